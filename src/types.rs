use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::network::Network;
use crate::utils::config::ConfigManager;
use crate::{Result, WalletError};

pub use crate::utils::logging::LogLevel;

pub type WalletId = u64;
pub type KeyId = u64;
pub type TransactionId = u64;

/// Engine wide settings, see [`EngineConfig::load`].
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for snapshots and config files. In-memory only when unset.
    #[serde(rename = "datadir")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    pub default_network: Network,
    pub default_witness_type: WitnessType,
    /// Number of consecutive unused keys scanned before a scan pass stops.
    pub scan_gap_limit: usize,
    /// Page size for address history requests.
    pub max_transactions: usize,
    pub min_confirms: u32,
    pub random_output_order: bool,
    /// Fixed seed for change splitting and output shuffling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: None,
            default_network: Network::Bitcoin,
            default_witness_type: WitnessType::Legacy,
            scan_gap_limit: 5,
            max_transactions: 20,
            min_confirms: 1,
            random_output_order: true,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    /// Loads `engine.json` from `dir`, overridable through `HDWALLET_ENGINE_*`
    /// environment variables.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        ConfigManager::new(dir, "HDWALLET").load_config("engine")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Bip32,
    Single,
}

impl FromStr for Scheme {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bip32" => Ok(Scheme::Bip32),
            "single" => Ok(Scheme::Single),
            other => Err(WalletError::Configuration(format!(
                "Only bip32 or single key scheme's are supported at the moment, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WitnessType {
    Legacy,
    P2shSegwit,
    Segwit,
}

impl WitnessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WitnessType::Legacy => "legacy",
            WitnessType::P2shSegwit => "p2sh-segwit",
            WitnessType::Segwit => "segwit",
        }
    }

    /// Script type number used in the `script_type'` path level of multisig wallets.
    pub fn script_type_index(&self) -> u32 {
        match self {
            WitnessType::P2shSegwit => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for WitnessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WitnessType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacy" => Ok(WitnessType::Legacy),
            "p2sh-segwit" => Ok(WitnessType::P2shSegwit),
            "segwit" => Ok(WitnessType::Segwit),
            other => Err(WalletError::Configuration(format!(
                "Witness type {} not supported at the moment",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Bip32,
    Single,
    Multisig,
}

/// Locking script families the wallet can spend from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
    P2shMultisig,
    P2shP2wshMultisig,
    P2wshMultisig,
    NullData,
    Unknown,
}

impl ScriptType {
    pub fn for_wallet(witness_type: WitnessType, multisig: bool) -> Self {
        match (witness_type, multisig) {
            (WitnessType::Legacy, false) => ScriptType::P2pkh,
            (WitnessType::P2shSegwit, false) => ScriptType::P2shP2wpkh,
            (WitnessType::Segwit, false) => ScriptType::P2wpkh,
            (WitnessType::Legacy, true) => ScriptType::P2shMultisig,
            (WitnessType::P2shSegwit, true) => ScriptType::P2shP2wshMultisig,
            (WitnessType::Segwit, true) => ScriptType::P2wshMultisig,
        }
    }

    pub fn is_multisig(&self) -> bool {
        matches!(
            self,
            ScriptType::P2shMultisig | ScriptType::P2shP2wshMultisig | ScriptType::P2wshMultisig
        )
    }

    pub fn is_segwit(&self) -> bool {
        matches!(
            self,
            ScriptType::P2shP2wpkh
                | ScriptType::P2wpkh
                | ScriptType::P2shP2wshMultisig
                | ScriptType::P2wshMultisig
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    New,
    Unconfirmed,
    Confirmed,
}

/// Fee priority, mapped to a confirmation target in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeePriority {
    Low,
    Normal,
    High,
}

impl FeePriority {
    pub fn blocks(&self) -> u32 {
        match self {
            FeePriority::Low => 10,
            FeePriority::Normal => 3,
            FeePriority::High => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("engine.json"),
            r#"{"default_network": "testnet", "scan_gap_limit": 8}"#,
        )
        .unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.default_network, Network::Testnet);
        assert_eq!(config.scan_gap_limit, 8);
        assert_eq!(config.max_transactions, 20);
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(Scheme::from_str("bip32").unwrap(), Scheme::Bip32);
        assert!(matches!(
            Scheme::from_str("bip44"),
            Err(WalletError::Configuration(_))
        ));
        assert_eq!(
            WitnessType::from_str("p2sh-segwit").unwrap(),
            WitnessType::P2shSegwit
        );
        assert!(WitnessType::from_str("taproot").is_err());
    }

    #[test]
    fn test_witness_type_serde() {
        let json = serde_json::to_string(&WitnessType::P2shSegwit).unwrap();
        assert_eq!(json, "\"p2sh-segwit\"");
        let back: WitnessType = serde_json::from_str("\"segwit\"").unwrap();
        assert_eq!(back, WitnessType::Segwit);
    }

    #[test]
    fn test_script_type_for_wallet() {
        assert_eq!(
            ScriptType::for_wallet(WitnessType::Legacy, false),
            ScriptType::P2pkh
        );
        let ms = ScriptType::for_wallet(WitnessType::Segwit, true);
        assert!(ms.is_multisig() && ms.is_segwit());
        assert!(!ScriptType::P2shMultisig.is_segwit());
    }

    #[test]
    fn test_engine_config_defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{"scan_gap_limit": 10}"#).unwrap();
        assert_eq!(config.scan_gap_limit, 10);
        assert_eq!(config.max_transactions, 20);
        assert_eq!(config.default_network, Network::Bitcoin);
        assert!(config.random_output_order);
    }
}
