//! Network parameters.
//!
//! Every chain the wallet can hold keys for is described by a static
//! [`NetworkParams`] table: address and key prefixes, BIP44 coin type,
//! the dust threshold and the accepted fee band (satoshi per 1000 vbytes).

use crate::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Bitcoin,
    Testnet,
    Regtest,
    Litecoin,
    Dogecoin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub name: &'static str,
    pub bip44_coin_type: u32,
    pub prefix_address: u8,
    pub prefix_address_p2sh: u8,
    pub prefix_wif: u8,
    pub bech32_hrp: Option<&'static str>,
    pub xprv_version: [u8; 4],
    pub xpub_version: [u8; 4],
    pub dust_amount: u64,
    pub fee_min: u64,
    pub fee_max: u64,
    pub fee_default: u64,
    pub segwit_supported: bool,
}

const BITCOIN: NetworkParams = NetworkParams {
    name: "bitcoin",
    bip44_coin_type: 0,
    prefix_address: 0x00,
    prefix_address_p2sh: 0x05,
    prefix_wif: 0x80,
    bech32_hrp: Some("bc"),
    xprv_version: [0x04, 0x88, 0xAD, 0xE4],
    xpub_version: [0x04, 0x88, 0xB2, 0x1E],
    dust_amount: 1_000,
    fee_min: 1_000,
    fee_max: 1_000_000,
    fee_default: 10_000,
    segwit_supported: true,
};

const TESTNET: NetworkParams = NetworkParams {
    name: "testnet",
    bip44_coin_type: 1,
    prefix_address: 0x6f,
    prefix_address_p2sh: 0xc4,
    prefix_wif: 0xef,
    bech32_hrp: Some("tb"),
    xprv_version: [0x04, 0x35, 0x83, 0x94],
    xpub_version: [0x04, 0x35, 0x87, 0xCF],
    dust_amount: 1_000,
    fee_min: 1_000,
    fee_max: 1_000_000,
    fee_default: 10_000,
    segwit_supported: true,
};

const REGTEST: NetworkParams = NetworkParams {
    name: "regtest",
    bech32_hrp: Some("bcrt"),
    ..TESTNET
};

const LITECOIN: NetworkParams = NetworkParams {
    name: "litecoin",
    bip44_coin_type: 2,
    prefix_address: 0x30,
    prefix_address_p2sh: 0x32,
    prefix_wif: 0xb0,
    bech32_hrp: Some("ltc"),
    xprv_version: [0x01, 0x9d, 0x9c, 0xfe],
    xpub_version: [0x01, 0x9d, 0xa4, 0x62],
    dust_amount: 1_000,
    fee_min: 1_000,
    fee_max: 2_000_000,
    fee_default: 10_000,
    segwit_supported: true,
};

const DOGECOIN: NetworkParams = NetworkParams {
    name: "dogecoin",
    bip44_coin_type: 3,
    prefix_address: 0x1e,
    prefix_address_p2sh: 0x16,
    prefix_wif: 0x9e,
    bech32_hrp: None,
    xprv_version: [0x02, 0xfa, 0xc3, 0x98],
    xpub_version: [0x02, 0xfa, 0xca, 0xfd],
    dust_amount: 1_000_000,
    fee_min: 100_000,
    fee_max: 1_000_000_000,
    fee_default: 1_000_000,
    segwit_supported: false,
};

impl Network {
    pub const ALL: [Network; 5] = [
        Network::Bitcoin,
        Network::Testnet,
        Network::Regtest,
        Network::Litecoin,
        Network::Dogecoin,
    ];

    pub fn params(&self) -> &'static NetworkParams {
        match self {
            Network::Bitcoin => &BITCOIN,
            Network::Testnet => &TESTNET,
            Network::Regtest => &REGTEST,
            Network::Litecoin => &LITECOIN,
            Network::Dogecoin => &DOGECOIN,
        }
    }

    pub fn name(&self) -> &'static str {
        self.params().name
    }

    pub fn dust_amount(&self) -> u64 {
        self.params().dust_amount
    }

    pub fn fee_min(&self) -> u64 {
        self.params().fee_min
    }

    pub fn fee_max(&self) -> u64 {
        self.params().fee_max
    }

    /// Networks sharing an extended key version with `self`, `self` first.
    pub fn by_xkey_version(version: [u8; 4]) -> Vec<(Network, bool)> {
        Network::ALL
            .iter()
            .filter_map(|n| {
                let p = n.params();
                if p.xprv_version == version {
                    Some((*n, true))
                } else if p.xpub_version == version {
                    Some((*n, false))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn by_wif_prefix(prefix: u8) -> Vec<Network> {
        Network::ALL
            .iter()
            .copied()
            .filter(|n| n.params().prefix_wif == prefix)
            .collect()
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Bitcoin
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Network {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        Network::ALL
            .iter()
            .copied()
            .find(|n| n.name() == s.to_ascii_lowercase())
            .ok_or_else(|| WalletError::Configuration(format!("Unknown network: {}", s)))
    }
}
