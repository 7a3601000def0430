//! Bitcoin style addresses for every supported network.

use crate::network::Network;
use crate::primitives::hash::{hash160, sha256, Hash160};
use crate::primitives::script::Script;
use crate::{Result, WalletError};
use base58check::{FromBase58Check, ToBase58Check};
use bech32::{segwit, Hrp};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressPayload {
    /// Pay-to-Pubkey-Hash
    P2pkh(Hash160),
    /// Pay-to-Script-Hash
    P2sh(Hash160),
    /// Version 0 witness program, 20 bytes for P2WPKH and 32 for P2WSH
    WitnessV0(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub network: Network,
    pub payload: AddressPayload,
}

impl Address {
    pub fn p2pkh(pubkey: &[u8], network: Network) -> Self {
        Address {
            network,
            payload: AddressPayload::P2pkh(hash160(pubkey)),
        }
    }

    pub fn p2sh(redeem_script: &Script, network: Network) -> Self {
        Address {
            network,
            payload: AddressPayload::P2sh(hash160(redeem_script.as_bytes())),
        }
    }

    pub fn p2wpkh(pubkey: &[u8], network: Network) -> Result<Self> {
        Self::require_segwit(network)?;
        Ok(Address {
            network,
            payload: AddressPayload::WitnessV0(hash160(pubkey).to_vec()),
        })
    }

    pub fn p2sh_p2wpkh(pubkey: &[u8], network: Network) -> Result<Self> {
        Self::require_segwit(network)?;
        let redeem = Script::new_p2wpkh(&hash160(pubkey));
        Ok(Self::p2sh(&redeem, network))
    }

    pub fn p2wsh(witness_script: &Script, network: Network) -> Result<Self> {
        Self::require_segwit(network)?;
        Ok(Address {
            network,
            payload: AddressPayload::WitnessV0(sha256(witness_script.as_bytes()).to_vec()),
        })
    }

    pub fn p2sh_p2wsh(witness_script: &Script, network: Network) -> Result<Self> {
        Self::require_segwit(network)?;
        let redeem = Script::new_p2wsh(&sha256(witness_script.as_bytes()));
        Ok(Self::p2sh(&redeem, network))
    }

    fn require_segwit(network: Network) -> Result<()> {
        if network.params().segwit_supported {
            Ok(())
        } else {
            Err(WalletError::Configuration(format!(
                "Segwit is not supported for {} wallets",
                network
            )))
        }
    }

    /// Parses an address, preferring `hint` when prefixes are shared between networks.
    pub fn parse(s: &str, hint: Network) -> Result<Self> {
        let candidates = std::iter::once(hint).chain(Network::ALL.iter().copied().filter(|n| *n != hint));

        let lower = s.to_ascii_lowercase();
        if let Some(network) = candidates
            .clone()
            .find(|n| matches!(n.params().bech32_hrp, Some(hrp) if lower.starts_with(&format!("{}1", hrp))))
        {
            let (hrp, version, program) = segwit::decode(s)
                .map_err(|e| WalletError::InvalidInput(format!("Invalid bech32 address {}: {}", s, e)))?;
            if Some(hrp.to_lowercase().as_str()) != network.params().bech32_hrp {
                return Err(WalletError::InvalidInput(format!("Unexpected bech32 prefix in {}", s)));
            }
            if version != segwit::VERSION_0 || !(program.len() == 20 || program.len() == 32) {
                return Err(WalletError::InvalidInput(format!(
                    "Only version 0 witness programs are supported: {}",
                    s
                )));
            }
            return Ok(Address {
                network,
                payload: AddressPayload::WitnessV0(program),
            });
        }

        let (version, payload) = s
            .from_base58check()
            .map_err(|e| WalletError::InvalidInput(format!("Invalid address {}: {:?}", s, e)))?;
        if payload.len() != 20 {
            return Err(WalletError::InvalidInput(format!("Invalid address length: {}", s)));
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload);

        for network in candidates {
            let params = network.params();
            if version == params.prefix_address {
                return Ok(Address {
                    network,
                    payload: AddressPayload::P2pkh(hash),
                });
            }
            if version == params.prefix_address_p2sh {
                return Ok(Address {
                    network,
                    payload: AddressPayload::P2sh(hash),
                });
            }
        }
        Err(WalletError::InvalidInput(format!(
            "Address {} does not belong to a known network",
            s
        )))
    }

    pub fn script_pubkey(&self) -> Script {
        match &self.payload {
            AddressPayload::P2pkh(hash) => Script::new_p2pkh(hash),
            AddressPayload::P2sh(hash) => Script::new_p2sh(hash),
            AddressPayload::WitnessV0(program) => {
                let mut script = Script::new();
                script.push_opcode(crate::primitives::script::OP_0).push_slice(program);
                script
            }
        }
    }

    /// Base58 for legacy payloads, bech32 for witness programs.
    pub fn encoding(&self) -> &'static str {
        match self.payload {
            AddressPayload::WitnessV0(_) => "bech32",
            _ => "base58",
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self.network.params();
        match &self.payload {
            AddressPayload::P2pkh(hash) => f.write_str(&hash[..].to_base58check(params.prefix_address)),
            AddressPayload::P2sh(hash) => {
                f.write_str(&hash[..].to_base58check(params.prefix_address_p2sh))
            }
            AddressPayload::WitnessV0(program) => {
                let hrp = params
                    .bech32_hrp
                    .and_then(|h| Hrp::parse(h).ok())
                    .ok_or(fmt::Error)?;
                let encoded = segwit::encode(hrp, segwit::VERSION_0, program).map_err(|_| fmt::Error)?;
                f.write_str(&encoded)
            }
        }
    }
}
