//! BIP32 Hierarchical Deterministic Keys.

use crate::network::Network;
use crate::primitives::hash::hash160;
use crate::{Result, WalletError};
use base58check::{FromBase58Check, ToBase58Check};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::Sha512;
use std::fmt;

const BIP32_MASTER_KEY: &[u8] = b"Bitcoin seed";
pub const BIP32_HARDENED_KEY_LIMIT: u32 = 0x8000_0000;
const BIP39_ROUNDS: u32 = 2048;

pub fn is_hardened(child_number: u32) -> bool {
    child_number >= BIP32_HARDENED_KEY_LIMIT
}

pub fn hardened(index: u32) -> u32 {
    index | BIP32_HARDENED_KEY_LIMIT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainCode(pub [u8; 32]);

/// First 4 bytes of HASH160 of a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 4]);

impl Fingerprint {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let hash = hash160(&public_key.serialize());
        let mut fingerprint = [0u8; 4];
        fingerprint.copy_from_slice(&hash[0..4]);
        Fingerprint(fingerprint)
    }
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 64]> {
    let mut mac = Hmac::<Sha512>::new_from_slice(key)
        .map_err(|e| WalletError::Key(format!("HMAC key rejected: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn split_chain_code(i: &[u8; 64]) -> ([u8; 32], ChainCode) {
    let mut il = [0u8; 32];
    let mut ir = [0u8; 32];
    il.copy_from_slice(&i[..32]);
    ir.copy_from_slice(&i[32..]);
    (il, ChainCode(ir))
}

/// The 78 byte BIP32 payload shared by both key kinds.
fn serialize_xkey(
    version: [u8; 4],
    depth: u8,
    parent: &Fingerprint,
    child_number: u32,
    chain_code: &ChainCode,
    key_data: &[u8; 33],
) -> String {
    let mut data = Vec::with_capacity(78);
    data.extend_from_slice(&version);
    data.push(depth);
    data.extend_from_slice(&parent.0);
    data.extend_from_slice(&child_number.to_be_bytes());
    data.extend_from_slice(&chain_code.0);
    data.extend_from_slice(key_data);
    // base58check takes a single version byte; the remaining version bytes ride in the payload.
    data[1..].to_base58check(data[0])
}

struct RawXkey {
    version: [u8; 4],
    depth: u8,
    parent_fingerprint: Fingerprint,
    child_number: u32,
    chain_code: ChainCode,
    key_data: [u8; 33],
}

fn decode_xkey(s: &str) -> Result<RawXkey> {
    let (first, rest) = s
        .from_base58check()
        .map_err(|e| WalletError::Key(format!("Invalid extended key encoding: {:?}", e)))?;
    if rest.len() != 77 {
        return Err(WalletError::Key(format!(
            "Invalid extended key length: {} expected 78",
            rest.len() + 1
        )));
    }
    let mut parent = [0u8; 4];
    parent.copy_from_slice(&rest[4..8]);
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(&rest[12..44]);
    let mut key_data = [0u8; 33];
    key_data.copy_from_slice(&rest[44..77]);
    Ok(RawXkey {
        version: [first, rest[0], rest[1], rest[2]],
        depth: rest[3],
        parent_fingerprint: Fingerprint(parent),
        child_number: u32::from_be_bytes([rest[8], rest[9], rest[10], rest[11]]),
        chain_code: ChainCode(chain_code),
        key_data,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedPrivateKey {
    pub network: Network,
    pub depth: u8,
    pub parent_fingerprint: Fingerprint,
    pub child_number: u32,
    pub private_key: SecretKey,
    pub chain_code: ChainCode,
}

impl ExtendedPrivateKey {
    pub fn new_master_from_seed(seed: &[u8], network: Network) -> Result<Self> {
        let i = hmac_sha512(BIP32_MASTER_KEY, &[seed])?;
        let (il, chain_code) = split_chain_code(&i);
        let private_key = SecretKey::from_slice(&il)
            .map_err(|e| WalletError::Key(format!("Invalid private key from seed: {}", e)))?;

        Ok(ExtendedPrivateKey {
            network,
            depth: 0,
            parent_fingerprint: Fingerprint([0; 4]),
            child_number: 0,
            private_key,
            chain_code,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key(SECP256K1)
    }

    pub fn derive_child(&self, child_number: u32) -> Result<ExtendedPrivateKey> {
        let public_key = self.public_key();
        let index = child_number.to_be_bytes();
        let i = if is_hardened(child_number) {
            let secret = self.private_key.secret_bytes();
            hmac_sha512(&self.chain_code.0, &[&[0u8][..], &secret[..], &index[..]])?
        } else {
            hmac_sha512(&self.chain_code.0, &[&public_key.serialize()[..], &index[..]])?
        };
        let (il, chain_code) = split_chain_code(&i);

        let tweak = Scalar::from_be_bytes(il)
            .map_err(|_| WalletError::Key("Derived tweak exceeds curve order".to_string()))?;
        let private_key = self.private_key.add_tweak(&tweak)?;

        Ok(ExtendedPrivateKey {
            network: self.network,
            depth: self.depth.saturating_add(1),
            parent_fingerprint: Fingerprint::from_public_key(&public_key),
            child_number,
            private_key,
            chain_code,
        })
    }

    pub fn extended_public_key(&self) -> ExtendedPublicKey {
        ExtendedPublicKey {
            network: self.network,
            depth: self.depth,
            parent_fingerprint: self.parent_fingerprint,
            child_number: self.child_number,
            public_key: self.public_key(),
            chain_code: self.chain_code,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(&self.public_key())
    }

    /// Decodes an xprv style string, preferring `hint` for versions shared between networks.
    pub fn decode(s: &str, hint: Network) -> Result<Self> {
        let raw = decode_xkey(s)?;
        let network = pick_network(&raw.version, true, hint)?;
        if raw.key_data[0] != 0x00 {
            return Err(WalletError::Key("Invalid private key prefix".to_string()));
        }
        let private_key = SecretKey::from_slice(&raw.key_data[1..])
            .map_err(|e| WalletError::Key(format!("Invalid private key: {}", e)))?;
        Ok(ExtendedPrivateKey {
            network,
            depth: raw.depth,
            parent_fingerprint: raw.parent_fingerprint,
            child_number: raw.child_number,
            private_key,
            chain_code: raw.chain_code,
        })
    }
}

impl fmt::Display for ExtendedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut key_data = [0u8; 33];
        key_data[1..].copy_from_slice(&self.private_key.secret_bytes());
        f.write_str(&serialize_xkey(
            self.network.params().xprv_version,
            self.depth,
            &self.parent_fingerprint,
            self.child_number,
            &self.chain_code,
            &key_data,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedPublicKey {
    pub network: Network,
    pub depth: u8,
    pub parent_fingerprint: Fingerprint,
    pub child_number: u32,
    pub public_key: PublicKey,
    pub chain_code: ChainCode,
}

impl ExtendedPublicKey {
    /// Non-hardened derivation only.
    pub fn derive_child(&self, child_number: u32) -> Result<ExtendedPublicKey> {
        if is_hardened(child_number) {
            return Err(WalletError::Key(
                "Cannot derive hardened key from a public key".to_string(),
            ));
        }
        let i = hmac_sha512(
            &self.chain_code.0,
            &[&self.public_key.serialize()[..], &child_number.to_be_bytes()[..]],
        )?;
        let (il, chain_code) = split_chain_code(&i);
        let tweak = Scalar::from_be_bytes(il)
            .map_err(|_| WalletError::Key("Derived tweak exceeds curve order".to_string()))?;
        let public_key = self.public_key.add_exp_tweak(SECP256K1, &tweak)?;

        Ok(ExtendedPublicKey {
            network: self.network,
            depth: self.depth.saturating_add(1),
            parent_fingerprint: Fingerprint::from_public_key(&self.public_key),
            child_number,
            public_key,
            chain_code,
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_public_key(&self.public_key)
    }

    pub fn decode(s: &str, hint: Network) -> Result<Self> {
        let raw = decode_xkey(s)?;
        let network = pick_network(&raw.version, false, hint)?;
        let public_key = PublicKey::from_slice(&raw.key_data)
            .map_err(|e| WalletError::Key(format!("Invalid public key: {}", e)))?;
        Ok(ExtendedPublicKey {
            network,
            depth: raw.depth,
            parent_fingerprint: raw.parent_fingerprint,
            child_number: raw.child_number,
            public_key,
            chain_code: raw.chain_code,
        })
    }
}

impl fmt::Display for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&serialize_xkey(
            self.network.params().xpub_version,
            self.depth,
            &self.parent_fingerprint,
            self.child_number,
            &self.chain_code,
            &self.public_key.serialize(),
        ))
    }
}

fn pick_network(version: &[u8; 4], private: bool, hint: Network) -> Result<Network> {
    let matches: Vec<Network> = Network::by_xkey_version(*version)
        .into_iter()
        .filter(|(_, is_private)| *is_private == private)
        .map(|(n, _)| n)
        .collect();
    if matches.contains(&hint) {
        return Ok(hint);
    }
    matches.first().copied().ok_or_else(|| {
        WalletError::Key(format!(
            "Unknown extended key version {}",
            hex::encode(version)
        ))
    })
}

/// Key material held by a wallet key: extended BIP32 keys for HD wallets or
/// bare keys for the single scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HdKey {
    ExtendedPrivate(ExtendedPrivateKey),
    ExtendedPublic(ExtendedPublicKey),
    Private { secret: SecretKey, network: Network },
    Public { public_key: PublicKey, network: Network },
}

impl HdKey {
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self> {
        Ok(HdKey::ExtendedPrivate(ExtendedPrivateKey::new_master_from_seed(
            seed, network,
        )?))
    }

    /// A fresh master key from 64 bytes of OS randomness.
    pub fn random(network: Network) -> Result<Self> {
        let mut seed = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(&seed, network)
    }

    /// BIP39 seed stretching of a passphrase, then a master key from the seed.
    pub fn from_passphrase(passphrase: &str, password: &str, network: Network) -> Result<Self> {
        Self::from_seed(&seed_from_passphrase(passphrase, password), network)
    }

    /// Imports an extended key, a WIF private key or a hex encoded public key.
    pub fn import(s: &str, hint: Network) -> Result<Self> {
        let s = s.trim();
        if let Ok(bytes) = hex::decode(s) {
            if bytes.len() == 33 || bytes.len() == 65 {
                let public_key = PublicKey::from_slice(&bytes)?;
                return Ok(HdKey::Public {
                    public_key,
                    network: hint,
                });
            }
            if bytes.len() == 32 {
                return Ok(HdKey::Private {
                    secret: SecretKey::from_slice(&bytes)?,
                    network: hint,
                });
            }
        }
        let (version, payload) = s
            .from_base58check()
            .map_err(|e| WalletError::Key(format!("Unrecognised key format: {:?}", e)))?;
        match payload.len() {
            77 => {
                let full = [version, payload[0], payload[1], payload[2]];
                let private = Network::by_xkey_version(full)
                    .first()
                    .map(|(_, p)| *p)
                    .ok_or_else(|| {
                        WalletError::Key(format!("Unknown extended key version {}", hex::encode(full)))
                    })?;
                if private {
                    Ok(HdKey::ExtendedPrivate(ExtendedPrivateKey::decode(s, hint)?))
                } else {
                    Ok(HdKey::ExtendedPublic(ExtendedPublicKey::decode(s, hint)?))
                }
            }
            33 if payload[32] == 0x01 => {
                let networks = Network::by_wif_prefix(version);
                let network = if networks.contains(&hint) {
                    hint
                } else {
                    networks.first().copied().ok_or_else(|| {
                        WalletError::Key(format!("Unknown WIF prefix {:#04x}", version))
                    })?
                };
                Ok(HdKey::Private {
                    secret: SecretKey::from_slice(&payload[..32])?,
                    network,
                })
            }
            32 => Err(WalletError::Key(
                "Uncompressed WIF keys are not supported".to_string(),
            )),
            n => Err(WalletError::Key(format!("Unexpected key payload length {}", n))),
        }
    }

    pub fn network(&self) -> Network {
        match self {
            HdKey::ExtendedPrivate(k) => k.network,
            HdKey::ExtendedPublic(k) => k.network,
            HdKey::Private { network, .. } | HdKey::Public { network, .. } => *network,
        }
    }

    pub fn depth(&self) -> u8 {
        match self {
            HdKey::ExtendedPrivate(k) => k.depth,
            HdKey::ExtendedPublic(k) => k.depth,
            _ => 0,
        }
    }

    pub fn child_number(&self) -> u32 {
        match self {
            HdKey::ExtendedPrivate(k) => k.child_number,
            HdKey::ExtendedPublic(k) => k.child_number,
            _ => 0,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, HdKey::ExtendedPrivate(_) | HdKey::Private { .. })
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, HdKey::ExtendedPrivate(_) | HdKey::ExtendedPublic(_))
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            HdKey::ExtendedPrivate(k) => k.public_key(),
            HdKey::ExtendedPublic(k) => k.public_key,
            HdKey::Private { secret, .. } => secret.public_key(SECP256K1),
            HdKey::Public { public_key, .. } => *public_key,
        }
    }

    /// Compressed SEC encoding.
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public_key().serialize().to_vec()
    }

    pub fn secret_key(&self) -> Option<SecretKey> {
        match self {
            HdKey::ExtendedPrivate(k) => Some(k.private_key),
            HdKey::Private { secret, .. } => Some(*secret),
            _ => None,
        }
    }

    pub fn derive_child(&self, child_number: u32) -> Result<HdKey> {
        match self {
            HdKey::ExtendedPrivate(k) => Ok(HdKey::ExtendedPrivate(k.derive_child(child_number)?)),
            HdKey::ExtendedPublic(k) => Ok(HdKey::ExtendedPublic(k.derive_child(child_number)?)),
            _ => Err(WalletError::Key(
                "Key derivation needs an extended key".to_string(),
            )),
        }
    }

    /// Drops private material.
    pub fn public(&self) -> HdKey {
        match self {
            HdKey::ExtendedPrivate(k) => HdKey::ExtendedPublic(k.extended_public_key()),
            HdKey::Private { secret, network } => HdKey::Public {
                public_key: secret.public_key(SECP256K1),
                network: *network,
            },
            other => other.clone(),
        }
    }

    /// Same key material, serialized for another network.
    pub fn with_network(self, network: Network) -> HdKey {
        match self {
            HdKey::ExtendedPrivate(mut k) => {
                k.network = network;
                HdKey::ExtendedPrivate(k)
            }
            HdKey::ExtendedPublic(mut k) => {
                k.network = network;
                HdKey::ExtendedPublic(k)
            }
            HdKey::Private { secret, .. } => HdKey::Private { secret, network },
            HdKey::Public { public_key, .. } => HdKey::Public { public_key, network },
        }
    }

    /// Storage form: extended key string, compressed WIF or hex public key.
    pub fn wif(&self) -> String {
        match self {
            HdKey::ExtendedPrivate(k) => k.to_string(),
            HdKey::ExtendedPublic(k) => k.to_string(),
            HdKey::Private { secret, network } => {
                let mut payload = secret.secret_bytes().to_vec();
                payload.push(0x01);
                payload.to_base58check(network.params().prefix_wif)
            }
            HdKey::Public { public_key, .. } => hex::encode(public_key.serialize()),
        }
    }
}

/// BIP39 seed: PBKDF2-HMAC-SHA512 over the passphrase, salted with `"mnemonic" + password`.
pub fn seed_from_passphrase(passphrase: &str, password: &str) -> [u8; 64] {
    let salt = format!("mnemonic{}", password);
    let mut seed = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt.as_bytes(), BIP39_ROUNDS, &mut seed);
    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED_1: &str = "000102030405060708090a0b0c0d0e0f";
    const XPRV_1: &str = "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";
    const XPUB_1: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn master() -> ExtendedPrivateKey {
        let seed = hex::decode(SEED_1).unwrap();
        ExtendedPrivateKey::new_master_from_seed(&seed, Network::Bitcoin).unwrap()
    }

    #[test]
    fn test_bip32_master_from_seed() {
        let xprv = master();
        assert_eq!(
            hex::encode(xprv.private_key.secret_bytes()),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );
        assert_eq!(
            hex::encode(xprv.chain_code.0),
            "873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508"
        );
        assert_eq!(xprv.to_string(), XPRV_1);
        assert_eq!(xprv.extended_public_key().to_string(), XPUB_1);
    }

    #[test]
    fn test_hardened_child_vector() {
        let child = master().derive_child(hardened(0)).unwrap();
        assert_eq!(
            child.to_string(),
            "xprv9uHRZZhk6KAJC1avXpDAp4MDc3sQKNxDiPvvkX8Br5ngLNv1TxvUxt4cV1rGL5hj6KCesnDYUhd7oWgT11eZG7XnxHrnYeSvkzY7d2bhkJ7"
        );
        assert_eq!(
            child.extended_public_key().to_string(),
            "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw"
        );
        assert_eq!(child.parent_fingerprint, master().fingerprint());
    }

    #[test]
    fn test_public_derivation_matches_private() {
        let master = master();
        let from_priv = master.derive_child(7).unwrap().extended_public_key();
        let from_pub = master.extended_public_key().derive_child(7).unwrap();
        assert_eq!(from_priv, from_pub);
        assert!(master.extended_public_key().derive_child(hardened(0)).is_err());
    }

    #[test]
    fn test_decode_round_trip() {
        let decoded = ExtendedPrivateKey::decode(XPRV_1, Network::Bitcoin).unwrap();
        assert_eq!(decoded, master());
        let decoded_pub = ExtendedPublicKey::decode(XPUB_1, Network::Bitcoin).unwrap();
        assert_eq!(decoded_pub, master().extended_public_key());
        assert!(ExtendedPrivateKey::decode(XPUB_1, Network::Bitcoin).is_err());
        assert!(ExtendedPrivateKey::decode(&XPRV_1[..XPRV_1.len() - 10], Network::Bitcoin).is_err());
    }

    #[test]
    fn test_testnet_versions_resolve_with_hint() {
        let seed = hex::decode(SEED_1).unwrap();
        let tprv = ExtendedPrivateKey::new_master_from_seed(&seed, Network::Testnet).unwrap();
        let encoded = tprv.to_string();
        assert!(encoded.starts_with("tprv"));
        assert_eq!(ExtendedPrivateKey::decode(&encoded, Network::Regtest).unwrap().network, Network::Regtest);
        assert_eq!(ExtendedPrivateKey::decode(&encoded, Network::Bitcoin).unwrap().network, Network::Testnet);
    }

    #[test]
    fn test_hdkey_import_formats() {
        let xprv = HdKey::import(XPRV_1, Network::Bitcoin).unwrap();
        assert!(xprv.is_private() && xprv.is_extended());
        assert_eq!(xprv.wif(), XPRV_1);

        let xpub = HdKey::import(XPUB_1, Network::Bitcoin).unwrap();
        assert!(!xpub.is_private());
        assert_eq!(xprv.public(), xpub);

        let single = HdKey::Private {
            secret: master().private_key,
            network: Network::Bitcoin,
        };
        let wif = single.wif();
        assert!(wif.starts_with('K') || wif.starts_with('L'));
        assert_eq!(HdKey::import(&wif, Network::Bitcoin).unwrap(), single);

        let pubhex = hex::encode(single.public_bytes());
        let imported = HdKey::import(&pubhex, Network::Bitcoin).unwrap();
        assert!(!imported.is_private());
        assert_eq!(imported.public_key(), single.public_key());
        assert!(imported.derive_child(0).is_err());
    }

    #[test]
    fn test_seed_from_passphrase_vector() {
        let seed = seed_from_passphrase(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
            "TREZOR",
        );
        assert_eq!(
            hex::encode(seed),
            "c55257c360c07c72029aebc1b53c05ed0362ada38ead3e3e9efa3708e53495531f09a6987599d18264c1e1c92f2cf141630c7a3c4ab7c81b2f001698e7463b04"
        );
    }
}
