//! Shared fixtures: an in-memory repository and chain plus key helpers.
#![allow(dead_code)]

use hdwallet_rs::chain::InMemoryChain;
use hdwallet_rs::network::Network;
use hdwallet_rs::primitives::bip32::HdKey;
use hdwallet_rs::storage::MemoryRepository;
use hdwallet_rs::types::WitnessType;
use hdwallet_rs::wallet::{Wallet, WalletOptions};
use hdwallet_rs::EngineConfig;
use std::sync::Arc;

pub const CHAIN_HEIGHT: u64 = 100;
pub const CHAIN_FEE_PER_KB: u64 = 10_000;

pub struct Fixture {
    pub repo: Arc<MemoryRepository>,
    pub chain: Arc<InMemoryChain>,
    pub config: EngineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            repo: Arc::new(MemoryRepository::new()),
            chain: Arc::new(InMemoryChain::new(CHAIN_HEIGHT, CHAIN_FEE_PER_KB)),
            config: EngineConfig {
                rng_seed: Some(42),
                ..Default::default()
            },
        }
    }

    pub async fn create(&self, name: &str, keys: &[&str], options: WalletOptions) -> Wallet {
        self.try_create(name, keys, options).await.unwrap()
    }

    pub async fn try_create(&self, name: &str, keys: &[&str], options: WalletOptions) -> hdwallet_rs::Result<Wallet> {
        Wallet::create(
            name,
            keys,
            options,
            self.repo.clone(),
            self.chain.clone(),
            self.config.clone(),
        )
        .await
    }

    pub async fn open(&self, name_or_id: &str) -> hdwallet_rs::Result<Wallet> {
        Wallet::open(name_or_id, self.repo.clone(), self.chain.clone(), self.config.clone()).await
    }

    /// Receive address of a fresh wallet outside the one under test.
    pub async fn foreign_address(&self, name: &str) -> String {
        let mut wallet = self.create(name, &[], options(WitnessType::Legacy)).await;
        wallet.get_key(None, None, 0).await.unwrap().address
    }
}

pub fn options(witness_type: WitnessType) -> WalletOptions {
    WalletOptions {
        network: Some(Network::Bitcoin),
        witness_type: Some(witness_type),
        ..Default::default()
    }
}

/// Deterministic bare private key.
pub fn single_key(n: u8) -> HdKey {
    HdKey::import(&hex::encode([n; 32]), Network::Bitcoin).unwrap()
}

pub fn public_hex(key: &HdKey) -> String {
    hex::encode(key.public_bytes())
}

pub fn txid(n: u8) -> String {
    hex::encode([n; 32])
}
