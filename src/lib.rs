//! # hdwallet-rs
//!
//! A hierarchical deterministic wallet engine for Bitcoin-family networks.
//!
//! Wallets derive and store keys along BIP32/44/49/84/45/48 path templates,
//! track unspent outputs per account and network, discover activity through a
//! pluggable [`chain::ChainService`], and build, sign and broadcast
//! transactions, including m-of-n multisig transactions whose signatures are
//! collected from several cosigner wallets.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hdwallet_rs::chain::InMemoryChain;
//! use hdwallet_rs::storage::MemoryRepository;
//! use hdwallet_rs::transaction_builder::Fee;
//! use hdwallet_rs::wallet::{Wallet, WalletOptions};
//! use hdwallet_rs::{init, EngineConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     init(&config)?;
//!
//!     let repo = Arc::new(MemoryRepository::new());
//!     let chain = Arc::new(InMemoryChain::default());
//!     let mut wallet = Wallet::create("hot", &[], WalletOptions::default(), repo, chain.clone(), config).await?;
//!
//!     let key = wallet.get_key(None, None, 0).await?;
//!     chain.fund(&key.address, 100_000, Some(90)).await;
//!     wallet.scan(Default::default()).await?;
//!
//!     let tx = wallet.send_to(&key.address, 50_000, Some(Fee::Amount(1_000)), false).await?;
//!     println!("sent {}", tx.txid);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture Overview
//!
//! - [`path`]: path templates and partial path expansion
//! - [`keystore`]: key derivation and caching for one wallet
//! - [`cosigner`]: multisig cosigner coordination
//! - [`ledger`]: transactions, unspent outputs and balances
//! - [`sync`]: gap-limit address discovery
//! - [`coin_selection`]: input selection
//! - [`transaction_builder`] and [`transaction_signer`]: building and signing
//! - [`wallet`]: the orchestrating [`Wallet`] type
//! - [`storage`] and [`chain`]: the repository and chain service seams
//!
//! ## Error Handling
//!
//! All public APIs return [`Result<T, WalletError>`](error::WalletError).

pub mod chain;
pub mod coin_selection;
pub mod cosigner;
pub mod error;
pub mod keystore;
pub mod ledger;
pub mod network;
pub mod path;
pub mod primitives;
pub mod storage;
pub mod sync;
pub mod transaction_builder;
pub mod transaction_signer;
pub mod types;
pub mod utils;
pub mod wallet;

pub use error::{Result, WalletError};
pub use types::EngineConfig;
pub use wallet::Wallet;

use std::fs;
use utils::logging::{init_logging, LoggingConfig};

/// Initializes logging and the data directory. Safe to call more than once.
pub fn init(config: &EngineConfig) -> Result<()> {
    if let Some(level) = config.log_level {
        init_logging(&LoggingConfig::with_level(level));
    } else {
        // It's ok if this fails, it just means logging was already initialized.
        let _ = env_logger::try_init();
    }

    if let Some(data_dir) = &config.data_dir {
        if !data_dir.exists() {
            fs::create_dir_all(data_dir)?;
            log::info!("Created data directory at: {:?}", data_dir);
        }
    }

    log::info!("Wallet engine initialized with config: {:?}", config);
    Ok(())
}
