//! Blockchain data provider interface.
//!
//! The wallet never talks to a node directly. Everything it learns about the
//! chain comes through a [`ChainService`], which is expected to enforce its
//! own timeouts. [`InMemoryChain`] is a scriptable provider used by tests and
//! offline tooling.

use crate::primitives::hash::sha256;
use crate::types::ScriptType;
use crate::{Result, WalletError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInput {
    pub index_n: u32,
    pub prev_txid: String,
    pub output_n: u32,
    pub address: Option<String>,
    pub value: u64,
    pub script_type: ScriptType,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainOutput {
    pub output_n: u32,
    pub address: Option<String>,
    pub value: u64,
    /// Locking script, hex encoded.
    pub script: String,
    pub script_type: ScriptType,
    pub spent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub txid: String,
    pub block_height: Option<u64>,
    pub confirmations: u32,
    pub fee: Option<u64>,
    pub size: usize,
    pub locktime: u32,
    pub version: i32,
    pub inputs: Vec<ChainInput>,
    pub outputs: Vec<ChainOutput>,
    pub raw: Option<String>,
}

impl ChainTransaction {
    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// True if any input or output pays from or to `address`.
    pub fn touches(&self, address: &str) -> bool {
        self.inputs.iter().any(|i| i.address.as_deref() == Some(address))
            || self.outputs.iter().any(|o| o.address.as_deref() == Some(address))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainUtxo {
    pub txid: String,
    pub output_n: u32,
    pub address: String,
    pub value: u64,
    pub script: String,
    pub block_height: Option<u64>,
    pub confirmations: u32,
}

#[async_trait]
pub trait ChainService: Send + Sync {
    async fn block_height(&self) -> Result<u64>;

    /// Fee rate in smallest units per 1000 vbytes for confirmation within `blocks`.
    async fn estimate_fee(&self, blocks: u32) -> Result<u64>;

    /// Unspent outputs of `address`, listed after `after_txid` when given.
    async fn get_utxos(&self, address: &str, after_txid: Option<&str>, limit: usize) -> Result<Vec<ChainUtxo>>;

    /// One page of the address history, oldest first, starting at `after_index`.
    async fn get_transactions_by_address(
        &self,
        address: &str,
        after_index: usize,
        limit: usize,
    ) -> Result<Vec<ChainTransaction>>;

    async fn get_transactions(&self, txids: &[String]) -> Result<Vec<ChainTransaction>>;

    async fn broadcast(&self, raw_hex: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    fee_per_kb: u64,
    transactions: Vec<ChainTransaction>,
    queried: Vec<String>,
    broadcasts: Vec<String>,
    failing: bool,
    next_txid: u64,
}

impl ChainState {
    fn confirmations(&self, block_height: Option<u64>) -> u32 {
        match block_height {
            Some(h) if h <= self.height => (self.height - h + 1) as u32,
            _ => 0,
        }
    }

    fn with_confirmations(&self, tx: &ChainTransaction) -> ChainTransaction {
        let mut tx = tx.clone();
        tx.confirmations = self.confirmations(tx.block_height);
        tx
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            return Err(WalletError::Network("Chain provider unavailable".to_string()));
        }
        Ok(())
    }
}

/// Scriptable in-process chain. Records every queried address and every
/// broadcast transaction.
#[derive(Debug)]
pub struct InMemoryChain {
    state: RwLock<ChainState>,
}

impl Default for InMemoryChain {
    fn default() -> Self {
        Self::new(100, 10_000)
    }
}

impl InMemoryChain {
    pub fn new(height: u64, fee_per_kb: u64) -> Self {
        Self {
            state: RwLock::new(ChainState {
                height,
                fee_per_kb,
                ..Default::default()
            }),
        }
    }

    pub async fn set_height(&self, height: u64) {
        self.state.write().await.height = height;
    }

    pub async fn set_fee_per_kb(&self, fee_per_kb: u64) {
        self.state.write().await.fee_per_kb = fee_per_kb;
    }

    /// Makes every following call fail with a network error.
    pub async fn set_failing(&self, failing: bool) {
        self.state.write().await.failing = failing;
    }

    pub async fn add_transaction(&self, tx: ChainTransaction) {
        self.state.write().await.transactions.push(tx);
    }

    /// Adds a transaction paying `value` to `address` mined at `block_height`
    /// and returns its txid.
    pub async fn fund(&self, address: &str, value: u64, block_height: Option<u64>) -> String {
        let mut state = self.state.write().await;
        state.next_txid += 1;
        let txid = hex::encode(sha256(format!("funding-{}", state.next_txid).as_bytes()));
        state.transactions.push(ChainTransaction {
            txid: txid.clone(),
            block_height,
            confirmations: 0,
            fee: None,
            size: 0,
            locktime: 0,
            version: 1,
            inputs: Vec::new(),
            outputs: vec![ChainOutput {
                output_n: 0,
                address: Some(address.to_string()),
                value,
                script: String::new(),
                script_type: ScriptType::Unknown,
                spent: false,
            }],
            raw: None,
        });
        txid
    }

    pub async fn queried_addresses(&self) -> Vec<String> {
        self.state.read().await.queried.clone()
    }

    pub async fn broadcasts(&self) -> Vec<String> {
        self.state.read().await.broadcasts.clone()
    }
}

#[async_trait]
impl ChainService for InMemoryChain {
    async fn block_height(&self) -> Result<u64> {
        let state = self.state.read().await;
        state.check()?;
        Ok(state.height)
    }

    async fn estimate_fee(&self, _blocks: u32) -> Result<u64> {
        let state = self.state.read().await;
        state.check()?;
        Ok(state.fee_per_kb)
    }

    async fn get_utxos(&self, address: &str, after_txid: Option<&str>, limit: usize) -> Result<Vec<ChainUtxo>> {
        let state = self.state.read().await;
        state.check()?;
        let spent = |txid: &str, n: u32| {
            state
                .transactions
                .iter()
                .any(|t| t.inputs.iter().any(|i| i.prev_txid == txid && i.output_n == n))
        };
        let mut utxos = Vec::new();
        let mut skipping = after_txid.is_some();
        for tx in &state.transactions {
            if skipping {
                if Some(tx.txid.as_str()) == after_txid {
                    skipping = false;
                }
                continue;
            }
            for output in tx.outputs.iter().filter(|o| o.address.as_deref() == Some(address)) {
                if output.spent || spent(&tx.txid, output.output_n) {
                    continue;
                }
                utxos.push(ChainUtxo {
                    txid: tx.txid.clone(),
                    output_n: output.output_n,
                    address: address.to_string(),
                    value: output.value,
                    script: output.script.clone(),
                    block_height: tx.block_height,
                    confirmations: state.confirmations(tx.block_height),
                });
            }
        }
        utxos.truncate(limit);
        Ok(utxos)
    }

    async fn get_transactions_by_address(
        &self,
        address: &str,
        after_index: usize,
        limit: usize,
    ) -> Result<Vec<ChainTransaction>> {
        let mut state = self.state.write().await;
        state.check()?;
        state.queried.push(address.to_string());
        let page = state
            .transactions
            .iter()
            .filter(|t| t.touches(address))
            .skip(after_index)
            .take(limit)
            .map(|t| state.with_confirmations(t))
            .collect();
        Ok(page)
    }

    async fn get_transactions(&self, txids: &[String]) -> Result<Vec<ChainTransaction>> {
        let state = self.state.read().await;
        state.check()?;
        Ok(state
            .transactions
            .iter()
            .filter(|t| txids.contains(&t.txid))
            .map(|t| state.with_confirmations(t))
            .collect())
    }

    async fn broadcast(&self, raw_hex: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.check()?;
        hex::decode(raw_hex)?;
        state.broadcasts.push(raw_hex.to_string());
        Ok(())
    }
}
