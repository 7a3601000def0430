//! Address discovery and transaction scanning.
//!
//! A scan pass walks payment and change keys in batches, querying the chain
//! for each address concurrently. New keys are created until a whole batch
//! of `gap_limit` keys turns up no new transactions. Confirmation refreshes
//! run as background tasks and are joined before balances are recomputed.

use crate::chain::{ChainService, ChainTransaction};
use crate::keystore::KeyProvider;
use crate::ledger::UtxoLedger;
use crate::network::Network;
use crate::storage::{KeyFilter, KeyRecord, TransactionFilter, TransactionRecord, WalletRepository};
use crate::types::{KeyId, Scheme, TxStatus};
use crate::{Result, WalletError};
use futures_util::future::try_join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub account_id: Option<u32>,
    pub network: Option<Network>,
    /// Restrict to payment (0) or change (1) keys.
    pub change: Option<u32>,
    /// Chain height the pass is for. Fetched from the chain when unset.
    pub height: Option<u64>,
    /// Scan even when the wallet is already scanned up to `height`.
    pub rescan: bool,
    pub keys_ignore: Vec<KeyId>,
}

#[derive(Clone)]
pub struct SyncEngine {
    repo: Arc<dyn WalletRepository>,
    chain: Arc<dyn ChainService>,
    ledger: UtxoLedger,
    gap_limit: usize,
    max_transactions: usize,
}

impl SyncEngine {
    pub fn new(
        repo: Arc<dyn WalletRepository>,
        chain: Arc<dyn ChainService>,
        ledger: UtxoLedger,
        gap_limit: usize,
        max_transactions: usize,
    ) -> Self {
        Self {
            repo,
            chain,
            ledger,
            gap_limit: gap_limit.max(1),
            max_transactions: max_transactions.max(1),
        }
    }

    pub fn gap_limit(&self) -> usize {
        self.gap_limit
    }

    /// Fetches the full history of one key. Returns the txids not seen
    /// before in this pass.
    pub async fn scan_key(&self, key: &KeyRecord, processed: &Mutex<HashSet<String>>) -> Result<Vec<String>> {
        let mut after = key.latest_tx_index;
        let mut history: Vec<ChainTransaction> = Vec::new();
        loop {
            let page = self
                .chain
                .get_transactions_by_address(&key.address, after, self.max_transactions)
                .await?;
            let fetched = page.len();
            after += fetched;
            history.extend(page);
            if fetched < self.max_transactions {
                break;
            }
        }

        let mut new_txids = Vec::new();
        {
            let mut seen = processed.lock().await;
            history.retain(|tx| {
                if seen.insert(tx.txid.clone()) {
                    new_txids.push(tx.txid.clone());
                    true
                } else {
                    false
                }
            });
        }
        let stored = self.ledger.apply_scan_results(history).await?;
        if after != key.latest_tx_index {
            self.repo.set_latest_tx_index(key.id, after).await?;
        }
        log::debug!(
            "Scanned key {} ({}): {} new transactions, {} stored",
            key.id,
            key.address,
            new_txids.len(),
            stored
        );
        Ok(new_txids)
    }

    async fn scan_batch(&self, keys: &[KeyRecord], processed: &Arc<Mutex<HashSet<String>>>) -> Result<Vec<String>> {
        let results = try_join_all(keys.iter().map(|key| self.scan_key(key, processed))).await?;
        Ok(results.into_iter().flatten().collect())
    }

    fn spawn_refresh(&self, tasks: &mut JoinSet<Result<usize>>, height: u64, known: &[TransactionRecord]) {
        if !known.is_empty() {
            let ledger = self.ledger.clone();
            tasks.spawn(async move { ledger.update_confirmations(height).await });
        }
        let unconfirmed: Vec<String> = known
            .iter()
            .filter(|t| t.status == TxStatus::Unconfirmed)
            .map(|t| t.txid.clone())
            .collect();
        if !unconfirmed.is_empty() {
            let ledger = self.ledger.clone();
            let chain = self.chain.clone();
            tasks.spawn(async move { ledger.refresh_transactions(chain.as_ref(), &unconfirmed).await });
        }
    }

    /// Runs one scan pass and returns the ids of transactions found.
    pub async fn scan(&self, keys: &mut dyn KeyProvider, request: &ScanRequest) -> Result<BTreeSet<String>> {
        let wallet_id = keys.wallet().id;
        let wallet = self
            .repo
            .get_wallet(wallet_id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Wallet {}", wallet_id)))?;
        let height = match request.height {
            Some(height) => height,
            None => self.chain.block_height().await?,
        };
        if !request.rescan && height <= wallet.last_scanned_height {
            log::debug!("Wallet {} already scanned up to height {}", wallet.name, height);
            return Ok(BTreeSet::new());
        }

        let known = self
            .repo
            .find_transactions(&TransactionFilter::wallet(wallet_id))
            .await?;
        let processed = Arc::new(Mutex::new(
            known.iter().map(|t| t.txid.clone()).collect::<HashSet<_>>(),
        ));
        let mut tasks = JoinSet::new();
        self.spawn_refresh(&mut tasks, height, &known);

        let outcome = self.scan_keys(keys, request, wallet.scheme, &processed).await;
        // Background work is always joined, also when the key walk failed.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined? {
                log::warn!("Transaction refresh failed for wallet {}: {}", wallet.name, e);
                return Err(e);
            }
        }
        let found = outcome?;

        self.ledger.update_input_output_key_ids().await?;
        self.ledger.balance_update(0).await?;
        let mut wallet = self
            .repo
            .get_wallet(wallet_id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Wallet {}", wallet_id)))?;
        wallet.last_scanned_height = height;
        self.repo.update_wallet(&wallet).await?;
        log::info!(
            "Scan of wallet {} at height {} found {} new transactions",
            wallet.name,
            height,
            found.len()
        );
        Ok(found)
    }

    async fn scan_keys(
        &self,
        keys: &mut dyn KeyProvider,
        request: &ScanRequest,
        scheme: Scheme,
        processed: &Arc<Mutex<HashSet<String>>>,
    ) -> Result<BTreeSet<String>> {
        let mut found = BTreeSet::new();
        if scheme == Scheme::Single {
            let main = keys.main_key().await?;
            found.extend(self.scan_key(&main, processed).await?);
            return Ok(found);
        }

        let changes: Vec<u32> = match request.change {
            Some(change) => vec![change],
            None => vec![0, 1],
        };
        for change in changes {
            let mut scanned: HashSet<KeyId> = request.keys_ignore.iter().copied().collect();
            if request.rescan {
                // Used keys are skipped by the gap walk, refresh their history too.
                let mut filter = KeyFilter::wallet(keys.wallet().id).change(change).used(true);
                filter.account_id = request.account_id;
                filter.network = request.network;
                let used: Vec<KeyRecord> = self
                    .repo
                    .find_keys(&filter)
                    .await?
                    .into_iter()
                    .filter(|k| k.address_index.is_some() && scanned.insert(k.id))
                    .collect();
                found.extend(self.scan_batch(&used, processed).await?);
            }
            let mut force = false;
            loop {
                let batch: Vec<KeyRecord> = keys
                    .get_keys(request.account_id, request.network, change, self.gap_limit, force)
                    .await?
                    .into_iter()
                    .filter(|k| scanned.insert(k.id))
                    .collect();
                if batch.is_empty() {
                    break;
                }
                let new_txids = self.scan_batch(&batch, processed).await?;
                log::debug!(
                    "Scanned {} keys (change {}), {} new transactions",
                    batch.len(),
                    change,
                    new_txids.len()
                );
                if new_txids.is_empty() {
                    break;
                }
                found.extend(new_txids);
                force = true;
            }
        }
        Ok(found)
    }
}
