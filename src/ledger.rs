//! Unspent output tracking and balances.

use crate::chain::{ChainService, ChainTransaction};
use crate::network::Network;
use crate::storage::{
    KeyFilter, KeyRecord, TransactionFilter, TransactionRecord, TxInputRecord, TxOutputRecord, WalletRepository,
};
use crate::types::{KeyId, ScriptType, TransactionId, TxStatus, WalletId};
use crate::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A spendable output owned by one of the wallet's keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub output_n: u32,
    pub key_id: KeyId,
    pub address: String,
    pub value: u64,
    pub script: String,
    pub script_type: ScriptType,
    pub confirmations: u32,
    pub account_id: u32,
    pub network: Network,
}

/// Balance per (network, account) after a recompute.
pub type BalanceMap = BTreeMap<(Network, u32), u64>;

fn status_for(confirmations: u32) -> TxStatus {
    if confirmations > 0 {
        TxStatus::Confirmed
    } else {
        TxStatus::Unconfirmed
    }
}

#[derive(Clone)]
pub struct UtxoLedger {
    repo: Arc<dyn WalletRepository>,
    wallet_id: WalletId,
    network: Network,
}

impl UtxoLedger {
    pub fn new(repo: Arc<dyn WalletRepository>, wallet_id: WalletId, network: Network) -> Self {
        Self {
            repo,
            wallet_id,
            network,
        }
    }

    async fn keys_by_address(&self) -> Result<HashMap<String, KeyRecord>> {
        let keys = self.repo.find_keys(&KeyFilter::wallet(self.wallet_id)).await?;
        Ok(keys.into_iter().map(|k| (k.address.clone(), k)).collect())
    }

    fn to_record(&self, tx: ChainTransaction, keys: &HashMap<String, KeyRecord>) -> (TransactionRecord, Vec<KeyId>) {
        let key_of = |address: &Option<String>| address.as_ref().and_then(|a| keys.get(a));
        let mut used = Vec::new();
        let mut account_id = None;
        let mut network = self.network;

        let inputs = tx
            .inputs
            .iter()
            .map(|i| {
                let key = key_of(&i.address);
                if let Some(k) = key {
                    used.push(k.id);
                    if account_id.is_none() {
                        account_id = Some(k.account_id);
                        network = k.network;
                    }
                }
                TxInputRecord {
                    index_n: i.index_n,
                    prev_txid: i.prev_txid.clone(),
                    output_n: i.output_n,
                    key_id: key.map(|k| k.id),
                    address: i.address.clone(),
                    value: i.value,
                    script_type: i.script_type,
                    sequence: i.sequence,
                }
            })
            .collect();
        let outputs = tx
            .outputs
            .iter()
            .map(|o| {
                let key = key_of(&o.address);
                if let Some(k) = key {
                    used.push(k.id);
                    if account_id.is_none() {
                        account_id = Some(k.account_id);
                        network = k.network;
                    }
                }
                TxOutputRecord {
                    output_n: o.output_n,
                    key_id: key.map(|k| k.id),
                    address: o.address.clone(),
                    value: o.value,
                    script: o.script.clone(),
                    script_type: o.script_type,
                    spent: o.spent,
                    spending_txid: None,
                }
            })
            .collect();

        let record = TransactionRecord {
            id: 0,
            wallet_id: self.wallet_id,
            account_id: account_id.unwrap_or(0),
            network,
            fee: tx.fee,
            size: tx.size,
            locktime: tx.locktime,
            version: tx.version,
            block_height: tx.block_height,
            confirmations: tx.confirmations,
            status: status_for(tx.confirmations),
            input_total: tx.input_total(),
            output_total: tx.output_total(),
            raw: tx.raw,
            inputs,
            outputs,
            txid: tx.txid,
        };
        used.sort_unstable();
        used.dedup();
        (record, used)
    }

    /// Stores chain transactions, linking them to wallet keys. Returns the
    /// number of transactions not seen before.
    pub async fn apply_scan_results(&self, txs: Vec<ChainTransaction>) -> Result<usize> {
        if txs.is_empty() {
            return Ok(0);
        }
        let keys = self.keys_by_address().await?;
        let mut created = 0;
        let mut used = Vec::new();
        for tx in txs {
            let (record, touched) = self.to_record(tx, &keys);
            let (_, is_new) = self.repo.store_transaction(record).await?;
            if is_new {
                created += 1;
            }
            used.extend(touched);
        }
        used.sort_unstable();
        used.dedup();
        self.repo.mark_keys_used(&used).await?;
        Ok(created)
    }

    /// Recomputes key and wallet balances from unspent outputs with at least
    /// `min_confirms` confirmations.
    pub async fn balance_update(&self, min_confirms: u32) -> Result<BalanceMap> {
        let txs = self.repo.find_transactions(&TransactionFilter::wallet(self.wallet_id)).await?;
        let mut per_key: HashMap<KeyId, u64> = HashMap::new();
        for tx in txs
            .iter()
            .filter(|t| t.status != TxStatus::New && t.confirmations >= min_confirms)
        {
            for output in tx.outputs.iter().filter(|o| !o.spent) {
                if let Some(key_id) = output.key_id {
                    *per_key.entry(key_id).or_default() += output.value;
                }
            }
        }

        let keys = self.repo.find_keys(&KeyFilter::wallet(self.wallet_id)).await?;
        let mut balances = BalanceMap::new();
        let mut updates = Vec::new();
        for key in &keys {
            let balance = per_key.get(&key.id).copied().unwrap_or(0);
            if balance > 0 {
                *balances.entry((key.network, key.account_id)).or_default() += balance;
            }
            if key.balance != balance {
                updates.push((key.id, balance));
            }
        }
        self.repo.update_key_balances(&updates).await?;

        let total: u64 = balances
            .iter()
            .filter(|((network, _), _)| *network == self.network)
            .map(|(_, v)| *v)
            .sum();
        let mut wallet = self
            .repo
            .get_wallet(self.wallet_id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Wallet {}", self.wallet_id)))?;
        if wallet.balance != total {
            wallet.balance = total;
            self.repo.update_wallet(&wallet).await?;
        }
        log::debug!(
            "Balance of wallet {} is {} ({} keys updated)",
            wallet.name,
            total,
            updates.len()
        );
        Ok(balances)
    }

    /// Unspent outputs, most confirmed first. Ties keep storage order.
    pub async fn utxos(
        &self,
        account_id: Option<u32>,
        network: Option<Network>,
        min_confirms: u32,
        key_id: Option<KeyId>,
    ) -> Result<Vec<Utxo>> {
        let mut filter = TransactionFilter::wallet(self.wallet_id);
        filter.account_id = account_id;
        filter.network = Some(network.unwrap_or(self.network));
        let txs = self.repo.find_transactions(&filter).await?;
        let mut utxos: Vec<Utxo> = txs
            .iter()
            .filter(|t| t.status != TxStatus::New && t.confirmations >= min_confirms)
            .flat_map(|t| {
                t.outputs.iter().filter_map(move |o| {
                    let owner = o.key_id?;
                    if o.spent || key_id.map_or(false, |k| k != owner) {
                        return None;
                    }
                    Some(Utxo {
                        txid: t.txid.clone(),
                        output_n: o.output_n,
                        key_id: owner,
                        address: o.address.clone().unwrap_or_default(),
                        value: o.value,
                        script: o.script.clone(),
                        script_type: o.script_type,
                        confirmations: t.confirmations,
                        account_id: t.account_id,
                        network: t.network,
                    })
                })
            })
            .collect();
        utxos.sort_by(|a, b| b.confirmations.cmp(&a.confirmations));
        Ok(utxos)
    }

    /// Records a known unspent output without consulting the chain.
    pub async fn utxo_add(
        &self,
        address: &str,
        value: u64,
        txid: &str,
        output_n: u32,
        confirmations: u32,
    ) -> Result<TransactionId> {
        let keys = self
            .repo
            .find_keys(&KeyFilter::wallet(self.wallet_id).address(address))
            .await?;
        let key = keys
            .into_iter()
            .next()
            .ok_or_else(|| WalletError::NotFound(format!("No key found for address {}", address)))?;
        let record = TransactionRecord {
            id: 0,
            txid: txid.to_string(),
            wallet_id: self.wallet_id,
            account_id: key.account_id,
            network: key.network,
            fee: None,
            size: 0,
            locktime: 0,
            version: 1,
            block_height: None,
            confirmations,
            status: status_for(confirmations),
            input_total: 0,
            output_total: value,
            raw: None,
            inputs: Vec::new(),
            outputs: vec![TxOutputRecord {
                output_n,
                key_id: Some(key.id),
                address: Some(address.to_string()),
                value,
                script: String::new(),
                script_type: ScriptType::for_wallet(key.witness_type, key.key_type == crate::types::KeyType::Multisig),
                spent: false,
                spending_txid: None,
            }],
        };
        let (id, _) = self.repo.store_transaction(record).await?;
        self.repo.mark_keys_used(&[key.id]).await?;
        Ok(id)
    }

    /// Recomputes confirmations of mined transactions for a new tip height.
    pub async fn update_confirmations(&self, height: u64) -> Result<usize> {
        let txs = self.repo.find_transactions(&TransactionFilter::wallet(self.wallet_id)).await?;
        let mut updated = 0;
        for tx in txs {
            let Some(block_height) = tx.block_height else {
                continue;
            };
            let confirmations = height.saturating_sub(block_height).saturating_add(1) as u32;
            if block_height <= height && confirmations != tx.confirmations {
                self.repo
                    .update_transaction_status(self.wallet_id, &tx.txid, Some(block_height), confirmations)
                    .await?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Refreshes block height and confirmations of the given transactions.
    pub async fn refresh_transactions(&self, chain: &dyn ChainService, txids: &[String]) -> Result<usize> {
        if txids.is_empty() {
            return Ok(0);
        }
        let fresh = chain.get_transactions(txids).await?;
        let mut updated = 0;
        for tx in fresh {
            if let Some(stored) = self.repo.get_transaction(self.wallet_id, &tx.txid).await? {
                if stored.confirmations != tx.confirmations || stored.block_height != tx.block_height {
                    self.repo
                        .update_transaction_status(self.wallet_id, &tx.txid, tx.block_height, tx.confirmations)
                        .await?;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    /// Links inputs and outputs to keys created after the transaction was stored.
    pub async fn update_input_output_key_ids(&self) -> Result<usize> {
        let links: BTreeMap<String, KeyId> = self
            .repo
            .find_keys(&KeyFilter::wallet(self.wallet_id))
            .await?
            .into_iter()
            .filter(|k| !k.address.is_empty())
            .map(|k| (k.address, k.id))
            .collect();
        self.repo.link_key_ids(self.wallet_id, &links).await
    }

    pub async fn transactions(&self, account_id: Option<u32>, network: Option<Network>) -> Result<Vec<TransactionRecord>> {
        let mut filter = TransactionFilter::wallet(self.wallet_id);
        filter.account_id = account_id;
        filter.network = network;
        self.repo.find_transactions(&filter).await
    }

    pub async fn mark_spent(&self, txid: &str, output_n: u32, spending_txid: Option<&str>) -> Result<bool> {
        self.repo
            .mark_output_spent(self.wallet_id, txid, output_n, spending_txid)
            .await
    }
}
