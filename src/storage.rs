//! Wallet storage.
//!
//! [`WalletRepository`] is the system of record for wallets, keys and
//! transactions. Every method is a single atomic unit of work: it either
//! commits fully or leaves the stored state untouched.
//!
//! [`MemoryRepository`] keeps all tables behind one `RwLock` and can mirror
//! every committed write to a JSON snapshot on disk.

use crate::network::Network;
use crate::types::{KeyId, KeyType, Scheme, ScriptType, TransactionId, TxStatus, WalletId, WitnessType};
use crate::utils::persistence::SnapshotFile;
use crate::{Result, WalletError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub id: WalletId,
    pub name: String,
    pub owner: String,
    pub scheme: Scheme,
    pub witness_type: WitnessType,
    pub multisig: bool,
    pub sigs_required: u32,
    pub sort_keys: bool,
    pub key_path: Vec<String>,
    pub purpose: u32,
    pub cosigner_id: Option<u32>,
    pub default_account_id: u32,
    pub network: Network,
    pub main_key_id: Option<KeyId>,
    pub parent_id: Option<WalletId>,
    pub balance: u64,
    pub last_scanned_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: KeyId,
    pub wallet_id: WalletId,
    pub parent_id: Option<KeyId>,
    pub name: String,
    pub path: String,
    pub depth: u32,
    pub account_id: u32,
    pub change: Option<u32>,
    pub address_index: Option<u32>,
    pub purpose: u32,
    pub network: Network,
    pub key_type: KeyType,
    pub cosigner_id: Option<u32>,
    pub is_private: bool,
    pub witness_type: WitnessType,
    /// Compressed public key hex. Empty for multisig keys.
    pub public: String,
    /// Extended key, WIF, hex public key, or `multisig-<address>`.
    pub wif: String,
    pub address: String,
    pub encoding: String,
    pub used: bool,
    pub balance: u64,
    pub latest_tx_index: usize,
    /// Constituent cosigner key ids, in redeem script order.
    pub multisig_children: Vec<KeyId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInputRecord {
    pub index_n: u32,
    pub prev_txid: String,
    pub output_n: u32,
    pub key_id: Option<KeyId>,
    pub address: Option<String>,
    pub value: u64,
    pub script_type: ScriptType,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputRecord {
    pub output_n: u32,
    pub key_id: Option<KeyId>,
    pub address: Option<String>,
    pub value: u64,
    pub script: String,
    pub script_type: ScriptType,
    pub spent: bool,
    pub spending_txid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub txid: String,
    pub wallet_id: WalletId,
    pub account_id: u32,
    pub network: Network,
    pub fee: Option<u64>,
    pub size: usize,
    pub locktime: u32,
    pub version: i32,
    pub block_height: Option<u64>,
    pub confirmations: u32,
    pub status: TxStatus,
    pub input_total: u64,
    pub output_total: u64,
    pub raw: Option<String>,
    pub inputs: Vec<TxInputRecord>,
    pub outputs: Vec<TxOutputRecord>,
}

/// Key query. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub wallet_id: WalletId,
    pub account_id: Option<u32>,
    pub network: Option<Network>,
    pub change: Option<u32>,
    pub depth: Option<u32>,
    pub used: Option<bool>,
    pub key_type: Option<KeyType>,
    pub address: Option<String>,
    pub path: Option<String>,
    pub cosigner_id: Option<u32>,
    pub purpose: Option<u32>,
    pub is_private: Option<bool>,
}

impl KeyFilter {
    pub fn wallet(wallet_id: WalletId) -> Self {
        Self {
            wallet_id,
            ..Default::default()
        }
    }

    pub fn account(mut self, account_id: u32) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn network(mut self, network: Network) -> Self {
        self.network = Some(network);
        self
    }

    pub fn change(mut self, change: u32) -> Self {
        self.change = Some(change);
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn used(mut self, used: bool) -> Self {
        self.used = Some(used);
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn purpose(mut self, purpose: u32) -> Self {
        self.purpose = Some(purpose);
        self
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    pub fn private(mut self, is_private: bool) -> Self {
        self.is_private = Some(is_private);
        self
    }

    pub fn matches(&self, key: &KeyRecord) -> bool {
        key.wallet_id == self.wallet_id
            && self.account_id.map_or(true, |a| key.account_id == a)
            && self.network.map_or(true, |n| key.network == n)
            && self.change.map_or(true, |c| key.change == Some(c))
            && self.depth.map_or(true, |d| key.depth == d)
            && self.used.map_or(true, |u| key.used == u)
            && self.key_type.map_or(true, |t| key.key_type == t)
            && self.address.as_ref().map_or(true, |a| &key.address == a)
            && self.path.as_ref().map_or(true, |p| &key.path == p)
            && self.cosigner_id.map_or(true, |c| key.cosigner_id == Some(c))
            && self.purpose.map_or(true, |p| key.purpose == p)
            && self.is_private.map_or(true, |p| key.is_private == p)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub wallet_id: WalletId,
    pub account_id: Option<u32>,
    pub network: Option<Network>,
    pub status: Option<TxStatus>,
}

impl TransactionFilter {
    pub fn wallet(wallet_id: WalletId) -> Self {
        Self {
            wallet_id,
            ..Default::default()
        }
    }

    pub fn matches(&self, tx: &TransactionRecord) -> bool {
        tx.wallet_id == self.wallet_id
            && self.account_id.map_or(true, |a| tx.account_id == a)
            && self.network.map_or(true, |n| tx.network == n)
            && self.status.map_or(true, |s| tx.status == s)
    }
}

#[async_trait]
pub trait WalletRepository: Send + Sync {
    async fn create_wallet(&self, record: WalletRecord) -> Result<WalletId>;
    async fn get_wallet(&self, id: WalletId) -> Result<Option<WalletRecord>>;
    async fn find_wallet_by_name(&self, name: &str) -> Result<Option<WalletRecord>>;
    /// Cosigner wallets of a multisig parent, ordered by cosigner id.
    async fn cosigner_wallets(&self, parent_id: WalletId) -> Result<Vec<WalletRecord>>;
    async fn update_wallet(&self, record: &WalletRecord) -> Result<()>;
    /// Removes a wallet with its keys, transactions and cosigner wallets.
    async fn delete_wallet(&self, id: WalletId) -> Result<()>;

    async fn create_key(&self, record: KeyRecord) -> Result<KeyId>;
    async fn get_key(&self, id: KeyId) -> Result<Option<KeyRecord>>;
    /// Matching keys ordered by id.
    async fn find_keys(&self, filter: &KeyFilter) -> Result<Vec<KeyRecord>>;
    async fn update_key(&self, record: &KeyRecord) -> Result<()>;
    async fn mark_keys_used(&self, ids: &[KeyId]) -> Result<()>;
    /// Records how far the address history of a key has been scanned.
    async fn set_latest_tx_index(&self, id: KeyId, index: usize) -> Result<()>;
    async fn update_key_balances(&self, balances: &[(KeyId, u64)]) -> Result<()>;

    /// Inserts or merges a transaction by (wallet, txid) and links spent
    /// outputs in both directions. Returns the row id and whether it is new.
    async fn store_transaction(&self, record: TransactionRecord) -> Result<(TransactionId, bool)>;
    async fn get_transaction(&self, wallet_id: WalletId, txid: &str) -> Result<Option<TransactionRecord>>;
    async fn find_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>>;
    async fn update_transaction_status(
        &self,
        wallet_id: WalletId,
        txid: &str,
        block_height: Option<u64>,
        confirmations: u32,
    ) -> Result<()>;
    /// Returns false when the output is unknown. Spent never reverts.
    async fn mark_output_spent(
        &self,
        wallet_id: WalletId,
        txid: &str,
        output_n: u32,
        spending_txid: Option<&str>,
    ) -> Result<bool>;
    /// Fills missing input and output key ids from an address map.
    async fn link_key_ids(&self, wallet_id: WalletId, links: &BTreeMap<String, KeyId>) -> Result<usize>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    next_id: u64,
    wallets: BTreeMap<WalletId, WalletRecord>,
    keys: BTreeMap<KeyId, KeyRecord>,
    transactions: BTreeMap<TransactionId, TransactionRecord>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn find_tx_mut(&mut self, wallet_id: WalletId, txid: &str) -> Option<&mut TransactionRecord> {
        self.transactions
            .values_mut()
            .find(|t| t.wallet_id == wallet_id && t.txid == txid)
    }

    fn spend_output(&mut self, wallet_id: WalletId, txid: &str, output_n: u32, spending_txid: Option<&str>) -> bool {
        let Some(tx) = self.find_tx_mut(wallet_id, txid) else {
            return false;
        };
        match tx.outputs.iter_mut().find(|o| o.output_n == output_n) {
            Some(output) => {
                if !output.spent {
                    output.spent = true;
                    output.spending_txid = spending_txid.map(str::to_string);
                }
                true
            }
            None => false,
        }
    }
}

fn merge_transaction(existing: &mut TransactionRecord, incoming: TransactionRecord) {
    existing.account_id = incoming.account_id;
    existing.block_height = incoming.block_height.or(existing.block_height);
    existing.confirmations = existing.confirmations.max(incoming.confirmations);
    existing.status = match (existing.status, incoming.status) {
        (TxStatus::Confirmed, _) | (_, TxStatus::Confirmed) => TxStatus::Confirmed,
        (TxStatus::Unconfirmed, _) | (_, TxStatus::Unconfirmed) => TxStatus::Unconfirmed,
        _ => TxStatus::New,
    };
    existing.fee = incoming.fee.or(existing.fee);
    existing.raw = incoming.raw.or(existing.raw.take());
    if incoming.size > 0 {
        existing.size = incoming.size;
    }
    existing.input_total = existing.input_total.max(incoming.input_total);
    existing.output_total = existing.output_total.max(incoming.output_total);

    for input in incoming.inputs {
        match existing.inputs.iter_mut().find(|i| i.index_n == input.index_n) {
            Some(current) => {
                current.key_id = current.key_id.or(input.key_id);
                current.address = current.address.take().or(input.address);
                if current.value == 0 {
                    current.value = input.value;
                }
            }
            None => existing.inputs.push(input),
        }
    }
    for output in incoming.outputs {
        match existing.outputs.iter_mut().find(|o| o.output_n == output.output_n) {
            Some(current) => {
                current.key_id = current.key_id.or(output.key_id);
                current.address = current.address.take().or(output.address);
                if !current.spent && output.spent {
                    current.spent = true;
                    current.spending_txid = output.spending_txid;
                }
            }
            None => existing.outputs.push(output),
        }
    }
    existing.inputs.sort_by_key(|i| i.index_n);
    existing.outputs.sort_by_key(|o| o.output_n);
}

pub struct MemoryRepository {
    tables: RwLock<Tables>,
    snapshot: Option<SnapshotFile>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Restores from `path` when it exists. Every later commit rewrites it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let snapshot = SnapshotFile::new(path.as_ref());
        let tables = snapshot.load::<Tables>()?.unwrap_or_default();
        log::info!(
            "Opened wallet store {:?} with {} wallets and {} keys",
            snapshot.path(),
            tables.wallets.len(),
            tables.keys.len()
        );
        Ok(Self {
            tables: RwLock::new(tables),
            snapshot: Some(snapshot),
        })
    }

    /// Applies `f` to a staged copy and publishes it only when `f` and the
    /// snapshot write both succeed.
    async fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut guard = self.tables.write().await;
        let mut staged = guard.clone();
        let out = f(&mut staged)?;
        if let Some(snapshot) = &self.snapshot {
            snapshot.save(&staged)?;
        }
        *guard = staged;
        Ok(out)
    }
}

#[async_trait]
impl WalletRepository for MemoryRepository {
    async fn create_wallet(&self, record: WalletRecord) -> Result<WalletId> {
        self.write(|t| {
            if t.wallets.values().any(|w| w.name == record.name) {
                return Err(WalletError::Configuration(format!(
                    "Wallet with name '{}' already exists",
                    record.name
                )));
            }
            let id = t.allocate_id();
            t.wallets.insert(id, WalletRecord { id, ..record });
            Ok(id)
        })
        .await
    }

    async fn get_wallet(&self, id: WalletId) -> Result<Option<WalletRecord>> {
        Ok(self.tables.read().await.wallets.get(&id).cloned())
    }

    async fn find_wallet_by_name(&self, name: &str) -> Result<Option<WalletRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .wallets
            .values()
            .find(|w| w.name == name)
            .cloned())
    }

    async fn cosigner_wallets(&self, parent_id: WalletId) -> Result<Vec<WalletRecord>> {
        let tables = self.tables.read().await;
        let mut wallets: Vec<WalletRecord> = tables
            .wallets
            .values()
            .filter(|w| w.parent_id == Some(parent_id))
            .cloned()
            .collect();
        wallets.sort_by_key(|w| (w.cosigner_id, w.id));
        Ok(wallets)
    }

    async fn update_wallet(&self, record: &WalletRecord) -> Result<()> {
        self.write(|t| match t.wallets.get_mut(&record.id) {
            Some(current) => {
                *current = record.clone();
                Ok(())
            }
            None => Err(WalletError::NotFound(format!("Wallet {}", record.id))),
        })
        .await
    }

    async fn delete_wallet(&self, id: WalletId) -> Result<()> {
        self.write(|t| {
            if !t.wallets.contains_key(&id) {
                return Err(WalletError::NotFound(format!("Wallet {}", id)));
            }
            let mut doomed: Vec<WalletId> = vec![id];
            doomed.extend(t.wallets.values().filter(|w| w.parent_id == Some(id)).map(|w| w.id));
            t.wallets.retain(|wid, _| !doomed.contains(wid));
            t.keys.retain(|_, k| !doomed.contains(&k.wallet_id));
            t.transactions.retain(|_, tx| !doomed.contains(&tx.wallet_id));
            Ok(())
        })
        .await
    }

    async fn create_key(&self, record: KeyRecord) -> Result<KeyId> {
        self.write(|t| {
            if !t.wallets.contains_key(&record.wallet_id) {
                return Err(WalletError::NotFound(format!("Wallet {}", record.wallet_id)));
            }
            let id = t.allocate_id();
            t.keys.insert(id, KeyRecord { id, ..record });
            Ok(id)
        })
        .await
    }

    async fn get_key(&self, id: KeyId) -> Result<Option<KeyRecord>> {
        Ok(self.tables.read().await.keys.get(&id).cloned())
    }

    async fn find_keys(&self, filter: &KeyFilter) -> Result<Vec<KeyRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .keys
            .values()
            .filter(|k| filter.matches(k))
            .cloned()
            .collect())
    }

    async fn update_key(&self, record: &KeyRecord) -> Result<()> {
        self.write(|t| match t.keys.get_mut(&record.id) {
            Some(current) => {
                *current = record.clone();
                Ok(())
            }
            None => Err(WalletError::NotFound(format!("Key {}", record.id))),
        })
        .await
    }

    async fn mark_keys_used(&self, ids: &[KeyId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.write(|t| {
            for id in ids {
                if let Some(key) = t.keys.get_mut(id) {
                    key.used = true;
                }
            }
            Ok(())
        })
        .await
    }

    async fn set_latest_tx_index(&self, id: KeyId, index: usize) -> Result<()> {
        self.write(|t| match t.keys.get_mut(&id) {
            Some(key) => {
                key.latest_tx_index = index;
                Ok(())
            }
            None => Err(WalletError::NotFound(format!("Key {}", id))),
        })
        .await
    }

    async fn update_key_balances(&self, balances: &[(KeyId, u64)]) -> Result<()> {
        self.write(|t| {
            for (id, balance) in balances {
                let key = t
                    .keys
                    .get_mut(id)
                    .ok_or_else(|| WalletError::NotFound(format!("Key {}", id)))?;
                key.balance = *balance;
            }
            Ok(())
        })
        .await
    }

    async fn store_transaction(&self, record: TransactionRecord) -> Result<(TransactionId, bool)> {
        self.write(|t| {
            let wallet_id = record.wallet_id;
            let txid = record.txid.clone();
            let spends: Vec<(String, u32)> = record
                .inputs
                .iter()
                .map(|i| (i.prev_txid.clone(), i.output_n))
                .collect();

            let (id, created) = match t.find_tx_mut(wallet_id, &txid) {
                Some(existing) => {
                    let id = existing.id;
                    merge_transaction(existing, record);
                    (id, false)
                }
                None => {
                    let id = t.allocate_id();
                    t.transactions.insert(id, TransactionRecord { id, ..record });
                    (id, true)
                }
            };

            for (prev_txid, output_n) in spends {
                t.spend_output(wallet_id, &prev_txid, output_n, Some(txid.as_str()));
            }
            // Spending transactions stored before this one.
            let mut spenders: Vec<(u32, String)> = Vec::new();
            for other in t.transactions.values() {
                if other.wallet_id != wallet_id || other.txid == txid {
                    continue;
                }
                for input in other.inputs.iter().filter(|i| i.prev_txid == txid) {
                    spenders.push((input.output_n, other.txid.clone()));
                }
            }
            for (output_n, spender) in spenders {
                t.spend_output(wallet_id, &txid, output_n, Some(spender.as_str()));
            }
            Ok((id, created))
        })
        .await
    }

    async fn get_transaction(&self, wallet_id: WalletId, txid: &str) -> Result<Option<TransactionRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .transactions
            .values()
            .find(|t| t.wallet_id == wallet_id && t.txid == txid)
            .cloned())
    }

    async fn find_transactions(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .transactions
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn update_transaction_status(
        &self,
        wallet_id: WalletId,
        txid: &str,
        block_height: Option<u64>,
        confirmations: u32,
    ) -> Result<()> {
        self.write(|t| {
            let tx = t
                .find_tx_mut(wallet_id, txid)
                .ok_or_else(|| WalletError::NotFound(format!("Transaction {}", txid)))?;
            tx.block_height = block_height.or(tx.block_height);
            tx.confirmations = confirmations;
            tx.status = if confirmations > 0 {
                TxStatus::Confirmed
            } else {
                TxStatus::Unconfirmed
            };
            Ok(())
        })
        .await
    }

    async fn mark_output_spent(
        &self,
        wallet_id: WalletId,
        txid: &str,
        output_n: u32,
        spending_txid: Option<&str>,
    ) -> Result<bool> {
        self.write(|t| Ok(t.spend_output(wallet_id, txid, output_n, spending_txid)))
            .await
    }

    async fn link_key_ids(&self, wallet_id: WalletId, links: &BTreeMap<String, KeyId>) -> Result<usize> {
        self.write(|t| {
            let mut linked = 0;
            for tx in t.transactions.values_mut().filter(|tx| tx.wallet_id == wallet_id) {
                for input in tx.inputs.iter_mut().filter(|i| i.key_id.is_none()) {
                    if let Some(id) = input.address.as_ref().and_then(|a| links.get(a)) {
                        input.key_id = Some(*id);
                        linked += 1;
                    }
                }
                for output in tx.outputs.iter_mut().filter(|o| o.key_id.is_none()) {
                    if let Some(id) = output.address.as_ref().and_then(|a| links.get(a)) {
                        output.key_id = Some(*id);
                        linked += 1;
                    }
                }
            }
            Ok(linked)
        })
        .await
    }
}
