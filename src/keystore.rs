//! Per-wallet key store.
//!
//! A [`WalletKeyStore`] maps derivation paths to persisted keys. Keys are
//! materialized lazily: [`WalletKeyStore::key_for_path`] walks up from the
//! requested path to the nearest stored ancestor and derives each missing
//! level from it. Derived keys are cached in a [`KeyArena`] owned by the
//! store, indexed by their persisted id.

use crate::network::Network;
use crate::path::{self, PathContext};
use crate::primitives::address::Address;
use crate::primitives::bip32::HdKey;
use crate::primitives::script::Script;
use crate::storage::{KeyFilter, KeyRecord, WalletRecord, WalletRepository};
use crate::types::{KeyId, KeyType, Scheme, ScriptType, WitnessType};
use crate::{Result, WalletError};
use async_trait::async_trait;
use secp256k1::SecretKey;
use std::collections::HashMap;
use std::sync::Arc;

/// A persisted key together with its key material. Multisig keys carry no
/// key material of their own.
#[derive(Debug, Clone)]
pub struct WalletKey {
    pub record: KeyRecord,
    pub hd: Option<HdKey>,
}

impl WalletKey {
    pub fn id(&self) -> KeyId {
        self.record.id
    }

    pub fn address(&self) -> &str {
        &self.record.address
    }

    pub fn path(&self) -> &str {
        &self.record.path
    }

    pub fn is_private(&self) -> bool {
        self.hd.as_ref().map_or(false, HdKey::is_private)
    }

    pub fn hd(&self) -> Result<&HdKey> {
        self.hd.as_ref().ok_or_else(|| {
            WalletError::Key(format!("Key {} has no key material", self.record.id))
        })
    }
}

/// Slot map from persisted key id to cached key.
#[derive(Debug, Default)]
pub struct KeyArena {
    slots: Vec<Option<WalletKey>>,
    free: Vec<usize>,
    index: HashMap<KeyId, usize>,
}

impl KeyArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `key.id()` and returns its slot.
    pub fn insert(&mut self, key: WalletKey) -> usize {
        if let Some(&slot) = self.index.get(&key.id()) {
            self.slots[slot] = Some(key);
            return slot;
        }
        let id = key.id();
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(key);
                slot
            }
            None => {
                self.slots.push(Some(key));
                self.slots.len() - 1
            }
        };
        self.index.insert(id, slot);
        slot
    }

    pub fn get(&self, id: KeyId) -> Option<&WalletKey> {
        self.index
            .get(&id)
            .and_then(|&slot| self.slots.get(slot))
            .and_then(Option::as_ref)
    }

    pub fn remove(&mut self, id: KeyId) -> Option<WalletKey> {
        let slot = self.index.remove(&id)?;
        self.free.push(slot);
        self.slots[slot].take()
    }

    pub fn contains(&self, id: KeyId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
    }
}

/// Parameters of a [`WalletKeyStore::key_for_path`] call.
#[derive(Debug, Clone, Default)]
pub struct KeyRequest {
    /// Partial (`["0", "5"]`) or absolute (`["m", ...]`) path.
    pub path: Vec<String>,
    pub level_offset: Option<i32>,
    pub account_id: Option<u32>,
    pub cosigner_id: Option<u32>,
    pub network: Option<Network>,
    pub change: u32,
    pub address_index: u32,
    pub name: Option<String>,
    /// Only private ancestors qualify; public keys on the way are upgraded.
    pub recreate: bool,
}

impl KeyRequest {
    pub fn new<S: ToString>(path: impl IntoIterator<Item = S>) -> Self {
        Self {
            path: path.into_iter().map(|s| s.to_string()).collect(),
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

    pub fn cosigner(mut self, cosigner_id: Option<u32>) -> Self {
        self.cosigner_id = cosigner_id;
        self
    }

    pub fn level_offset(mut self, level_offset: i32) -> Self {
        self.level_offset = Some(level_offset);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn recreate(mut self) -> Self {
        self.recreate = true;
        self
    }
}

/// Account, change and address index encoded in a full path.
pub(crate) fn path_fields(template: &[String], fullpath: &[String], default_account: u32) -> (u32, Option<u32>, Option<u32>) {
    let value_at = |token: &str| -> Option<u32> {
        let pos = path::require_token(template, token).ok()?;
        let segment = fullpath.get(pos)?;
        segment.trim_end_matches(path::HARDENED_MARK).parse().ok()
    };
    (
        value_at("account").unwrap_or(default_account),
        value_at("change"),
        value_at("address_index"),
    )
}

/// Address of a single key for the given witness type.
pub(crate) fn key_address(public: &[u8], witness_type: WitnessType, network: Network) -> Result<Address> {
    match witness_type {
        WitnessType::Legacy => Ok(Address::p2pkh(public, network)),
        WitnessType::P2shSegwit => Address::p2sh_p2wpkh(public, network),
        WitnessType::Segwit => Address::p2wpkh(public, network),
    }
}

pub struct WalletKeyStore {
    repo: Arc<dyn WalletRepository>,
    wallet: WalletRecord,
    arena: KeyArena,
}

impl WalletKeyStore {
    pub fn new(repo: Arc<dyn WalletRepository>, wallet: WalletRecord) -> Self {
        Self {
            repo,
            wallet,
            arena: KeyArena::new(),
        }
    }

    pub fn wallet(&self) -> &WalletRecord {
        &self.wallet
    }

    pub fn wallet_id(&self) -> u64 {
        self.wallet.id
    }

    pub fn repository(&self) -> &Arc<dyn WalletRepository> {
        &self.repo
    }

    pub fn cached(&self) -> usize {
        self.arena.len()
    }

    /// Reloads the wallet record after changes made elsewhere.
    pub async fn refresh(&mut self) -> Result<()> {
        self.wallet = self
            .repo
            .get_wallet(self.wallet.id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Wallet {}", self.wallet.id)))?;
        Ok(())
    }

    /// Depth of address level keys.
    pub fn address_depth(&self) -> u32 {
        self.wallet.key_path.len().saturating_sub(1) as u32
    }

    pub fn path_context(&self, network: Network, account_id: u32, cosigner_id: Option<u32>) -> PathContext {
        PathContext {
            network,
            purpose: self.wallet.purpose,
            account_id,
            witness_type: self.wallet.witness_type,
            cosigner_id,
            change: 0,
            address_index: 0,
        }
    }

    /// Stores `hd` as the wallet's main key at `m` (depth 0) or `M`.
    pub async fn set_main_key(&mut self, hd: HdKey, name: &str) -> Result<WalletKey> {
        let network = hd.network();
        let public = hd.public_bytes();
        let address = key_address(&public, self.wallet.witness_type, network)?;
        let depth = hd.depth() as u32;
        let record = KeyRecord {
            id: 0,
            wallet_id: self.wallet.id,
            parent_id: None,
            name: name.to_string(),
            path: if depth == 0 { "m" } else { "M" }.to_string(),
            depth,
            account_id: self.wallet.default_account_id,
            change: None,
            address_index: None,
            purpose: self.wallet.purpose,
            network,
            key_type: if self.wallet.scheme == Scheme::Single {
                KeyType::Single
            } else {
                KeyType::Bip32
            },
            cosigner_id: self.wallet.cosigner_id,
            is_private: hd.is_private(),
            witness_type: self.wallet.witness_type,
            public: hex::encode(&public),
            wif: hd.wif(),
            address: address.to_string(),
            encoding: address.encoding().to_string(),
            used: false,
            balance: 0,
            latest_tx_index: 0,
            multisig_children: Vec::new(),
        };
        let id = self.repo.create_key(record.clone()).await?;
        let mut wallet = self
            .repo
            .get_wallet(self.wallet.id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Wallet {}", self.wallet.id)))?;
        wallet.main_key_id = Some(id);
        self.repo.update_wallet(&wallet).await?;
        self.wallet = wallet;
        self.arena.clear();

        let key = WalletKey {
            record: KeyRecord { id, ..record },
            hd: Some(hd),
        };
        self.arena.insert(key.clone());
        log::debug!("Main key {} stored for wallet {}", id, self.wallet.name);
        Ok(key)
    }

    pub async fn main_key(&mut self) -> Result<WalletKey> {
        let id = self.wallet.main_key_id.ok_or_else(|| {
            WalletError::NotFound(format!("Wallet {} has no main key", self.wallet.name))
        })?;
        // Scans update used flags and tx indexes behind the cache.
        let record = self
            .repo
            .get_key(id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Main key {}", id)))?;
        self.load(record)
    }

    pub async fn key(&mut self, id: KeyId) -> Result<WalletKey> {
        if let Some(key) = self.arena.get(id) {
            return Ok(key.clone());
        }
        let record = self
            .repo
            .get_key(id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Key {}", id)))?;
        if record.wallet_id != self.wallet.id {
            return Err(WalletError::NotFound(format!(
                "Key {} does not belong to wallet {}",
                id, self.wallet.name
            )));
        }
        self.load(record)
    }

    /// Caches a stored record, parsing its key material.
    pub fn load(&mut self, record: KeyRecord) -> Result<WalletKey> {
        if let Some(key) = self.arena.get(record.id) {
            if key.record == record {
                return Ok(key.clone());
            }
        }
        let hd = match record.key_type {
            KeyType::Multisig => None,
            _ => Some(HdKey::import(&record.wif, record.network)?),
        };
        let key = WalletKey { record, hd };
        self.arena.insert(key.clone());
        Ok(key)
    }

    pub async fn find_keys(&self, filter: &KeyFilter) -> Result<Vec<KeyRecord>> {
        self.repo.find_keys(filter).await
    }

    pub async fn key_by_address(&mut self, address: &str) -> Result<Option<WalletKey>> {
        let found = self
            .repo
            .find_keys(&KeyFilter::wallet(self.wallet.id).address(address))
            .await?;
        match found.into_iter().next() {
            Some(record) => Ok(Some(self.load(record)?)),
            None => Ok(None),
        }
    }

    /// Highest address index used for (account, change, network), if any.
    pub async fn last_address_index(&self, account_id: u32, change: u32, network: Network) -> Result<Option<u32>> {
        let mut filter = KeyFilter::wallet(self.wallet.id)
            .network(network)
            .change(change)
            .depth(self.address_depth());
        if path::require_token(&self.wallet.key_path, "account").is_ok() {
            filter = filter.account(account_id);
        }
        let keys = self.repo.find_keys(&filter).await?;
        Ok(keys.iter().filter_map(|k| k.address_index).max())
    }

    pub async fn update_key(&mut self, record: &KeyRecord) -> Result<()> {
        self.repo.update_key(record).await?;
        if self.arena.contains(record.id) {
            self.arena.remove(record.id);
        }
        Ok(())
    }

    /// Persists a new record built elsewhere and caches it.
    pub async fn create_key(&mut self, record: KeyRecord, hd: Option<HdKey>) -> Result<WalletKey> {
        let id = self.repo.create_key(record.clone()).await?;
        let key = WalletKey {
            record: KeyRecord { id, ..record },
            hd,
        };
        self.arena.insert(key.clone());
        Ok(key)
    }

    /// Key at the public master level of `account_id`. Single key wallets
    /// return their main key.
    pub async fn public_master(&mut self, account_id: Option<u32>, network: Option<Network>) -> Result<WalletKey> {
        let main = self.main_key().await?;
        if self.wallet.scheme == Scheme::Single {
            return Ok(main);
        }
        let depth = path::public_master_depth(&self.wallet.key_path);
        if main.record.depth as usize == depth {
            return match account_id {
                Some(id) if id != main.record.account_id => Err(WalletError::Key(format!(
                    "Wallet {} only holds the public master of account {}",
                    self.wallet.name, main.record.account_id
                ))),
                _ => Ok(main),
            };
        }
        let mut request = KeyRequest::new(Vec::<String>::new()).level_offset(depth as i32 - self.address_depth() as i32);
        if let Some(account_id) = account_id {
            request = request.account(account_id);
        }
        if let Some(network) = network {
            request = request.network(network);
        }
        self.key_for_path(&request).await?.ok_or_else(|| {
            WalletError::Key(format!("No public master key available in wallet {}", self.wallet.name))
        })
    }

    /// Adds the private counterpart of a public main key and upgrades every
    /// public key derived below it. Returns the upgraded main key.
    pub async fn upgrade_private(&mut self, hd: HdKey) -> Result<WalletKey> {
        let main = self.main_key().await?;
        if !hd.is_private() {
            return Err(WalletError::Key("Only private keys can upgrade a public key".to_string()));
        }
        if hd.public_bytes() != main.hd()?.public_bytes() {
            return Err(WalletError::Key(format!(
                "Key does not match the main key of wallet {}",
                self.wallet.name
            )));
        }
        let hd = hd.with_network(main.record.network);
        let mut record = main.record.clone();
        record.is_private = true;
        record.wif = hd.wif();
        self.update_key(&record).await?;

        let mut upgraded = 1;
        if hd.is_extended() {
            let prefix = format!("{}/", main.record.path);
            let public = self
                .repo
                .find_keys(&KeyFilter::wallet(self.wallet.id).key_type(KeyType::Bip32).private(false))
                .await?;
            for mut stored in public {
                let Some(rest) = stored.path.strip_prefix(prefix.as_str()) else {
                    continue;
                };
                let mut derived = hd.clone();
                for segment in rest.split('/') {
                    derived = derived.derive_child(path::child_number(segment)?)?;
                }
                let derived = derived.with_network(stored.network);
                if hex::encode(derived.public_bytes()) != stored.public {
                    return Err(WalletError::Consistency(format!(
                        "Key {} at {} does not derive from the main key",
                        stored.id, stored.path
                    )));
                }
                stored.is_private = true;
                stored.wif = derived.wif();
                self.repo.update_key(&stored).await?;
                upgraded += 1;
            }
        }
        self.arena.clear();
        log::info!("Upgraded {} keys of wallet {} with private material", upgraded, self.wallet.name);
        self.key(record.id).await
    }

    pub fn forget(&mut self, id: KeyId) {
        self.arena.remove(id);
    }

    pub fn clear_cache(&mut self) {
        self.arena.clear();
    }

    /// Returns the key at the requested path, deriving and storing any
    /// missing levels below the nearest stored ancestor. `None` when the
    /// wallet holds no usable ancestor.
    pub async fn key_for_path(&mut self, request: &KeyRequest) -> Result<Option<WalletKey>> {
        let main = self.main_key().await?;
        if self.wallet.scheme == Scheme::Single {
            return Ok(Some(main));
        }

        let network = request.network.unwrap_or(self.wallet.network);
        let account_id = request.account_id.unwrap_or(self.wallet.default_account_id);
        let cosigner_id = request.cosigner_id.or(self.wallet.cosigner_id);
        let main_depth = main.record.depth as usize;

        let level_offset = request.level_offset.map(|offset| {
            if offset > 0 {
                offset - main_depth as i32
            } else {
                offset
            }
        });
        let mut ctx = self.path_context(network, account_id, cosigner_id);
        ctx.change = request.change;
        ctx.address_index = request.address_index;
        let template = self.wallet.key_path.clone();
        let fullpath = path::expand(&request.path, &template, level_offset, &ctx)?;

        let wpath: Vec<String> = if main_depth > 0 {
            if fullpath.len() <= main_depth {
                return Err(WalletError::Path(format!(
                    "Path {} is above the main key at depth {}",
                    path::path_to_string(&fullpath),
                    main_depth
                )));
            }
            std::iter::once("M".to_string())
                .chain(fullpath[main_depth + 1..].iter().cloned())
                .collect()
        } else {
            fullpath.clone()
        };

        let mut ancestor: Option<KeyRecord> = None;
        let mut matched = wpath.len();
        while matched > 0 {
            let mut filter = KeyFilter::wallet(self.wallet.id).path(path::path_to_string(&wpath[..matched]));
            if request.recreate {
                filter = filter.private(true);
            }
            if let Some(found) = self.repo.find_keys(&filter).await?.into_iter().next() {
                ancestor = Some(found);
                break;
            }
            matched -= 1;
        }
        let Some(ancestor) = ancestor else {
            log::warn!(
                "No master or public key available in wallet {} for path {}",
                self.wallet.name,
                path::path_to_string(&wpath)
            );
            return Ok(None);
        };
        let ancestor = self.load(ancestor)?;
        if matched == wpath.len() {
            return Ok(Some(ancestor));
        }

        let mut inserted = Vec::new();
        let derived = self
            .derive_levels(ancestor, &wpath, matched, main_depth, &fullpath, network, request, &mut inserted)
            .await;
        if derived.is_err() {
            for id in inserted {
                self.arena.remove(id);
            }
        }
        derived.map(Some)
    }

    #[allow(clippy::too_many_arguments)]
    async fn derive_levels(
        &mut self,
        ancestor: WalletKey,
        wpath: &[String],
        matched: usize,
        main_depth: usize,
        fullpath: &[String],
        network: Network,
        request: &KeyRequest,
        inserted: &mut Vec<KeyId>,
    ) -> Result<WalletKey> {
        let template = self.wallet.key_path.clone();
        let mut current = ancestor;
        for level in matched..wpath.len() {
            let segment = &wpath[level];
            let child = current.hd()?.derive_child(path::child_number(segment)?)?;
            let hd = child.with_network(network);
            let depth = main_depth + level;
            let key_path = path::path_to_string(&wpath[..=level]);
            let token = template.get(depth).map(String::as_str).unwrap_or(segment);
            let name = match (&request.name, level + 1 == wpath.len()) {
                (Some(name), true) => name.clone(),
                _ => path::level_name(token, segment),
            };
            let (account_id, change, address_index) =
                path_fields(&template, &fullpath[..=depth.min(fullpath.len() - 1)], self.wallet.default_account_id);

            let public = hd.public_bytes();
            let address = key_address(&public, self.wallet.witness_type, network)?;
            let existing = if request.recreate {
                self.repo
                    .find_keys(&KeyFilter::wallet(self.wallet.id).path(key_path.clone()))
                    .await?
                    .into_iter()
                    .next()
            } else {
                None
            };

            let key = match existing {
                Some(mut record) => {
                    record.is_private = hd.is_private();
                    record.wif = hd.wif();
                    record.parent_id = Some(current.id());
                    if level + 1 == wpath.len() {
                        if let Some(name) = &request.name {
                            record.name = name.clone();
                        }
                    }
                    self.repo.update_key(&record).await?;
                    log::debug!("Upgraded key {} at {} with private material", record.id, key_path);
                    WalletKey { record, hd: Some(hd) }
                }
                None => {
                    let record = KeyRecord {
                        id: 0,
                        wallet_id: self.wallet.id,
                        parent_id: Some(current.id()),
                        name,
                        path: key_path.clone(),
                        depth: depth as u32,
                        account_id,
                        change,
                        address_index,
                        purpose: self.wallet.purpose,
                        network,
                        key_type: KeyType::Bip32,
                        cosigner_id: self.wallet.cosigner_id,
                        is_private: hd.is_private(),
                        witness_type: self.wallet.witness_type,
                        public: hex::encode(&public),
                        wif: hd.wif(),
                        address: address.to_string(),
                        encoding: address.encoding().to_string(),
                        used: false,
                        balance: 0,
                        latest_tx_index: 0,
                        multisig_children: Vec::new(),
                    };
                    let id = self.repo.create_key(record.clone()).await?;
                    log::debug!("Derived key {} at {} ({})", id, key_path, record.address);
                    WalletKey {
                        record: KeyRecord { id, ..record },
                        hd: Some(hd),
                    }
                }
            };
            self.arena.insert(key.clone());
            inserted.push(key.id());
            current = key;
        }
        Ok(current)
    }
}

/// Public data needed to spend an output locked to one of the wallet's keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendInfo {
    pub key_id: KeyId,
    pub script_type: ScriptType,
    /// Single public key, or all cosigner keys in redeem script order.
    pub pubkeys: Vec<Vec<u8>>,
    pub redeem_script: Option<Script>,
    pub sigs_required: usize,
}

/// Key operations the scanner, the builder and the signer need from a wallet.
#[async_trait]
pub trait KeyProvider: Send {
    fn wallet(&self) -> &WalletRecord;

    async fn main_key(&mut self) -> Result<KeyRecord>;

    /// Unused address keys, creating new ones to reach `number` (or always
    /// when `force` is set).
    async fn get_keys(
        &mut self,
        account_id: Option<u32>,
        network: Option<Network>,
        change: u32,
        number: usize,
        force: bool,
    ) -> Result<Vec<KeyRecord>>;

    async fn spend_info(&mut self, address: &str) -> Result<Option<SpendInfo>>;

    /// Private keys this wallet holds for the output locked to `address`.
    async fn signing_keys(&mut self, address: &str) -> Result<Vec<SecretKey>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::template_for;
    use crate::storage::MemoryRepository;

    const XPRV_1: &str = "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";

    async fn store(witness_type: WitnessType) -> WalletKeyStore {
        let repo: Arc<dyn WalletRepository> = Arc::new(MemoryRepository::new());
        let (key_path, purpose) = template_for(Scheme::Bip32, witness_type, false);
        let record = WalletRecord {
            id: 0,
            name: "keys".to_string(),
            owner: String::new(),
            scheme: Scheme::Bip32,
            witness_type,
            multisig: false,
            sigs_required: 1,
            sort_keys: true,
            key_path,
            purpose,
            cosigner_id: None,
            default_account_id: 0,
            network: Network::Bitcoin,
            main_key_id: None,
            parent_id: None,
            balance: 0,
            last_scanned_height: 0,
        };
        let id = repo.create_wallet(record.clone()).await.unwrap();
        let mut store = WalletKeyStore::new(repo, WalletRecord { id, ..record });
        let hd = HdKey::import(XPRV_1, Network::Bitcoin).unwrap();
        store.set_main_key(hd, "main").await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_key_for_path_is_idempotent() {
        let mut store = store(WitnessType::Legacy).await;
        let request = KeyRequest::new(["0", "5"]);
        let first = store.key_for_path(&request).await.unwrap().unwrap();
        let count = store.find_keys(&KeyFilter::wallet(store.wallet_id())).await.unwrap().len();
        let second = store.key_for_path(&request).await.unwrap().unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(first.path(), "m/44'/0'/0'/0/5");
        assert_eq!(first.record.address_index, Some(5));
        assert_eq!(first.record.change, Some(0));
        // main key plus five derived levels
        assert_eq!(count, 6);
        assert_eq!(
            store.find_keys(&KeyFilter::wallet(store.wallet_id())).await.unwrap().len(),
            count
        );
    }

    #[tokio::test]
    async fn test_intermediate_names_and_explicit_name() {
        let mut store = store(WitnessType::Segwit).await;
        let key = store
            .key_for_path(&KeyRequest::new(["1", "2"]).name("change two"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.record.name, "change two");
        assert!(key.address().starts_with("bc1q"));

        let account = store
            .find_keys(&KeyFilter::wallet(store.wallet_id()).depth(3))
            .await
            .unwrap();
        assert_eq!(account.len(), 1);
        assert_eq!(account[0].name, "account 0");
        assert_eq!(account[0].path, "m/84'/0'/0'");
        assert_eq!(account[0].change, None);

        let parent = store.key(key.record.parent_id.unwrap()).await.unwrap();
        assert_eq!(parent.record.name, "change 1");
    }

    #[tokio::test]
    async fn test_level_offset_reaches_account_key() {
        let mut store = store(WitnessType::Legacy).await;
        let account = store
            .key_for_path(&KeyRequest::new(Vec::<String>::new()).account(2).level_offset(-2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.path(), "m/44'/0'/2'");
        assert_eq!(account.record.account_id, 2);
        assert_eq!(account.record.depth, 3);
    }

    #[tokio::test]
    async fn test_public_master_below_depth_zero() {
        let repo: Arc<dyn WalletRepository> = Arc::new(MemoryRepository::new());
        let (key_path, purpose) = template_for(Scheme::Bip32, WitnessType::Legacy, false);
        let record = WalletRecord {
            id: 0,
            name: "watch".to_string(),
            owner: String::new(),
            scheme: Scheme::Bip32,
            witness_type: WitnessType::Legacy,
            multisig: false,
            sigs_required: 1,
            sort_keys: true,
            key_path,
            purpose,
            cosigner_id: None,
            default_account_id: 0,
            network: Network::Bitcoin,
            main_key_id: None,
            parent_id: None,
            balance: 0,
            last_scanned_height: 0,
        };
        let id = repo.create_wallet(record.clone()).await.unwrap();
        let mut store = WalletKeyStore::new(repo, WalletRecord { id, ..record });

        let master = HdKey::import(XPRV_1, Network::Bitcoin).unwrap();
        let mut account = master.clone();
        for n in [0x8000_002c, 0x8000_0000, 0x8000_0000] {
            account = account.derive_child(n).unwrap();
        }
        store.set_main_key(account.public(), "account xpub").await.unwrap();

        let key = store.key_for_path(&KeyRequest::new(["0", "1"])).await.unwrap().unwrap();
        assert_eq!(key.path(), "M/0/1");
        assert_eq!(key.record.depth, 5);
        assert!(!key.is_private());

        let expected = master
            .derive_child(0x8000_002c)
            .and_then(|k| k.derive_child(0x8000_0000))
            .and_then(|k| k.derive_child(0x8000_0000))
            .and_then(|k| k.derive_child(0))
            .and_then(|k| k.derive_child(1))
            .unwrap();
        assert_eq!(key.record.public, hex::encode(expected.public_bytes()));
    }

    #[tokio::test]
    async fn test_hardened_level_from_public_ancestor_fails_cleanly() {
        let mut store = store(WitnessType::Legacy).await;
        let main = store.main_key().await.unwrap();
        let mut record = main.record.clone();
        let public = main.hd.unwrap().public();
        record.wif = public.wif();
        record.is_private = false;
        store.update_key(&record).await.unwrap();

        let err = store.key_for_path(&KeyRequest::new(["0", "0"])).await.unwrap_err();
        assert!(matches!(err, WalletError::Key(_)));
        assert_eq!(store.cached(), 1);
        assert!(store.key_for_path(&KeyRequest::new(["0", "0"]).recreate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_public_master_is_account_level() {
        let mut store = store(WitnessType::Segwit).await;
        let master = store.public_master(Some(1), None).await.unwrap();
        assert_eq!(master.path(), "m/84'/0'/1'");
        assert_eq!(master.record.depth, 3);
        assert_eq!(master.record.account_id, 1);
        assert!(master.hd().unwrap().is_extended());
    }

    #[tokio::test]
    async fn test_upgrade_private_restores_signing_keys() {
        let master = HdKey::import(XPRV_1, Network::Bitcoin).unwrap();
        let mut store = store(WitnessType::Legacy).await;
        let main = store.main_key().await.unwrap();
        let mut record = main.record.clone();
        record.wif = master.public().wif();
        record.is_private = false;
        store.update_key(&record).await.unwrap();
        store.clear_cache();

        // normal levels below a public master still derive
        let mut watch = store.key_for_path(&KeyRequest::new(["m", "1", "2"])).await.unwrap().unwrap();
        assert!(!watch.is_private());

        assert!(matches!(
            store.upgrade_private(master.public()).await,
            Err(WalletError::Key(_))
        ));
        let other = HdKey::from_seed(&[5; 32], Network::Bitcoin).unwrap();
        assert!(matches!(store.upgrade_private(other).await, Err(WalletError::Key(_))));

        let upgraded = store.upgrade_private(master.clone()).await.unwrap();
        assert!(upgraded.is_private());
        watch = store.key(watch.id()).await.unwrap();
        assert!(watch.is_private());
        let expected = master.derive_child(1).and_then(|k| k.derive_child(2)).unwrap();
        assert_eq!(
            watch.hd().unwrap().secret_key().unwrap().secret_bytes(),
            expected.secret_key().unwrap().secret_bytes()
        );
    }

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = KeyArena::new();
        let key = |id| WalletKey {
            record: KeyRecord {
                id,
                wallet_id: 1,
                parent_id: None,
                name: String::new(),
                path: "m".to_string(),
                depth: 0,
                account_id: 0,
                change: None,
                address_index: None,
                purpose: 44,
                network: Network::Bitcoin,
                key_type: KeyType::Bip32,
                cosigner_id: None,
                is_private: false,
                witness_type: WitnessType::Legacy,
                public: String::new(),
                wif: String::new(),
                address: String::new(),
                encoding: String::new(),
                used: false,
                balance: 0,
                latest_tx_index: 0,
                multisig_children: Vec::new(),
            },
            hd: None,
        };
        let a = arena.insert(key(1));
        arena.insert(key(2));
        assert!(arena.remove(1).is_some());
        assert_eq!(arena.insert(key(3)), a);
        assert!(arena.get(1).is_none());
        assert_eq!(arena.get(3).unwrap().id(), 3);
        assert_eq!(arena.len(), 2);
    }
}
