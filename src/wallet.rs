//! Wallet creation, key management and spending.
//!
//! A [`Wallet`] owns the key store of one stored wallet plus, for multisig
//! wallets, one key store per cosigner. Everything else (scanning, balances,
//! coin selection, building and signing) is delegated to the components in
//! the sibling modules and wired together here.
//!
//! ```no_run
//! use hdwallet_rs::chain::InMemoryChain;
//! use hdwallet_rs::storage::MemoryRepository;
//! use hdwallet_rs::wallet::{Wallet, WalletOptions};
//! use hdwallet_rs::EngineConfig;
//! use std::sync::Arc;
//!
//! # async fn demo() -> hdwallet_rs::Result<()> {
//! let repo = Arc::new(MemoryRepository::new());
//! let chain = Arc::new(InMemoryChain::default());
//! let mut wallet = Wallet::create("savings", &[], WalletOptions::default(), repo, chain, EngineConfig::default()).await?;
//! let key = wallet.get_key(None, None, 0).await?;
//! println!("receive at {}", key.address);
//! # Ok(())
//! # }
//! ```

use crate::chain::ChainService;
use crate::coin_selection::{self, SelectionQuery};
use crate::cosigner::{infer_cosigner_id, CosignerGroup};
use crate::keystore::{key_address, KeyProvider, KeyRequest, SpendInfo, WalletKey, WalletKeyStore};
use crate::ledger::{BalanceMap, Utxo, UtxoLedger};
use crate::network::Network;
use crate::path;
use crate::primitives::bip32::HdKey;
use crate::primitives::script::{MAX_MULTISIG_KEYS, Script};
use crate::storage::{
    KeyFilter, KeyRecord, TransactionRecord, TxInputRecord, TxOutputRecord, WalletRecord, WalletRepository,
};
use crate::sync::{ScanRequest, SyncEngine};
use crate::transaction_builder::{
    fee_for_size, CreateRequest, Fee, InputRef, TransactionBuilder, WalletTransaction,
};
use crate::transaction_signer;
use crate::types::{EngineConfig, KeyId, KeyType, Scheme, ScriptType, TransactionId, TxStatus, WalletId, WitnessType};
use crate::utils::persistence::SnapshotFile;
use crate::{Result, WalletError};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use secp256k1::SecretKey;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Most inputs a sweep will spend in one transaction.
const SWEEP_MAX_INPUTS: usize = 999;

/// Path prefix of standalone keys added with [`Wallet::import_key`].
pub const IMPORT_PATH_PREFIX: &str = "import_key_";

/// Key layout of a wallet.
pub enum WalletKind {
    Single,
    Bip32,
    Bip32Multisig(CosignerGroup),
}

impl WalletKind {
    pub fn is_multisig(&self) -> bool {
        matches!(self, WalletKind::Bip32Multisig(_))
    }
}

#[derive(Debug, Clone)]
pub struct WalletOptions {
    pub owner: String,
    /// Required when a key is given as a passphrase.
    pub network: Option<Network>,
    pub scheme: Scheme,
    pub witness_type: Option<WitnessType>,
    /// Implied when more than one key is given.
    pub multisig: bool,
    pub sigs_required: Option<u32>,
    pub sort_keys: bool,
    pub cosigner_id: Option<u32>,
    pub account_id: u32,
    /// BIP39 password for passphrase keys.
    pub password: String,
}

impl Default for WalletOptions {
    fn default() -> Self {
        Self {
            owner: String::new(),
            network: None,
            scheme: Scheme::Bip32,
            witness_type: None,
            multisig: false,
            sigs_required: None,
            sort_keys: true,
            cosigner_id: None,
            account_id: 0,
            password: String::new(),
        }
    }
}

/// Key store plus kind. Implements the key operations other components use.
pub struct WalletKeys {
    store: WalletKeyStore,
    kind: WalletKind,
}

impl WalletKeys {
    pub fn new(store: WalletKeyStore, kind: WalletKind) -> Self {
        Self { store, kind }
    }

    pub fn store(&self) -> &WalletKeyStore {
        &self.store
    }

    pub fn kind(&self) -> &WalletKind {
        &self.kind
    }

    pub async fn key_for_path(&mut self, request: &KeyRequest) -> Result<Option<WalletKey>> {
        match &mut self.kind {
            WalletKind::Bip32Multisig(group) => group.key_for_path(&mut self.store, request).await.map(Some),
            _ => self.store.key_for_path(request).await,
        }
    }

    /// Creates the key after the highest existing address index.
    pub async fn new_key(
        &mut self,
        account_id: Option<u32>,
        network: Option<Network>,
        change: u32,
        name: Option<&str>,
    ) -> Result<WalletKey> {
        let wallet = self.store.wallet().clone();
        if wallet.scheme == Scheme::Single {
            return self.store.main_key().await;
        }
        let network = network.unwrap_or(wallet.network);
        let account_id = account_id.unwrap_or(wallet.default_account_id);
        let index = self
            .store
            .last_address_index(account_id, change, network)
            .await?
            .map_or(0, |i| i + 1);
        let mut request = KeyRequest::new([change.to_string(), index.to_string()])
            .account(account_id)
            .network(network);
        if let Some(name) = name {
            request = request.name(name);
        }
        self.key_for_path(&request).await?.ok_or_else(|| {
            WalletError::Key(format!(
                "No key available to derive address {} of wallet {}",
                index, wallet.name
            ))
        })
    }

    fn address_filter(&self, account_id: u32, network: Network, change: u32) -> KeyFilter {
        let wallet = self.store.wallet();
        let mut filter = KeyFilter::wallet(wallet.id)
            .network(network)
            .change(change)
            .depth(self.store.address_depth());
        if path::require_token(&wallet.key_path, "account").is_ok() {
            filter = filter.account(account_id);
        }
        filter
    }
}

#[async_trait]
impl KeyProvider for WalletKeys {
    fn wallet(&self) -> &WalletRecord {
        self.store.wallet()
    }

    async fn main_key(&mut self) -> Result<KeyRecord> {
        Ok(self.store.main_key().await?.record)
    }

    async fn get_keys(
        &mut self,
        account_id: Option<u32>,
        network: Option<Network>,
        change: u32,
        number: usize,
        force: bool,
    ) -> Result<Vec<KeyRecord>> {
        let wallet = self.store.wallet().clone();
        if wallet.scheme == Scheme::Single {
            return Ok(vec![self.store.main_key().await?.record]);
        }
        let network = network.unwrap_or(wallet.network);
        let account_id = account_id.unwrap_or(wallet.default_account_id);
        let mut keys = Vec::with_capacity(number);
        if !force {
            let filter = self.address_filter(account_id, network, change).used(false);
            let mut unused = self.store.find_keys(&filter).await?;
            unused.sort_by_key(|k| k.address_index);
            unused.truncate(number);
            keys = unused;
        }
        while keys.len() < number {
            keys.push(self.new_key(Some(account_id), Some(network), change, None).await?.record);
        }
        Ok(keys)
    }

    async fn spend_info(&mut self, address: &str) -> Result<Option<SpendInfo>> {
        let Some(key) = self.store.key_by_address(address).await? else {
            return Ok(None);
        };
        let witness_type = self.store.wallet().witness_type;
        match &mut self.kind {
            WalletKind::Bip32Multisig(group) => {
                let pubkeys = group
                    .child_keys(&key)
                    .await?
                    .iter()
                    .map(|child| -> Result<Vec<u8>> { Ok(child.hd()?.public_bytes()) })
                    .collect::<Result<Vec<_>>>()?;
                let sigs_required = group.sigs_required() as usize;
                Ok(Some(SpendInfo {
                    key_id: key.id(),
                    script_type: ScriptType::for_wallet(witness_type, true),
                    redeem_script: Some(Script::new_multisig(sigs_required, &pubkeys)?),
                    pubkeys,
                    sigs_required,
                }))
            }
            _ => Ok(Some(SpendInfo {
                key_id: key.id(),
                script_type: ScriptType::for_wallet(witness_type, false),
                pubkeys: vec![key.hd()?.public_bytes()],
                redeem_script: None,
                sigs_required: 1,
            })),
        }
    }

    async fn signing_keys(&mut self, address: &str) -> Result<Vec<SecretKey>> {
        let Some(key) = self.store.key_by_address(address).await? else {
            return Ok(Vec::new());
        };
        match &mut self.kind {
            WalletKind::Bip32Multisig(group) => Ok(group
                .child_keys(&key)
                .await?
                .iter()
                .filter_map(|child| child.hd.as_ref().and_then(HdKey::secret_key))
                .collect()),
            _ => Ok(key.hd()?.secret_key().into_iter().collect()),
        }
    }
}

fn parse_key(input: &str, network: Option<Network>, password: &str, hint: Network) -> Result<HdKey> {
    if input.split_whitespace().count() > 1 {
        let network = network.ok_or_else(|| {
            WalletError::Configuration("Please specify network when using passphrase to create a key".to_string())
        })?;
        return HdKey::from_passphrase(input, password, network);
    }
    HdKey::import(input, hint)
}

fn public_view(mut key: WalletKey) -> Result<WalletKey> {
    let hd = key.hd()?.public();
    key.record.is_private = false;
    key.record.wif = hd.wif();
    key.hd = Some(hd);
    Ok(key)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(WalletError::Configuration("Wallet name cannot be empty".to_string()));
    }
    if name.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WalletError::Configuration(format!(
            "Wallet name '{}' invalid, please include letter characters",
            name
        )));
    }
    Ok(())
}

fn wallet_record(
    name: String,
    owner: &str,
    scheme: Scheme,
    witness_type: WitnessType,
    multisig: bool,
    network: Network,
    account_id: u32,
) -> WalletRecord {
    let (key_path, purpose) = path::template_for(scheme, witness_type, multisig);
    WalletRecord {
        id: 0,
        name,
        owner: owner.to_string(),
        scheme,
        witness_type,
        multisig,
        sigs_required: 1,
        sort_keys: true,
        key_path,
        purpose,
        cosigner_id: None,
        default_account_id: account_id,
        network,
        main_key_id: None,
        parent_id: None,
        balance: 0,
        last_scanned_height: 0,
    }
}

fn output_script_type(script: &Script) -> ScriptType {
    if script.is_p2pkh() {
        ScriptType::P2pkh
    } else if script.is_p2wpkh() {
        ScriptType::P2wpkh
    } else if script.is_op_return() {
        ScriptType::NullData
    } else {
        ScriptType::Unknown
    }
}

pub struct Wallet {
    repo: Arc<dyn WalletRepository>,
    chain: Arc<dyn ChainService>,
    config: EngineConfig,
    keys: WalletKeys,
    ledger: UtxoLedger,
    sync: SyncEngine,
    rng: StdRng,
}

impl Wallet {
    fn assemble(
        repo: Arc<dyn WalletRepository>,
        chain: Arc<dyn ChainService>,
        config: EngineConfig,
        record: WalletRecord,
        kind: WalletKind,
    ) -> Self {
        let ledger = UtxoLedger::new(repo.clone(), record.id, record.network);
        let sync = SyncEngine::new(
            repo.clone(),
            chain.clone(),
            ledger.clone(),
            config.scan_gap_limit,
            config.max_transactions,
        );
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            keys: WalletKeys::new(WalletKeyStore::new(repo.clone(), record), kind),
            repo,
            chain,
            config,
            ledger,
            sync,
            rng,
        }
    }

    /// Creates and stores a new wallet. `keys` holds extended keys, WIF or
    /// hex keys, or passphrases. A random master key is generated when empty.
    pub async fn create(
        name: &str,
        keys: &[&str],
        options: WalletOptions,
        repo: Arc<dyn WalletRepository>,
        chain: Arc<dyn ChainService>,
        config: EngineConfig,
    ) -> Result<Wallet> {
        validate_name(name)?;
        if repo.find_wallet_by_name(name).await?.is_some() {
            return Err(WalletError::Configuration(format!("Wallet with name '{}' already exists", name)));
        }
        let multisig = options.multisig || keys.len() > 1;
        if multisig && options.scheme != Scheme::Bip32 {
            return Err(WalletError::Configuration(
                "Multisig wallets should use bip32 scheme".to_string(),
            ));
        }
        if keys.len() > MAX_MULTISIG_KEYS {
            return Err(WalletError::Configuration(format!(
                "Redeemscripts with more than {} keys are non-standard",
                MAX_MULTISIG_KEYS
            )));
        }
        let sigs_required = options.sigs_required.unwrap_or(keys.len().max(1) as u32);
        if multisig && (sigs_required == 0 || sigs_required as usize > keys.len()) {
            return Err(WalletError::Configuration(format!(
                "Number of keys required to sign ({}) must be between 1 and the number of keys ({})",
                sigs_required,
                keys.len()
            )));
        }

        let hint = options.network.unwrap_or(config.default_network);
        let parsed = keys
            .iter()
            .map(|k| parse_key(k, options.network, &options.password, hint))
            .collect::<Result<Vec<_>>>()?;
        let network = options
            .network
            .or_else(|| parsed.first().map(HdKey::network))
            .unwrap_or(config.default_network);
        let witness_type = options.witness_type.unwrap_or(config.default_witness_type);
        if !network.params().segwit_supported && witness_type != WitnessType::Legacy {
            return Err(WalletError::Configuration(format!(
                "Network {} does not support {} wallets",
                network, witness_type
            )));
        }
        if let Some(key) = parsed.iter().find(|k| k.network() != network) {
            return Err(WalletError::Configuration(format!(
                "Network from key ({}) is different than specified network ({})",
                key.network(),
                network
            )));
        }
        if !multisig {
            if let Some(key) = parsed.first() {
                if options.scheme == Scheme::Bip32 && !key.is_extended() {
                    return Err(WalletError::Configuration(
                        "A bip32 wallet needs an extended key, use the single scheme for plain keys".to_string(),
                    ));
                }
            }
        }

        let wallet = if multisig {
            Self::create_multisig(name, parsed, sigs_required, network, witness_type, &options, repo.clone(), chain, config)
                .await?
        } else {
            let hd = match parsed.into_iter().next() {
                Some(hd) => hd,
                None => HdKey::random(network)?,
            };
            let record = wallet_record(
                name.to_string(),
                &options.owner,
                options.scheme,
                witness_type,
                false,
                network,
                options.account_id,
            );
            let id = repo.create_wallet(record.clone()).await?;
            let kind = match options.scheme {
                Scheme::Single => WalletKind::Single,
                Scheme::Bip32 => WalletKind::Bip32,
            };
            let mut wallet = Self::assemble(repo.clone(), chain, config, WalletRecord { id, ..record }, kind);
            if let Err(e) = wallet.materialize(hd).await {
                repo.delete_wallet(id).await?;
                return Err(e);
            }
            wallet
        };
        log::info!(
            "Created {} wallet {} ({}, {})",
            if multisig { "multisig" } else { "single signature" },
            wallet.name(),
            network,
            witness_type
        );
        Ok(wallet)
    }

    async fn materialize(&mut self, hd: HdKey) -> Result<()> {
        let main_name = format!("{} main key", self.name());
        self.keys.store.set_main_key(hd, &main_name).await?;
        if self.record().scheme == Scheme::Bip32 {
            self.keys.key_for_path(&KeyRequest::new(["0", "0"])).await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_multisig(
        name: &str,
        mut parsed: Vec<HdKey>,
        sigs_required: u32,
        network: Network,
        witness_type: WitnessType,
        options: &WalletOptions,
        repo: Arc<dyn WalletRepository>,
        chain: Arc<dyn ChainService>,
        config: EngineConfig,
    ) -> Result<Wallet> {
        if parsed.is_empty() {
            return Err(WalletError::Configuration("Multisig wallets need cosigner keys".to_string()));
        }
        if options.sort_keys {
            parsed.sort_by_key(HdKey::public_bytes);
        }
        let cosigner_id = match options.cosigner_id {
            Some(id) if id as usize >= parsed.len() => {
                return Err(WalletError::Configuration(format!(
                    "Cosigner id {} out of range for {} keys",
                    id,
                    parsed.len()
                )))
            }
            Some(id) => id,
            None => infer_cosigner_id(&parsed)?,
        };

        let mut record = wallet_record(
            name.to_string(),
            &options.owner,
            Scheme::Bip32,
            witness_type,
            true,
            network,
            options.account_id,
        );
        record.sigs_required = sigs_required;
        record.sort_keys = options.sort_keys;
        record.cosigner_id = Some(cosigner_id);
        let id = repo.create_wallet(record.clone()).await?;
        let record = WalletRecord { id, ..record };

        match Self::create_cosigners(&record, parsed, &options.owner, repo.clone()).await {
            Ok(stores) => {
                let group = CosignerGroup::new(stores, sigs_required, options.sort_keys);
                Ok(Self::assemble(repo, chain, config, record, WalletKind::Bip32Multisig(group)))
            }
            Err(e) => {
                repo.delete_wallet(id).await?;
                Err(e)
            }
        }
    }

    async fn create_cosigners(
        parent: &WalletRecord,
        keys: Vec<HdKey>,
        owner: &str,
        repo: Arc<dyn WalletRepository>,
    ) -> Result<Vec<WalletKeyStore>> {
        let mut stores = Vec::with_capacity(keys.len());
        for (index, hd) in keys.into_iter().enumerate() {
            let scheme = if hd.is_extended() { Scheme::Bip32 } else { Scheme::Single };
            let mut record = wallet_record(
                format!("{}-cosigner-{}", parent.name, index),
                owner,
                scheme,
                parent.witness_type,
                false,
                parent.network,
                parent.default_account_id,
            );
            if scheme == Scheme::Bip32 {
                record.key_path = parent.key_path.clone();
                record.purpose = parent.purpose;
            }
            record.cosigner_id = Some(index as u32);
            record.parent_id = Some(parent.id);
            let id = repo.create_wallet(record.clone()).await?;
            let mut store = WalletKeyStore::new(repo.clone(), WalletRecord { id, ..record });
            let key_name = format!("{} cosigner key {}", parent.name, index);
            store.set_main_key(hd, &key_name).await?;
            stores.push(store);
        }
        Ok(stores)
    }

    /// Opens a stored wallet by name or numeric id.
    pub async fn open(
        name_or_id: &str,
        repo: Arc<dyn WalletRepository>,
        chain: Arc<dyn ChainService>,
        config: EngineConfig,
    ) -> Result<Wallet> {
        let record = match name_or_id.parse::<WalletId>() {
            Ok(id) => repo.get_wallet(id).await?,
            Err(_) => repo.find_wallet_by_name(name_or_id).await?,
        }
        .ok_or_else(|| WalletError::NotFound(format!("Wallet '{}'", name_or_id)))?;

        let kind = if record.multisig {
            let stores = repo
                .cosigner_wallets(record.id)
                .await?
                .into_iter()
                .map(|cosigner| WalletKeyStore::new(repo.clone(), cosigner))
                .collect::<Vec<_>>();
            if stores.is_empty() {
                return Err(WalletError::Configuration(format!(
                    "Multisig wallet {} has no cosigners",
                    record.name
                )));
            }
            WalletKind::Bip32Multisig(CosignerGroup::new(stores, record.sigs_required, record.sort_keys))
        } else if record.scheme == Scheme::Single {
            WalletKind::Single
        } else {
            WalletKind::Bip32
        };
        log::info!("Opened wallet {} (id {})", record.name, record.id);
        Ok(Self::assemble(repo, chain, config, record, kind))
    }

    pub fn id(&self) -> WalletId {
        self.keys.store.wallet_id()
    }

    pub fn name(&self) -> &str {
        &self.keys.store.wallet().name
    }

    pub fn record(&self) -> &WalletRecord {
        self.keys.store.wallet()
    }

    pub fn network(&self) -> Network {
        self.record().network
    }

    pub fn kind(&self) -> &WalletKind {
        &self.keys.kind
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cosigners(&self) -> &[WalletKeyStore] {
        match &self.keys.kind {
            WalletKind::Bip32Multisig(group) => group.cosigners(),
            _ => &[],
        }
    }

    pub async fn key_for_path(&mut self, request: &KeyRequest) -> Result<Option<WalletKey>> {
        self.keys.key_for_path(request).await
    }

    /// Stored state of a key, bypassing the derivation cache.
    pub async fn key(&mut self, id: KeyId) -> Result<WalletKey> {
        self.keys.store.forget(id);
        self.keys.store.key(id).await
    }

    pub async fn main_key(&mut self) -> Result<WalletKey> {
        self.keys.store.main_key().await
    }

    pub async fn new_key(&mut self, account_id: Option<u32>, network: Option<Network>, name: Option<&str>) -> Result<WalletKey> {
        self.keys.new_key(account_id, network, 0, name).await
    }

    pub async fn new_key_change(&mut self, account_id: Option<u32>, network: Option<Network>, name: Option<&str>) -> Result<WalletKey> {
        self.keys.new_key(account_id, network, 1, name).await
    }

    /// First unused key, created when none exists.
    pub async fn get_key(&mut self, account_id: Option<u32>, network: Option<Network>, change: u32) -> Result<KeyRecord> {
        self.keys
            .get_keys(account_id, network, change, 1, false)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| WalletError::Key(format!("No key available in wallet {}", self.name())))
    }

    pub async fn get_keys(
        &mut self,
        account_id: Option<u32>,
        network: Option<Network>,
        change: u32,
        number: usize,
        force: bool,
    ) -> Result<Vec<KeyRecord>> {
        self.keys.get_keys(account_id, network, change, number, force).await
    }

    pub async fn keys(&self, filter: KeyFilter) -> Result<Vec<KeyRecord>> {
        self.keys.store.find_keys(&filter).await
    }

    /// Creates the account level key for a new account plus its first
    /// payment and change keys.
    pub async fn new_account(&mut self, name: &str, account_id: Option<u32>) -> Result<WalletKey> {
        let record = self.record().clone();
        if !matches!(self.keys.kind, WalletKind::Bip32) {
            return Err(WalletError::Configuration(format!(
                "Accounts can only be added to single signature bip32 wallets, {} is not one",
                record.name
            )));
        }
        let main = self.keys.store.main_key().await?;
        if !main.is_private() || main.record.depth != 0 {
            return Err(WalletError::Configuration(
                "A master private key at depth 0 is needed to create new accounts".to_string(),
            ));
        }
        let account_pos = path::require_token(&record.key_path, "account")?;
        let account_id = match account_id {
            Some(id) => id,
            None => self
                .keys
                .store
                .find_keys(&KeyFilter::wallet(record.id).network(record.network))
                .await?
                .iter()
                .filter(|k| k.depth as usize >= account_pos)
                .map(|k| k.account_id + 1)
                .max()
                .unwrap_or(0),
        };
        let offset = account_pos as i32 - (record.key_path.len() as i32 - 1);
        let account_key = self
            .keys
            .key_for_path(
                &KeyRequest::new(Vec::<String>::new())
                    .account(account_id)
                    .level_offset(offset)
                    .name(name),
            )
            .await?
            .ok_or_else(|| WalletError::Key(format!("Could not derive account {}", account_id)))?;
        for change in ["0", "1"] {
            self.keys
                .key_for_path(&KeyRequest::new([change, "0"]).account(account_id))
                .await?;
        }
        log::info!("Created account {} in wallet {}", account_id, record.name);
        Ok(account_key)
    }

    /// Replaces a public main key with the master private key it descends
    /// from and upgrades every stored key with private material.
    pub async fn import_master_key(&mut self, key: &str, name: &str) -> Result<WalletKey> {
        let record = self.record().clone();
        if !matches!(self.keys.kind, WalletKind::Bip32) {
            return Err(WalletError::Configuration(
                "Master keys can only be imported into single signature bip32 wallets".to_string(),
            ));
        }
        let main = self.keys.store.main_key().await?;
        if main.is_private() {
            return Err(WalletError::Configuration(format!(
                "Wallet {} already holds a private main key",
                record.name
            )));
        }
        let master = HdKey::import(key, record.network)?;
        if !master.is_private() || !master.is_extended() || master.depth() != 0 {
            return Err(WalletError::Key("Please import a master private key at depth 0".to_string()));
        }

        let depth = main.record.depth as usize;
        let ctx = self
            .keys
            .store
            .path_context(record.network, main.record.account_id, record.cosigner_id);
        let prefix = path::expand(&[], &record.key_path, Some(depth as i32 + 1), &ctx)?;
        let mut derived = master.clone();
        for segment in prefix.iter().skip(1) {
            derived = derived.derive_child(path::child_number(segment)?)?;
        }
        if derived.public_bytes() != main.hd()?.public_bytes() {
            return Err(WalletError::Key(format!(
                "Key does not derive the public main key of wallet {}",
                record.name
            )));
        }

        let prefix_str = path::path_to_string(&prefix);
        let mut public_keys = Vec::new();
        for mut stored in self.keys.store.find_keys(&KeyFilter::wallet(record.id)).await? {
            if let Some(rest) = stored.path.strip_prefix('M') {
                stored.path = format!("{}{}", prefix_str, rest);
                self.keys.store.update_key(&stored).await?;
            }
            if !stored.is_private && stored.key_type == KeyType::Bip32 {
                public_keys.push(stored);
            }
        }
        let new_main = self.keys.store.set_main_key(master, name).await?;
        public_keys.sort_by_key(|k| k.depth);
        for stored in public_keys {
            let request = KeyRequest::new(path::parse_path(&stored.path)?)
                .account(stored.account_id)
                .network(stored.network)
                .recreate();
            self.keys.key_for_path(&request).await?;
        }
        log::info!("Imported master key into wallet {}", record.name);
        Ok(new_main)
    }

    /// Imports a key. A private cosigner key upgrades that cosigner of a
    /// multisig wallet, a master private key upgrades a watch-only bip32
    /// wallet and anything else is stored as a standalone key. Returns
    /// `None` when the key is already known.
    pub async fn import_key(&mut self, key: &str, account_id: Option<u32>, name: &str) -> Result<Option<WalletKey>> {
        let record = self.record().clone();
        let hd = HdKey::import(key, record.network)?;

        if let WalletKind::Bip32Multisig(group) = &mut self.keys.kind {
            if !hd.is_private() {
                return Err(WalletError::Configuration(format!(
                    "Only private cosigner keys can be imported into multisig wallet {}",
                    record.name
                )));
            }
            let public = hd.public_bytes();
            for cosigner in group.cosigners_mut() {
                let main = cosigner.main_key().await?;
                if main.hd()?.public_bytes() != public {
                    continue;
                }
                if main.is_private() {
                    return Ok(None);
                }
                let upgraded = cosigner.upgrade_private(hd).await?;
                log::info!("Imported private key for cosigner {} of wallet {}", cosigner.wallet().name, record.name);
                return Ok(Some(upgraded));
            }
            return Err(WalletError::Key(format!(
                "Key does not belong to any cosigner of wallet {}",
                record.name
            )));
        }

        if matches!(self.keys.kind, WalletKind::Bip32)
            && hd.is_private()
            && hd.is_extended()
            && hd.depth() == 0
            && !self.keys.store.main_key().await?.is_private()
        {
            return self.import_master_key(key, name).await.map(Some);
        }

        let network = hd.network();
        let public = hd.public_bytes();
        let address = key_address(&public, record.witness_type, network)?;
        let encoding = address.encoding().to_string();
        let address = address.to_string();
        if self.keys.store.key_by_address(&address).await?.is_some() {
            log::info!("Key with address {} already in wallet {}", address, record.name);
            return Ok(None);
        }
        let imported = self
            .keys
            .store
            .find_keys(&KeyFilter::wallet(record.id).key_type(KeyType::Single))
            .await?
            .iter()
            .filter(|k| k.path.starts_with(IMPORT_PATH_PREFIX))
            .count();
        let path = format!("{}{:05}", IMPORT_PATH_PREFIX, imported + 1);
        let key_record = KeyRecord {
            id: 0,
            wallet_id: record.id,
            parent_id: None,
            name: if name.is_empty() { path.clone() } else { name.to_string() },
            path,
            depth: hd.depth() as u32,
            account_id: account_id.unwrap_or(record.default_account_id),
            change: None,
            address_index: None,
            purpose: record.purpose,
            network,
            key_type: KeyType::Single,
            cosigner_id: record.cosigner_id,
            is_private: hd.is_private(),
            witness_type: record.witness_type,
            public: hex::encode(&public),
            wif: hd.wif(),
            address,
            encoding,
            used: false,
            balance: 0,
            latest_tx_index: 0,
            multisig_children: Vec::new(),
        };
        let key = self.keys.store.create_key(key_record, Some(hd)).await?;
        log::info!("Imported key {} as {} into wallet {}", key.id(), key.path(), record.name);
        Ok(Some(key))
    }

    /// Key store holding this wallet's account keys: its own, or for
    /// multisig wallets the one of its own cosigner.
    fn account_store(&self) -> Result<&WalletKeyStore> {
        match &self.keys.kind {
            WalletKind::Bip32Multisig(group) => {
                let index = self.record().cosigner_id.unwrap_or(0) as usize;
                group.cosigners().get(index).ok_or_else(|| {
                    WalletError::Configuration(format!(
                        "Cosigner {} of wallet {} not found",
                        index,
                        self.name()
                    ))
                })
            }
            _ => Ok(&self.keys.store),
        }
    }

    /// Stored keys at the public master level.
    pub async fn keys_accounts(&self, account_id: Option<u32>, network: Option<Network>) -> Result<Vec<KeyRecord>> {
        let store = self.account_store()?;
        let wallet = store.wallet();
        let key_type = if wallet.scheme == Scheme::Single {
            KeyType::Single
        } else {
            KeyType::Bip32
        };
        let mut filter = KeyFilter::wallet(wallet.id)
            .depth(path::public_master_depth(&wallet.key_path) as u32)
            .key_type(key_type);
        filter.account_id = account_id;
        if let Some(network) = network {
            filter = filter.network(network);
        }
        let mut keys = store.find_keys(&filter).await?;
        keys.sort_by_key(|k| (k.account_id, k.id));
        Ok(keys)
    }

    /// Account ids in use, or the default account when none is stored yet.
    pub async fn accounts(&self, network: Option<Network>) -> Result<Vec<u32>> {
        let ids: BTreeSet<u32> = self
            .keys_accounts(None, network)
            .await?
            .iter()
            .map(|k| k.account_id)
            .collect();
        if ids.is_empty() {
            return Ok(vec![self.record().default_account_id]);
        }
        Ok(ids.into_iter().collect())
    }

    /// Home network first, then every other network a stored key uses.
    pub async fn networks(&self) -> Result<Vec<Network>> {
        let home = self.network();
        let others: BTreeSet<Network> = self
            .keys
            .store
            .find_keys(&KeyFilter::wallet(self.id()))
            .await?
            .iter()
            .map(|k| k.network)
            .filter(|n| *n != home)
            .collect();
        Ok(std::iter::once(home).chain(others).collect())
    }

    /// Public master keys, one per cosigner for multisig wallets. Private
    /// material is stripped unless `as_private` is set.
    pub async fn public_master(
        &mut self,
        account_id: Option<u32>,
        network: Option<Network>,
        as_private: bool,
    ) -> Result<Vec<WalletKey>> {
        let keys = match &mut self.keys.kind {
            WalletKind::Bip32Multisig(group) => {
                let mut keys = Vec::with_capacity(group.len());
                for cosigner in group.cosigners_mut() {
                    keys.push(cosigner.public_master(account_id, network).await?);
                }
                keys
            }
            _ => vec![self.keys.store.public_master(account_id, network).await?],
        };
        if as_private {
            return Ok(keys);
        }
        keys.into_iter().map(public_view).collect()
    }

    /// Private main key WIFs, or with `is_private` unset the public master
    /// keys to share with cosigners and watch-only wallets.
    pub async fn wif(&mut self, is_private: bool, account_id: Option<u32>) -> Result<Vec<String>> {
        if !is_private {
            return Ok(self
                .public_master(account_id, None, false)
                .await?
                .into_iter()
                .map(|k| k.record.wif)
                .collect());
        }
        let mains = match &mut self.keys.kind {
            WalletKind::Bip32Multisig(group) => {
                let mut mains = Vec::with_capacity(group.len());
                for cosigner in group.cosigners_mut() {
                    mains.push(cosigner.main_key().await?);
                }
                mains
            }
            _ => vec![self.keys.store.main_key().await?],
        };
        let wifs: Vec<String> = mains
            .into_iter()
            .filter(WalletKey::is_private)
            .map(|k| k.record.wif)
            .collect();
        if wifs.is_empty() {
            return Err(WalletError::Key(format!("Wallet {} holds no private key", self.name())));
        }
        Ok(wifs)
    }

    pub async fn scan(&mut self, request: ScanRequest) -> Result<BTreeSet<String>> {
        let found = self.sync.scan(&mut self.keys, &request).await?;
        self.keys.store.refresh().await?;
        Ok(found)
    }

    /// Scans the full history of one key.
    pub async fn scan_key(&mut self, key_id: KeyId) -> Result<Vec<String>> {
        let key = self.keys.store.key(key_id).await?;
        let known: HashSet<String> = self
            .ledger
            .transactions(None, None)
            .await?
            .into_iter()
            .map(|t| t.txid)
            .collect();
        let found = self.sync.scan_key(&key.record, &Mutex::new(known)).await?;
        self.ledger.update_input_output_key_ids().await?;
        self.ledger.balance_update(0).await?;
        self.keys.store.refresh().await?;
        Ok(found)
    }

    /// Stored balance of the home network.
    pub async fn balance(&self) -> Result<u64> {
        Ok(self
            .repo
            .get_wallet(self.id())
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("Wallet {}", self.id())))?
            .balance)
    }

    pub async fn balance_update(&mut self, min_confirms: u32) -> Result<BalanceMap> {
        let balances = self.ledger.balance_update(min_confirms).await?;
        self.keys.store.refresh().await?;
        Ok(balances)
    }

    pub async fn utxos(
        &self,
        account_id: Option<u32>,
        network: Option<Network>,
        min_confirms: u32,
        key_id: Option<KeyId>,
    ) -> Result<Vec<Utxo>> {
        self.ledger.utxos(account_id, network, min_confirms, key_id).await
    }

    pub async fn utxo_add(
        &mut self,
        address: &str,
        value: u64,
        txid: &str,
        output_n: u32,
        confirmations: u32,
    ) -> Result<TransactionId> {
        let id = self.ledger.utxo_add(address, value, txid, output_n, confirmations).await?;
        self.ledger.balance_update(0).await?;
        Ok(id)
    }

    /// Reconciles stored unspent outputs with the chain's view. Returns the
    /// number of outputs added.
    pub async fn utxos_update(&mut self, account_id: Option<u32>, network: Option<Network>) -> Result<usize> {
        let network = network.unwrap_or(self.network());
        let wallet = self.record().clone();
        let keys: Vec<KeyRecord> = if wallet.scheme == Scheme::Single {
            vec![self.keys.store.main_key().await?.record]
        } else {
            let mut filter = KeyFilter::wallet(wallet.id).network(network);
            filter.account_id = account_id;
            self.keys
                .store
                .find_keys(&filter)
                .await?
                .into_iter()
                .filter(|k| k.address_index.is_some())
                .collect()
        };

        let mut added = 0;
        for key in keys {
            let remote = self.chain.get_utxos(&key.address, None, usize::MAX).await?;
            let stored = self.ledger.utxos(None, Some(network), 0, Some(key.id)).await?;
            for utxo in &remote {
                if !stored.iter().any(|s| s.txid == utxo.txid && s.output_n == utxo.output_n) {
                    self.ledger
                        .utxo_add(&key.address, utxo.value, &utxo.txid, utxo.output_n, utxo.confirmations)
                        .await?;
                    added += 1;
                }
            }
            for gone in stored
                .iter()
                .filter(|s| !remote.iter().any(|r| r.txid == s.txid && r.output_n == s.output_n))
            {
                log::warn!("Output {}:{} no longer unspent, marking spent", gone.txid, gone.output_n);
                self.ledger.mark_spent(&gone.txid, gone.output_n, None).await?;
            }
        }
        self.ledger.balance_update(0).await?;
        self.keys.store.refresh().await?;
        Ok(added)
    }

    pub async fn transactions(&self, account_id: Option<u32>, network: Option<Network>) -> Result<Vec<TransactionRecord>> {
        self.ledger.transactions(account_id, network).await
    }

    pub async fn select_inputs(&self, amount: u64, query: SelectionQuery) -> Result<Vec<Utxo>> {
        let network = query.network.unwrap_or(self.network());
        coin_selection::select_inputs(&self.ledger, network, amount, &query).await
    }

    pub async fn transaction_create(&mut self, request: CreateRequest) -> Result<WalletTransaction> {
        let mut builder = TransactionBuilder::new(&self.ledger, self.chain.as_ref(), &mut self.keys, &mut self.rng);
        builder.create(request).await
    }

    /// Adds this wallet's signatures to `tx`. Returns the number added.
    pub async fn sign(&mut self, tx: &mut WalletTransaction) -> Result<usize> {
        let mut added = 0;
        for index in 0..tx.inputs.len() {
            let address = tx.inputs[index].address.clone();
            let secrets = self.keys.signing_keys(&address).await?;
            if secrets.is_empty() {
                continue;
            }
            added += transaction_signer::sign_input(tx, index, &secrets)?;
        }
        tx.refresh()?;
        log::debug!(
            "Added {} signatures to transaction {}, complete: {}",
            added,
            tx.txid,
            tx.complete
        );
        Ok(added)
    }

    /// Creates, signs and, unless `offline`, broadcasts and stores a transaction.
    pub async fn send(&mut self, request: CreateRequest, offline: bool) -> Result<WalletTransaction> {
        let mut tx = self.transaction_create(request.clone()).await?;
        let rate = tx.fee_per_kb;
        self.sign(&mut tx).await?;

        if tx.fee_estimated && tx.complete {
            let exact = fee_for_size(tx.vsize, rate);
            if exact.abs_diff(tx.fee) * 10 > tx.fee {
                log::debug!("Adjusting fee of {} from {} to {}", tx.txid, tx.fee, exact);
                let retry = CreateRequest {
                    inputs: tx
                        .inputs
                        .iter()
                        .map(|i| InputRef::new(i.txid.clone(), i.output_n).with_address(i.address.clone(), i.value))
                        .collect(),
                    fee: Some(Fee::Amount(exact)),
                    number_of_change_outputs: tx.change_outputs().count().max(1),
                    ..request
                };
                tx = self.transaction_create(retry).await?;
                self.sign(&mut tx).await?;
            }
        }
        if offline {
            return Ok(tx);
        }
        self.send_transaction(tx).await
    }

    /// Adopts a transaction built elsewhere, typically by another cosigner.
    /// Inputs and outputs are matched to this wallet's keys by address and
    /// the signatures it carries are verified.
    pub async fn transaction_import(&mut self, mut tx: WalletTransaction) -> Result<WalletTransaction> {
        if !self.networks().await?.contains(&tx.network) {
            return Err(WalletError::InvalidInput(format!(
                "Transaction {} is for network {}, not used by wallet {}",
                tx.txid,
                tx.network,
                self.name()
            )));
        }
        let inputs = tx.inputs.iter().try_fold(0u64, |acc, i| acc.checked_add(i.value));
        let outputs = tx.outputs.iter().try_fold(0u64, |acc, o| acc.checked_add(o.value));
        if inputs != Some(tx.input_total)
            || outputs != Some(tx.output_total)
            || tx.fee.checked_add(tx.output_total) != Some(tx.input_total)
        {
            return Err(WalletError::Consistency(format!(
                "Input, output and fee totals of transaction {} do not add up",
                tx.txid
            )));
        }

        let mut own_inputs = 0;
        for input in tx.inputs.iter_mut() {
            let Some(info) = self.keys.spend_info(&input.address).await? else {
                continue;
            };
            if info.pubkeys != input.pubkeys
                || info.script_type != input.script_type
                || info.sigs_required != input.sigs_required
            {
                return Err(WalletError::Transaction(format!(
                    "Input {}:{} does not match the keys of wallet {}",
                    input.txid,
                    input.output_n,
                    self.keys.store.wallet().name
                )));
            }
            input.key_id = info.key_id;
            own_inputs += 1;
        }
        if own_inputs == 0 {
            return Err(WalletError::Transaction(format!(
                "Transaction {} spends no outputs of wallet {}",
                tx.txid,
                self.name()
            )));
        }
        for output in tx.outputs.iter_mut() {
            let found = match &output.address {
                Some(address) => self.keys.store.key_by_address(address).await?,
                None => None,
            };
            output.is_change = match &found {
                Some(key) => output.is_change || key.record.change == Some(1),
                None => false,
            };
            output.key_id = found.as_ref().map(WalletKey::id);
        }

        tx.refresh()?;
        if !transaction_signer::verify(&tx)? {
            return Err(WalletError::Transaction(format!(
                "Signatures of transaction {} do not verify",
                tx.txid
            )));
        }
        log::info!(
            "Imported transaction {} into wallet {}, complete: {}",
            tx.txid,
            self.name(),
            tx.complete
        );
        Ok(tx)
    }

    fn transaction_file(&self, txid: Option<&str>, filename: Option<&Path>) -> Result<PathBuf> {
        let data_dir = || {
            self.config.data_dir.clone().ok_or_else(|| {
                WalletError::Configuration("No data directory configured for transaction files".to_string())
            })
        };
        match (filename, txid) {
            (Some(file), _) if file.parent().map_or(true, |p| p.as_os_str().is_empty()) => Ok(data_dir()?.join(file)),
            (Some(file), _) => Ok(file.to_path_buf()),
            (None, Some(txid)) => Ok(data_dir()?.join(format!("{}.tx", txid))),
            (None, None) => Err(WalletError::InvalidInput("Please supply a filename or txid".to_string())),
        }
    }

    /// Writes `tx` as JSON, by default to `<txid>.tx` in the data directory.
    /// Bare file names are placed in the data directory too.
    pub fn transaction_save(&self, tx: &WalletTransaction, filename: Option<&Path>) -> Result<PathBuf> {
        let path = self.transaction_file(Some(&tx.txid), filename)?;
        SnapshotFile::new(&path).save(tx)?;
        log::info!("Transaction {} saved to {:?}", tx.txid, path);
        Ok(path)
    }

    /// Reads a transaction written by [`Wallet::transaction_save`] and
    /// imports it.
    pub async fn transaction_load(&mut self, txid: Option<&str>, filename: Option<&Path>) -> Result<WalletTransaction> {
        let path = self.transaction_file(txid, filename)?;
        let tx: WalletTransaction = SnapshotFile::new(&path)
            .load()?
            .ok_or_else(|| WalletError::NotFound(format!("Transaction file {:?}", path)))?;
        self.transaction_import(tx).await
    }

    /// Broadcasts a fully signed transaction and records it as unconfirmed.
    pub async fn send_transaction(&mut self, tx: WalletTransaction) -> Result<WalletTransaction> {
        if !tx.complete {
            return Err(WalletError::Transaction(format!(
                "Transaction {} is not fully signed",
                tx.txid
            )));
        }
        self.chain.broadcast(&tx.raw).await?;
        self.store_sent(&tx).await?;
        self.ledger.balance_update(0).await?;
        self.keys.store.refresh().await?;
        log::info!("Sent transaction {} with fee {}", tx.txid, tx.fee);
        Ok(tx)
    }

    async fn store_sent(&self, tx: &WalletTransaction) -> Result<()> {
        let change_type = ScriptType::for_wallet(self.record().witness_type, self.record().multisig);
        let record = TransactionRecord {
            id: 0,
            txid: tx.txid.clone(),
            wallet_id: self.id(),
            account_id: tx.account_id,
            network: tx.network,
            fee: Some(tx.fee),
            size: tx.vsize,
            locktime: tx.locktime,
            version: tx.version,
            block_height: None,
            confirmations: 0,
            status: TxStatus::Unconfirmed,
            input_total: tx.input_total,
            output_total: tx.output_total,
            raw: Some(tx.raw.clone()),
            inputs: tx
                .inputs
                .iter()
                .enumerate()
                .map(|(n, i)| TxInputRecord {
                    index_n: n as u32,
                    prev_txid: i.txid.clone(),
                    output_n: i.output_n,
                    key_id: Some(i.key_id),
                    address: Some(i.address.clone()),
                    value: i.value,
                    script_type: i.script_type,
                    sequence: i.sequence,
                })
                .collect(),
            outputs: tx
                .outputs
                .iter()
                .enumerate()
                .map(|(n, o)| TxOutputRecord {
                    output_n: n as u32,
                    key_id: o.key_id,
                    address: o.address.clone(),
                    value: o.value,
                    script: o.script.to_hex(),
                    script_type: if o.key_id.is_some() {
                        change_type
                    } else {
                        output_script_type(&o.script)
                    },
                    spent: false,
                    spending_txid: None,
                })
                .collect(),
        };
        self.repo.store_transaction(record).await?;
        let used: Vec<KeyId> = tx.outputs.iter().filter_map(|o| o.key_id).collect();
        self.repo.mark_keys_used(&used).await
    }

    pub async fn send_to(
        &mut self,
        address: &str,
        amount: u64,
        fee: Option<Fee>,
        offline: bool,
    ) -> Result<WalletTransaction> {
        let request = CreateRequest {
            outputs: vec![(address.to_string(), amount)],
            fee,
            min_confirms: self.config.min_confirms,
            random_output_order: self.config.random_output_order,
            ..Default::default()
        };
        self.send(request, offline).await
    }

    /// Spends every non-dust output to `outputs`. One output may have a zero
    /// amount and receives what is left after the other outputs and the fee.
    pub async fn sweep(
        &mut self,
        outputs: Vec<(String, u64)>,
        account_id: Option<u32>,
        fee: Option<Fee>,
        offline: bool,
    ) -> Result<WalletTransaction> {
        let network = self.network();
        let dust = network.dust_amount();
        let mut utxos: Vec<Utxo> = self
            .ledger
            .utxos(account_id, Some(network), self.config.min_confirms, None)
            .await?
            .into_iter()
            .filter(|u| u.value > dust)
            .collect();
        utxos.truncate(SWEEP_MAX_INPUTS);
        if utxos.is_empty() {
            return Err(WalletError::InsufficientFunds(format!(
                "No unspent outputs to sweep in wallet {}",
                self.name()
            )));
        }
        let total: u64 = utxos.iter().map(|u| u.value).sum();
        let n_inputs = utxos.len() as u64;
        let n_outputs = outputs.len().max(1) as u64;
        let sigs = self.record().sigs_required as u64;
        let fee = match fee {
            Some(Fee::Amount(amount)) => amount,
            Some(Fee::Priority(priority)) => {
                let rate = self.chain.estimate_fee(priority.blocks()).await?;
                let size = 125 + n_inputs * (77 + sigs * 72) + n_outputs * 30;
                100 + size * rate / 1000
            }
            None => {
                let rate = self.chain.estimate_fee(3).await?.max(network.fee_min());
                let size = 125 + n_inputs * 125;
                size * rate / 1000
            }
        };
        if total <= fee || total - fee <= dust {
            return Err(WalletError::InsufficientFunds(format!(
                "Amount to send ({}) is smaller than the fee ({}) plus dust",
                total, fee
            )));
        }
        let available = total - fee;

        let mut outputs = outputs;
        let zero: Vec<usize> = outputs.iter().enumerate().filter(|(_, o)| o.1 == 0).map(|(i, _)| i).collect();
        let fixed: u64 = outputs.iter().map(|o| o.1).sum();
        match zero.as_slice() {
            [] if fixed == available => {}
            [index] if fixed < available => outputs[*index].1 = available - fixed,
            _ => {
                return Err(WalletError::InvalidInput(format!(
                    "Sweep outputs total {} but {} is available after fee; leave exactly one output at 0",
                    fixed, available
                )))
            }
        }

        let request = CreateRequest {
            outputs,
            inputs: utxos.iter().map(InputRef::from).collect(),
            account_id,
            network: Some(network),
            fee: Some(Fee::Amount(fee)),
            min_confirms: self.config.min_confirms,
            random_output_order: self.config.random_output_order,
            ..Default::default()
        };
        self.send(request, offline).await
    }

    /// Removes the wallet, its cosigners, keys and transactions.
    pub async fn delete(self) -> Result<()> {
        let name = self.name().to_string();
        self.repo.delete_wallet(self.id()).await?;
        log::info!("Deleted wallet {}", name);
        Ok(())
    }
}
