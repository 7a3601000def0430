//! Multisig cosigner coordination.
//!
//! A multisig wallet owns one [`WalletKeyStore`] per cosigner. Every key
//! request is fanned out to all cosigners, their public keys are combined
//! into an m-of-n redeem script and the resulting address is stored as a
//! multisig key in the owning wallet.

use crate::keystore::{path_fields, KeyRequest, WalletKey, WalletKeyStore};
use crate::network::Network;
use crate::path;
use crate::primitives::address::Address;
use crate::primitives::bip32::HdKey;
use crate::primitives::script::Script;
use crate::storage::{KeyFilter, KeyRecord};
use crate::types::{KeyType, Scheme, WitnessType};
use crate::{Result, WalletError};
use futures_util::future::try_join_all;

/// Redeem script and address for an ordered set of public keys.
pub fn multisig_address(
    sigs_required: usize,
    pubkeys: &[Vec<u8>],
    witness_type: WitnessType,
    network: Network,
) -> Result<(Script, Address)> {
    let script = Script::new_multisig(sigs_required, pubkeys)?;
    let address = match witness_type {
        WitnessType::Legacy => Address::p2sh(&script, network),
        WitnessType::P2shSegwit => Address::p2sh_p2wsh(&script, network)?,
        WitnessType::Segwit => Address::p2wsh(&script, network)?,
    };
    Ok((script, address))
}

/// Index of the single private key among `keys`, used as the wallet's own
/// cosigner id when none is given.
pub fn infer_cosigner_id(keys: &[HdKey]) -> Result<u32> {
    let private: Vec<usize> = keys
        .iter()
        .enumerate()
        .filter(|(_, k)| k.is_private())
        .map(|(i, _)| i)
        .collect();
    match private.as_slice() {
        [index] => Ok(*index as u32),
        [] => Err(WalletError::AmbiguousCosigner(
            "No private key found among cosigner keys, please specify cosigner_id".to_string(),
        )),
        _ => Err(WalletError::AmbiguousCosigner(format!(
            "{} private keys found among cosigner keys, please specify cosigner_id",
            private.len()
        ))),
    }
}

pub struct CosignerGroup {
    cosigners: Vec<WalletKeyStore>,
    sigs_required: u32,
    sort_keys: bool,
}

impl CosignerGroup {
    pub fn new(cosigners: Vec<WalletKeyStore>, sigs_required: u32, sort_keys: bool) -> Self {
        Self {
            cosigners,
            sigs_required,
            sort_keys,
        }
    }

    pub fn cosigners(&self) -> &[WalletKeyStore] {
        &self.cosigners
    }

    pub fn cosigners_mut(&mut self) -> &mut [WalletKeyStore] {
        &mut self.cosigners
    }

    pub fn len(&self) -> usize {
        self.cosigners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cosigners.is_empty()
    }

    pub fn sigs_required(&self) -> u32 {
        self.sigs_required
    }

    /// Resolves the request on every cosigner and returns the matching
    /// multisig key of `owner`, creating it on first use.
    pub async fn key_for_path(&mut self, owner: &mut WalletKeyStore, request: &KeyRequest) -> Result<WalletKey> {
        let wallet = owner.wallet().clone();
        let network = request.network.unwrap_or(wallet.network);
        let cosigner_request = request.clone().cosigner(wallet.cosigner_id).network(network);

        let resolved = try_join_all(self.cosigners.iter_mut().map(|cosigner| {
            let req = cosigner_request.clone();
            async move {
                if cosigner.wallet().scheme == Scheme::Single {
                    return cosigner.main_key().await;
                }
                cosigner.key_for_path(&req).await?.ok_or_else(|| {
                    WalletError::Key(format!(
                        "Cosigner {} has no key usable for this path",
                        cosigner.wallet().name
                    ))
                })
            }
        }))
        .await?;

        let mut members: Vec<(Vec<u8>, u64)> = resolved
            .iter()
            .map(|key| Ok((key.hd()?.public_bytes(), key.id())))
            .collect::<Result<_>>()?;
        if self.sort_keys {
            members.sort_by(|a, b| a.0.cmp(&b.0));
        }
        let pubkeys: Vec<Vec<u8>> = members.iter().map(|(pk, _)| pk.clone()).collect();
        let (_, address) = multisig_address(self.sigs_required as usize, &pubkeys, wallet.witness_type, network)?;
        let encoding = address.encoding().to_string();
        let address = address.to_string();

        if let Some(existing) = owner.key_by_address(&address).await? {
            return Ok(existing);
        }

        let account_id = request.account_id.unwrap_or(wallet.default_account_id);
        let mut ctx = owner.path_context(network, account_id, wallet.cosigner_id);
        ctx.change = request.change;
        ctx.address_index = request.address_index;
        let fullpath = path::expand(&request.path, &wallet.key_path, request.level_offset, &ctx)?;
        let (account_id, change, address_index) = path_fields(&wallet.key_path, &fullpath, account_id);
        let record = KeyRecord {
            id: 0,
            wallet_id: wallet.id,
            parent_id: None,
            name: request
                .name
                .clone()
                .unwrap_or_else(|| format!("multisig-{}", address)),
            path: path::path_to_string(&fullpath),
            depth: fullpath.len().saturating_sub(1) as u32,
            account_id,
            change,
            address_index,
            purpose: wallet.purpose,
            network,
            key_type: KeyType::Multisig,
            cosigner_id: wallet.cosigner_id,
            is_private: false,
            witness_type: wallet.witness_type,
            public: String::new(),
            wif: format!("multisig-{}", address),
            encoding,
            address,
            used: false,
            balance: 0,
            latest_tx_index: 0,
            multisig_children: members.iter().map(|(_, id)| *id).collect(),
        };
        let key = owner.create_key(record, None).await?;
        log::debug!(
            "Multisig key {} created at {} ({}-of-{})",
            key.id(),
            key.path(),
            self.sigs_required,
            self.cosigners.len()
        );
        Ok(key)
    }

    /// Constituent cosigner keys of a multisig key, in redeem script order.
    pub async fn child_keys(&mut self, key: &WalletKey) -> Result<Vec<WalletKey>> {
        let mut children = Vec::with_capacity(key.record.multisig_children.len());
        for &child_id in &key.record.multisig_children {
            let mut found = None;
            for cosigner in self.cosigners.iter_mut() {
                match cosigner.key(child_id).await {
                    Ok(child) => {
                        found = Some(child);
                        break;
                    }
                    Err(WalletError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            children.push(found.ok_or_else(|| {
                WalletError::NotFound(format!("Cosigner key {} of multisig key {}", child_id, key.id()))
            })?);
        }
        Ok(children)
    }

    /// Redeem script of a stored multisig key.
    pub async fn redeem_script(&mut self, key: &WalletKey) -> Result<Script> {
        let children = self.child_keys(key).await?;
        let pubkeys = children
            .iter()
            .map(|c| Ok(c.hd()?.public_bytes()))
            .collect::<Result<Vec<_>>>()?;
        Script::new_multisig(self.sigs_required as usize, &pubkeys)
    }

    /// Existing multisig keys of `owner` matching `filter`.
    pub async fn find_keys(&self, owner: &WalletKeyStore, filter: KeyFilter) -> Result<Vec<KeyRecord>> {
        owner.find_keys(&filter.key_type(KeyType::Multisig)).await
    }
}
