//! Coin selection over the wallet's unspent outputs.

use crate::ledger::{Utxo, UtxoLedger};
use crate::network::Network;
use crate::types::KeyId;
use crate::{Result, WalletError};

/// Filters applied before selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionQuery {
    pub account_id: Option<u32>,
    pub network: Option<Network>,
    pub min_confirms: u32,
    /// Maximum number of inputs. `None` means unbounded.
    pub max_utxos: Option<usize>,
    /// Accepted overshoot for an exact single-input match. Defaults to dust.
    pub variance: Option<u64>,
    pub key_ids: Option<Vec<KeyId>>,
    /// Skip outputs at or below the dust amount.
    pub skip_dust: bool,
}

/// Picks inputs covering `amount` from `candidates`, which are expected to
/// be ordered by confirmations descending. Returns an empty list when no
/// acceptable set exists.
pub fn select(candidates: &[Utxo], amount: u64, variance: u64, max_utxos: Option<usize>) -> Vec<Utxo> {
    if candidates.is_empty() {
        return Vec::new();
    }

    // A single output close to the amount needs no change.
    let upper = amount.saturating_add(variance);
    if let Some(exact) = candidates.iter().find(|u| u.value >= amount && u.value <= upper) {
        return vec![exact.clone()];
    }

    if let Some(smallest) = candidates
        .iter()
        .filter(|u| u.value >= amount)
        .min_by_key(|u| u.value)
    {
        return vec![smallest.clone()];
    }

    if max_utxos.map_or(false, |max| max <= 1) {
        return Vec::new();
    }

    let mut lesser: Vec<&Utxo> = candidates.iter().filter(|u| u.value < amount).collect();
    lesser.sort_by(|a, b| b.value.cmp(&a.value));
    if let Some(max) = max_utxos {
        lesser.truncate(max);
    }

    let mut selected = Vec::new();
    let mut total = 0u64;
    for utxo in lesser {
        selected.push(utxo.clone());
        total += utxo.value;
        if total >= amount {
            return selected;
        }
    }
    Vec::new()
}

/// Queries the ledger and selects inputs for `amount`.
pub async fn select_inputs(ledger: &UtxoLedger, network: Network, amount: u64, query: &SelectionQuery) -> Result<Vec<Utxo>> {
    let dust = network.dust_amount();
    let candidates: Vec<Utxo> = ledger
        .utxos(query.account_id, Some(query.network.unwrap_or(network)), query.min_confirms, None)
        .await?
        .into_iter()
        .filter(|u| query.key_ids.as_ref().map_or(true, |ids| ids.contains(&u.key_id)))
        .filter(|u| !query.skip_dust || u.value > dust)
        .collect();
    if candidates.is_empty() {
        return Err(WalletError::InsufficientFunds(format!(
            "No unspent transaction outputs found for account {:?}",
            query.account_id
        )));
    }

    let selected = select(&candidates, amount, query.variance.unwrap_or(dust), query.max_utxos);
    log::debug!(
        "Selected {} of {} outputs for amount {}",
        selected.len(),
        candidates.len(),
        amount
    );
    Ok(selected)
}
