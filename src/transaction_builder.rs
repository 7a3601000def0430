//! Transaction construction: input selection, fee and change computation.

use crate::chain::ChainService;
use crate::coin_selection::{self, SelectionQuery};
use crate::keystore::{KeyProvider, SpendInfo};
use crate::ledger::{Utxo, UtxoLedger};
use crate::network::Network;
use crate::primitives::address::Address;
use crate::primitives::script::Script;
use crate::primitives::transaction::{OutPoint, Transaction, TxIn, TxOut};
use crate::types::{FeePriority, KeyId, Scheme, ScriptType};
use crate::{Result, WalletError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Confirmation target used when no fee is given.
const DEFAULT_FEE_BLOCKS: u32 = 3;
/// Largest OP_RETURN payload relayed by default.
const MAX_MESSAGE_LEN: usize = 80;

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
pub const SEQUENCE_LOCKTIME: u32 = 0xffff_fffe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fee {
    Amount(u64),
    Priority(FeePriority),
}

/// A caller supplied input. Value and address are only needed when the
/// output is not in the ledger yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub txid: String,
    pub output_n: u32,
    pub value: Option<u64>,
    pub address: Option<String>,
}

impl InputRef {
    pub fn new(txid: impl Into<String>, output_n: u32) -> Self {
        Self {
            txid: txid.into(),
            output_n,
            value: None,
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>, value: u64) -> Self {
        self.address = Some(address.into());
        self.value = Some(value);
        self
    }
}

impl From<&Utxo> for InputRef {
    fn from(utxo: &Utxo) -> Self {
        InputRef::new(utxo.txid.clone(), utxo.output_n).with_address(utxo.address.clone(), utxo.value)
    }
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Destination address and amount pairs.
    pub outputs: Vec<(String, u64)>,
    pub inputs: Vec<InputRef>,
    pub account_id: Option<u32>,
    pub network: Option<Network>,
    pub fee: Option<Fee>,
    pub min_confirms: u32,
    pub max_utxos: Option<usize>,
    pub locktime: u32,
    /// 0 picks a randomized number of change outputs.
    pub number_of_change_outputs: usize,
    pub random_output_order: bool,
    /// Appended as an OP_RETURN output.
    pub message: Option<String>,
}

impl Default for CreateRequest {
    fn default() -> Self {
        Self {
            outputs: Vec::new(),
            inputs: Vec::new(),
            account_id: None,
            network: None,
            fee: None,
            min_confirms: 1,
            max_utxos: None,
            locktime: 0,
            number_of_change_outputs: 1,
            random_output_order: true,
            message: None,
        }
    }
}

impl CreateRequest {
    pub fn new(outputs: Vec<(String, u64)>) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPlan {
    pub txid: String,
    pub output_n: u32,
    pub value: u64,
    pub key_id: KeyId,
    pub address: String,
    pub script_type: ScriptType,
    pub sequence: u32,
    pub pubkeys: Vec<Vec<u8>>,
    pub redeem_script: Option<Script>,
    pub sigs_required: usize,
    /// One slot per public key, in `pubkeys` order. DER plus sighash byte.
    pub signatures: Vec<Option<Vec<u8>>>,
    pub script_sig: Script,
    pub witness: Vec<Vec<u8>>,
}

impl InputPlan {
    fn new(txid: String, output_n: u32, value: u64, address: String, sequence: u32, info: SpendInfo) -> Self {
        let slots = info.pubkeys.len();
        Self {
            txid,
            output_n,
            value,
            key_id: info.key_id,
            address,
            script_type: info.script_type,
            sequence,
            pubkeys: info.pubkeys,
            redeem_script: info.redeem_script,
            sigs_required: info.sigs_required,
            signatures: vec![None; slots],
            script_sig: Script::new(),
            witness: Vec::new(),
        }
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_signed(&self) -> bool {
        self.signature_count() >= self.sigs_required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPlan {
    pub address: Option<String>,
    pub value: u64,
    pub script: Script,
    pub key_id: Option<KeyId>,
    pub is_change: bool,
}

/// A built transaction together with everything needed to sign and store it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub network: Network,
    pub account_id: u32,
    pub version: i32,
    pub locktime: u32,
    pub inputs: Vec<InputPlan>,
    pub outputs: Vec<OutputPlan>,
    pub input_total: u64,
    pub output_total: u64,
    pub fee: u64,
    pub fee_per_kb: u64,
    /// Estimated before signing, exact afterwards.
    pub vsize: usize,
    /// Set when the fee came from a rate estimate rather than the caller.
    pub fee_estimated: bool,
    pub change: u64,
    pub txid: String,
    pub raw: String,
    pub complete: bool,
}

impl WalletTransaction {
    pub fn to_transaction(&self) -> Result<Transaction> {
        let input = self
            .inputs
            .iter()
            .map(|i| {
                Ok(TxIn {
                    previous_output: OutPoint::from_hex_txid(&i.txid, i.output_n)?,
                    script_sig: i.script_sig.clone(),
                    sequence: i.sequence,
                    witness: i.witness.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let output = self
            .outputs
            .iter()
            .map(|o| TxOut {
                value: o.value,
                script_pubkey: o.script.clone(),
            })
            .collect();
        Ok(Transaction {
            version: self.version,
            lock_time: self.locktime,
            input,
            output,
        })
    }

    /// Recomputes txid and raw serialization from the current plans.
    pub fn refresh(&mut self) -> Result<()> {
        let tx = self.to_transaction()?;
        self.txid = tx.txid()?;
        self.raw = tx.raw_hex()?;
        self.complete = !self.inputs.is_empty() && self.inputs.iter().all(InputPlan::is_signed);
        if self.complete {
            self.vsize = tx.vsize()?;
            self.fee_per_kb = fee_per_kb(self.fee, self.vsize);
        }
        Ok(())
    }

    pub fn change_outputs(&self) -> impl Iterator<Item = &OutputPlan> {
        self.outputs.iter().filter(|o| o.is_change)
    }
}

fn fee_per_kb(fee: u64, vsize: usize) -> u64 {
    if vsize == 0 {
        return 0;
    }
    fee.saturating_mul(1000) / vsize as u64
}

/// Sum of satoshi amounts, rejecting totals that do not fit in a u64.
fn checked_total(amounts: impl IntoIterator<Item = u64>, what: &str) -> Result<u64> {
    amounts
        .into_iter()
        .try_fold(0u64, u64::checked_add)
        .ok_or_else(|| WalletError::InvalidInput(format!("Total {} overflows", what)))
}

/// Fee for `vsize` at `rate` per 1000 vbytes.
pub fn fee_for_size(vsize: usize, rate: u64) -> u64 {
    vsize as u64 * rate / 1000
}

/// Estimated vsize of one input spending `script_type`.
pub fn input_vsize(script_type: ScriptType, sigs_required: usize, n_keys: usize) -> usize {
    let redeem_len = 3 + 34 * n_keys;
    let witness_multisig = 2 + 73 * sigs_required + 3 + redeem_len;
    match script_type {
        ScriptType::P2pkh => 148,
        ScriptType::P2shP2wpkh => 91,
        ScriptType::P2wpkh => 68,
        ScriptType::P2shMultisig => 41 + 3 + 1 + 73 * sigs_required + 2 + redeem_len,
        ScriptType::P2shP2wshMultisig => 41 + 35 + (witness_multisig + 3) / 4,
        ScriptType::P2wshMultisig => 41 + (witness_multisig + 3) / 4,
        ScriptType::NullData | ScriptType::Unknown => 148,
    }
}

pub fn output_vsize(script_len: usize) -> usize {
    9 + script_len
}

/// Estimated vsize of a transaction with the given inputs and output script lengths.
pub fn estimate_vsize(inputs: &[(ScriptType, usize, usize)], output_script_lens: &[usize]) -> usize {
    10 + inputs.iter().map(|&(t, m, n)| input_vsize(t, m, n)).sum::<usize>()
        + output_script_lens.iter().map(|&l| output_vsize(l)).sum::<usize>()
}

/// Splits change over one or more outputs without creating sub-threshold outputs.
pub struct ChangeSplitter {
    min_output: u64,
}

impl ChangeSplitter {
    pub fn new(network: Network, fee_per_kb: Option<u64>) -> Self {
        let min_output = match fee_per_kb {
            Some(rate) => rate + network.fee_min() * 4 + network.dust_amount(),
            None => network.dust_amount() * 2 + network.fee_min() * 4,
        };
        Self { min_output }
    }

    pub fn min_output(&self) -> u64 {
        self.min_output
    }

    /// Number of change outputs when the caller leaves it open.
    pub fn count(&self, change: u64, output_total: u64, rng: &mut StdRng) -> usize {
        if change < output_total / 10 || change < self.min_output * 8 {
            1
        } else if change / 10 > output_total {
            rng.gen_range(2..=5)
        } else {
            match rng.gen_range(1..=3) {
                3 => rng.gen_range(3..=4),
                n => n,
            }
        }
    }

    /// Random proportional allocation of `change` over `parts` outputs. The
    /// result sums to `change` and every part is at least the minimum output.
    pub fn split(&self, change: u64, parts: usize, rng: &mut StdRng) -> Result<Vec<u64>> {
        if parts <= 1 {
            return Ok(vec![change]);
        }
        let k = parts as u64;
        if change / k < self.min_output {
            return Err(WalletError::InsufficientFunds(format!(
                "Change of {} cannot be split over {} outputs of at least {}",
                change, parts, self.min_output
            )));
        }
        // Dirichlet(1, ..., 1) via normalized exponential draws.
        let draws: Vec<f64> = (0..parts)
            .map(|_| -(1.0 - rng.gen::<f64>()).ln())
            .collect();
        let total: f64 = draws.iter().sum();
        let spread = change - k * self.min_output;
        let mut amounts: Vec<u64> = draws
            .iter()
            .map(|d| (d / total * spread as f64).floor() as u64 + self.min_output)
            .collect();
        let allocated: u64 = amounts.iter().sum();
        if allocated <= change {
            amounts[0] += change - allocated;
        } else if let Some(largest) = amounts.iter_mut().max() {
            *largest -= allocated - change;
        }
        Ok(amounts)
    }
}

pub struct TransactionBuilder<'a> {
    ledger: &'a UtxoLedger,
    chain: &'a dyn ChainService,
    keys: &'a mut dyn KeyProvider,
    rng: &'a mut StdRng,
}

struct FeePlan {
    rate: Option<u64>,
    fixed: Option<u64>,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(
        ledger: &'a UtxoLedger,
        chain: &'a dyn ChainService,
        keys: &'a mut dyn KeyProvider,
        rng: &'a mut StdRng,
    ) -> Self {
        Self {
            ledger,
            chain,
            keys,
            rng,
        }
    }

    fn target_network(&self, request: &CreateRequest) -> Result<(Network, Vec<(Address, u64)>)> {
        let hint = request.network.unwrap_or(self.keys.wallet().network);
        let (first, _) = request
            .outputs
            .first()
            .ok_or_else(|| WalletError::InvalidInput("Transaction needs at least one output".to_string()))?;
        let network = match request.network {
            Some(network) => network,
            None => Address::parse(first, hint)?.network,
        };
        let outputs = request
            .outputs
            .iter()
            .map(|(address, value)| {
                let parsed = Address::parse(address, network)?;
                if parsed.network != network {
                    return Err(WalletError::InvalidInput(format!(
                        "Address {} is not a {} address",
                        address, network
                    )));
                }
                if *value == 0 {
                    return Err(WalletError::InvalidInput(format!("Output to {} has no value", address)));
                }
                Ok((parsed, *value))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((network, outputs))
    }

    async fn fee_plan(&self, fee: Option<Fee>, explicit_inputs: bool, network: Network) -> Result<FeePlan> {
        Ok(match fee {
            Some(Fee::Amount(amount)) => FeePlan {
                rate: None,
                fixed: Some(amount),
            },
            Some(Fee::Priority(priority)) => FeePlan {
                rate: Some(self.chain.estimate_fee(priority.blocks()).await?),
                fixed: None,
            },
            None if explicit_inputs => FeePlan { rate: None, fixed: None },
            None => {
                let estimate = self.chain.estimate_fee(DEFAULT_FEE_BLOCKS).await?;
                FeePlan {
                    rate: Some(estimate.max(network.fee_min())),
                    fixed: None,
                }
            }
        })
    }

    /// Input shape assumed before selection. The cosigner count is not on
    /// the wallet record, so multisig inputs are sized as m-of-m.
    fn default_input_type(&self) -> (ScriptType, usize, usize) {
        let wallet = self.keys.wallet();
        (
            ScriptType::for_wallet(wallet.witness_type, wallet.multisig),
            wallet.sigs_required as usize,
            wallet.sigs_required.max(1) as usize,
        )
    }

    async fn resolve_inputs(&mut self, inputs: &[InputRef], network: Network, sequence: u32) -> Result<Vec<InputPlan>> {
        let stored = self.ledger.utxos(None, Some(network), 0, None).await?;
        let mut plans = Vec::with_capacity(inputs.len());
        for input in inputs {
            let found = stored
                .iter()
                .find(|u| u.txid == input.txid && u.output_n == input.output_n);
            let (address, value) = match (found, &input.address) {
                (Some(utxo), _) => (utxo.address.clone(), utxo.value),
                (None, Some(address)) => (address.clone(), input.value.unwrap_or(0)),
                (None, None) => {
                    return Err(WalletError::NotFound(format!(
                        "Output {}:{} not found and no address given",
                        input.txid, input.output_n
                    )))
                }
            };
            let info = self.keys.spend_info(&address).await?.ok_or_else(|| {
                WalletError::NotFound(format!("No key found for input address {}", address))
            })?;
            if value == 0 {
                return Err(WalletError::InvalidInput(format!(
                    "Value of input {}:{} is unknown",
                    input.txid, input.output_n
                )));
            }
            plans.push(InputPlan::new(input.txid.clone(), input.output_n, value, address, sequence, info));
        }
        Ok(plans)
    }

    pub async fn create(&mut self, request: CreateRequest) -> Result<WalletTransaction> {
        let (network, outputs) = self.target_network(&request)?;
        let wallet = self.keys.wallet().clone();
        let account_id = request.account_id.unwrap_or(wallet.default_account_id);
        let dust = network.dust_amount();

        if let Some(max) = request.max_utxos {
            if request.inputs.len() > max {
                return Err(WalletError::InvalidInput(format!(
                    "{} inputs given but at most {} allowed",
                    request.inputs.len(),
                    max
                )));
            }
        }
        let message = match &request.message {
            Some(m) if m.len() > MAX_MESSAGE_LEN => {
                return Err(WalletError::InvalidInput(format!(
                    "Message is {} bytes, at most {} allowed",
                    m.len(),
                    MAX_MESSAGE_LEN
                )))
            }
            Some(m) => Some(Script::new_op_return(m.as_bytes())),
            None => None,
        };

        let sequence = if request.locktime > 0 && request.locktime < SEQUENCE_FINAL {
            SEQUENCE_LOCKTIME
        } else {
            SEQUENCE_FINAL
        };
        let output_total = checked_total(outputs.iter().map(|(_, v)| *v), "output value")?;
        let mut output_lens: Vec<usize> = outputs.iter().map(|(a, _)| a.script_pubkey().len()).collect();
        if let Some(script) = &message {
            output_lens.push(script.len());
        }
        let change_script_len = {
            let (script_type, _, _) = self.default_input_type();
            match script_type {
                ScriptType::P2pkh => 25,
                ScriptType::P2wpkh => 22,
                ScriptType::P2wshMultisig => 34,
                _ => 23,
            }
        };

        let explicit_inputs = !request.inputs.is_empty();
        let plan = self.fee_plan(request.fee, explicit_inputs, network).await?;
        let fee_per_output = plan.rate.map_or(0, |rate| 50 * rate / 1000);

        let estimate_fee = |inputs: &[(ScriptType, usize, usize)], extra_outputs: usize| -> Option<u64> {
            if let Some(fixed) = plan.fixed {
                return Some(fixed);
            }
            let rate = plan.rate?;
            let mut lens = output_lens.clone();
            lens.extend(std::iter::repeat(change_script_len).take(extra_outputs));
            Some(fee_for_size(estimate_vsize(inputs, &lens), rate))
        };

        let mut plans = if explicit_inputs {
            self.resolve_inputs(&request.inputs, network, sequence).await?
        } else {
            let mut inputs_guess = vec![self.default_input_type()];
            let mut selected = Vec::new();
            for _ in 0..2 {
                let fee = estimate_fee(&inputs_guess, 1).unwrap_or(0);
                let target = checked_total([output_total, fee], "of outputs and fee")?;
                let query = SelectionQuery {
                    account_id: Some(account_id),
                    network: Some(network),
                    min_confirms: request.min_confirms,
                    max_utxos: request.max_utxos,
                    ..Default::default()
                };
                selected = coin_selection::select_inputs(self.ledger, network, target, &query).await?;
                if selected.is_empty() {
                    return Err(WalletError::InsufficientFunds(format!(
                        "Not enough unspent transaction outputs found to send {} plus fee",
                        output_total
                    )));
                }
                let total = checked_total(selected.iter().map(|u| u.value), "input value")?;
                inputs_guess = vec![self.default_input_type(); selected.len()];
                let exact = estimate_fee(&inputs_guess, 1).unwrap_or(0);
                if total >= output_total.saturating_add(exact) {
                    break;
                }
            }
            let refs: Vec<InputRef> = selected.iter().map(InputRef::from).collect();
            self.resolve_inputs(&refs, network, sequence).await?
        };

        let input_types: Vec<(ScriptType, usize, usize)> = plans
            .iter()
            .map(|p| (p.script_type, p.sigs_required, p.pubkeys.len()))
            .collect();
        let input_total = checked_total(plans.iter().map(|p| p.value), "input value")?;
        let mut fee = match estimate_fee(&input_types, 1) {
            Some(fee) => fee,
            None => input_total.checked_sub(output_total).ok_or_else(|| {
                WalletError::InsufficientFunds(format!(
                    "Inputs of {} do not cover outputs of {}",
                    input_total, output_total
                ))
            })?,
        };
        let spent = checked_total([output_total, fee], "of outputs and fee")?;
        let mut change = input_total.checked_sub(spent).ok_or_else(|| {
            WalletError::InsufficientFunds(format!(
                "Inputs of {} do not cover outputs of {} plus fee {}",
                input_total, output_total, fee
            ))
        })?;
        if change > 0 && (change < fee_per_output || change <= dust) {
            fee += change;
            change = 0;
        }

        let mut change_amounts = Vec::new();
        if change > 0 {
            let size = estimate_vsize(&input_types, &output_lens);
            let splitter = ChangeSplitter::new(network, Some(fee_per_kb(fee, size)).filter(|r| *r > 0));
            let parts = match request.number_of_change_outputs {
                0 => splitter.count(change, output_total, self.rng),
                n => n,
            };
            if parts > 1 && plan.rate.is_some() {
                let extra = estimate_fee(&input_types, parts).unwrap_or(fee) - estimate_fee(&input_types, 1).unwrap_or(fee);
                if extra >= change {
                    return Err(WalletError::InsufficientFunds(format!(
                        "Change of {} does not cover the fee for {} change outputs",
                        change, parts
                    )));
                }
                fee += extra;
                change -= extra;
            }
            change_amounts = splitter.split(change, parts, self.rng)?;
        }

        let mut output_plans: Vec<OutputPlan> = outputs
            .iter()
            .map(|(address, value)| OutputPlan {
                address: Some(address.to_string()),
                value: *value,
                script: address.script_pubkey(),
                key_id: None,
                is_change: false,
            })
            .collect();
        if !change_amounts.is_empty() {
            let change_keys = if wallet.scheme == Scheme::Single {
                vec![self.keys.main_key().await?; change_amounts.len()]
            } else {
                self.keys
                    .get_keys(Some(account_id), Some(network), 1, change_amounts.len(), false)
                    .await?
            };
            if change_keys.len() < change_amounts.len() {
                return Err(WalletError::Key(format!(
                    "Only {} change keys available for {} change outputs",
                    change_keys.len(),
                    change_amounts.len()
                )));
            }
            for (key, value) in change_keys.iter().zip(&change_amounts) {
                let address = Address::parse(&key.address, network)?;
                output_plans.push(OutputPlan {
                    script: address.script_pubkey(),
                    address: Some(key.address.clone()),
                    value: *value,
                    key_id: Some(key.id),
                    is_change: true,
                });
            }
        }
        if request.random_output_order {
            output_plans.shuffle(&mut *self.rng);
        }
        if let Some(script) = message {
            output_plans.push(OutputPlan {
                address: None,
                value: 0,
                script,
                key_id: None,
                is_change: false,
            });
        }

        let output_total = checked_total(output_plans.iter().map(|o| o.value), "output value")?;
        if Some(input_total) != fee.checked_add(output_total) {
            return Err(WalletError::Consistency(format!(
                "Input total {} does not equal fee {} plus output total {}",
                input_total, fee, output_total
            )));
        }
        let lens: Vec<usize> = output_plans.iter().map(|o| o.script.len()).collect();
        let vsize = estimate_vsize(&input_types, &lens);
        let rate = fee_per_kb(fee, vsize);
        if rate < network.fee_min() || rate > network.fee_max() {
            return Err(WalletError::InvalidInput(format!(
                "Fee per kB of {} is outside the allowed range {} to {}",
                rate,
                network.fee_min(),
                network.fee_max()
            )));
        }

        for plan_input in plans.iter_mut() {
            plan_input.sequence = sequence;
        }
        let mut tx = WalletTransaction {
            network,
            account_id,
            version: 1,
            locktime: request.locktime,
            inputs: plans,
            outputs: output_plans,
            input_total,
            output_total,
            fee,
            fee_per_kb: rate,
            vsize,
            fee_estimated: plan.rate.is_some(),
            change: change_amounts.iter().sum(),
            txid: String::new(),
            raw: String::new(),
            complete: false,
        };
        tx.refresh()?;
        log::debug!(
            "Created transaction {} with {} inputs, {} outputs and fee {}",
            tx.txid,
            tx.inputs.len(),
            tx.outputs.len(),
            tx.fee
        );
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_split_sums_and_respects_minimum() {
        let splitter = ChangeSplitter::new(Network::Bitcoin, None);
        assert_eq!(splitter.min_output(), 1_000 * 2 + 1_000 * 4);
        let mut rng = StdRng::seed_from_u64(7);
        for parts in 2..=5 {
            for change in [30_000u64, 123_457, 10_000_000] {
                let amounts = splitter.split(change, parts, &mut rng).unwrap();
                assert_eq!(amounts.len(), parts);
                assert_eq!(amounts.iter().sum::<u64>(), change);
                assert!(amounts.iter().all(|a| *a >= splitter.min_output()));
            }
        }
    }

    #[test]
    fn test_split_rejects_sub_minimum_parts() {
        let splitter = ChangeSplitter::new(Network::Bitcoin, Some(10_000));
        assert_eq!(splitter.min_output(), 10_000 + 4_000 + 1_000);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            splitter.split(40_000, 3, &mut rng),
            Err(WalletError::InsufficientFunds(_))
        ));
        assert_eq!(splitter.split(40_000, 1, &mut rng).unwrap(), vec![40_000]);
    }

    #[test]
    fn test_change_output_count_rules() {
        let splitter = ChangeSplitter::new(Network::Bitcoin, None);
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(splitter.count(1_000, 1_000_000, &mut rng), 1);
        assert_eq!(splitter.count(40_000, 100_000, &mut rng), 1);
        for _ in 0..20 {
            let many = splitter.count(10_000_000, 100_000, &mut rng);
            assert!((2..=5).contains(&many));
            let some = splitter.count(1_000_000, 500_000, &mut rng);
            assert!((1..=4).contains(&some));
        }
    }

    #[test]
    fn test_size_estimates() {
        assert_eq!(estimate_vsize(&[(ScriptType::P2pkh, 1, 1)], &[25, 25]), 10 + 148 + 34 + 34);
        assert_eq!(input_vsize(ScriptType::P2wpkh, 1, 1), 68);
        let legacy = input_vsize(ScriptType::P2shMultisig, 2, 3);
        let native = input_vsize(ScriptType::P2wshMultisig, 2, 3);
        assert!(native < legacy);
        assert_eq!(fee_for_size(250, 10_000), 2_500);
    }
}
