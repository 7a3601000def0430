//! Input signing for single key and multisig outputs, legacy and segwit v0.

use crate::primitives::encode::write_var_bytes;
use crate::primitives::hash::{hash160, sha256, sha256d, Hash256};
use crate::primitives::script::{Script, OP_0};
use crate::primitives::transaction::Transaction;
use crate::transaction_builder::{InputPlan, WalletTransaction};
use crate::types::ScriptType;
use crate::{Result, WalletError};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

pub const SIGHASH_ALL: u8 = 0x01;

/// Legacy signature hash: every other input script is blanked and the
/// signed input carries `script_code`.
pub fn signature_hash_legacy(tx: &Transaction, index: usize, script_code: &Script) -> Result<Hash256> {
    let mut copy = tx.clone();
    for input in copy.input.iter_mut() {
        input.script_sig = Script::new();
        input.witness.clear();
    }
    let input = copy
        .input
        .get_mut(index)
        .ok_or_else(|| WalletError::InvalidInput(format!("Input {} out of range", index)))?;
    input.script_sig = script_code.clone();

    let mut data = copy.consensus_encode_legacy()?;
    data.extend_from_slice(&(SIGHASH_ALL as u32).to_le_bytes());
    Ok(sha256d(&data))
}

/// BIP143 signature hash for version 0 witness inputs.
pub fn signature_hash_segwit_v0(tx: &Transaction, index: usize, script_code: &Script, value: u64) -> Result<Hash256> {
    let input = tx
        .input
        .get(index)
        .ok_or_else(|| WalletError::InvalidInput(format!("Input {} out of range", index)))?;

    let mut prevouts = Vec::with_capacity(tx.input.len() * 36);
    let mut sequences = Vec::with_capacity(tx.input.len() * 4);
    for i in &tx.input {
        prevouts.extend_from_slice(&i.previous_output.txid);
        prevouts.extend_from_slice(&i.previous_output.vout.to_le_bytes());
        sequences.extend_from_slice(&i.sequence.to_le_bytes());
    }
    let mut outputs = Vec::new();
    for o in &tx.output {
        outputs.extend_from_slice(&o.value.to_le_bytes());
        write_var_bytes(&mut outputs, o.script_pubkey.as_bytes())?;
    }

    let mut data = Vec::new();
    data.extend_from_slice(&tx.version.to_le_bytes());
    data.extend_from_slice(&sha256d(&prevouts));
    data.extend_from_slice(&sha256d(&sequences));
    data.extend_from_slice(&input.previous_output.txid);
    data.extend_from_slice(&input.previous_output.vout.to_le_bytes());
    write_var_bytes(&mut data, script_code.as_bytes())?;
    data.extend_from_slice(&value.to_le_bytes());
    data.extend_from_slice(&input.sequence.to_le_bytes());
    data.extend_from_slice(&sha256d(&outputs));
    data.extend_from_slice(&tx.lock_time.to_le_bytes());
    data.extend_from_slice(&(SIGHASH_ALL as u32).to_le_bytes());
    Ok(sha256d(&data))
}

fn script_code(plan: &InputPlan) -> Result<Script> {
    if plan.script_type.is_multisig() {
        return plan
            .redeem_script
            .clone()
            .ok_or_else(|| WalletError::Transaction(format!("Input {}:{} has no redeem script", plan.txid, plan.output_n)));
    }
    let pubkey = plan
        .pubkeys
        .first()
        .ok_or_else(|| WalletError::Transaction(format!("Input {}:{} has no public key", plan.txid, plan.output_n)))?;
    Ok(Script::new_p2pkh(&hash160(pubkey)))
}

fn sighash(tx: &Transaction, index: usize, plan: &InputPlan) -> Result<Hash256> {
    let code = script_code(plan)?;
    if plan.script_type.is_segwit() {
        signature_hash_segwit_v0(tx, index, &code, plan.value)
    } else {
        signature_hash_legacy(tx, index, &code)
    }
}

/// Rebuilds the unlocking script and witness of `plan` from its signature
/// slots. At most `sigs_required` signatures are pushed, in key order.
fn assemble(plan: &mut InputPlan) -> Result<()> {
    let signatures: Vec<&Vec<u8>> = plan
        .signatures
        .iter()
        .flatten()
        .take(plan.sigs_required.max(1))
        .collect();
    if signatures.is_empty() {
        plan.script_sig = Script::new();
        plan.witness.clear();
        return Ok(());
    }
    let mut script_sig = Script::new();
    let mut witness = Vec::new();
    match plan.script_type {
        ScriptType::P2pkh => {
            script_sig.push_slice(signatures[0]).push_slice(&plan.pubkeys[0]);
        }
        ScriptType::P2wpkh => {
            witness = vec![signatures[0].clone(), plan.pubkeys[0].clone()];
        }
        ScriptType::P2shP2wpkh => {
            script_sig.push_slice(Script::new_p2wpkh(&hash160(&plan.pubkeys[0])).as_bytes());
            witness = vec![signatures[0].clone(), plan.pubkeys[0].clone()];
        }
        ScriptType::P2shMultisig | ScriptType::P2wshMultisig | ScriptType::P2shP2wshMultisig => {
            let redeem = script_code(plan)?;
            if plan.script_type == ScriptType::P2shMultisig {
                script_sig.push_opcode(OP_0);
                for sig in &signatures {
                    script_sig.push_slice(sig);
                }
                script_sig.push_slice(redeem.as_bytes());
            } else {
                if plan.script_type == ScriptType::P2shP2wshMultisig {
                    script_sig.push_slice(Script::new_p2wsh(&sha256(redeem.as_bytes())).as_bytes());
                }
                witness.push(Vec::new());
                witness.extend(signatures.iter().map(|s| (*s).clone()));
                witness.push(redeem.as_bytes().to_vec());
            }
        }
        ScriptType::NullData | ScriptType::Unknown => {
            return Err(WalletError::Transaction(format!(
                "Cannot sign input {}:{} of unknown script type",
                plan.txid, plan.output_n
            )))
        }
    }
    plan.script_sig = script_sig;
    plan.witness = witness;
    Ok(())
}

/// Signs input `index` with the keys in `secrets` that belong to it until
/// `sigs_required` slots are filled. Existing signatures are kept. Returns
/// the number of signatures added.
pub fn sign_input(tx: &mut WalletTransaction, index: usize, secrets: &[SecretKey]) -> Result<usize> {
    let unsigned = tx.to_transaction()?;
    let plan = tx
        .inputs
        .get(index)
        .ok_or_else(|| WalletError::InvalidInput(format!("Input {} out of range", index)))?;
    let hash = sighash(&unsigned, index, plan)?;
    let message = Message::from_digest_slice(&hash)?;

    let mut added = 0;
    let plan = &mut tx.inputs[index];
    for secret in secrets {
        if plan.is_signed() {
            break;
        }
        let public = PublicKey::from_secret_key(SECP256K1, secret).serialize();
        let Some(slot) = plan.pubkeys.iter().position(|pk| pk.as_slice() == public.as_slice()) else {
            continue;
        };
        if plan.signatures[slot].is_some() {
            continue;
        }
        let mut der = SECP256K1.sign_ecdsa(&message, secret).serialize_der().to_vec();
        der.push(SIGHASH_ALL);
        plan.signatures[slot] = Some(der);
        added += 1;
    }
    assemble(plan)?;
    Ok(added)
}

/// Copies signatures present in `other` into empty slots of `tx`. Both must
/// spend the same outputs.
pub fn merge_signatures(tx: &mut WalletTransaction, other: &WalletTransaction) -> Result<usize> {
    if tx.inputs.len() != other.inputs.len() {
        return Err(WalletError::InvalidInput("Transactions spend different inputs".to_string()));
    }
    let mut merged = 0;
    for (mine, theirs) in tx.inputs.iter_mut().zip(&other.inputs) {
        if mine.txid != theirs.txid || mine.output_n != theirs.output_n || mine.pubkeys != theirs.pubkeys {
            return Err(WalletError::InvalidInput(format!(
                "Input {}:{} does not match its counterpart",
                mine.txid, mine.output_n
            )));
        }
        for slot_index in 0..mine.signatures.len() {
            if mine.is_signed() {
                break;
            }
            if mine.signatures[slot_index].is_none() {
                if let Some(sig) = theirs.signatures.get(slot_index).cloned().flatten() {
                    mine.signatures[slot_index] = Some(sig);
                    merged += 1;
                }
            }
        }
        assemble(mine)?;
    }
    tx.refresh()?;
    Ok(merged)
}

/// Checks every present signature against its public key.
pub fn verify(tx: &WalletTransaction) -> Result<bool> {
    let unsigned = tx.to_transaction()?;
    for (index, plan) in tx.inputs.iter().enumerate() {
        let message = Message::from_digest_slice(&sighash(&unsigned, index, plan)?)?;
        for (slot, sig) in plan.signatures.iter().enumerate() {
            let Some(sig) = sig else {
                continue;
            };
            let der = sig.split_last().map(|(_, der)| der).unwrap_or_default();
            let signature = Signature::from_der(der)?;
            let public = PublicKey::from_slice(&plan.pubkeys[slot])?;
            if SECP256K1.verify_ecdsa(&message, &signature, &public).is_err() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}
