//! Bitcoin transaction data structures.

use super::encode::{write_var_bytes, write_varint, Encodable};
use super::hash::sha256d;
use super::script::Script;
use crate::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::io::Write;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutPoint {
    /// Internal (little endian) byte order.
    pub txid: [u8; 32],
    pub vout: u32,
}

impl OutPoint {
    /// Builds an outpoint from a display-order txid hex string.
    pub fn from_hex_txid(txid: &str, vout: u32) -> Result<Self> {
        let bytes = hex::decode(txid)?;
        if bytes.len() != 32 {
            return Err(WalletError::InvalidInput(format!(
                "Transaction id must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes);
        txid.reverse();
        Ok(OutPoint { txid, vout })
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let mut written = self.txid.consensus_encode(writer)?;
        written += self.vout.consensus_encode(writer)?;
        Ok(written)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl Encodable for TxIn {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let mut written = self.previous_output.consensus_encode(writer)?;
        written += self.script_sig.consensus_encode(writer)?;
        written += self.sequence.consensus_encode(writer)?;
        Ok(written)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Script,
}

impl Encodable for TxOut {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let mut written = self.value.consensus_encode(writer)?;
        written += self.script_pubkey.consensus_encode(writer)?;
        Ok(written)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub lock_time: u32,
    pub input: Vec<TxIn>,
    pub output: Vec<TxOut>,
}

impl Transaction {
    pub fn has_witness(&self) -> bool {
        self.input.iter().any(|i| !i.witness.is_empty())
    }

    /// Serialization without witness data, as used for txids and legacy sighashes.
    pub fn consensus_encode_legacy(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.version.consensus_encode(&mut buf)?;
        self.input.consensus_encode(&mut buf)?;
        self.output.consensus_encode(&mut buf)?;
        self.lock_time.consensus_encode(&mut buf)?;
        Ok(buf)
    }

    /// Display-order hex txid.
    pub fn txid(&self) -> Result<String> {
        let mut hash = sha256d(&self.consensus_encode_legacy()?);
        hash.reverse();
        Ok(hex::encode(hash))
    }

    pub fn raw_hex(&self) -> Result<String> {
        Ok(hex::encode(self.consensus_encode_to_vec()?))
    }

    /// BIP141 weight: base size * 3 + total size.
    pub fn weight(&self) -> Result<usize> {
        let base = self.consensus_encode_legacy()?.len();
        let total = self.consensus_encode_to_vec()?.len();
        Ok(base * 3 + total)
    }

    pub fn vsize(&self) -> Result<usize> {
        Ok((self.weight()? + 3) / 4)
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        if !self.has_witness() {
            let legacy = self.consensus_encode_legacy()?;
            writer.write_all(&legacy)?;
            return Ok(legacy.len());
        }
        let mut written = self.version.consensus_encode(writer)?;
        writer.write_all(&[0x00, 0x01])?;
        written += 2;
        written += self.input.consensus_encode(writer)?;
        written += self.output.consensus_encode(writer)?;
        for input in &self.input {
            written += write_varint(writer, input.witness.len() as u64)?;
            for item in &input.witness {
                written += write_var_bytes(writer, item)?;
            }
        }
        written += self.lock_time.consensus_encode(writer)?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction {
            version: 1,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: [0; 32],
                    vout: 0,
                },
                script_sig: Script::new(),
                sequence: 0xffffffff,
                witness: vec![],
            }],
            output: vec![TxOut {
                value: 10_000_000,
                script_pubkey: Script::new_p2pkh(&[0x55; 20]),
            }],
        }
    }

    #[test]
    fn test_legacy_size() {
        let tx = sample();
        // 4 version + 1 + 41 input + 1 + 34 output + 4 locktime
        assert_eq!(tx.consensus_encode_to_vec().unwrap().len(), 85);
        assert_eq!(tx.vsize().unwrap(), 85);
        assert_eq!(tx.txid().unwrap().len(), 64);
    }

    #[test]
    fn test_witness_discounts_vsize_but_not_txid() {
        let mut tx = sample();
        let txid = tx.txid().unwrap();
        tx.input[0].witness = vec![vec![0u8; 72], vec![0u8; 33]];
        assert_eq!(tx.txid().unwrap(), txid);
        let total = tx.consensus_encode_to_vec().unwrap().len();
        assert_eq!(total, 85 + 2 + 1 + 73 + 34);
        assert!(tx.vsize().unwrap() < total);
    }

    #[test]
    fn test_outpoint_from_display_txid() {
        let outpoint = OutPoint::from_hex_txid(
            "0100000000000000000000000000000000000000000000000000000000000000",
            3,
        )
        .unwrap();
        assert_eq!(outpoint.txid[31], 0x01);
        assert!(OutPoint::from_hex_txid("abcd", 0).is_err());
    }
}
