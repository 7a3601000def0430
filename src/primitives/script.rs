//! Locking and unlocking scripts.

use super::encode::{write_var_bytes, Encodable};
use super::hash::{Hash160, Hash256};
use crate::{Result, WalletError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

/// Largest m-of-n a standard bare multisig redeem script accepts.
pub const MAX_MULTISIG_KEYS: usize = 15;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Script(pub Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Script(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Script(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Ok(Script(hex::decode(s)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Appends a minimal data push.
    pub fn push_slice(&mut self, data: &[u8]) -> &mut Self {
        match data.len() {
            n @ 0..=75 => self.0.push(n as u8),
            n @ 76..=255 => {
                self.0.push(OP_PUSHDATA1);
                self.0.push(n as u8);
            }
            n => {
                self.0.push(OP_PUSHDATA2);
                self.0.extend_from_slice(&(n as u16).to_le_bytes());
            }
        }
        self.0.extend_from_slice(data);
        self
    }

    pub fn push_opcode(&mut self, op: u8) -> &mut Self {
        self.0.push(op);
        self
    }

    pub fn is_p2pkh(&self) -> bool {
        self.0.len() == 25
            && self.0[0] == OP_DUP
            && self.0[1] == OP_HASH160
            && self.0[2] == 0x14
            && self.0[23] == OP_EQUALVERIFY
            && self.0[24] == OP_CHECKSIG
    }

    pub fn is_p2sh(&self) -> bool {
        self.0.len() == 23 && self.0[0] == OP_HASH160 && self.0[1] == 0x14 && self.0[22] == OP_EQUAL
    }

    pub fn is_p2wpkh(&self) -> bool {
        self.0.len() == 22 && self.0[0] == OP_0 && self.0[1] == 0x14
    }

    pub fn is_p2wsh(&self) -> bool {
        self.0.len() == 34 && self.0[0] == OP_0 && self.0[1] == 0x20
    }

    pub fn is_op_return(&self) -> bool {
        self.0.first() == Some(&OP_RETURN)
    }

    pub fn new_p2pkh(hash160: &Hash160) -> Self {
        let mut script = Script(Vec::with_capacity(25));
        script
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(hash160)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG);
        script
    }

    pub fn new_p2sh(hash160: &Hash160) -> Self {
        let mut script = Script(Vec::with_capacity(23));
        script
            .push_opcode(OP_HASH160)
            .push_slice(hash160)
            .push_opcode(OP_EQUAL);
        script
    }

    pub fn new_p2wpkh(hash160: &Hash160) -> Self {
        let mut script = Script(Vec::with_capacity(22));
        script.push_opcode(OP_0).push_slice(hash160);
        script
    }

    pub fn new_p2wsh(hash256: &Hash256) -> Self {
        let mut script = Script(Vec::with_capacity(34));
        script.push_opcode(OP_0).push_slice(hash256);
        script
    }

    /// `OP_m <pubkey>... OP_n OP_CHECKMULTISIG`, keys kept in the given order.
    pub fn new_multisig(sigs_required: usize, pubkeys: &[Vec<u8>]) -> Result<Self> {
        let n = pubkeys.len();
        if n == 0 || n > MAX_MULTISIG_KEYS {
            return Err(WalletError::InvalidInput(format!(
                "Multisig needs between 1 and {} public keys, got {}",
                MAX_MULTISIG_KEYS, n
            )));
        }
        if sigs_required == 0 || sigs_required > n {
            return Err(WalletError::InvalidInput(format!(
                "Number of signatures required ({}) must be between 1 and {}",
                sigs_required, n
            )));
        }
        let mut script = Script::new();
        script.push_opcode(OP_1 + sigs_required as u8 - 1);
        for pk in pubkeys {
            script.push_slice(pk);
        }
        script
            .push_opcode(OP_1 + n as u8 - 1)
            .push_opcode(OP_CHECKMULTISIG);
        Ok(script)
    }

    pub fn new_op_return(data: &[u8]) -> Self {
        let mut script = Script::new();
        script.push_opcode(OP_RETURN).push_slice(data);
        script
    }
}

impl Encodable for Script {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        write_var_bytes(writer, &self.0)
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_templates() {
        let hash = [0x11u8; 20];
        assert!(Script::new_p2pkh(&hash).is_p2pkh());
        assert!(Script::new_p2sh(&hash).is_p2sh());
        assert!(Script::new_p2wpkh(&hash).is_p2wpkh());
        assert!(Script::new_p2wsh(&[0x22u8; 32]).is_p2wsh());
        assert!(!Script::new_p2sh(&hash).is_p2pkh());
    }

    #[test]
    fn test_multisig_script_layout() {
        let keys = vec![vec![0x02; 33], vec![0x03; 33], vec![0x02; 33]];
        let script = Script::new_multisig(2, &keys).unwrap();
        let bytes = script.as_bytes();
        assert_eq!(bytes[0], 0x52);
        assert_eq!(bytes[1], 33);
        assert_eq!(bytes[bytes.len() - 2], 0x53);
        assert_eq!(bytes[bytes.len() - 1], OP_CHECKMULTISIG);
        assert_eq!(script.len(), 3 + 3 * 34);
    }

    #[test]
    fn test_multisig_rejects_bad_threshold() {
        let keys = vec![vec![0x02; 33]];
        assert!(Script::new_multisig(2, &keys).is_err());
        assert!(Script::new_multisig(0, &keys).is_err());
        assert!(Script::new_multisig(1, &vec![vec![0x02; 33]; 16]).is_err());
    }

    #[test]
    fn test_op_return_and_long_push() {
        let script = Script::new_op_return(b"hello");
        assert!(script.is_op_return());
        assert_eq!(script.to_hex(), "6a0568656c6c6f");

        let mut long = Script::new();
        long.push_slice(&[0u8; 80]);
        assert_eq!(long.as_bytes()[0], OP_PUSHDATA1);
        assert_eq!(long.as_bytes()[1], 80);
    }
}
