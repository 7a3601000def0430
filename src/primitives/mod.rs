//! Key, script, address and transaction primitives used by the wallet engine.

pub mod address;
pub mod bip32;
pub mod encode;
pub mod hash;
pub mod script;
pub mod transaction;
