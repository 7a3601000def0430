//! Consensus serialization.

use crate::Result;
use std::io::Write;

pub trait Encodable {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize>;

    fn consensus_encode_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.consensus_encode(&mut buf)?;
        Ok(buf)
    }
}

/// Writes a CompactSize integer.
pub fn write_varint<W: Write>(writer: &mut W, n: u64) -> Result<usize> {
    let len = if n < 0xfd {
        writer.write_all(&[n as u8])?;
        1
    } else if n <= 0xffff {
        writer.write_all(&[0xfd])?;
        writer.write_all(&(n as u16).to_le_bytes())?;
        3
    } else if n <= 0xffff_ffff {
        writer.write_all(&[0xfe])?;
        writer.write_all(&(n as u32).to_le_bytes())?;
        5
    } else {
        writer.write_all(&[0xff])?;
        writer.write_all(&n.to_le_bytes())?;
        9
    };
    Ok(len)
}

pub fn varint_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Writes `data` prefixed by its CompactSize length.
pub fn write_var_bytes<W: Write>(writer: &mut W, data: &[u8]) -> Result<usize> {
    let written = write_varint(writer, data.len() as u64)?;
    writer.write_all(data)?;
    Ok(written + data.len())
}

impl Encodable for u32 {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        writer.write_all(&self.to_le_bytes())?;
        Ok(4)
    }
}

impl Encodable for i32 {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        writer.write_all(&self.to_le_bytes())?;
        Ok(4)
    }
}

impl Encodable for u64 {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        writer.write_all(&self.to_le_bytes())?;
        Ok(8)
    }
}

impl Encodable for [u8; 32] {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        writer.write_all(self)?;
        Ok(32)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let mut written = write_varint(writer, self.len() as u64)?;
        for item in self {
            written += item.consensus_encode(writer)?;
        }
        Ok(written)
    }
}
