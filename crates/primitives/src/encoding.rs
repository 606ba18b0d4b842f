//! Consensus serialization helpers.

use ldoged_consensus::Hash256;
use thiserror::Error;

/// Upper bound on any length prefix read from the wire.
pub const MAX_SIZE: u64 = 0x0200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("non-canonical compact size")]
    NonCanonicalVarInt,
    #[error("length prefix exceeds maximum size")]
    Oversize,
    #[error("trailing bytes after decode")]
    TrailingBytes,
    #[error("invalid value: {0}")]
    InvalidData(&'static str),
}

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32_be(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash256) {
        self.buf.extend_from_slice(hash);
    }

    pub fn write_varint(&mut self, value: u64) {
        match value {
            0..=0xfc => self.write_u8(value as u8),
            0xfd..=0xffff => {
                self.write_u8(0xfd);
                self.buf.extend_from_slice(&(value as u16).to_le_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.write_u8(0xfe);
                self.write_u32_le(value as u32);
            }
            _ => {
                self.write_u8(0xff);
                self.write_u64_le(value);
            }
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.offset;
        self.offset += len;
        Ok(&self.bytes[start..self.offset])
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_fixed()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_fixed()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let prefix = self.read_u8()?;
        let value = match prefix {
            0xfd => {
                let value = u64::from(self.read_u16_le()?);
                if value < 0xfd {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            0xfe => {
                let value = u64::from(self.read_u32_le()?);
                if value <= 0xffff {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            0xff => {
                let value = self.read_u64_le()?;
                if value <= 0xffff_ffff {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            byte => u64::from(byte),
        };
        Ok(value)
    }

    /// Reads a length prefix bounded by [`MAX_SIZE`].
    pub fn read_len(&mut self) -> Result<usize, DecodeError> {
        let len = self.read_varint()?;
        if len > MAX_SIZE {
            return Err(DecodeError::Oversize);
        }
        Ok(len as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_len()?;
        Ok(self.read_bytes(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let mut encoder = Encoder::new();
            encoder.write_varint(value);
            let bytes = encoder.into_inner();
            assert_eq!(bytes.len(), varint_size(value));
            let mut decoder = Decoder::new(&bytes);
            assert_eq!(decoder.read_varint().expect("varint"), value);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn rejects_non_canonical_varint() {
        let mut decoder = Decoder::new(&[0xfd, 0x10, 0x00]);
        assert_eq!(decoder.read_varint(), Err(DecodeError::NonCanonicalVarInt));
    }

    #[test]
    fn short_input_is_eof() {
        let mut decoder = Decoder::new(&[0x01, 0x02]);
        assert_eq!(decoder.read_u32_le(), Err(DecodeError::UnexpectedEof));
    }
}
