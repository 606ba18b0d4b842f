//! Transactions with the proof-of-stake timestamp field.

use ldoged_consensus::constants::{LOCKTIME_THRESHOLD, SEQUENCE_FINAL};
use ldoged_consensus::money::{money_range, Amount};
use ldoged_consensus::Hash256;

use crate::encoding::{varint_size, DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    fn encoded_size(&self) -> usize {
        OutPoint::SIZE + varint_size(self.script_sig.len() as u64) + self.script_sig.len() + 4
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// Zero value and no script, the marker output of coinstakes.
    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }

    fn encoded_size(&self) -> usize {
        8 + varint_size(self.script_pubkey.len() as u64) + self.script_pubkey.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.size());
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_u32_le(self.time);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.prevout.consensus_encode(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let time = decoder.read_u32_le()?;
        let input_count = decoder.read_len()?;
        let mut vin = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            let prevout = OutPoint::consensus_decode(decoder)?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            vin.push(TxIn {
                prevout,
                script_sig,
                sequence,
            });
        }
        let output_count = decoder.read_len()?;
        let mut vout = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            vout.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            time,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        let inputs: usize = self.vin.iter().map(TxIn::encoded_size).sum();
        let outputs: usize = self.vout.iter().map(TxOut::encoded_size).sum();
        4 + 4
            + varint_size(self.vin.len() as u64)
            + inputs
            + varint_size(self.vout.len() as u64)
            + outputs
            + 4
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null() && !self.vout.is_empty()
    }

    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() > 1
            && self.vout[0].is_empty()
    }

    /// Sum of output values, `None` if any value or the running total leaves the money range.
    pub fn value_out(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.vout {
            if !money_range(output.value) {
                return None;
            }
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }

    /// Lock time finality at `height` and `time`. A `time` of `None`
    /// treats time based lock times as unsatisfied.
    pub fn is_final(&self, height: u32, time: Option<i64>) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let satisfied = if self.lock_time < LOCKTIME_THRESHOLD {
            self.lock_time < height
        } else {
            time.is_some_and(|time| i64::from(self.lock_time) < time)
        };
        if satisfied {
            return true;
        }
        self.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
    }
}
