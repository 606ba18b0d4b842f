//! Block headers, blocks and the merkle tree.

use ldoged_consensus::params::ChainParams;
use ldoged_consensus::Hash256;

use crate::encoding::{varint_size, DecodeError, Decoder, Encoder};
use crate::hash::{scrypt_hash, sha256d};
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut};

/// Headers with a version above this are identified by their double-SHA256.
pub const SHA256D_HASH_MIN_VERSION: u32 = 7;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 80;

    pub fn consensus_encode(&self) -> [u8; Self::SIZE] {
        let mut encoder = Encoder::with_capacity(Self::SIZE);
        self.encode_into(&mut encoder);
        let bytes = encoder.into_inner();
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&bytes);
        out
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_u32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    /// Block identifier. Older headers are identified by their scrypt hash.
    pub fn hash(&self) -> Hash256 {
        header_hash(&self.consensus_encode())
    }

    /// Hash checked against the proof-of-work target.
    pub fn pow_hash(&self) -> Hash256 {
        scrypt_hash(&self.consensus_encode())
    }
}

/// Version-gated hash of a raw 80-byte header.
pub fn header_hash(raw: &[u8; BlockHeader::SIZE]) -> Hash256 {
    let version = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    if version >= SHA256D_HASH_MIN_VERSION {
        sha256d(raw)
    } else {
        scrypt_hash(raw)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.size());
        self.header.encode_into(&mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let count = decoder.read_len()?;
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut decoder)?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn size(&self) -> usize {
        BlockHeader::SIZE
            + varint_size(self.transactions.len() as u64)
            + self.transactions.iter().map(Transaction::size).sum::<usize>()
    }

    /// A block is proof-of-stake when its second transaction is a coinstake.
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake()
    }

    /// Byte offset of transaction `index` inside the serialized block.
    pub fn tx_offset(&self, index: usize) -> Option<usize> {
        if index >= self.transactions.len() {
            return None;
        }
        let mut offset = BlockHeader::SIZE + varint_size(self.transactions.len() as u64);
        for tx in &self.transactions[..index] {
            offset += tx.size();
        }
        Some(offset)
    }

    pub fn index_of(&self, txid: &Hash256) -> Option<usize> {
        self.transactions.iter().position(|tx| &tx.txid() == txid)
    }

    /// Merkle root of the transaction ids and whether the tree contains a
    /// duplicated sibling pair that would let a different transaction list
    /// produce the same root.
    pub fn merkle_root(&self) -> (Hash256, bool) {
        let leaves: Vec<Hash256> = self.transactions.iter().map(Transaction::txid).collect();
        merkle_root(leaves)
    }

    /// The genesis block described by `params`.
    pub fn genesis(params: &ChainParams) -> Self {
        let genesis = &params.genesis;
        let coinbase = Transaction {
            version: 1,
            time: genesis.coinbase_time,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: genesis.coinbase_script.to_vec(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 0,
                script_pubkey: Vec::new(),
            }],
            lock_time: 0,
        };
        Self {
            header: BlockHeader {
                version: genesis.version,
                prev_block: [0u8; 32],
                merkle_root: genesis.merkle_root,
                time: genesis.time,
                bits: genesis.bits,
                nonce: genesis.nonce,
            },
            transactions: vec![coinbase],
        }
    }
}

pub fn merkle_root(mut level: Vec<Hash256>) -> (Hash256, bool) {
    if level.is_empty() {
        return ([0u8; 32], false);
    }
    let mut mutated = false;
    while level.len() > 1 {
        for pair in level.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                sha256d(&buf)
            })
            .collect();
    }
    (level[0], mutated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_with_lock(lock_time: u32) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn {
                prevout: OutPoint::new([9; 32], lock_time),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time,
        }
    }

    #[test]
    fn merkle_single_leaf_is_txid() {
        let tx = tx_with_lock(1);
        let (root, mutated) = merkle_root(vec![tx.txid()]);
        assert_eq!(root, tx.txid());
        assert!(!mutated);
    }

    #[test]
    fn merkle_detects_duplicated_pair() {
        let a = tx_with_lock(1).txid();
        let b = tx_with_lock(2).txid();
        let c = tx_with_lock(3).txid();
        let (root_odd, mutated_odd) = merkle_root(vec![a, b, c]);
        assert!(!mutated_odd);
        let (root_dup, mutated_dup) = merkle_root(vec![a, b, c, c]);
        assert_eq!(root_odd, root_dup);
        assert!(mutated_dup);
    }

    #[test]
    fn tx_offsets_follow_serialization() {
        let header = BlockHeader {
            version: 7,
            prev_block: [0; 32],
            merkle_root: [0; 32],
            time: 0,
            bits: 0,
            nonce: 0,
        };
        let block = Block {
            header,
            transactions: vec![tx_with_lock(1), tx_with_lock(2)],
        };
        let raw = block.consensus_encode();
        assert_eq!(raw.len(), block.size());
        let second = block.tx_offset(1).expect("offset");
        assert_eq!(&raw[second..], block.transactions[1].consensus_encode().as_slice());
        assert_eq!(block.tx_offset(2), None);
    }

    #[test]
    fn header_hash_is_version_gated() {
        let mut header = BlockHeader {
            version: 6,
            prev_block: [1; 32],
            merkle_root: [2; 32],
            time: 3,
            bits: 4,
            nonce: 5,
        };
        assert_eq!(header.hash(), header.pow_hash());
        header.version = 7;
        assert_eq!(header.hash(), sha256d(&header.consensus_encode()));
        assert_ne!(header.hash(), header.pow_hash());
    }
}
