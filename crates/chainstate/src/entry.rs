//! Chain entries: one record per accepted header, carrying cumulative trust
//! and the stake modifier chain.

use ldoged_consensus::constants::{VERSION_TOP_BITS, VERSION_TOP_MASK};
use ldoged_consensus::{has_version_bit, hash_to_display, Hash256, ZERO_HASH};
use ldoged_pow::difficulty::block_proof;
use ldoged_primitives::block::{header_hash, Block, BlockHeader};
use ldoged_primitives::encoding::{DecodeError, Decoder, Encoder};
use ldoged_primitives::hash::sha256d;
use ldoged_primitives::OutPoint;
use primitive_types::U256;

pub const FLAG_PROOF_OF_STAKE: u32 = 1 << 0;
pub const FLAG_STAKE_ENTROPY: u32 = 1 << 1;
pub const FLAG_STAKE_MODIFIER: u32 = 1 << 2;

const MODIFIER_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEntry {
    pub hash: Hash256,
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub block_signature: [u8; 32],
    pub height: u32,
    pub flags: u32,
    pub stake_modifier: U256,
    pub prevout_stake: OutPoint,
    pub stake_time: u32,
    pub chain_trust: U256,
    pub proof_hash: Hash256,
}

impl ChainEntry {
    pub const SIZE: usize = 240;

    /// Builds the entry for `block` on top of `prev`. The stake modifier is
    /// left at zero until the kernel assigns one.
    pub fn from_block(block: &Block, prev: Option<&ChainEntry>) -> Self {
        let header = &block.header;
        let hash = block.hash();
        let mut flags = entropy_flag(&hash);
        let mut prevout_stake = OutPoint::null();
        let mut stake_time = 0;
        let mut proof_hash = ZERO_HASH;

        if block.is_proof_of_stake() {
            let coinstake = &block.transactions[1];
            flags |= FLAG_PROOF_OF_STAKE;
            prevout_stake = coinstake.vin[0].prevout.clone();
            stake_time = coinstake.time;
        } else {
            proof_hash = header.pow_hash();
        }

        let proof = block_proof(header.bits).unwrap_or_default();
        let chain_trust = match prev {
            Some(prev) => proof.saturating_add(prev.chain_trust),
            None => proof,
        };

        Self {
            hash,
            version: header.version,
            prev_block: header.prev_block,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            block_signature: [0u8; 32],
            height: prev.map(|prev| prev.height + 1).unwrap_or(0),
            flags,
            stake_modifier: U256::zero(),
            prevout_stake,
            stake_time,
            chain_trust,
            proof_hash,
        }
    }

    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_block: self.prev_block,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    /// Trust contributed by this entry alone.
    pub fn proof(&self) -> U256 {
        block_proof(self.bits).unwrap_or_default()
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.flags & FLAG_PROOF_OF_STAKE != 0
    }

    pub fn generated_stake_modifier(&self) -> bool {
        self.flags & FLAG_STAKE_MODIFIER != 0
    }

    pub fn stake_entropy_bit(&self) -> u32 {
        (self.flags & FLAG_STAKE_ENTROPY) >> 1
    }

    pub fn set_stake_modifier(&mut self, modifier: U256, generated: bool) {
        self.stake_modifier = modifier;
        if generated {
            self.flags |= FLAG_STAKE_MODIFIER;
        }
    }

    /// Hash used to rank this entry when it is a stake modifier candidate.
    /// Proof-of-stake entries are shifted down 32 bits so they win more often.
    pub fn selection_hash(&self, prev_modifier: U256) -> U256 {
        let mut preimage = [0u8; 40];
        preimage[..32].copy_from_slice(&self.proof_hash);
        preimage[32..].copy_from_slice(&prev_modifier.low_u64().to_le_bytes());
        let value = U256::from_little_endian(&sha256d(&preimage));
        if self.is_proof_of_stake() {
            value >> 32
        } else {
            value
        }
    }

    pub fn has_bit(&self, bit: u8) -> bool {
        has_version_bit(self.version, bit)
    }

    /// True when the version signals a bit no known deployment claims.
    pub fn has_unknown(&self, unknown_bits: u32) -> bool {
        self.version & VERSION_TOP_MASK == VERSION_TOP_BITS && self.version & unknown_bits != 0
    }

    pub fn display_hash(&self) -> String {
        hash_to_display(&self.hash)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(Self::SIZE);
        self.header().encode_into(&mut encoder);
        encoder.write_bytes(&self.block_signature);
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.flags);
        let modifier: [u8; 32] = self.stake_modifier.to_little_endian();
        encoder.write_bytes(&modifier[..MODIFIER_LEN]);
        self.prevout_stake.consensus_encode(&mut encoder);
        encoder.write_u32_le(self.stake_time);
        let trust: [u8; 32] = self.chain_trust.to_little_endian();
        encoder.write_bytes(&trust);
        encoder.write_hash(&self.proof_hash);
        encoder.into_inner()
    }

    /// Decodes a stored record. The hash is recomputed from the header
    /// prefix and the entropy flag is re-derived from it.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != Self::SIZE {
            return Err(DecodeError::InvalidData("chain entry length"));
        }
        let mut raw_header = [0u8; BlockHeader::SIZE];
        raw_header.copy_from_slice(&bytes[..BlockHeader::SIZE]);
        let hash = header_hash(&raw_header);

        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let block_signature = decoder.read_fixed::<32>()?;
        let height = decoder.read_u32_le()?;
        let stored_flags = decoder.read_u32_le()?;
        let modifier = decoder.read_fixed::<MODIFIER_LEN>()?;
        let prevout_stake = OutPoint::consensus_decode(&mut decoder)?;
        let stake_time = decoder.read_u32_le()?;
        let trust = decoder.read_fixed::<32>()?;
        let proof_hash = decoder.read_hash()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }

        Ok(Self {
            hash,
            version: header.version,
            prev_block: header.prev_block,
            merkle_root: header.merkle_root,
            time: header.time,
            bits: header.bits,
            nonce: header.nonce,
            block_signature,
            height,
            flags: (stored_flags & !FLAG_STAKE_ENTROPY) | entropy_flag(&hash),
            stake_modifier: U256::from_little_endian(&modifier),
            prevout_stake,
            stake_time,
            chain_trust: U256::from_little_endian(&trust),
            proof_hash,
        })
    }
}

fn entropy_flag(hash: &Hash256) -> u32 {
    u32::from(hash[0] & 1) << 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldoged_consensus::{chain_params, Network};

    fn genesis_entry() -> ChainEntry {
        let params = chain_params(Network::Mainnet);
        ChainEntry::from_block(&Block::genesis(&params), None)
    }

    #[test]
    fn layout_is_fixed_and_round_trips() {
        let mut entry = genesis_entry();
        entry.set_stake_modifier(U256::from(0x1234_5678_9abc_def0u64), true);
        entry.prevout_stake = OutPoint::new([7; 32], 3);
        entry.stake_time = 99;
        let raw = entry.encode();
        assert_eq!(raw.len(), ChainEntry::SIZE);
        let decoded = ChainEntry::decode(&raw).expect("decode");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn decode_recomputes_hash_and_entropy() {
        let entry = genesis_entry();
        let mut raw = entry.encode();
        // Flags live at offset 116; clear everything including the entropy bit.
        raw[116..120].copy_from_slice(&FLAG_STAKE_MODIFIER.to_le_bytes());
        let decoded = ChainEntry::decode(&raw).expect("decode");
        assert_eq!(decoded.hash, chain_params(Network::Mainnet).genesis.hash);
        assert_eq!(decoded.stake_entropy_bit(), u32::from(entry.hash[0] & 1));
        assert!(decoded.generated_stake_modifier());
        assert!(ChainEntry::decode(&raw[..239]).is_err());
    }

    #[test]
    fn chain_trust_accumulates_proof() {
        let params = chain_params(Network::Mainnet);
        let genesis_block = Block::genesis(&params);
        let genesis = ChainEntry::from_block(&genesis_block, None);
        assert_eq!(genesis.chain_trust, genesis.proof());

        let mut next_block = genesis_block.clone();
        next_block.header.prev_block = genesis.hash;
        next_block.header.version = 7;
        let next = ChainEntry::from_block(&next_block, Some(&genesis));
        assert_eq!(next.height, 1);
        assert_eq!(next.chain_trust, genesis.chain_trust + next.proof());
        assert!(!next.is_proof_of_stake());
        assert_eq!(next.proof_hash, next_block.header.pow_hash());
    }

    #[test]
    fn proof_decreases_as_target_grows() {
        let hard = block_proof(0x1d00ffff).expect("proof");
        let easy = block_proof(0x1e0fffff).expect("proof");
        assert!(hard > easy);
    }

    #[test]
    fn stake_selection_hash_is_shifted() {
        let mut entry = genesis_entry();
        entry.proof_hash = [0xab; 32];
        let pow = entry.selection_hash(U256::from(5u64));
        entry.flags |= FLAG_PROOF_OF_STAKE;
        let pos = entry.selection_hash(U256::from(5u64));
        assert_eq!(pos, pow >> 32);
    }

    #[test]
    fn unknown_bits_need_top_bits() {
        let mut entry = genesis_entry();
        entry.version = VERSION_TOP_BITS | (1 << 5);
        assert!(entry.has_unknown(1 << 5));
        assert!(entry.has_bit(5));
        entry.version = 1 << 5;
        assert!(!entry.has_unknown(1 << 5));
    }
}
