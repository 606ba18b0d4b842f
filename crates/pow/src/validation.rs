use ldoged_consensus::Hash256;
use ldoged_primitives::block::Block;
use primitive_types::U256;

use crate::difficulty::compact_to_u256;

/// Checks a proof-of-work hash against the compact target `bits`.
pub fn verify_pow(pow_hash: &Hash256, bits: u32) -> bool {
    let target = match compact_to_u256(bits) {
        Ok(target) => target,
        Err(_) => return false,
    };
    if target.is_zero() {
        return false;
    }
    U256::from_little_endian(pow_hash) <= target
}

/// Structural shape of a proof-of-stake block: an empty coinbase followed by
/// exactly one coinstake in second position.
pub fn verify_pos(block: &Block) -> bool {
    let txs = &block.transactions;
    let Some(coinbase) = txs.first() else {
        return false;
    };
    if coinbase.vout.len() != 1 || !coinbase.vout[0].is_empty() {
        return false;
    }
    if txs.len() < 2 || !txs[1].is_coinstake() {
        return false;
    }
    !txs[2..].iter().any(|tx| tx.is_coinstake())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldoged_primitives::block::BlockHeader;
    use ldoged_primitives::{OutPoint, Transaction, TxIn, TxOut};

    fn tx(prevout: OutPoint, vout: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 1,
            time: 0,
            vin: vec![TxIn {
                prevout,
                script_sig: vec![0x01, 0x02],
                sequence: u32::MAX,
            }],
            vout,
            lock_time: 0,
        }
    }

    fn empty() -> TxOut {
        TxOut {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    fn paying() -> TxOut {
        TxOut {
            value: 10,
            script_pubkey: vec![0x51],
        }
    }

    fn block(transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 7,
                prev_block: [0; 32],
                merkle_root: [0; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions,
        }
    }

    #[test]
    fn pow_hash_boundary() {
        let bits = 0x1d00_ffff;
        let target = compact_to_u256(bits).expect("bits");
        let at_target: Hash256 = target.to_little_endian();
        assert!(verify_pow(&at_target, bits));
        let above: Hash256 = (target + U256::one()).to_little_endian();
        assert!(!verify_pow(&above, bits));
        assert!(!verify_pow(&[0; 32], 0));
    }

    #[test]
    fn pos_shape() {
        let coinbase = tx(OutPoint::null(), vec![empty()]);
        let stake = tx(OutPoint::new([3; 32], 1), vec![empty(), paying()]);
        assert!(verify_pos(&block(vec![coinbase.clone(), stake.clone()])));
        assert!(!verify_pos(&block(vec![coinbase.clone()])));
        assert!(!verify_pos(&block(vec![
            coinbase.clone(),
            stake.clone(),
            stake.clone()
        ])));
        let paid_coinbase = tx(OutPoint::null(), vec![paying()]);
        assert!(!verify_pos(&block(vec![paid_coinbase, stake])));
    }
}
