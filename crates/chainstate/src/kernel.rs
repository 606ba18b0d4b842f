//! Proof-of-stake kernel: stake modifier selection and kernel hash checks.

use std::collections::HashSet;

use ldoged_consensus::constants::ONE_DAY;
use ldoged_consensus::money::COIN;
use ldoged_consensus::{hash_to_display, ChainParams, Hash256};
use ldoged_pow::difficulty::compact_to_u256;
use ldoged_primitives::encoding::Encoder;
use ldoged_primitives::hash::sha256d;
use ldoged_primitives::{Block, OutPoint, Transaction};
use ldoged_script::flags::VERIFY_NONE;
use ldoged_script::ScriptVerifier;
use ldoged_storage::KeyValueStore;
use primitive_types::{U256, U512};
use tracing::{debug, trace};

use crate::chaindb::ChainDb;
use crate::entry::ChainEntry;
use crate::error::{ChainError, KernelError, VerifyError};

/// A coinstake kernel that met its weighted target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StakeProof {
    pub proof_hash: Hash256,
    /// Weighted target the hash was checked against, saturated to 256 bits.
    pub target: U256,
}

pub struct Kernel<'a, S> {
    db: &'a ChainDb<S>,
    verifier: &'a dyn ScriptVerifier,
}

impl<'a, S: KeyValueStore> Kernel<'a, S> {
    pub fn new(db: &'a ChainDb<S>, verifier: &'a dyn ScriptVerifier) -> Self {
        Self { db, verifier }
    }

    fn params(&self) -> &ChainParams {
        self.db.params()
    }

    /// Nearest ancestor of `entry` (inclusive) that generated a modifier.
    pub fn last_stake_modifier_entry(&self, entry: &ChainEntry) -> Result<ChainEntry, ChainError> {
        let mut current = entry.clone();
        while !current.is_genesis() && !current.generated_stake_modifier() {
            current = self
                .db
                .get_previous(&current)?
                .ok_or(ChainError::Corrupt("missing previous entry"))?;
        }
        if !current.generated_stake_modifier() {
            return Err(KernelError::NoGeneration.into());
        }
        Ok(current)
    }

    /// Modifier for the block built on `prev` and whether it was freshly
    /// generated. A new modifier is only generated once per modifier interval.
    pub fn compute_next_stake_modifier(
        &self,
        prev: Option<&ChainEntry>,
    ) -> Result<(U256, bool), ChainError> {
        let Some(prev) = prev else {
            return Ok((U256::zero(), true));
        };
        let params = self.params();
        let interval = params.pos.modifier_interval;
        let last = self.last_stake_modifier_entry(prev)?;
        trace!(
            modifier = %last.stake_modifier,
            time = last.time,
            "previous stake modifier"
        );
        if i64::from(last.time) / interval >= i64::from(prev.time) / interval {
            return Ok((last.stake_modifier, false));
        }

        let selection_interval = params.stake_modifier_selection_interval();
        let start = (i64::from(prev.time) / interval) * interval - selection_interval;

        let mut candidates = Vec::new();
        let mut cursor = Some(prev.clone());
        while let Some(entry) = cursor {
            if i64::from(entry.time) < start {
                break;
            }
            cursor = self.db.get_previous(&entry)?;
            candidates.push(entry);
        }
        candidates.sort_by_key(|entry| entry.time);

        let mut stop = start;
        let mut selected = HashSet::new();
        let mut modifier = U256::zero();
        let rounds = candidates.len().min(64);
        for round in 0..rounds {
            stop += params.stake_modifier_selection_interval_section(round);
            let entry = select_block(&candidates, &selected, stop, last.stake_modifier)
                .ok_or(KernelError::Selection(round))?;
            selected.insert(entry.hash);
            trace!(
                round,
                stop,
                height = entry.height,
                bit = entry.stake_entropy_bit(),
                "selected stake modifier block"
            );
            modifier = modifier | (U256::from(entry.stake_entropy_bit()) << round);
        }

        debug!(height = prev.height + 1, modifier = %modifier, "generated stake modifier");
        Ok((modifier, true))
    }

    /// Verifies the coinstake of a block built on `prev` and returns its
    /// kernel proof.
    pub fn check_proof_of_stake(
        &self,
        prev: &ChainEntry,
        coinstake: &Transaction,
        bits: u32,
        tip_height: u32,
    ) -> Result<StakeProof, ChainError> {
        if !coinstake.is_coinstake() {
            return Err(VerifyError::proof_of_stake("called on non-coinstake", 0).into());
        }
        let input = &coinstake.vin[0];
        let coin = self
            .db
            .get_coin(&input.prevout)?
            .ok_or_else(|| VerifyError::proof_of_stake("coin not found", 1))?;
        let from_entry = self
            .db
            .get_entry_by_height(coin.height)?
            .ok_or_else(|| VerifyError::proof_of_stake("coinstake input entry not found", 1))?;
        let from_block = self
            .db
            .get_block(&from_entry.hash)?
            .ok_or_else(|| VerifyError::proof_of_stake("coinstake input block not found", 1))?;

        if let Err(err) =
            self.verifier
                .verify_input(coinstake, 0, &coin.script_pubkey, coin.value, VERIFY_NONE)
        {
            debug!(
                coin = %hash_to_display(&input.prevout.hash),
                error = %err,
                "coinstake signature check failed"
            );
            return Err(VerifyError::proof_of_stake("verify signature failed on coinstake", 100).into());
        }

        let tx_index = from_block
            .index_of(&input.prevout.hash)
            .ok_or_else(|| VerifyError::proof_of_stake("coinstake input tx not found", 1))?;

        match self.check_stake_kernel_hash(
            prev,
            bits,
            &from_entry,
            &from_block,
            tx_index,
            &input.prevout,
            coinstake.time,
            tip_height,
        ) {
            Ok(Some(proof)) => Ok(proof),
            Ok(None) => Err(VerifyError::proof_of_stake("stake kernel check failed", 1).into()),
            Err(ChainError::Kernel(err)) => Err(VerifyError::proof_of_stake(
                format!("stake kernel check failed: {err}"),
                1,
            )
            .into()),
            Err(err) => Err(err),
        }
    }

    /// Dispatches to the kernel protocol active at `prev`.
    #[allow(clippy::too_many_arguments)]
    pub fn check_stake_kernel_hash(
        &self,
        prev: &ChainEntry,
        bits: u32,
        from_entry: &ChainEntry,
        from_block: &Block,
        tx_index: usize,
        prevout: &OutPoint,
        time: u32,
        tip_height: u32,
    ) -> Result<Option<StakeProof>, ChainError> {
        let tx_prev = from_block
            .transactions
            .get(tx_index)
            .ok_or(KernelError::NotIndexed)?;
        if self.params().is_protocol_v1(prev.height) {
            let offset = from_block
                .tx_offset(tx_index)
                .ok_or(KernelError::NotIndexed)?;
            let Some(modifier) = self.kernel_stake_modifier(from_entry, tip_height)? else {
                return Ok(None);
            };
            Ok(check_stake_kernel_hash_v1(
                self.params(),
                bits,
                modifier,
                from_entry.time,
                tx_prev,
                offset as u32,
                prevout,
                time,
            )?)
        } else {
            Ok(check_stake_kernel_hash_v2(
                self.params(),
                bits,
                prev.stake_modifier,
                from_entry.time,
                tx_prev,
                prevout,
                time,
            )?)
        }
    }

    /// Legacy modifier lookup: the modifier in force one selection interval
    /// after the source block. `None` when the chain has not grown that far.
    pub fn kernel_stake_modifier(
        &self,
        from: &ChainEntry,
        tip_height: u32,
    ) -> Result<Option<U256>, ChainError> {
        let limit = i64::from(from.time) + self.params().stake_modifier_selection_interval();
        let mut modifier_time = i64::from(from.time);
        let mut entry = from.clone();
        while modifier_time < limit {
            if entry.height >= tip_height {
                return Ok(None);
            }
            entry = self
                .db
                .get_next(&entry)?
                .ok_or(KernelError::NotIndexed)?;
            if entry.generated_stake_modifier() {
                modifier_time = i64::from(entry.time);
            }
        }
        Ok(Some(entry.stake_modifier))
    }
}

fn select_block<'c>(
    candidates: &'c [ChainEntry],
    selected: &HashSet<Hash256>,
    stop: i64,
    prev_modifier: U256,
) -> Option<&'c ChainEntry> {
    let mut best: Option<(U256, &ChainEntry)> = None;
    for entry in candidates {
        if best.is_some() && i64::from(entry.time) > stop {
            break;
        }
        if selected.contains(&entry.hash) {
            continue;
        }
        let hash = entry.selection_hash(prev_modifier);
        match best {
            Some((best_hash, _)) if hash >= best_hash => {}
            _ => best = Some((hash, entry)),
        }
    }
    best.map(|(_, entry)| entry)
}

fn check_kernel_times(
    params: &ChainParams,
    from_time: u32,
    tx_prev_time: u32,
    time: u32,
) -> Result<(), KernelError> {
    if time < tx_prev_time {
        return Err(KernelError::TimeViolation);
    }
    if i64::from(from_time) + params.pos.stake_min_age > i64::from(time) {
        return Err(KernelError::MinAgeViolation);
    }
    Ok(())
}

fn output_value(tx: &Transaction, prevout: &OutPoint) -> Result<u64, KernelError> {
    let output = tx
        .vout
        .get(prevout.index as usize)
        .ok_or(KernelError::NotIndexed)?;
    Ok(output.value.max(0) as u64)
}

fn saturate(value: U512) -> U256 {
    U256::try_from(value).unwrap_or(U256::MAX)
}

/// Current kernel: the hash must not exceed `target(bits) * value`.
pub fn check_stake_kernel_hash_v2(
    params: &ChainParams,
    bits: u32,
    modifier: U256,
    from_time: u32,
    tx_prev: &Transaction,
    prevout: &OutPoint,
    time: u32,
) -> Result<Option<StakeProof>, KernelError> {
    check_kernel_times(params, from_time, tx_prev.time, time)?;
    let Ok(target) = compact_to_u256(bits) else {
        return Ok(None);
    };
    let weighted = target.full_mul(U256::from(output_value(tx_prev, prevout)?));
    let proof_hash = proof_of_stake_hash_v2(modifier, from_time, tx_prev.time, prevout, time);
    if U512::from(U256::from_little_endian(&proof_hash)) > weighted {
        return Ok(None);
    }
    Ok(Some(StakeProof {
        proof_hash,
        target: saturate(weighted),
    }))
}

/// Legacy kernel weighted by coin age in coin-days.
#[allow(clippy::too_many_arguments)]
pub fn check_stake_kernel_hash_v1(
    params: &ChainParams,
    bits: u32,
    modifier: U256,
    from_time: u32,
    tx_prev: &Transaction,
    tx_offset: u32,
    prevout: &OutPoint,
    time: u32,
) -> Result<Option<StakeProof>, KernelError> {
    check_kernel_times(params, from_time, tx_prev.time, time)?;
    let Ok(target) = compact_to_u256(bits) else {
        return Ok(None);
    };
    let value = i128::from(output_value(tx_prev, prevout)?);
    let age = i128::from(stake_weight(params, tx_prev.time, time));
    let coin_days = (value * age / i128::from(COIN) / i128::from(ONE_DAY)).max(0) as u128;
    let weighted = target.full_mul(U256::from(coin_days));
    let proof_hash = proof_of_stake_hash_v1(modifier, from_time, tx_offset, prevout.index, time);
    if U512::from(U256::from_little_endian(&proof_hash)) > weighted {
        return Ok(None);
    }
    Ok(Some(StakeProof {
        proof_hash,
        target: saturate(weighted),
    }))
}

/// Seconds of coin age beyond the minimum stake age.
pub fn stake_weight(params: &ChainParams, from: u32, to: u32) -> i64 {
    i64::from(to) - i64::from(from) - params.pos.stake_min_age
}

pub fn proof_of_stake_hash_v2(
    modifier: U256,
    from_time: u32,
    tx_prev_time: u32,
    prevout: &OutPoint,
    time: u32,
) -> Hash256 {
    let mut encoder = Encoder::with_capacity(56);
    encoder.write_u64_le(modifier.low_u64());
    encoder.write_u32_le(from_time);
    encoder.write_u32_le(tx_prev_time);
    encoder.write_hash(&prevout.hash);
    encoder.write_u32_le(prevout.index);
    encoder.write_u32_le(time);
    sha256d(&encoder.into_inner())
}

pub fn proof_of_stake_hash_v1(
    modifier: U256,
    from_time: u32,
    tx_offset: u32,
    index: u32,
    time: u32,
) -> Hash256 {
    let bytes: [u8; 32] = modifier.to_little_endian();
    let mut encoder = Encoder::with_capacity(32);
    encoder.write_bytes(&bytes[..16]);
    encoder.write_u32_le(from_time);
    encoder.write_u32_le(tx_offset);
    encoder.write_u32_le(index);
    encoder.write_u32_le(time);
    sha256d(&encoder.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldoged_consensus::{chain_params, Network};
    use ldoged_primitives::{TxIn, TxOut};

    const EASY_BITS: u32 = 0x2100_ffff;

    fn source_tx(time: u32, value: i64) -> Transaction {
        Transaction {
            version: 1,
            time,
            vin: vec![TxIn {
                prevout: OutPoint::new([1; 32], 0),
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn v2_hash_is_deterministic_and_input_sensitive() {
        let prevout = OutPoint::new([0x42; 32], 1);
        let modifier = U256::from(0xdead_beefu64);
        let base = proof_of_stake_hash_v2(modifier, 1_000, 2_000, &prevout, 3_000);
        assert_eq!(base, proof_of_stake_hash_v2(modifier, 1_000, 2_000, &prevout, 3_000));
        assert_ne!(base, proof_of_stake_hash_v2(modifier + 1, 1_000, 2_000, &prevout, 3_000));
        assert_ne!(base, proof_of_stake_hash_v2(modifier, 1_001, 2_000, &prevout, 3_000));
        assert_ne!(base, proof_of_stake_hash_v2(modifier, 1_000, 2_001, &prevout, 3_000));
        assert_ne!(
            base,
            proof_of_stake_hash_v2(modifier, 1_000, 2_000, &OutPoint::new([0x42; 32], 2), 3_000)
        );
        assert_ne!(base, proof_of_stake_hash_v2(modifier, 1_000, 2_000, &prevout, 3_001));
    }

    #[test]
    fn v2_preimage_uses_low_64_bits_of_modifier() {
        let prevout = OutPoint::new([7; 32], 0);
        let low = U256::from(5u64);
        let high = low + (U256::from(1u64) << 100);
        assert_eq!(
            proof_of_stake_hash_v2(low, 1, 2, &prevout, 3),
            proof_of_stake_hash_v2(high, 1, 2, &prevout, 3)
        );
    }

    #[test]
    fn v2_rejects_young_coins_and_time_travel() {
        let params = chain_params(Network::Mainnet);
        let min_age = params.pos.stake_min_age as u32;
        let tx = source_tx(10_000, COIN);
        let prevout = OutPoint::new(tx.txid(), 0);
        let young = check_stake_kernel_hash_v2(
            &params,
            EASY_BITS,
            U256::zero(),
            10_000,
            &tx,
            &prevout,
            10_000 + min_age - 1,
        );
        assert_eq!(young, Err(KernelError::MinAgeViolation));
        assert!(KernelError::MinAgeViolation.to_string().contains("min age violation"));

        let backwards =
            check_stake_kernel_hash_v2(&params, EASY_BITS, U256::zero(), 0, &tx, &prevout, 9_999);
        assert_eq!(backwards, Err(KernelError::TimeViolation));
    }

    #[test]
    fn v2_weighted_target_scales_with_value() {
        let params = chain_params(Network::Mainnet);
        let time = 10_000 + params.pos.stake_min_age as u32;
        let rich = source_tx(10_000, 1_000 * COIN);
        let prevout = OutPoint::new(rich.txid(), 0);
        let proof = check_stake_kernel_hash_v2(
            &params,
            EASY_BITS,
            U256::zero(),
            10_000,
            &rich,
            &prevout,
            time,
        )
        .expect("times")
        .expect("easy target is met");
        assert_eq!(
            proof.proof_hash,
            proof_of_stake_hash_v2(U256::zero(), 10_000, rich.time, &prevout, time)
        );

        let dust = source_tx(10_000, 0);
        let none = check_stake_kernel_hash_v2(
            &params,
            EASY_BITS,
            U256::zero(),
            10_000,
            &dust,
            &OutPoint::new(dust.txid(), 0),
            time,
        )
        .expect("times");
        assert_eq!(none, None);
    }

    #[test]
    fn v1_needs_coin_age_beyond_minimum() {
        let params = chain_params(Network::Mainnet);
        let min_age = params.pos.stake_min_age as u32;
        let tx = source_tx(10_000, 1_000 * COIN);
        let prevout = OutPoint::new(tx.txid(), 0);
        // Exactly the minimum age leaves zero coin-days and no target.
        let result = check_stake_kernel_hash_v1(
            &params,
            EASY_BITS,
            U256::one(),
            10_000,
            &tx,
            81,
            &prevout,
            10_000 + min_age,
        )
        .expect("times");
        assert_eq!(result, None);
        assert_eq!(stake_weight(&params, 10_000, 10_000 + min_age + 60), 60);
    }

    #[test]
    fn selection_prefers_smallest_hash_within_window() {
        let params = chain_params(Network::Mainnet);
        let genesis = ChainEntry::from_block(&Block::genesis(&params), None);
        let mut candidates = Vec::new();
        for index in 0..4u8 {
            let mut entry = genesis.clone();
            entry.hash = [index + 1; 32];
            entry.proof_hash = [index.wrapping_mul(37); 32];
            entry.time = 1_000 + u32::from(index) * 10;
            candidates.push(entry);
        }
        let modifier = U256::from(9u64);
        let best = candidates
            .iter()
            .min_by_key(|entry| entry.selection_hash(modifier))
            .expect("candidates");
        let picked = select_block(&candidates, &HashSet::new(), i64::MAX, modifier).expect("pick");
        assert_eq!(picked.hash, best.hash);

        // With a tight window only the first candidate is eligible.
        let first = select_block(&candidates, &HashSet::new(), 0, modifier).expect("pick");
        assert_eq!(first.hash, candidates[0].hash);

        let mut taken = HashSet::new();
        taken.insert(candidates[0].hash);
        let second = select_block(&candidates, &taken, 0, modifier).expect("pick");
        assert_eq!(second.hash, candidates[1].hash);
    }
}
