//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use ldoged_consensus::Hash256;
use primitive_types::{U256, U512};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompactError {
    #[error("compact target has negative sign bit")]
    Negative,
    #[error("compact target overflows 256-bit range")]
    Overflow,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        if word != 0 {
            let overflow = size > 34
                || (word > 0xff && size > 33)
                || (word > 0xffff && size > 32);
            if overflow {
                return Err(CompactError::Overflow);
            }
        }
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(u256_to_hash(value))
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Expected number of hashes needed to meet `bits`, the per-block trust increment.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

pub fn cmp_be(a: &Hash256, b: &Hash256) -> Ordering {
    let left = U256::from_little_endian(a);
    let right = U256::from_little_endian(b);
    left.cmp(&right)
}

/// Damped retarget between the two most recent blocks of the same proof type.
///
/// `next = last * ((interval - 1) * spacing + 2 * actual) / ((interval + 1) * spacing)`
/// with `interval = timespan / spacing`. Results at or below zero, or above
/// `limit`, fall back to the limit.
pub fn next_target(
    last_bits: u32,
    actual_spacing: i64,
    target_spacing: i64,
    target_timespan: i64,
    limit: &Hash256,
) -> Result<u32, CompactError> {
    let limit_value = U256::from_little_endian(limit);
    if target_spacing <= 0 {
        return Ok(u256_to_compact(limit_value));
    }
    let last = compact_to_u256(last_bits)?;
    let interval = target_timespan / target_spacing;
    let numerator = (interval - 1) * target_spacing + actual_spacing + actual_spacing;
    let denominator = (interval + 1) * target_spacing;
    if numerator <= 0 || denominator <= 0 {
        return Ok(u256_to_compact(limit_value));
    }

    let wide = U512::from(last) * U512::from(numerator as u64) / U512::from(denominator as u64);
    if wide.is_zero() || wide > U512::from(limit_value) {
        return Ok(u256_to_compact(limit_value));
    }
    let next = U256::try_from(wide).map_err(|_| CompactError::Overflow)?;
    Ok(u256_to_compact(next))
}

fn u256_to_hash(value: U256) -> Hash256 {
    value.to_little_endian()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn compact_round_trip_known_values() {
        for bits in [0x1d00_ffffu32, 0x1e0f_ffff, 0x207f_ffff, 0x1b04_04cb] {
            let value = compact_to_u256(bits).expect("valid bits");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn compact_rejects_negative_and_overflow() {
        assert_eq!(compact_to_u256(0x0480_0001), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff12_3456), Err(CompactError::Overflow));
        assert_eq!(compact_to_u256(0), Ok(U256::zero()));
    }

    #[test]
    fn proof_of_easiest_target() {
        // 0x207fffff ~ 2^255, so each block is worth two hashes.
        assert_eq!(block_proof(0x207f_ffff), Ok(U256::from(2u64)));
        assert_eq!(block_proof(0), Ok(U256::zero()));
    }

    #[test]
    fn retarget_on_schedule_keeps_target() {
        let limit = compact_to_target(0x1e0f_ffff).expect("limit");
        let bits = 0x1d00_ffff;
        assert_eq!(next_target(bits, 64, 64, 960, &limit), Ok(bits));
    }

    #[test]
    fn retarget_slow_blocks_ease_up_to_limit() {
        let limit = compact_to_target(0x1e0f_ffff).expect("limit");
        let slow = next_target(0x1d00_ffff, 64 * 4, 64, 960, &limit).expect("target");
        assert!(compact_to_u256(slow).expect("slow") > compact_to_u256(0x1d00_ffff).expect("base"));
        assert_eq!(next_target(0x1e0f_ffff, 64 * 100, 64, 960, &limit), Ok(0x1e0f_ffff));
    }

    #[test]
    fn retarget_negative_multiplier_uses_limit() {
        let limit = compact_to_target(0x1e0f_ffff).expect("limit");
        assert_eq!(next_target(0x1d00_ffff, -10_000, 64, 960, &limit), Ok(0x1e0f_ffff));
    }

    proptest! {
        #[test]
        fn compact_normalizes_idempotently(bits in any::<u32>()) {
            if let Ok(value) = compact_to_u256(bits) {
                let normalized = u256_to_compact(value);
                prop_assert_eq!(compact_to_u256(normalized), Ok(value));
                prop_assert_eq!(u256_to_compact(compact_to_u256(normalized).unwrap()), normalized);
            }
        }
    }
}
