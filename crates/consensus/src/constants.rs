//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// The maximum allowed weight for a block (network rule).
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;
/// The maximum allowed sigop cost in a block (network rule).
pub const MAX_BLOCK_SIGOPS_COST: usize = 80_000;
/// Key count assumed for multisig opcodes when counting legacy sigops.
pub const MAX_MULTISIG_PUBKEYS: u32 = 20;
/// Outputs with a longer script can never be spent.
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Number of ancestors sampled for median-time-past.
pub const MEDIAN_TIMESPAN: usize = 11;
/// Version bits signalling prefix for BIP9 style deployments.
pub const VERSION_TOP_BITS: u32 = 0x2000_0000;
pub const VERSION_TOP_MASK: u32 = 0xe000_0000;
/// Coinbase and coinstake outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: u32 = 100;
/// Lock times below this are block heights, above are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

pub const SEQUENCE_FINAL: u32 = u32::MAX;
pub const SEQUENCE_DISABLE_FLAG: u32 = 1 << 31;
pub const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_GRANULARITY: u32 = 9;
pub const SEQUENCE_MASK: u32 = 0x0000_ffff;

/// Pay-to-script-hash activation time.
pub const BIP16_TIME: u32 = 1_333_238_400;
pub const REWARD_HALVING_PERIOD: u32 = 2_000_000;

/// Blocks may not be stamped further than this into the future.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
pub const ONE_DAY: i64 = 24 * 60 * 60;

/// Number of stake modifier selection rounds.
pub const STAKE_MODIFIER_ROUNDS: usize = 64;
pub const MODIFIER_INTERVAL_RATIO: i64 = 3;

/// Enforce BIP68 relative lock times.
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;
/// Use median-time-past instead of block time for lock time checks.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
pub const MANDATORY_LOCKTIME_FLAGS: u32 = 0;
pub const STANDARD_LOCKTIME_FLAGS: u32 = LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;

pub fn has_version_bit(version: u32, bit: u8) -> bool {
    (version & VERSION_TOP_MASK) == VERSION_TOP_BITS && (version & (1u32 << bit)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_bits_require_top_bits() {
        assert!(has_version_bit(VERSION_TOP_BITS | 1, 0));
        assert!(!has_version_bit(1, 0));
        assert!(!has_version_bit(VERSION_TOP_BITS | 2, 0));
        assert!(!has_version_bit(0x6000_0001, 0));
    }
}
