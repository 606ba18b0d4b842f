//! Block reward schedules.

use crate::constants::REWARD_HALVING_PERIOD;
use crate::money::{Amount, COIN};

/// Coinbase subsidy for a proof-of-work block at `height`.
pub fn proof_of_work_reward(height: u32) -> Amount {
    match height {
        0..=29 => 1_000 * COIN,
        30..=999 => 1_000_000 * COIN,
        1_000..=1_999 => 500_000 * COIN,
        2_000..=2_999 => 250_000 * COIN,
        3_000..=3_999 => 125_000 * COIN,
        4_000..=4_999 => 62_500 * COIN,
        5_000..=5_999 => 31_250 * COIN,
        6_000..=6_999 => 15_625 * COIN,
        7_000..=8_000 => 10_000 * COIN,
        // Past the mining phase the subsidy collapses to a dust amount of
        // one satoshi per height.
        _ => Amount::from(height),
    }
}

/// Coinstake subsidy for a proof-of-stake block at `height`.
pub fn proof_of_stake_reward(height: u32) -> Amount {
    match height {
        0..=9_999 => 100_000 * COIN,
        10_000..=19_999 => 50_000 * COIN,
        20_000..=29_999 => 25_000 * COIN,
        30_000..=39_999 => 12_500 * COIN,
        40_000..=50_999 => halving_band_reward(height),
        51_000..=144_998 => 30_000 * COIN,
        144_999..=189_998 => 28_000 * COIN,
        189_999..=234_998 => 26_000 * COIN,
        234_999..=279_998 => 24_000 * COIN,
        279_999..=324_998 => 22_000 * COIN,
        324_999..=369_998 => 20_000 * COIN,
        369_999..=414_998 => 18_000 * COIN,
        414_999..=459_998 => 16_000 * COIN,
        459_999..=504_998 => 14_000 * COIN,
        504_999..=549_998 => 12_000 * COIN,
        549_999..=594_998 => 10_000 * COIN,
        594_999..=639_998 => 4_000 * COIN,
        639_999..=684_998 => 2_000 * COIN,
        684_999..=729_998 => 1_000 * COIN,
        _ => 500 * COIN,
    }
}

fn halving_band_reward(height: u32) -> Amount {
    let mut subsidy = 10_000 * COIN;
    let halvings = height / REWARD_HALVING_PERIOD;
    if halvings >= 64 {
        return 0;
    }
    subsidy >>= halvings;
    // Integer division, so the fractional reduction truncates before the multiply.
    let fraction = (height % REWARD_HALVING_PERIOD) / (2 * REWARD_HALVING_PERIOD);
    subsidy -= subsidy * Amount::from(fraction);
    subsidy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow_schedule_steps() {
        assert_eq!(proof_of_work_reward(0), 1_000 * COIN);
        assert_eq!(proof_of_work_reward(29), 1_000 * COIN);
        assert_eq!(proof_of_work_reward(30), 1_000_000 * COIN);
        assert_eq!(proof_of_work_reward(6_999), 15_625 * COIN);
        assert_eq!(proof_of_work_reward(8_000), 10_000 * COIN);
        assert_eq!(proof_of_work_reward(8_001), 8_001);
    }

    #[test]
    fn pos_schedule_steps() {
        assert_eq!(proof_of_stake_reward(9_999), 100_000 * COIN);
        assert_eq!(proof_of_stake_reward(39_999), 12_500 * COIN);
        assert_eq!(proof_of_stake_reward(40_000), 10_000 * COIN);
        assert_eq!(proof_of_stake_reward(50_999), 10_000 * COIN);
        assert_eq!(proof_of_stake_reward(51_000), 30_000 * COIN);
        assert_eq!(proof_of_stake_reward(144_998), 30_000 * COIN);
        assert_eq!(proof_of_stake_reward(144_999), 28_000 * COIN);
        assert_eq!(proof_of_stake_reward(729_998), 1_000 * COIN);
        assert_eq!(proof_of_stake_reward(729_999), 500 * COIN);
    }
}
