//! Monetary amounts.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;
pub const MAX_MONEY: Amount = 50_000_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
