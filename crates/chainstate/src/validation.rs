//! Context-free block and transaction checks, plus the input checks that
//! only need a coin view.

use std::collections::HashSet;

use ldoged_consensus::constants::{COINBASE_MATURITY, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_SIZE};
use ldoged_consensus::money::{money_range, Amount, MAX_MONEY};
use ldoged_primitives::{Block, Transaction};
use ldoged_script::flags::{has_flag, VERIFY_P2SH};
use ldoged_script::script::{is_p2sh, p2sh_sigop_count, sigop_count};

use crate::coins::CoinView;
use crate::error::VerifyError;

/// Which of the expensive header checks `Chain::add` runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationFlags {
    pub check_pow: bool,
    pub check_pos: bool,
    pub check_body: bool,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_pow: true,
            check_pos: true,
            check_body: true,
        }
    }
}

impl ValidationFlags {
    /// Contextual checks only.
    pub fn none() -> Self {
        Self {
            check_pow: false,
            check_pos: false,
            check_body: false,
        }
    }
}

pub fn check_sanity(tx: &Transaction) -> Result<(), VerifyError> {
    if tx.vin.is_empty() {
        return Err(VerifyError::invalid("bad-txns-vin-empty", 100));
    }
    if tx.vout.is_empty() {
        return Err(VerifyError::invalid("bad-txns-vout-empty", 100));
    }
    if tx.size() > MAX_BLOCK_SIZE {
        return Err(VerifyError::invalid("bad-txns-oversize", 100));
    }

    let coinbase = tx.is_coinbase();
    let generated = coinbase || tx.is_coinstake();
    let mut total: Amount = 0;
    for output in &tx.vout {
        if output.is_empty() && !generated {
            return Err(VerifyError::invalid("bad-txns-empty-user-outputs", 100));
        }
        if output.value < 0 {
            return Err(VerifyError::invalid("bad-txns-vout-negative", 100));
        }
        if output.value > MAX_MONEY {
            return Err(VerifyError::invalid("bad-txns-vout-toolarge", 100));
        }
        total = match total.checked_add(output.value) {
            Some(total) if money_range(total) => total,
            _ => return Err(VerifyError::invalid("bad-txns-txouttotal-toolarge", 100)),
        };
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(&input.prevout) {
            return Err(VerifyError::invalid("bad-txns-inputs-duplicate", 100));
        }
    }

    if coinbase {
        let size = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&size) {
            return Err(VerifyError::invalid("bad-cb-length", 100));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(VerifyError::invalid("bad-txns-prevout-null", 10));
    }
    Ok(())
}

/// Sigops counted without looking at the spent outputs.
pub fn legacy_sigops(tx: &Transaction) -> usize {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| sigop_count(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| sigop_count(&output.script_pubkey, false))
        .sum();
    (inputs + outputs) as usize
}

/// Sigops of the redeem scripts of pay-to-script-hash inputs.
pub fn scripthash_sigops(tx: &Transaction, view: &CoinView) -> usize {
    if tx.is_coinbase() {
        return 0;
    }
    tx.vin
        .iter()
        .filter_map(|input| {
            let coin = view.get(&input.prevout)?;
            if !is_p2sh(&coin.script_pubkey) {
                return None;
            }
            Some(p2sh_sigop_count(&coin.script_pubkey, &input.script_sig) as usize)
        })
        .sum()
}

pub fn sigops_cost(tx: &Transaction, view: &CoinView, flags: u32) -> usize {
    let mut cost = legacy_sigops(tx);
    if has_flag(flags, VERIFY_P2SH) {
        cost += scripthash_sigops(tx, view);
    }
    cost
}

/// Blocks carry no witness data, so weight equals serialized size.
pub fn block_weight(block: &Block) -> usize {
    block.size()
}

pub fn check_body(block: &Block) -> Result<(), VerifyError> {
    let txs = &block.transactions;
    if txs.is_empty() || txs.len() > MAX_BLOCK_SIZE || block.size() > MAX_BLOCK_SIZE {
        return Err(VerifyError::invalid("bad-blk-length", 100));
    }
    if !txs[0].is_coinbase() {
        return Err(VerifyError::invalid("bad-cb-missing", 100));
    }
    if block.is_proof_of_stake() {
        let coinbase = &txs[0];
        if coinbase.vout.len() != 1 || !coinbase.vout[0].is_empty() {
            return Err(VerifyError::invalid("bad-cs-coinbasenotempty", 100));
        }
        if !txs.get(1).is_some_and(Transaction::is_coinstake) {
            return Err(VerifyError::invalid("bad-cs-missing", 100));
        }
    }

    let (root, mutated) = block.merkle_root();
    if mutated {
        return Err(VerifyError::invalid("bad-txns-duplicate", 100));
    }
    if root != block.header.merkle_root {
        return Err(VerifyError::invalid("bad-txnmrklroot", 100));
    }

    let mut sigops = 0usize;
    for (index, tx) in txs.iter().enumerate() {
        if index > 0 && tx.is_coinbase() {
            return Err(VerifyError::invalid("bad-cb-multiple", 100));
        }
        if index > 1 && tx.is_coinstake() {
            return Err(VerifyError::invalid("bad-cs-multiple", 100));
        }
        check_sanity(tx)?;
        sigops += legacy_sigops(tx);
        if sigops > MAX_BLOCK_SIGOPS_COST {
            return Err(VerifyError::invalid("bad-blk-sigops", 100));
        }
    }
    Ok(())
}

/// Checks the coins `tx` spends at `height` and returns the fee it pays.
/// Coinstakes mint their reward and pay no fee.
pub fn check_inputs(tx: &Transaction, view: &CoinView, height: u32) -> Result<Amount, VerifyError> {
    let mut total: Amount = 0;
    for input in &tx.vin {
        let Some(coin) = view.get(&input.prevout) else {
            return Err(VerifyError::invalid("bad-txns-inputs-missingorspent", 0));
        };
        if coin.is_generated() && height.saturating_sub(coin.height) < COINBASE_MATURITY {
            let reason = if coin.coinstake {
                "bad-txns-premature-spend-of-coinstake"
            } else {
                "bad-txns-premature-spend-of-coinbase"
            };
            return Err(VerifyError::invalid(reason, 0));
        }
        if !money_range(coin.value) {
            return Err(VerifyError::invalid("bad-txns-inputvalues-outofrange", 100));
        }
        total = match total.checked_add(coin.value) {
            Some(total) if money_range(total) => total,
            _ => return Err(VerifyError::invalid("bad-txns-inputvalues-outofrange", 100)),
        };
    }

    if tx.is_coinstake() {
        return Ok(0);
    }

    let value = tx
        .value_out()
        .ok_or_else(|| VerifyError::invalid("bad-txns-txouttotal-toolarge", 100))?;
    let fee = total - value;
    // No minimum relay fee at block level, only range checks.
    if fee < 0 {
        return Err(VerifyError::invalid("bad-txns-fee-negative", 100));
    }
    if fee > MAX_MONEY {
        return Err(VerifyError::invalid("bad-txns-fee-outofrange", 100));
    }
    Ok(fee)
}

/// Value a coinstake creates beyond the coins it spends.
pub fn coinstake_reward(tx: &Transaction, view: &CoinView) -> Option<Amount> {
    let mut spent: Amount = 0;
    for input in &tx.vin {
        spent = spent.checked_add(view.get(&input.prevout)?.value)?;
    }
    tx.value_out()?.checked_sub(spent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::Coin;
    use ldoged_consensus::money::COIN;
    use ldoged_primitives::block::BlockHeader;
    use ldoged_primitives::{OutPoint, TxIn, TxOut};
    use std::convert::Infallible;

    fn coinbase(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 1,
            time: 1_600_000_000,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x02],
                sequence: u32::MAX,
            }],
            vout: outputs,
            lock_time: 0,
        }
    }

    fn pay(value: Amount) -> TxOut {
        TxOut {
            value,
            script_pubkey: vec![0x51],
        }
    }

    fn spend(prevout: OutPoint, outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 1,
            time: 1_600_000_000,
            vin: vec![TxIn {
                prevout,
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: outputs,
            lock_time: 0,
        }
    }

    fn block_of(transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 7,
                prev_block: [0; 32],
                merkle_root: [0; 32],
                time: 0,
                bits: 0,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block.merkle_root().0;
        block
    }

    fn view_with(outpoint: &OutPoint, coin: Coin) -> CoinView {
        let mut view = CoinView::new();
        view.add_coin(outpoint.clone(), coin);
        view
    }

    fn coin(value: Amount, height: u32, coinbase: bool) -> Coin {
        Coin {
            version: 1,
            height,
            value,
            script_pubkey: vec![0x51],
            coinbase,
            coinstake: false,
            time: 0,
        }
    }

    #[test]
    fn sanity_rejects_bad_shapes() {
        let prevout = OutPoint::new([1; 32], 0);
        let mut tx = spend(prevout.clone(), vec![pay(1)]);
        assert!(check_sanity(&tx).is_ok());

        tx.vout.push(TxOut {
            value: 0,
            script_pubkey: Vec::new(),
        });
        assert_eq!(
            check_sanity(&tx).expect_err("empty").reason,
            "bad-txns-empty-user-outputs"
        );

        let dup = Transaction {
            vin: vec![tx.vin[0].clone(), tx.vin[0].clone()],
            ..spend(prevout.clone(), vec![pay(1)])
        };
        assert_eq!(
            check_sanity(&dup).expect_err("dup").reason,
            "bad-txns-inputs-duplicate"
        );

        let big = spend(prevout, vec![pay(MAX_MONEY), pay(1)]);
        assert_eq!(
            check_sanity(&big).expect_err("total").reason,
            "bad-txns-txouttotal-toolarge"
        );

        let mut short = coinbase(vec![pay(1)]);
        short.vin[0].script_sig = vec![0x01];
        assert_eq!(check_sanity(&short).expect_err("cb").reason, "bad-cb-length");
    }

    #[test]
    fn body_checks_follow_order() {
        let cb = coinbase(vec![pay(50)]);
        assert!(check_body(&block_of(vec![cb.clone()])).is_ok());

        let err = check_body(&block_of(Vec::new())).expect_err("empty");
        assert_eq!(err.reason, "bad-blk-length");

        let tx = spend(OutPoint::new([2; 32], 0), vec![pay(1)]);
        let err = check_body(&block_of(vec![tx.clone()])).expect_err("no coinbase");
        assert_eq!(err.reason, "bad-cb-missing");

        let mut bad_root = block_of(vec![cb.clone(), tx.clone()]);
        bad_root.header.merkle_root = [9; 32];
        assert_eq!(check_body(&bad_root).expect_err("root").reason, "bad-txnmrklroot");

        let dup = block_of(vec![cb.clone(), tx.clone(), tx.clone()]);
        assert_eq!(check_body(&dup).expect_err("dup").reason, "bad-txns-duplicate");

        let two_cb = block_of(vec![cb.clone(), coinbase(vec![pay(1)])]);
        assert_eq!(check_body(&two_cb).expect_err("cb").reason, "bad-cb-multiple");
    }

    #[test]
    fn inputs_enforce_maturity_and_fees() {
        let prevout = OutPoint::new([3; 32], 0);
        let tx = spend(prevout.clone(), vec![pay(40 * COIN)]);

        let view = view_with(&prevout, coin(50 * COIN, 10, true));
        let err = check_inputs(&tx, &view, 109).expect_err("immature");
        assert_eq!(err.reason, "bad-txns-premature-spend-of-coinbase");
        assert_eq!(check_inputs(&tx, &view, 110), Ok(10 * COIN));

        let view = view_with(&prevout, coin(30 * COIN, 10, false));
        let err = check_inputs(&tx, &view, 11).expect_err("negative fee");
        assert_eq!(err.reason, "bad-txns-fee-negative");

        let err = check_inputs(&tx, &CoinView::new(), 11).expect_err("missing");
        assert_eq!(err.reason, "bad-txns-inputs-missingorspent");
    }

    #[test]
    fn spent_coins_remain_visible_for_input_checks() {
        let prevout = OutPoint::new([4; 32], 1);
        let tx = spend(prevout.clone(), vec![pay(5)]);
        let mut view = CoinView::new();
        let spent = view
            .spend_inputs(&tx, |_| Ok::<_, Infallible>(Some(coin(7, 1, false))))
            .expect("lookup");
        assert!(spent);
        assert_eq!(check_inputs(&tx, &view, 2), Ok(2));
        assert_eq!(sigops_cost(&tx, &view, VERIFY_P2SH), 0);
    }
}
