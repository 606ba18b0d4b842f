//! Unspent outputs and the per-block view used while connecting a block.

use std::collections::HashMap;

use ldoged_consensus::money::Amount;
use ldoged_consensus::Hash256;
use ldoged_primitives::encoding::{DecodeError, Decoder, Encoder};
use ldoged_primitives::{OutPoint, Transaction};
use ldoged_script::script::is_unspendable;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coin {
    pub version: u32,
    pub height: u32,
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
    pub coinbase: bool,
    pub coinstake: bool,
    /// Timestamp of the transaction that created the output.
    pub time: u32,
}

const COIN_FLAG_COINBASE: u8 = 1 << 0;
const COIN_FLAG_COINSTAKE: u8 = 1 << 1;

impl Coin {
    pub fn from_tx(tx: &Transaction, index: usize, height: u32) -> Option<Self> {
        let output = tx.vout.get(index)?;
        Some(Self {
            version: tx.version,
            height,
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            coinbase: tx.is_coinbase(),
            coinstake: tx.is_coinstake(),
            time: tx.time,
        })
    }

    /// Coinbase and coinstake outputs both need to mature before spending.
    pub fn is_generated(&self) -> bool {
        self.coinbase || self.coinstake
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(22 + self.script_pubkey.len());
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    fn encode_into(&self, encoder: &mut Encoder) {
        let mut flags = 0u8;
        if self.coinbase {
            flags |= COIN_FLAG_COINBASE;
        }
        if self.coinstake {
            flags |= COIN_FLAG_COINSTAKE;
        }
        encoder.write_u32_le(self.version);
        encoder.write_u32_le(self.height);
        encoder.write_u8(flags);
        encoder.write_u32_le(self.time);
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let coin = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(coin)
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let height = decoder.read_u32_le()?;
        let flags = decoder.read_u8()?;
        let time = decoder.read_u32_le()?;
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            version,
            height,
            value,
            script_pubkey,
            coinbase: flags & COIN_FLAG_COINBASE != 0,
            coinstake: flags & COIN_FLAG_COINSTAKE != 0,
            time,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ViewCoin {
    coin: Coin,
    spent: bool,
}

/// Spent and created outputs of one block, applied to the store in a single
/// batch once the block is accepted.
#[derive(Clone, Debug, Default)]
pub struct CoinView {
    coins: HashMap<OutPoint, ViewCoin>,
    undo: BlockUndo,
}

impl CoinView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    /// Adds the spendable outputs of `tx` as fresh coins.
    pub fn add_tx(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.txid();
        for index in 0..tx.vout.len() {
            let Some(coin) = Coin::from_tx(tx, index, height) else {
                continue;
            };
            if is_unspendable(&coin.script_pubkey) {
                continue;
            }
            self.coins.insert(
                OutPoint::new(txid, index as u32),
                ViewCoin { coin, spent: false },
            );
        }
    }

    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin) {
        self.coins.insert(outpoint, ViewCoin { coin, spent: false });
    }

    /// Marks an output as removed from the coin set without recording undo data.
    pub fn remove_coin(&mut self, outpoint: OutPoint, coin: Coin) {
        self.coins.insert(outpoint, ViewCoin { coin, spent: true });
    }

    /// Spends every input of `tx`, reading missing coins through `lookup`.
    /// Returns `Ok(false)` when an input is missing or already spent.
    pub fn spend_inputs<E>(
        &mut self,
        tx: &Transaction,
        mut lookup: impl FnMut(&OutPoint) -> Result<Option<Coin>, E>,
    ) -> Result<bool, E> {
        for input in &tx.vin {
            let prevout = &input.prevout;
            if !self.coins.contains_key(prevout) {
                match lookup(prevout)? {
                    Some(coin) => {
                        self.coins
                            .insert(prevout.clone(), ViewCoin { coin, spent: false });
                    }
                    None => return Ok(false),
                }
            }
            let Some(entry) = self.coins.get_mut(prevout) else {
                return Ok(false);
            };
            if entry.spent {
                return Ok(false);
            }
            entry.spent = true;
            self.undo.push(prevout.clone(), entry.coin.clone());
        }
        Ok(true)
    }

    /// The coin behind `outpoint`, including coins this view already spent.
    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.coins.get(outpoint).map(|entry| &entry.coin)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.coins.get(outpoint).is_some_and(|entry| entry.spent)
    }

    /// Height of the coin spent by `outpoint`, if the view has seen it.
    pub fn get_height(&self, outpoint: &OutPoint) -> Option<u32> {
        self.get(outpoint).map(|coin| coin.height)
    }

    pub fn has_unspent_output(&self, txid: &Hash256) -> bool {
        self.coins
            .iter()
            .any(|(outpoint, entry)| &outpoint.hash == txid && !entry.spent)
    }

    /// Every touched outpoint with `Some(coin)` for live outputs and `None`
    /// for spent ones.
    pub fn changes(&self) -> impl Iterator<Item = (&OutPoint, Option<&Coin>)> {
        self.coins.iter().map(|(outpoint, entry)| {
            let coin = if entry.spent { None } else { Some(&entry.coin) };
            (outpoint, coin)
        })
    }

    pub fn undo(&self) -> &BlockUndo {
        &self.undo
    }
}

/// Coins spent by a block, in spend order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub spent: Vec<(OutPoint, Coin)>,
}

impl BlockUndo {
    pub fn push(&mut self, outpoint: OutPoint, coin: Coin) {
        self.spent.push((outpoint, coin));
    }

    pub fn is_empty(&self) -> bool {
        self.spent.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.spent.len() as u64);
        for (outpoint, coin) in &self.spent {
            outpoint.consensus_encode(&mut encoder);
            coin.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_len()?;
        let mut spent = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let outpoint = OutPoint::consensus_decode(&mut decoder)?;
            let coin = Coin::decode_from(&mut decoder)?;
            spent.push((outpoint, coin));
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldoged_primitives::{TxIn, TxOut};
    use std::convert::Infallible;

    fn funding_tx() -> Transaction {
        Transaction {
            version: 1,
            time: 1_600_000_000,
            vin: vec![TxIn {
                prevout: OutPoint::new([3; 32], 0),
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: vec![
                TxOut {
                    value: 10,
                    script_pubkey: vec![0x51],
                },
                TxOut {
                    value: 0,
                    script_pubkey: vec![0x6a, 0x01, 0x02],
                },
            ],
            lock_time: 0,
        }
    }

    fn spend_of(prevout: OutPoint) -> Transaction {
        Transaction {
            version: 1,
            time: 1_600_000_100,
            vin: vec![TxIn {
                prevout,
                script_sig: vec![0x51],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 9,
                script_pubkey: vec![0x52],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn add_tx_skips_unspendable_outputs() {
        let tx = funding_tx();
        let mut view = CoinView::new();
        view.add_tx(&tx, 5);
        assert_eq!(view.len(), 1);
        let coin = view.get(&OutPoint::new(tx.txid(), 0)).expect("coin");
        assert_eq!(coin.height, 5);
        assert_eq!(coin.time, tx.time);
        assert!(view.get(&OutPoint::new(tx.txid(), 1)).is_none());
    }

    #[test]
    fn spending_twice_fails_and_records_undo_once() {
        let funding = funding_tx();
        let mut view = CoinView::new();
        view.add_tx(&funding, 1);
        let outpoint = OutPoint::new(funding.txid(), 0);
        let spend = spend_of(outpoint.clone());

        let no_store = |_: &OutPoint| Ok::<_, Infallible>(None);
        assert_eq!(view.spend_inputs(&spend, no_store), Ok(true));
        assert!(view.is_spent(&outpoint));
        assert_eq!(view.get_height(&outpoint), Some(1));
        assert_eq!(view.spend_inputs(&spend, no_store), Ok(false));
        assert_eq!(view.undo().spent.len(), 1);
    }

    #[test]
    fn missing_coins_come_from_lookup() {
        let outpoint = OutPoint::new([8; 32], 2);
        let stored = Coin {
            version: 1,
            height: 40,
            value: 77,
            script_pubkey: vec![0x51],
            coinbase: true,
            coinstake: false,
            time: 12,
        };
        let mut view = CoinView::new();
        let found = view
            .spend_inputs(&spend_of(outpoint.clone()), |_| {
                Ok::<_, Infallible>(Some(stored.clone()))
            })
            .expect("lookup");
        assert!(found);
        assert_eq!(view.get(&outpoint), Some(&stored));
        let changes: Vec<_> = view.changes().collect();
        assert_eq!(changes, vec![(&outpoint, None)]);
    }

    #[test]
    fn undo_encoding_round_trips() {
        let mut undo = BlockUndo::default();
        undo.push(
            OutPoint::new([1; 32], 4),
            Coin {
                version: 2,
                height: 9,
                value: 1_000,
                script_pubkey: vec![0x76, 0xa9],
                coinbase: false,
                coinstake: true,
                time: 55,
            },
        );
        let decoded = BlockUndo::decode(&undo.encode()).expect("decode");
        assert_eq!(decoded, undo);
        assert!(Coin::decode(&[0u8; 3]).is_err());
    }
}
