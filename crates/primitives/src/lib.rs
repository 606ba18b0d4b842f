//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{scrypt_hash, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
