use std::borrow::Cow;
use std::fmt;

use ldoged_consensus::{hash_to_display, Hash256};
use ldoged_primitives::encoding::DecodeError;
use ldoged_storage::StoreError;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyErrorKind {
    Invalid,
    Checkpoint,
    Duplicate,
    Malformed,
    ProofOfStake,
}

impl VerifyErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VerifyErrorKind::Invalid => "invalid",
            VerifyErrorKind::Checkpoint => "checkpoint",
            VerifyErrorKind::Duplicate => "duplicate",
            VerifyErrorKind::Malformed => "malformed",
            VerifyErrorKind::ProofOfStake => "proofOfStake",
        }
    }
}

/// A consensus rejection. `score` is the ban penalty for the peer that
/// relayed the block; a `malleated` rejection never marks the hash invalid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyError {
    pub kind: VerifyErrorKind,
    pub reason: Cow<'static, str>,
    pub score: u32,
    pub malleated: bool,
    pub hash: Option<Hash256>,
}

impl VerifyError {
    pub fn new(
        kind: VerifyErrorKind,
        reason: impl Into<Cow<'static, str>>,
        score: u32,
        malleated: bool,
    ) -> Self {
        Self {
            kind,
            reason: reason.into(),
            score,
            malleated,
            hash: None,
        }
    }

    pub fn invalid(reason: impl Into<Cow<'static, str>>, score: u32) -> Self {
        Self::new(VerifyErrorKind::Invalid, reason, score, false)
    }

    /// An invalid block whose hash may still be valid with a different body.
    pub fn invalid_malleated(reason: impl Into<Cow<'static, str>>, score: u32) -> Self {
        Self::new(VerifyErrorKind::Invalid, reason, score, true)
    }

    pub fn checkpoint(reason: impl Into<Cow<'static, str>>, score: u32) -> Self {
        Self::new(VerifyErrorKind::Checkpoint, reason, score, false)
    }

    pub fn duplicate() -> Self {
        Self::new(VerifyErrorKind::Duplicate, "duplicate", 0, false)
    }

    pub fn malformed(reason: impl Into<Cow<'static, str>>, score: u32) -> Self {
        Self::new(VerifyErrorKind::Malformed, reason, score, true)
    }

    pub fn proof_of_stake(reason: impl Into<Cow<'static, str>>, score: u32) -> Self {
        Self::new(VerifyErrorKind::ProofOfStake, reason, score, false)
    }

    pub fn with_hash(mut self, hash: Hash256) -> Self {
        self.hash = Some(hash);
        self
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "verification failure: {} (code={} score={}",
            self.reason,
            self.kind.as_str(),
            self.score
        )?;
        if let Some(hash) = &self.hash {
            write!(f, " hash={}", hash_to_display(hash))?;
        }
        f.write_str(")")
    }
}

impl std::error::Error for VerifyError {}

/// Non-consensus failures inside the stake kernel.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("nTime violation")]
    TimeViolation,
    #[error("min age violation")]
    MinAgeViolation,
    #[error("no stake modifier generation at genesis")]
    NoGeneration,
    #[error("unable to select block at round {0}")]
    Selection(usize),
    #[error("block not indexed")]
    NotIndexed,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("stake kernel: {0}")]
    Kernel(#[from] KernelError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("database is corrupt: {0}")]
    Corrupt(&'static str),
    #[error("chain is not open")]
    NotOpen,
    #[error("chain is already open")]
    AlreadyOpen,
    #[error("block not found")]
    NotFound,
    #[error("cannot reset on alternate chain")]
    AlternateChain,
    #[error("chain is pruned")]
    Pruned,
    #[error("thread pool: {0}")]
    ThreadPool(String),
    #[error("config: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    pub fn as_verify(&self) -> Option<&VerifyError> {
        match self {
            ChainError::Verify(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_reason_and_code() {
        let err = VerifyError::invalid("bad-diffbits", 100).with_hash([0x11; 32]);
        let text = err.to_string();
        assert!(text.contains("bad-diffbits"));
        assert!(text.contains("code=invalid"));
        assert!(text.contains("score=100"));
        assert!(!err.malleated);
        assert!(VerifyError::malformed("compute-next-stake-modifier", 10).malleated);
    }
}
