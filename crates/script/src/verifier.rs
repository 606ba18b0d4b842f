use ldoged_consensus::money::Amount;
use ldoged_primitives::transaction::Transaction;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("input index {0} out of range")]
    InputIndex(usize),
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("signature check failed")]
    Signature,
    #[error("script failure: {0}")]
    Other(String),
}

/// Executes the unlocking script of one input against the output it spends.
///
/// Implementations must be safe to call from several worker threads at once.
pub trait ScriptVerifier: Send + Sync {
    fn verify_input(
        &self,
        tx: &Transaction,
        index: usize,
        script_pubkey: &[u8],
        value: Amount,
        flags: u32,
    ) -> Result<(), ScriptError>;
}

impl<T: ScriptVerifier + ?Sized> ScriptVerifier for std::sync::Arc<T> {
    fn verify_input(
        &self,
        tx: &Transaction,
        index: usize,
        script_pubkey: &[u8],
        value: Amount,
        flags: u32,
    ) -> Result<(), ScriptError> {
        (**self).verify_input(tx, index, script_pubkey, value, flags)
    }
}

/// Accepts every input whose index exists. Suitable for nodes that trust
/// their block source and for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopVerifier;

impl ScriptVerifier for NoopVerifier {
    fn verify_input(
        &self,
        tx: &Transaction,
        index: usize,
        _script_pubkey: &[u8],
        _value: Amount,
        _flags: u32,
    ) -> Result<(), ScriptError> {
        if index >= tx.vin.len() {
            return Err(ScriptError::InputIndex(index));
        }
        Ok(())
    }
}
