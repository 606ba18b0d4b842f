//! Script flags, opcode scanning and the script verification seam.

pub mod flags;
pub mod script;
pub mod verifier;

pub use script::{Instruction, Instructions};
pub use verifier::{NoopVerifier, ScriptError, ScriptVerifier};
