//! Proof-of-work targets and block proof predicates.

pub mod difficulty;
pub mod validation;
