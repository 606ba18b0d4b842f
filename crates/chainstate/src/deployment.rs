use ldoged_consensus::constants::{
    BIP16_TIME, LOCKTIME_MEDIAN_TIME_PAST, MANDATORY_LOCKTIME_FLAGS,
};
use ldoged_script::flags::{
    has_flag, MANDATORY_VERIFY_FLAGS, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY,
    VERIFY_P2SH,
};

/// Script and lock time rules in force for one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeploymentState {
    pub flags: u32,
    pub lock_flags: u32,
}

impl Default for DeploymentState {
    fn default() -> Self {
        Self {
            flags: MANDATORY_VERIFY_FLAGS & !VERIFY_P2SH,
            lock_flags: MANDATORY_LOCKTIME_FLAGS,
        }
    }
}

impl DeploymentState {
    /// Rules for a block stamped `time`. P2SH switched on by timestamp long
    /// before any version bits deployment existed.
    pub fn at_time(time: u32) -> Self {
        let mut state = Self::default();
        if time >= BIP16_TIME {
            state.flags |= VERIFY_P2SH;
        }
        state
    }

    pub fn has_p2sh(&self) -> bool {
        has_flag(self.flags, VERIFY_P2SH)
    }

    pub fn has_cltv(&self) -> bool {
        has_flag(self.flags, VERIFY_CHECKLOCKTIMEVERIFY)
    }

    pub fn has_mtp(&self) -> bool {
        self.lock_flags & LOCKTIME_MEDIAN_TIME_PAST != 0
    }

    pub fn has_csv(&self) -> bool {
        has_flag(self.flags, VERIFY_CHECKSEQUENCEVERIFY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2sh_follows_bip16_time() {
        assert!(!DeploymentState::at_time(BIP16_TIME - 1).has_p2sh());
        let state = DeploymentState::at_time(BIP16_TIME);
        assert!(state.has_p2sh());
        assert!(!state.has_csv());
        assert!(!state.has_mtp());
        assert!(!DeploymentState::default().has_cltv());
    }
}
