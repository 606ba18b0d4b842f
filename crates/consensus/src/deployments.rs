//! Version-bits deployment definitions.

use serde::{Deserialize, Serialize};

/// A BIP9 style soft-fork deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub bit: u8,
    /// Median time at which signalling starts. `None` means always active.
    pub start_time: Option<i64>,
    pub timeout: i64,
    /// Overrides the network activation threshold when set.
    pub threshold: Option<u32>,
    /// Overrides the network miner window when set.
    pub window: Option<u32>,
    pub required: bool,
    pub force: bool,
}

impl Deployment {
    pub fn mask(&self) -> u32 {
        1u32 << self.bit
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    pub fn as_u8(self) -> u8 {
        match self {
            ThresholdState::Defined => 0,
            ThresholdState::Started => 1,
            ThresholdState::LockedIn => 2,
            ThresholdState::Active => 3,
            ThresholdState::Failed => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ThresholdState::Defined),
            1 => Some(ThresholdState::Started),
            2 => Some(ThresholdState::LockedIn),
            3 => Some(ThresholdState::Active),
            4 => Some(ThresholdState::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdState::Defined => "defined",
            ThresholdState::Started => "started",
            ThresholdState::LockedIn => "locked_in",
            ThresholdState::Active => "active",
            ThresholdState::Failed => "failed",
        }
    }
}
