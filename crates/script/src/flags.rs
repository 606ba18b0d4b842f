//! Script verification flags.

pub const VERIFY_NONE: u32 = 0;
pub const VERIFY_P2SH: u32 = 1 << 0;
pub const VERIFY_STRICTENC: u32 = 1 << 1;
pub const VERIFY_DERSIG: u32 = 1 << 2;
pub const VERIFY_LOW_S: u32 = 1 << 3;
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
pub const VERIFY_SIGPUSHONLY: u32 = 1 << 5;
pub const VERIFY_MINIMALDATA: u32 = 1 << 6;
pub const VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
pub const VERIFY_CLEANSTACK: u32 = 1 << 8;
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;

/// Flags every block is verified with once P2SH is active.
pub const MANDATORY_VERIFY_FLAGS: u32 = VERIFY_P2SH;

pub const STANDARD_VERIFY_FLAGS: u32 = MANDATORY_VERIFY_FLAGS
    | VERIFY_STRICTENC
    | VERIFY_DERSIG
    | VERIFY_LOW_S
    | VERIFY_NULLDUMMY
    | VERIFY_MINIMALDATA
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CLEANSTACK
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY;

pub fn has_flag(flags: u32, flag: u32) -> bool {
    flags & flag != 0
}
