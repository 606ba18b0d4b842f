//! Consensus parameters and rules shared across the node crates.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;
pub mod rewards;

pub use constants::has_version_bit;
pub use deployments::{Deployment, ThresholdState};
pub use params::{chain_params, ChainParams, Checkpoint, Network};

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Parses a hash written in internal byte order at compile time.
pub const fn hash_from_hex(hex: &str) -> Hash256 {
    let bytes = hex.as_bytes();
    assert!(bytes.len() == 64, "hash hex must be 64 characters");
    let mut out = [0u8; 32];
    let mut index = 0;
    while index < 32 {
        let high = hex_nibble(bytes[index * 2]);
        let low = hex_nibble(bytes[index * 2 + 1]);
        out[index] = (high << 4) | low;
        index += 1;
    }
    out
}

const fn hex_nibble(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        b'A'..=b'F' => byte - b'A' + 10,
        _ => panic!("invalid hex digit"),
    }
}

/// Formats a hash the way block explorers display it (byte-reversed hex).
pub fn hash_to_display(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trips_through_display() {
        let hash = hash_from_hex("c6674f5395dd5a1332747194621b9efcf7536319b1ddcde7272f030121030000");
        assert_eq!(hash[0], 0xc6);
        assert_eq!(hash[31], 0x00);
        assert_eq!(
            hash_to_display(&hash),
            "0000032101032f27e7cdddb1196353f7fc9e1b6294717432135add95534f67c6"
        );
    }
}
