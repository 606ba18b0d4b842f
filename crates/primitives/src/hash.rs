use ldoged_consensus::Hash256;
use scrypt::Params;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// scrypt(N=1024, r=1, p=1) with the input as both password and salt.
pub fn scrypt_hash(data: &[u8]) -> Hash256 {
    let params = Params::new(10, 1, 1, 32).expect("static scrypt parameters are valid");
    let mut out = [0u8; 32];
    scrypt::scrypt(data, data, &params, &mut out).expect("32-byte scrypt output is valid");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_of_empty_input() {
        assert_eq!(
            hex::encode(sha256d(&[])),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }
}
