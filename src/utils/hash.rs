//! Content fingerprints for deduplication.

use sha3::{Digest, Sha3_256};

/// Digest bytes kept in a fingerprint (64 bits of SHA3-256).
const FINGERPRINT_BYTES: usize = 8;

/// Short, stable fingerprint of `data`.
pub fn fingerprint(data: &[u8]) -> String {
    let digest = Sha3_256::digest(data);
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stable_and_distinct() {
        assert_eq!(fingerprint(b"offer-1"), fingerprint(b"offer-1"));
        assert_ne!(fingerprint(b"offer-1"), fingerprint(b"offer-2"));
        assert_eq!(fingerprint(b"").len(), FINGERPRINT_BYTES * 2);
    }
}
