//! Content fingerprints used for change detection.

use sha2::{Digest, Sha256};

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 64;

/// Compute the SHA256 fingerprint of a unit's text as lowercase hex.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        assert_eq!(fingerprint("The quick brown fox"), fingerprint("The quick brown fox"));
    }

    #[test]
    fn test_fingerprint_length() {
        assert_eq!(fingerprint("").len(), FINGERPRINT_LEN);
        assert_eq!(fingerprint("some longer text here").len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_fingerprint_known_value() {
        assert_eq!(
            fingerprint("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_fingerprint_detects_edit() {
        assert_ne!(
            fingerprint("The quick brown fox"),
            fingerprint("The quick brown fox jumps")
        );
    }
}
