//! One-time unlock credential handling
//!
//! The plaintext credential from the server is hashed at ingestion and
//! dropped; only the SHA-256 digest is persisted. Verification compares
//! digests in constant time.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hex-encoded SHA-256 digest of a credential.
pub fn digest(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time check of a candidate against a stored digest.
pub fn verify(candidate: &str, stored_digest: &str) -> bool {
    let candidate_digest = digest(candidate);
    let a = candidate_digest.as_bytes();
    let b = stored_digest.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_hex() {
        let d = digest("ABC123");
        assert_eq!(d.len(), 64);
        assert_eq!(d, digest("ABC123"));
    }

    #[test]
    fn verify_accepts_matching_candidate() {
        let stored = digest("ABC123");
        assert!(verify("ABC123", &stored));
    }

    #[test]
    fn verify_rejects_wrong_candidate() {
        let stored = digest("ABC123");
        assert!(!verify("abc123", &stored));
        assert!(!verify("", &stored));
    }
}
