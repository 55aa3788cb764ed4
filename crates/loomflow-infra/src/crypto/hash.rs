//! SHA-256 content hasher.
//!
//! Implements the `ContentHasher` trait from `loomflow-core` so committed
//! outputs are addressed by the digest of their serialized bytes.

use loomflow_core::service::hash::ContentHasher;
use sha2::{Digest, Sha256};

/// SHA-256 content hasher producing lowercase hex digests.
pub struct Sha256ContentHasher;

impl Sha256ContentHasher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Sha256ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher for Sha256ContentHasher {
    fn compute_hash(&self, content: &[u8]) -> String {
        format!("{:x}", Sha256::digest(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_content_hash() {
        let hasher = Sha256ContentHasher::new();
        assert_eq!(
            hasher.compute_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hasher = Sha256ContentHasher::new();
        let payload = br#"{"outline":["intro","body"]}"#;
        assert_eq!(hasher.compute_hash(payload), hasher.compute_hash(payload));
        assert_ne!(hasher.compute_hash(payload), hasher.compute_hash(b"{}"));
    }

    #[test]
    fn test_hash_is_lowercase_hex() {
        let digest = Sha256ContentHasher::new().compute_hash(b"loomflow");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
