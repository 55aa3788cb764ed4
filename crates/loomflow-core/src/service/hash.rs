//! ContentHasher trait for content-addressing step outputs.
//!
//! Defined in loomflow-core so the idempotency store can address blobs without
//! coupling to a specific hashing algorithm. The `Sha256ContentHasher` adapter
//! lives in loomflow-infra.

/// Abstraction over content hashing.
pub trait ContentHasher: Send + Sync {
    /// Compute a lowercase hex digest of the given bytes.
    fn compute_hash(&self, content: &[u8]) -> String;
}
