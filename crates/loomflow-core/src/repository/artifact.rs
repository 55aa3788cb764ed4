//! Artifact store trait definition.
//!
//! A key -> blob store with write-once artifact references on top. Blobs are
//! addressed by digest and stored once; artifact references map a
//! (run, step, revision) key to a digest and are never overwritten.

use loomflow_types::artifact::ArtifactRef;
use loomflow_types::error::RepositoryError;
use uuid::Uuid;

/// Storage port for committed step outputs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `digest`. Storing an existing digest is a no-op.
    fn put_blob(
        &self,
        digest: &str,
        bytes: &[u8],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn read_blob(
        &self,
        digest: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, RepositoryError>> + Send;

    /// Atomically insert `artifact` if its (run, step, revision) key is free.
    ///
    /// Fails with `RepositoryError::Conflict` when the key is already taken.
    fn commit(
        &self,
        artifact: &ArtifactRef,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// The highest committed revision for (run, step).
    fn get_latest(
        &self,
        run_id: &Uuid,
        step: &str,
    ) -> impl std::future::Future<Output = Result<Option<ArtifactRef>, RepositoryError>> + Send;

    fn get_revision(
        &self,
        run_id: &Uuid,
        step: &str,
        revision: u32,
    ) -> impl std::future::Future<Output = Result<Option<ArtifactRef>, RepositoryError>> + Send;

    /// All revisions committed for a run, ordered by (step, revision).
    fn list_artifacts(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ArtifactRef>, RepositoryError>> + Send;
}
