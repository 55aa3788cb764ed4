//! Idempotency store: write-once step outputs keyed by (run, step, revision).
//!
//! The existence of a committed `ArtifactRef` is the signal that a step must
//! not be invoked again for that key. Payloads are serialized to JSON,
//! content-addressed by digest and stored once per digest.

use std::sync::Arc;

use chrono::Utc;
use loomflow_types::artifact::{ArtifactRef, output_key};
use loomflow_types::error::RepositoryError;
use loomflow_types::run::Run;
use uuid::Uuid;

use crate::repository::artifact::ArtifactStore;
use crate::service::hash::ContentHasher;

/// A payload written to the blob store, not yet committed to any key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPayload {
    pub digest: String,
    pub size_bytes: u64,
}

/// Result of forking a run's artifacts.
#[derive(Debug, Clone)]
pub struct ForkedArtifacts {
    pub run_id: Uuid,
    /// Copied artifacts, each at revision 0 of the new run.
    pub copied: Vec<ArtifactRef>,
}

/// Write-once artifact commits over an `ArtifactStore`.
pub struct IdempotencyStore<A: ArtifactStore> {
    store: A,
    hasher: Arc<dyn ContentHasher>,
}

fn store_err(e: RepositoryError) -> StoreError {
    StoreError::Repository(e.to_string())
}

impl<A: ArtifactStore> IdempotencyStore<A> {
    pub fn new(store: A, hasher: Arc<dyn ContentHasher>) -> Self {
        Self { store, hasher }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &A {
        &self.store
    }

    /// Latest committed revision for (run, step).
    pub async fn get(&self, run_id: Uuid, step: &str) -> Result<Option<ArtifactRef>, StoreError> {
        self.store.get_latest(&run_id, step).await.map_err(store_err)
    }

    pub async fn get_revision(
        &self,
        run_id: Uuid,
        step: &str,
        revision: u32,
    ) -> Result<Option<ArtifactRef>, StoreError> {
        self.store
            .get_revision(&run_id, step, revision)
            .await
            .map_err(store_err)
    }

    pub async fn list(&self, run_id: Uuid) -> Result<Vec<ArtifactRef>, StoreError> {
        self.store.list_artifacts(&run_id).await.map_err(store_err)
    }

    /// Serialize and store a payload, returning its digest and size.
    pub async fn put_payload(&self, payload: &serde_json::Value) -> Result<StoredPayload, StoreError> {
        let bytes =
            serde_json::to_vec(payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let digest = self.hasher.compute_hash(&bytes);
        self.put_blob(&digest, &bytes).await?;
        Ok(StoredPayload {
            digest,
            size_bytes: bytes.len() as u64,
        })
    }

    pub async fn put_blob(&self, digest: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.store.put_blob(digest, bytes).await.map_err(store_err)
    }

    /// Commit an output under (run, step, revision).
    ///
    /// Write-once: fails with `StoreError::Conflict` if the key is taken.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        step: &str,
        revision: u32,
        digest: &str,
        size_bytes: u64,
        summary: &str,
    ) -> Result<ArtifactRef, StoreError> {
        let artifact = ArtifactRef {
            tenant_id: tenant_id.to_string(),
            run_id,
            step: step.to_string(),
            revision,
            digest: digest.to_string(),
            size_bytes,
            summary: summary.to_string(),
            committed_at: Utc::now(),
        };

        match self.store.commit(&artifact).await {
            Ok(()) => {
                tracing::debug!(
                    run_id = %run_id,
                    step,
                    revision,
                    digest,
                    key = artifact.storage_key().as_str(),
                    "committed artifact"
                );
                Ok(artifact)
            }
            Err(RepositoryError::Conflict(_)) => Err(StoreError::Conflict(output_key(
                tenant_id, &run_id, step, revision,
            ))),
            Err(e) => Err(store_err(e)),
        }
    }

    /// Read and decode the payload behind an artifact.
    pub async fn read_output(&self, artifact: &ArtifactRef) -> Result<serde_json::Value, StoreError> {
        self.read_payload(&artifact.digest).await
    }

    /// Read and decode a stored payload by digest.
    pub async fn read_payload(&self, digest: &str) -> Result<serde_json::Value, StoreError> {
        let bytes = self
            .store
            .read_blob(digest)
            .await
            .map_err(store_err)?
            .ok_or_else(|| StoreError::MissingBlob(digest.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Copy the latest artifact of every step strictly before `resume_step`'s
    /// segment into a fresh run ID.
    ///
    /// Steps without a committed artifact (skipped steps) are not copied.
    /// Resuming at a parallel group member copies nothing from that group.
    pub async fn fork(&self, source: &Run, resume_step: &str) -> Result<ForkedArtifacts, StoreError> {
        let segment = source
            .plan
            .segment_of(resume_step)
            .ok_or_else(|| StoreError::UnknownStep(resume_step.to_string()))?;

        let new_run_id = Uuid::now_v7();
        let mut copied = Vec::new();
        for step in source.plan.steps_before(segment) {
            let Some(latest) = self.get(source.id, &step).await? else {
                continue;
            };
            let artifact = self
                .commit(
                    &source.tenant_id,
                    new_run_id,
                    &step,
                    0,
                    &latest.digest,
                    latest.size_bytes,
                    &latest.summary,
                )
                .await?;
            copied.push(artifact);
        }

        tracing::info!(
            source_run = %source.id,
            new_run = %new_run_id,
            resume_step,
            copied = copied.len(),
            "forked run artifacts"
        );

        Ok(ForkedArtifacts {
            run_id: new_run_id,
            copied,
        })
    }
}

/// Errors from the idempotency store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An artifact is already committed under this key.
    #[error("artifact already committed: {0}")]
    Conflict(String),

    #[error("blob not found: {0}")]
    MissingBlob(String),

    #[error("payload serialization error: {0}")]
    Serialization(String),

    #[error("step not in plan: {0}")]
    UnknownStep(String),

    #[error("artifact store error: {0}")]
    Repository(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryArtifactStore, TestHasher, sample_run};
    use serde_json::json;

    fn store() -> IdempotencyStore<MemoryArtifactStore> {
        IdempotencyStore::new(MemoryArtifactStore::default(), Arc::new(TestHasher))
    }

    async fn commit_value(
        store: &IdempotencyStore<MemoryArtifactStore>,
        run: &Run,
        step: &str,
        revision: u32,
        value: serde_json::Value,
    ) -> ArtifactRef {
        let stored = store.put_payload(&value).await.unwrap();
        store
            .commit(
                &run.tenant_id,
                run.id,
                step,
                revision,
                &stored.digest,
                stored.size_bytes,
                step,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn commit_is_write_once() {
        let store = store();
        let run = sample_run();
        let first = commit_value(&store, &run, "a", 0, json!({"v": 1})).await;

        let stored = store.put_payload(&json!({"v": 2})).await.unwrap();
        let second = store
            .commit(&run.tenant_id, run.id, "a", 0, &stored.digest, stored.size_bytes, "a")
            .await;
        assert!(matches!(second, Err(StoreError::Conflict(ref key)) if key.ends_with("/a/output")));

        let current = store.get(run.id, "a").await.unwrap().unwrap();
        assert_eq!(current.digest, first.digest);
    }

    #[tokio::test]
    async fn get_returns_latest_revision() {
        let store = store();
        let run = sample_run();
        commit_value(&store, &run, "a", 0, json!("first")).await;
        let second = commit_value(&store, &run, "a", 1, json!("second")).await;

        let latest = store.get(run.id, "a").await.unwrap().unwrap();
        assert_eq!(latest.revision, 1);
        assert_eq!(latest.digest, second.digest);
        assert_eq!(store.read_output(&latest).await.unwrap(), json!("second"));

        let original = store.get_revision(run.id, "a", 0).await.unwrap().unwrap();
        assert_eq!(store.read_output(&original).await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn identical_payloads_share_a_digest() {
        let store = store();
        let one = store.put_payload(&json!({"x": [1, 2]})).await.unwrap();
        let two = store.put_payload(&json!({"x": [1, 2]})).await.unwrap();
        assert_eq!(one, two);
    }

    #[tokio::test]
    async fn fork_copies_latest_artifacts_before_resume_segment() {
        let store = store();
        let run = sample_run();
        let a = commit_value(&store, &run, "a", 0, json!("a0")).await;
        commit_value(&store, &run, "b", 0, json!("b0")).await;
        let b1 = commit_value(&store, &run, "b", 1, json!("b1")).await;
        commit_value(&store, &run, "c", 0, json!("c0")).await;
        commit_value(&store, &run, "d", 0, json!("d0")).await;

        // sample plan: a | (b, c) | gate | d
        let forked = store.fork(&run, "d").await.unwrap();
        assert_ne!(forked.run_id, run.id);
        assert_eq!(forked.copied.len(), 3);

        let copied_a = store.get(forked.run_id, "a").await.unwrap().unwrap();
        assert_eq!(copied_a.digest, a.digest);
        assert_eq!(copied_a.revision, 0);

        let copied_b = store.get(forked.run_id, "b").await.unwrap().unwrap();
        assert_eq!(copied_b.digest, b1.digest);
        assert_eq!(copied_b.revision, 0);

        assert!(store.get(forked.run_id, "d").await.unwrap().is_none());

        // Resuming at a group member re-runs the whole group.
        let at_group = store.fork(&run, "c").await.unwrap();
        assert_eq!(at_group.copied.len(), 1);
        assert!(store.get(at_group.run_id, "b").await.unwrap().is_none());

        assert!(matches!(
            store.fork(&run, "missing").await,
            Err(StoreError::UnknownStep(_))
        ));
    }
}
