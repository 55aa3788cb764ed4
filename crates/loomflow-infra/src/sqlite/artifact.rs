//! SQLite artifact store implementation.
//!
//! Implements `ArtifactStore` from `loomflow-core`. Blobs are keyed by digest
//! and inserted with `INSERT OR IGNORE`, so identical outputs share storage.
//! Artifact references rely on the (run, step, revision) primary key for
//! write-once semantics: a second commit to the same key fails with
//! `RepositoryError::Conflict`.

use chrono::Utc;
use loomflow_core::repository::artifact::ArtifactStore;
use loomflow_types::artifact::{ArtifactRef, output_key};
use loomflow_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, map_write_error, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `ArtifactStore`.
pub struct SqliteArtifactStore {
    pool: DatabasePool,
}

impl SqliteArtifactStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ArtifactRow {
    tenant_id: String,
    run_id: String,
    step: String,
    revision: i64,
    digest: String,
    size_bytes: i64,
    summary: String,
    committed_at: String,
}

impl ArtifactRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            tenant_id: row.try_get("tenant_id")?,
            run_id: row.try_get("run_id")?,
            step: row.try_get("step")?,
            revision: row.try_get("revision")?,
            digest: row.try_get("digest")?,
            size_bytes: row.try_get("size_bytes")?,
            summary: row.try_get("summary")?,
            committed_at: row.try_get("committed_at")?,
        })
    }

    fn into_artifact(self) -> Result<ArtifactRef, RepositoryError> {
        Ok(ArtifactRef {
            tenant_id: self.tenant_id,
            run_id: parse_uuid(&self.run_id)?,
            step: self.step,
            revision: self.revision as u32,
            digest: self.digest,
            size_bytes: self.size_bytes as u64,
            summary: self.summary,
            committed_at: parse_datetime(&self.committed_at)?,
        })
    }
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn row_into_artifact(row: Option<sqlx::sqlite::SqliteRow>) -> Result<Option<ArtifactRef>, RepositoryError> {
    match row {
        Some(row) => Ok(Some(
            ArtifactRow::from_row(&row).map_err(query_error)?.into_artifact()?,
        )),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// ArtifactStore impl
// ---------------------------------------------------------------------------

impl ArtifactStore for SqliteArtifactStore {
    async fn put_blob(&self, digest: &str, bytes: &[u8]) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT OR IGNORE INTO blobs (digest, bytes, size_bytes, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(digest)
        .bind(bytes)
        .bind(bytes.len() as i64)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn read_blob(&self, digest: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        let row = sqlx::query("SELECT bytes FROM blobs WHERE digest = ?")
            .bind(digest)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(row.try_get("bytes").map_err(query_error)?)),
            None => Ok(None),
        }
    }

    async fn commit(&self, artifact: &ArtifactRef) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO artifacts
               (run_id, step, revision, tenant_id, digest, size_bytes, summary, committed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(artifact.run_id.to_string())
        .bind(&artifact.step)
        .bind(artifact.revision as i64)
        .bind(&artifact.tenant_id)
        .bind(&artifact.digest)
        .bind(artifact.size_bytes as i64)
        .bind(&artifact.summary)
        .bind(format_datetime(&artifact.committed_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            map_write_error(e, || {
                output_key(
                    &artifact.tenant_id,
                    &artifact.run_id,
                    &artifact.step,
                    artifact.revision,
                )
            })
        })?;

        Ok(())
    }

    async fn get_latest(&self, run_id: &Uuid, step: &str) -> Result<Option<ArtifactRef>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM artifacts WHERE run_id = ? AND step = ? ORDER BY revision DESC LIMIT 1",
        )
        .bind(run_id.to_string())
        .bind(step)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row_into_artifact(row)
    }

    async fn get_revision(
        &self,
        run_id: &Uuid,
        step: &str,
        revision: u32,
    ) -> Result<Option<ArtifactRef>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM artifacts WHERE run_id = ? AND step = ? AND revision = ?",
        )
        .bind(run_id.to_string())
        .bind(step)
        .bind(revision as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row_into_artifact(row)
    }

    async fn list_artifacts(&self, run_id: &Uuid) -> Result<Vec<ArtifactRef>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM artifacts WHERE run_id = ? ORDER BY step ASC, revision ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut artifacts = Vec::with_capacity(rows.len());
        for row in &rows {
            artifacts.push(ArtifactRow::from_row(row).map_err(query_error)?.into_artifact()?);
        }
        Ok(artifacts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use loomflow_core::service::hash::ContentHasher;
    use loomflow_core::workflow::idempotency::IdempotencyStore;
    use serde_json::json;

    use crate::crypto::hash::Sha256ContentHasher;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn artifact(run_id: Uuid, step: &str, revision: u32, digest: &str) -> ArtifactRef {
        ArtifactRef {
            tenant_id: "acme".to_string(),
            run_id,
            step: step.to_string(),
            revision,
            digest: digest.to_string(),
            size_bytes: 2,
            summary: format!("{step} r{revision}"),
            committed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_blob_is_stored_once_per_digest() {
        let store = SqliteArtifactStore::new(test_pool().await);

        store.put_blob("d1", b"first").await.unwrap();
        store.put_blob("d1", b"ignored").await.unwrap();

        assert_eq!(store.read_blob("d1").await.unwrap().unwrap(), b"first".to_vec());
        assert!(store.read_blob("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_is_write_once() {
        let store = SqliteArtifactStore::new(test_pool().await);
        let run_id = Uuid::now_v7();
        store.put_blob("d1", b"{}").await.unwrap();
        store.put_blob("d2", b"[]").await.unwrap();

        store.commit(&artifact(run_id, "outline", 0, "d1")).await.unwrap();
        let err = store
            .commit(&artifact(run_id, "outline", 0, "d2"))
            .await
            .unwrap_err();

        match err {
            RepositoryError::Conflict(key) => {
                assert_eq!(key, output_key("acme", &run_id, "outline", 0));
            }
            other => panic!("expected Conflict, got {other:?}"),
        }

        let stored = store.get_revision(&run_id, "outline", 0).await.unwrap().unwrap();
        assert_eq!(stored.digest, "d1");
    }

    #[tokio::test]
    async fn test_commit_requires_existing_blob() {
        let store = SqliteArtifactStore::new(test_pool().await);
        let err = store
            .commit(&artifact(Uuid::now_v7(), "outline", 0, "never-stored"))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Query(_)));
    }

    #[tokio::test]
    async fn test_latest_revision_wins() {
        let store = SqliteArtifactStore::new(test_pool().await);
        let run_id = Uuid::now_v7();
        store.put_blob("d1", b"{}").await.unwrap();
        store.put_blob("d2", b"[]").await.unwrap();

        store.commit(&artifact(run_id, "outline", 0, "d1")).await.unwrap();
        store.commit(&artifact(run_id, "outline", 1, "d2")).await.unwrap();
        store.commit(&artifact(run_id, "draft", 0, "d1")).await.unwrap();

        let latest = store.get_latest(&run_id, "outline").await.unwrap().unwrap();
        assert_eq!(latest.revision, 1);
        assert_eq!(latest.digest, "d2");
        assert!(store.get_latest(&run_id, "publish").await.unwrap().is_none());

        let keys: Vec<(String, u32)> = store
            .list_artifacts(&run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| (a.step, a.revision))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("draft".to_string(), 0),
                ("outline".to_string(), 0),
                ("outline".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_idempotency_store_over_sqlite() {
        let hasher = Arc::new(Sha256ContentHasher::new());
        let store = IdempotencyStore::new(
            SqliteArtifactStore::new(test_pool().await),
            hasher.clone(),
        );
        let run_id = Uuid::now_v7();
        let payload = json!({"sections": ["intro", "body"]});

        let stored = store.put_payload(&payload).await.unwrap();
        assert_eq!(
            stored.digest,
            hasher.compute_hash(&serde_json::to_vec(&payload).unwrap())
        );

        store
            .commit("acme", run_id, "outline", 0, &stored.digest, stored.size_bytes, "outline")
            .await
            .unwrap();

        let committed = store.get(run_id, "outline").await.unwrap().unwrap();
        assert_eq!(store.read_output(&committed).await.unwrap(), payload);
    }
}
