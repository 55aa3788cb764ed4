//! Committed step outputs.
//!
//! An `ArtifactRef` is the idempotency signal: once one exists for a
//! (run, step, revision) key, the step is never invoked again for that key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A committed, content-addressed step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub tenant_id: String,
    pub run_id: Uuid,
    pub step: String,
    /// 0 for the first commit; bumped by in-run bypass re-runs.
    pub revision: u32,
    /// Lowercase hex SHA-256 of the stored bytes.
    pub digest: String,
    pub size_bytes: u64,
    /// Short human-readable summary from the work function.
    pub summary: String,
    pub committed_at: DateTime<Utc>,
}

impl ArtifactRef {
    /// Logical storage key of this artifact.
    pub fn storage_key(&self) -> String {
        output_key(&self.tenant_id, &self.run_id, &self.step, self.revision)
    }
}

/// `{tenant}/{run}/{step}/output`, with an `r{n}` suffix for revisions after the first.
pub fn output_key(tenant_id: &str, run_id: &Uuid, step: &str, revision: u32) -> String {
    if revision == 0 {
        format!("{tenant_id}/{run_id}/{step}/output")
    } else {
        format!("{tenant_id}/{run_id}/{step}/output/r{revision}")
    }
}

/// `{tenant}/{run}/{step}/attempts/{n}`.
pub fn attempt_key(tenant_id: &str, run_id: &Uuid, step: &str, number: u32) -> String {
    format!("{tenant_id}/{run_id}/{step}/attempts/{number}")
}
