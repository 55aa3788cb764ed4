//! Run, step, and attempt tracking types.
//!
//! A `Run` is one end-to-end execution of a `RunPlan`. Steps and attempts are
//! the durable audit trail: every suspension point writes these records
//! before the engine yields, so a restarted process can pick up from the
//! persisted state rather than replaying in-memory control flow.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::{ApprovalDecision, GateRecord};
use crate::artifact::ArtifactRef;
use crate::phase::PhaseRecord;
use crate::pipeline::RunPlan;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingApproval,
    WaitingImageInput,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::WaitingImageInput => "waiting_image_input",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// `completed`, `failed` and `cancelled` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Suspended on an external decision. Not an error state.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            RunStatus::WaitingApproval | RunStatus::WaitingImageInput
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// A step that needs no further work for its current revision.
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Engine-wide failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Transient; retried under bounded backoff.
    Retryable,
    /// Terminal; surfaced immediately.
    NonRetryable,
    /// Output failed structural validation; terminal.
    ValidationFail,
    /// Produced only by the quality retry loop.
    QualityBelowThreshold,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Retryable => "RETRYABLE",
            ErrorCode::NonRetryable => "NON_RETRYABLE",
            ErrorCode::ValidationFail => "VALIDATION_FAIL",
            ErrorCode::QualityBelowThreshold => "QUALITY_BELOW_THRESHOLD",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error attached to an attempt or step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub code: ErrorCode,
    pub message: String,
}

impl StepError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// The failing step.
    pub step: String,
    /// Its last error code.
    pub code: ErrorCode,
    /// Its last error message.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Result of validating a step's output before it is committed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    /// Format tag the output was checked against (e.g. "json").
    pub format: String,
    #[serde(default)]
    pub errors: Vec<ValidationIssue>,
    #[serde(default)]
    pub warnings: Vec<ValidationIssue>,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One execution of a pipeline for one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Pipeline name (denormalized from the plan for listing).
    pub pipeline: String,
    pub status: RunStatus,
    /// Index of the segment being processed.
    pub cursor: usize,
    /// Step or gate the run is currently at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Resolved step-graph snapshot.
    pub plan: RunPlan,
    /// Initial input payload.
    pub input: serde_json::Value,
    /// Source run when this run was created by a resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: Uuid,
    pub name: String,
    /// Index of the owning segment in the run plan.
    pub segment: usize,
    pub status: StepStatus,
    /// Artifact revision the next commit targets. Bumped by bypass re-runs.
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    /// Non-fatal warnings (e.g. QUALITY_BELOW_THRESHOLD accepted on final attempt).
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Pending instructions folded into the next invocation.
    #[serde(default)]
    pub feedback: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(run_id: Uuid, name: &str, segment: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            name: name.to_string(),
            segment,
            status: StepStatus::Pending,
            revision: 0,
            error: None,
            validation: None,
            warnings: Vec::new(),
            feedback: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One try of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    pub run_id: Uuid,
    pub step: String,
    /// 1-based, monotonic per (run, step).
    pub number: u32,
    /// Artifact revision this attempt was producing.
    pub revision: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Deterministic repairs applied to the output.
    #[serde(default)]
    pub repairs: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    /// Feedback the invocation was given.
    #[serde(default)]
    pub feedback: Vec<String>,
}

/// Terminal bookkeeping written when an attempt leaves `running`.
#[derive(Debug, Clone, Default)]
pub struct AttemptFinish {
    pub error: Option<StepError>,
    pub repairs: Vec<String>,
    pub warnings: Vec<String>,
    pub quality_score: Option<f64>,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Full read model for `GET /runs/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: Run,
    pub steps: Vec<StepSnapshot>,
    pub gates: Vec<GateRecord>,
    pub decisions: Vec<ApprovalDecision>,
    pub phases: Vec<PhaseRecord>,
}

/// A step with its attempt history and latest artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub step: StepRecord,
    pub attempts: Vec<StepAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
