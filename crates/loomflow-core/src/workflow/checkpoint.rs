//! Durable checkpoint manager for run execution state.
//!
//! Wraps `RunRepository` to provide a higher-level API for recording run,
//! step, attempt, gate and phase transitions. Every transition is persisted
//! before the engine moves forward or suspends, so a crashed process resumes
//! by reloading state rather than replaying in-memory control flow.

use chrono::Utc;
use loomflow_types::approval::{ApprovalDecision, GateRecord};
use loomflow_types::phase::PhaseRecord;
use loomflow_types::run::{
    AttemptFinish, AttemptStatus, Run, RunStatus, StepAttempt, StepRecord,
};
use uuid::Uuid;

use crate::repository::run::RunRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for runs.
///
/// Generic over `R: RunRepository` so it works with any storage backend
/// (SQLite, in-memory test double, etc.).
pub struct CheckpointManager<R: RunRepository> {
    repo: R,
}

fn repo_err(e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Repository(e.to_string())
}

impl<R: RunRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    pub async fn create_run(&self, run: &Run) -> Result<(), CheckpointError> {
        self.repo.create_run(run).await.map_err(repo_err)?;
        tracing::debug!(run_id = %run.id, status = %run.status, "checkpointed run creation");
        Ok(())
    }

    /// Persist the run, stamping `updated_at`.
    pub async fn save_run(&self, run: &mut Run) -> Result<(), CheckpointError> {
        run.updated_at = Utc::now();
        self.repo.update_run(run).await.map_err(repo_err)?;
        tracing::debug!(
            run_id = %run.id,
            status = %run.status,
            cursor = run.cursor,
            "checkpointed run"
        );
        Ok(())
    }

    pub async fn load_run(&self, run_id: Uuid) -> Result<Run, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(repo_err)?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    pub async fn list_runs(&self, tenant_id: &str, limit: u32) -> Result<Vec<Run>, CheckpointError> {
        self.repo.list_runs(tenant_id, limit).await.map_err(repo_err)
    }

    /// Runs that a crash may have interrupted mid-segment.
    pub async fn interrupted_runs(&self) -> Result<Vec<Run>, CheckpointError> {
        self.repo
            .list_runs_by_status(&[RunStatus::Pending, RunStatus::Running])
            .await
            .map_err(repo_err)
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    pub async fn step(&self, run_id: Uuid, name: &str) -> Result<Option<StepRecord>, CheckpointError> {
        self.repo.get_step(&run_id, name).await.map_err(repo_err)
    }

    /// Load the step record, creating it as `pending` on first scheduling.
    pub async fn ensure_step(
        &self,
        run_id: Uuid,
        name: &str,
        segment: usize,
    ) -> Result<StepRecord, CheckpointError> {
        if let Some(existing) = self.step(run_id, name).await? {
            return Ok(existing);
        }
        let record = StepRecord::new(run_id, name, segment);
        self.repo.upsert_step(&record).await.map_err(repo_err)?;
        tracing::debug!(run_id = %run_id, step = name, "checkpointed step scheduled");
        Ok(record)
    }

    /// Persist the step record, stamping `updated_at`.
    pub async fn save_step(&self, step: &mut StepRecord) -> Result<(), CheckpointError> {
        step.updated_at = Utc::now();
        self.repo.upsert_step(step).await.map_err(repo_err)?;
        tracing::debug!(
            run_id = %step.run_id,
            step = step.name.as_str(),
            status = %step.status,
            revision = step.revision,
            "checkpointed step"
        );
        Ok(())
    }

    pub async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, CheckpointError> {
        self.repo.list_steps(&run_id).await.map_err(repo_err)
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Open the next attempt for a step.
    ///
    /// Attempt numbers are monotonic per (run, step) across revisions.
    pub async fn start_attempt(
        &self,
        run_id: Uuid,
        step: &str,
        revision: u32,
        feedback: &[String],
    ) -> Result<StepAttempt, CheckpointError> {
        let previous = self
            .repo
            .list_attempts(&run_id, Some(step))
            .await
            .map_err(repo_err)?;
        let number = previous.iter().map(|a| a.number).max().unwrap_or(0) + 1;

        let attempt = StepAttempt {
            run_id,
            step: step.to_string(),
            number,
            revision,
            status: AttemptStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            repairs: Vec::new(),
            warnings: Vec::new(),
            quality_score: None,
            feedback: feedback.to_vec(),
        };
        self.repo.create_attempt(&attempt).await.map_err(repo_err)?;

        tracing::debug!(run_id = %run_id, step, attempt = number, revision, "checkpointed attempt start");
        Ok(attempt)
    }

    /// Move a running attempt to its terminal status. Attempts leave `running` once.
    pub async fn finish_attempt(
        &self,
        attempt: &mut StepAttempt,
        status: AttemptStatus,
        finish: AttemptFinish,
    ) -> Result<(), CheckpointError> {
        if attempt.status != AttemptStatus::Running {
            return Err(CheckpointError::AttemptClosed {
                step: attempt.step.clone(),
                number: attempt.number,
            });
        }
        attempt.status = status;
        attempt.finished_at = Some(Utc::now());
        attempt.error = finish.error;
        attempt.repairs = finish.repairs;
        attempt.warnings = finish.warnings;
        attempt.quality_score = finish.quality_score;

        self.repo.finish_attempt(attempt).await.map_err(repo_err)?;

        tracing::debug!(
            run_id = %attempt.run_id,
            step = attempt.step.as_str(),
            attempt = attempt.number,
            status = attempt.status.as_str(),
            "checkpointed attempt finish"
        );
        Ok(())
    }

    pub async fn list_attempts(
        &self,
        run_id: Uuid,
        step: Option<&str>,
    ) -> Result<Vec<StepAttempt>, CheckpointError> {
        self.repo.list_attempts(&run_id, step).await.map_err(repo_err)
    }

    // -----------------------------------------------------------------------
    // Gates and decisions
    // -----------------------------------------------------------------------

    pub async fn gate(&self, run_id: Uuid, gate_id: &str) -> Result<Option<GateRecord>, CheckpointError> {
        self.repo.get_gate(&run_id, gate_id).await.map_err(repo_err)
    }

    pub async fn save_gate(&self, gate: &mut GateRecord) -> Result<(), CheckpointError> {
        gate.updated_at = Utc::now();
        self.repo.save_gate(gate).await.map_err(repo_err)?;
        tracing::debug!(
            run_id = %gate.run_id,
            gate = gate.gate_id.as_str(),
            state = %gate.state,
            round = gate.round,
            "checkpointed gate"
        );
        Ok(())
    }

    pub async fn list_gates(&self, run_id: Uuid) -> Result<Vec<GateRecord>, CheckpointError> {
        self.repo.list_gates(&run_id).await.map_err(repo_err)
    }

    pub async fn append_decision(&self, decision: &ApprovalDecision) -> Result<(), CheckpointError> {
        self.repo.append_decision(decision).await.map_err(repo_err)
    }

    pub async fn list_decisions(&self, run_id: Uuid) -> Result<Vec<ApprovalDecision>, CheckpointError> {
        self.repo.list_decisions(&run_id).await.map_err(repo_err)
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    pub async fn phase(&self, run_id: Uuid, step: &str) -> Result<Option<PhaseRecord>, CheckpointError> {
        self.repo.get_phase(&run_id, step).await.map_err(repo_err)
    }

    pub async fn save_phase(&self, record: &mut PhaseRecord) -> Result<(), CheckpointError> {
        record.updated_at = Utc::now();
        self.repo.save_phase(record).await.map_err(repo_err)?;
        tracing::debug!(
            run_id = %record.run_id,
            step = record.step.as_str(),
            phase = %record.state.phase.kind(),
            "checkpointed phase"
        );
        Ok(())
    }

    pub async fn list_phases(&self, run_id: Uuid) -> Result<Vec<PhaseRecord>, CheckpointError> {
        self.repo.list_phases(&run_id).await.map_err(repo_err)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// The attempt already reached a terminal status.
    #[error("attempt {number} of step '{step}' is already closed")]
    AttemptClosed { step: String, number: u32 },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
