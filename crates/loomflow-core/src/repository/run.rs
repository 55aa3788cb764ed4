//! Run repository trait definition.
//!
//! Defines the storage interface for runs, step records, attempts, approval
//! gates, decisions and sub-workflow phase records. The infrastructure layer
//! (loomflow-infra) implements this trait with SQLite persistence.

use loomflow_types::approval::{ApprovalDecision, GateRecord};
use loomflow_types::error::RepositoryError;
use loomflow_types::phase::PhaseRecord;
use loomflow_types::run::{Run, RunStatus, StepAttempt, StepRecord};
use uuid::Uuid;

/// Repository trait for run state persistence.
///
/// Covers five entity families:
/// - **Runs:** create/update/query run records with their plan snapshot.
/// - **Steps:** upsert/query per-step records.
/// - **Attempts:** append attempts and close them exactly once.
/// - **Gates and decisions:** approval gate state and the append-only audit log.
/// - **Phases:** multi-phase sub-workflow state.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record.
    fn create_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace the mutable fields of an existing run.
    fn update_run(
        &self,
        run: &Run,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Run>, RepositoryError>> + Send;

    /// List a tenant's runs, newest first.
    fn list_runs(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    /// List runs in any of the given statuses across all tenants (crash recovery).
    fn list_runs_by_status(
        &self,
        statuses: &[RunStatus],
    ) -> impl std::future::Future<Output = Result<Vec<Run>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Insert or replace a step record keyed by (run, name).
    fn upsert_step(
        &self,
        step: &StepRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_step(
        &self,
        run_id: &Uuid,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepRecord>, RepositoryError>> + Send;

    /// List a run's step records in graph order (segment, then name).
    fn list_steps(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Append a new attempt. Fails with `Conflict` if the number is taken.
    fn create_attempt(
        &self,
        attempt: &StepAttempt,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Close a running attempt. Fails with `Conflict` if it already left `running`.
    fn finish_attempt(
        &self,
        attempt: &StepAttempt,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List attempts of a run, optionally for one step, ordered by (step, number).
    fn list_attempts(
        &self,
        run_id: &Uuid,
        step: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<StepAttempt>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Approval gates
    // -----------------------------------------------------------------------

    /// Insert or replace a gate record keyed by (run, gate_id).
    fn save_gate(
        &self,
        gate: &GateRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_gate(
        &self,
        run_id: &Uuid,
        gate_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<GateRecord>, RepositoryError>> + Send;

    fn list_gates(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<GateRecord>, RepositoryError>> + Send;

    /// Append an approval decision. Decisions are never updated or deleted.
    fn append_decision(
        &self,
        decision: &ApprovalDecision,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List a run's decisions in the order they were made.
    fn list_decisions(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalDecision>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    /// Insert or replace a phase record keyed by (run, step).
    fn save_phase(
        &self,
        record: &PhaseRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_phase(
        &self,
        run_id: &Uuid,
        step: &str,
    ) -> impl std::future::Future<Output = Result<Option<PhaseRecord>, RepositoryError>> + Send;

    fn list_phases(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<PhaseRecord>, RepositoryError>> + Send;
}
