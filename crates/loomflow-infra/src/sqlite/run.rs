//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `loomflow-core` using sqlx with split
//! read/write pools. The run plan, failures, validation reports and phase
//! state are stored as JSON text columns; statuses are stored as their
//! snake_case names so they stay queryable.

use loomflow_core::repository::run::RunRepository;
use loomflow_types::approval::{ApprovalDecision, GateRecord, GateState};
use loomflow_types::error::RepositoryError;
use loomflow_types::phase::PhaseRecord;
use loomflow_types::run::{Run, RunStatus, StepAttempt, StepRecord};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, map_write_error, parse_datetime, parse_enum, parse_json, parse_uuid, to_json};

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    tenant_id: String,
    pipeline: String,
    status: String,
    cursor: i64,
    current_step: Option<String>,
    plan: String,
    input: String,
    forked_from: Option<String>,
    failure: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            pipeline: row.try_get("pipeline")?,
            status: row.try_get("status")?,
            cursor: row.try_get("cursor")?,
            current_step: row.try_get("current_step")?,
            plan: row.try_get("plan")?,
            input: row.try_get("input")?,
            forked_from: row.try_get("forked_from")?,
            failure: row.try_get("failure")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<Run, RepositoryError> {
        Ok(Run {
            id: parse_uuid(&self.id)?,
            tenant_id: self.tenant_id,
            pipeline: self.pipeline,
            status: parse_enum(&self.status, "run status")?,
            cursor: self.cursor as usize,
            current_step: self.current_step,
            plan: parse_json(&self.plan, "run plan")?,
            input: parse_json(&self.input, "run input")?,
            forked_from: self.forked_from.as_deref().map(parse_uuid).transpose()?,
            failure: self
                .failure
                .as_deref()
                .map(|s| parse_json(s, "run failure"))
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    run_id: String,
    name: String,
    segment: i64,
    status: String,
    revision: i64,
    error: Option<String>,
    validation: Option<String>,
    warnings: String,
    feedback: String,
    created_at: String,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            name: row.try_get("name")?,
            segment: row.try_get("segment")?,
            status: row.try_get("status")?,
            revision: row.try_get("revision")?,
            error: row.try_get("error")?,
            validation: row.try_get("validation")?,
            warnings: row.try_get("warnings")?,
            feedback: row.try_get("feedback")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_step(self) -> Result<StepRecord, RepositoryError> {
        Ok(StepRecord {
            run_id: parse_uuid(&self.run_id)?,
            name: self.name,
            segment: self.segment as usize,
            status: parse_enum(&self.status, "step status")?,
            revision: self.revision as u32,
            error: self
                .error
                .as_deref()
                .map(|s| parse_json(s, "step error"))
                .transpose()?,
            validation: self
                .validation
                .as_deref()
                .map(|s| parse_json(s, "validation report"))
                .transpose()?,
            warnings: parse_json(&self.warnings, "step warnings")?,
            feedback: parse_json(&self.feedback, "step feedback")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct AttemptRow {
    run_id: String,
    step: String,
    number: i64,
    revision: i64,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    error: Option<String>,
    repairs: String,
    warnings: String,
    quality_score: Option<f64>,
    feedback: String,
}

impl AttemptRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step: row.try_get("step")?,
            number: row.try_get("number")?,
            revision: row.try_get("revision")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            error: row.try_get("error")?,
            repairs: row.try_get("repairs")?,
            warnings: row.try_get("warnings")?,
            quality_score: row.try_get("quality_score")?,
            feedback: row.try_get("feedback")?,
        })
    }

    fn into_attempt(self) -> Result<StepAttempt, RepositoryError> {
        Ok(StepAttempt {
            run_id: parse_uuid(&self.run_id)?,
            step: self.step,
            number: self.number as u32,
            revision: self.revision as u32,
            status: parse_enum(&self.status, "attempt status")?,
            started_at: parse_datetime(&self.started_at)?,
            finished_at: self.finished_at.as_deref().map(parse_datetime).transpose()?,
            error: self
                .error
                .as_deref()
                .map(|s| parse_json(s, "attempt error"))
                .transpose()?,
            repairs: parse_json(&self.repairs, "attempt repairs")?,
            warnings: parse_json(&self.warnings, "attempt warnings")?,
            quality_score: self.quality_score,
            feedback: parse_json(&self.feedback, "attempt feedback")?,
        })
    }
}

struct GateRow {
    run_id: String,
    gate_id: String,
    state: String,
    round: i64,
    updated_at: String,
}

impl GateRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            gate_id: row.try_get("gate_id")?,
            state: row.try_get("state")?,
            round: row.try_get("round")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_gate(self) -> Result<GateRecord, RepositoryError> {
        let state: GateState = parse_enum(&self.state, "gate state")?;
        Ok(GateRecord {
            run_id: parse_uuid(&self.run_id)?,
            gate_id: self.gate_id,
            state,
            round: self.round as u32,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct DecisionRow {
    id: String,
    run_id: String,
    gate_id: String,
    decision: String,
    reason: Option<String>,
    revision: Option<i64>,
    actor: String,
    decided_at: String,
}

impl DecisionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            gate_id: row.try_get("gate_id")?,
            decision: row.try_get("decision")?,
            reason: row.try_get("reason")?,
            revision: row.try_get("revision")?,
            actor: row.try_get("actor")?,
            decided_at: row.try_get("decided_at")?,
        })
    }

    fn into_decision(self) -> Result<ApprovalDecision, RepositoryError> {
        Ok(ApprovalDecision {
            id: parse_uuid(&self.id)?,
            run_id: parse_uuid(&self.run_id)?,
            gate_id: self.gate_id,
            decision: parse_enum(&self.decision, "decision")?,
            reason: self.reason,
            revision: self.revision.map(|r| r as u32),
            actor: self.actor,
            decided_at: parse_datetime(&self.decided_at)?,
        })
    }
}

struct PhaseRow {
    run_id: String,
    step: String,
    state: String,
    updated_at: String,
}

impl PhaseRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step: row.try_get("step")?,
            state: row.try_get("state")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_phase(self) -> Result<PhaseRecord, RepositoryError> {
        Ok(PhaseRecord {
            run_id: parse_uuid(&self.run_id)?,
            step: self.step,
            state: parse_json(&self.state, "phase state")?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

const RUN_COLUMNS: &str = "id, tenant_id, pipeline, status, cursor, current_step, plan, input, \
     forked_from, failure, created_at, updated_at";

fn rows_into_runs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Run>, RepositoryError> {
    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        runs.push(RunRow::from_row(row).map_err(query_error)?.into_run()?);
    }
    Ok(runs)
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    // -- Runs -------------------------------------------------------------------

    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let failure = run.failure.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO runs
               (id, tenant_id, pipeline, status, cursor, current_step, plan, input,
                forked_from, failure, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.tenant_id)
        .bind(&run.pipeline)
        .bind(run.status.as_str())
        .bind(run.cursor as i64)
        .bind(&run.current_step)
        .bind(to_json(&run.plan)?)
        .bind(to_json(&run.input)?)
        .bind(run.forked_from.map(|id| id.to_string()))
        .bind(&failure)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| map_write_error(e, || format!("run {}", run.id)))?;

        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let failure = run.failure.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"UPDATE runs SET
                 status = ?, cursor = ?, current_step = ?, failure = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(run.status.as_str())
        .bind(run.cursor as i64)
        .bind(&run.current_step)
        .bind(&failure)
        .bind(format_datetime(&run.updated_at))
        .bind(run.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(RunRow::from_row(&row).map_err(query_error)?.into_run()?)),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, tenant_id: &str, limit: u32) -> Result<Vec<Run>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE tenant_id = ? ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows_into_runs(&rows)
    }

    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<Run>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status IN ({placeholders}) ORDER BY created_at ASC, id ASC"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows_into_runs(&rows)
    }

    // -- Steps ------------------------------------------------------------------

    async fn upsert_step(&self, step: &StepRecord) -> Result<(), RepositoryError> {
        let error = step.error.as_ref().map(to_json).transpose()?;
        let validation = step.validation.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO step_records
               (run_id, name, segment, status, revision, error, validation, warnings, feedback,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, name) DO UPDATE SET
                 segment = excluded.segment,
                 status = excluded.status,
                 revision = excluded.revision,
                 error = excluded.error,
                 validation = excluded.validation,
                 warnings = excluded.warnings,
                 feedback = excluded.feedback,
                 updated_at = excluded.updated_at"#,
        )
        .bind(step.run_id.to_string())
        .bind(&step.name)
        .bind(step.segment as i64)
        .bind(step.status.as_str())
        .bind(step.revision as i64)
        .bind(&error)
        .bind(&validation)
        .bind(to_json(&step.warnings)?)
        .bind(to_json(&step.feedback)?)
        .bind(format_datetime(&step.created_at))
        .bind(format_datetime(&step.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_step(&self, run_id: &Uuid, name: &str) -> Result<Option<StepRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM step_records WHERE run_id = ? AND name = ?")
            .bind(run_id.to_string())
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(StepRow::from_row(&row).map_err(query_error)?.into_step()?)),
            None => Ok(None),
        }
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_records WHERE run_id = ? ORDER BY segment ASC, name ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            steps.push(StepRow::from_row(row).map_err(query_error)?.into_step()?);
        }
        Ok(steps)
    }

    // -- Attempts ---------------------------------------------------------------

    async fn create_attempt(&self, attempt: &StepAttempt) -> Result<(), RepositoryError> {
        let error = attempt.error.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO step_attempts
               (run_id, step, number, revision, status, started_at, finished_at, error,
                repairs, warnings, quality_score, feedback)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(attempt.run_id.to_string())
        .bind(&attempt.step)
        .bind(attempt.number as i64)
        .bind(attempt.revision as i64)
        .bind(attempt.status.as_str())
        .bind(format_datetime(&attempt.started_at))
        .bind(attempt.finished_at.as_ref().map(format_datetime))
        .bind(&error)
        .bind(to_json(&attempt.repairs)?)
        .bind(to_json(&attempt.warnings)?)
        .bind(attempt.quality_score)
        .bind(to_json(&attempt.feedback)?)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            map_write_error(e, || {
                format!("{}/{}/attempts/{}", attempt.run_id, attempt.step, attempt.number)
            })
        })?;

        Ok(())
    }

    async fn finish_attempt(&self, attempt: &StepAttempt) -> Result<(), RepositoryError> {
        let error = attempt.error.as_ref().map(to_json).transpose()?;

        // Conditional on `running` so an attempt is closed exactly once.
        let result = sqlx::query(
            r#"UPDATE step_attempts SET
                 status = ?, finished_at = ?, error = ?, repairs = ?, warnings = ?, quality_score = ?
               WHERE run_id = ? AND step = ? AND number = ? AND status = 'running'"#,
        )
        .bind(attempt.status.as_str())
        .bind(attempt.finished_at.as_ref().map(format_datetime))
        .bind(&error)
        .bind(to_json(&attempt.repairs)?)
        .bind(to_json(&attempt.warnings)?)
        .bind(attempt.quality_score)
        .bind(attempt.run_id.to_string())
        .bind(&attempt.step)
        .bind(attempt.number as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists: Option<(i64,)> = sqlx::query_as(
            "SELECT number FROM step_attempts WHERE run_id = ? AND step = ? AND number = ?",
        )
        .bind(attempt.run_id.to_string())
        .bind(&attempt.step)
        .bind(attempt.number as i64)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_error)?;

        match exists {
            Some(_) => Err(RepositoryError::Conflict(format!(
                "{}/{}/attempts/{}",
                attempt.run_id, attempt.step, attempt.number
            ))),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_attempts(
        &self,
        run_id: &Uuid,
        step: Option<&str>,
    ) -> Result<Vec<StepAttempt>, RepositoryError> {
        let rows = match step {
            Some(step) => {
                sqlx::query(
                    "SELECT * FROM step_attempts WHERE run_id = ? AND step = ? ORDER BY number ASC",
                )
                .bind(run_id.to_string())
                .bind(step)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM step_attempts WHERE run_id = ? ORDER BY step ASC, number ASC",
                )
                .bind(run_id.to_string())
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        let mut attempts = Vec::with_capacity(rows.len());
        for row in &rows {
            attempts.push(AttemptRow::from_row(row).map_err(query_error)?.into_attempt()?);
        }
        Ok(attempts)
    }

    // -- Approval gates ---------------------------------------------------------

    async fn save_gate(&self, gate: &GateRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO approval_gates (run_id, gate_id, state, round, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(run_id, gate_id) DO UPDATE SET
                 state = excluded.state,
                 round = excluded.round,
                 updated_at = excluded.updated_at"#,
        )
        .bind(gate.run_id.to_string())
        .bind(&gate.gate_id)
        .bind(gate.state.as_str())
        .bind(gate.round as i64)
        .bind(format_datetime(&gate.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_gate(&self, run_id: &Uuid, gate_id: &str) -> Result<Option<GateRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM approval_gates WHERE run_id = ? AND gate_id = ?")
            .bind(run_id.to_string())
            .bind(gate_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(GateRow::from_row(&row).map_err(query_error)?.into_gate()?)),
            None => Ok(None),
        }
    }

    async fn list_gates(&self, run_id: &Uuid) -> Result<Vec<GateRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM approval_gates WHERE run_id = ? ORDER BY gate_id ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut gates = Vec::with_capacity(rows.len());
        for row in &rows {
            gates.push(GateRow::from_row(row).map_err(query_error)?.into_gate()?);
        }
        Ok(gates)
    }

    async fn append_decision(&self, decision: &ApprovalDecision) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO approval_decisions
               (id, run_id, gate_id, decision, reason, revision, actor, decided_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(decision.id.to_string())
        .bind(decision.run_id.to_string())
        .bind(&decision.gate_id)
        .bind(decision.decision.as_str())
        .bind(&decision.reason)
        .bind(decision.revision.map(i64::from))
        .bind(&decision.actor)
        .bind(format_datetime(&decision.decided_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| map_write_error(e, || format!("decision {}", decision.id)))?;

        Ok(())
    }

    async fn list_decisions(&self, run_id: &Uuid) -> Result<Vec<ApprovalDecision>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, run_id, gate_id, decision, reason, revision, actor, decided_at
               FROM approval_decisions WHERE run_id = ? ORDER BY seq ASC"#,
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut decisions = Vec::with_capacity(rows.len());
        for row in &rows {
            decisions.push(DecisionRow::from_row(row).map_err(query_error)?.into_decision()?);
        }
        Ok(decisions)
    }

    // -- Phases -----------------------------------------------------------------

    async fn save_phase(&self, record: &PhaseRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO phase_records (run_id, step, state, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(run_id, step) DO UPDATE SET
                 state = excluded.state,
                 updated_at = excluded.updated_at"#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.step)
        .bind(to_json(&record.state)?)
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_phase(&self, run_id: &Uuid, step: &str) -> Result<Option<PhaseRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM phase_records WHERE run_id = ? AND step = ?")
            .bind(run_id.to_string())
            .bind(step)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => Ok(Some(PhaseRow::from_row(&row).map_err(query_error)?.into_phase()?)),
            None => Ok(None),
        }
    }

    async fn list_phases(&self, run_id: &Uuid) -> Result<Vec<PhaseRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM phase_records WHERE run_id = ? ORDER BY step ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut phases = Vec::with_capacity(rows.len());
        for row in &rows {
            phases.push(PhaseRow::from_row(row).map_err(query_error)?.into_phase()?);
        }
        Ok(phases)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
