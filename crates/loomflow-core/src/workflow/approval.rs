//! Approval gate state machine: `armed -> waiting -> {approved, rejected}`.
//!
//! Arming suspends the run in `waiting_approval`. `decide` is the only way
//! out; a rejection is re-armable (`rejected -> waiting`, next round) once
//! the rejection branch has produced a new candidate.

use std::sync::Arc;

use chrono::Utc;
use loomflow_types::approval::{ApprovalDecision, Decision, GateRecord, GateState};
use loomflow_types::run::{Run, RunStatus};
use uuid::Uuid;

use crate::repository::run::RunRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};

pub struct ApprovalGate<R: RunRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
}

impl<R: RunRepository> ApprovalGate<R> {
    pub fn new(checkpoint: Arc<CheckpointManager<R>>) -> Self {
        Self { checkpoint }
    }

    /// Arm the gate and suspend the run on it.
    ///
    /// A gate already waiting keeps its round; a rejected gate re-arms into
    /// the next round. An approved gate is returned unchanged and the run is
    /// left alone.
    pub async fn arm(&self, run: &mut Run, gate_id: &str) -> Result<GateRecord, GateError> {
        let existing = self.checkpoint.gate(run.id, gate_id).await?;
        let gate = match existing {
            Some(gate) if gate.state == GateState::Approved => return Ok(gate),
            Some(gate) if gate.state == GateState::Waiting => gate,
            Some(mut gate) => {
                gate.state = GateState::Waiting;
                gate.round += 1;
                self.checkpoint.save_gate(&mut gate).await?;
                gate
            }
            None => {
                let mut gate = GateRecord {
                    run_id: run.id,
                    gate_id: gate_id.to_string(),
                    state: GateState::Waiting,
                    round: 1,
                    updated_at: Utc::now(),
                };
                self.checkpoint.save_gate(&mut gate).await?;
                gate
            }
        };

        run.status = RunStatus::WaitingApproval;
        run.current_step = Some(gate_id.to_string());
        self.checkpoint.save_run(run).await?;

        tracing::info!(run_id = %run.id, gate = gate_id, round = gate.round, "approval gate armed");
        Ok(gate)
    }

    /// Record a decision on a waiting gate.
    ///
    /// A reject without a non-empty reason fails before any state is read or
    /// written. Approve puts the run back to `running`; reject leaves the run
    /// waiting for the rejection branch to be scheduled.
    pub async fn decide(
        &self,
        run: &mut Run,
        gate_id: &str,
        decision: Decision,
        reason: Option<&str>,
        actor: &str,
    ) -> Result<ApprovalDecision, GateError> {
        let reason = normalize_reason(decision, reason)?;

        let mut gate = self
            .checkpoint
            .gate(run.id, gate_id)
            .await?
            .ok_or_else(|| GateError::NotArmed(gate_id.to_string()))?;
        if gate.state != GateState::Waiting {
            return Err(GateError::InvalidState {
                gate: gate_id.to_string(),
                state: gate.state,
            });
        }

        let record = ApprovalDecision {
            id: Uuid::now_v7(),
            run_id: run.id,
            gate_id: gate_id.to_string(),
            decision,
            reason,
            revision: None,
            actor: actor.to_string(),
            decided_at: Utc::now(),
        };
        self.checkpoint.append_decision(&record).await?;

        gate.state = match decision {
            Decision::Approve => GateState::Approved,
            Decision::Reject => GateState::Rejected,
        };
        self.checkpoint.save_gate(&mut gate).await?;

        if decision == Decision::Approve {
            run.status = RunStatus::Running;
            run.current_step = None;
            self.checkpoint.save_run(run).await?;
        }

        tracing::info!(
            run_id = %run.id,
            gate = gate_id,
            decision = decision.as_str(),
            actor,
            round = gate.round,
            "approval decision recorded"
        );
        Ok(record)
    }

    /// Move a rejected gate back to `waiting` for its next round.
    pub async fn rearm(&self, run: &mut Run, gate_id: &str) -> Result<GateRecord, GateError> {
        let gate = self.checkpoint.gate(run.id, gate_id).await?;
        match gate {
            Some(gate) if gate.state != GateState::Rejected => Err(GateError::InvalidState {
                gate: gate_id.to_string(),
                state: gate.state,
            }),
            _ => self.arm(run, gate_id).await,
        }
    }
}

/// A reject needs a non-empty reason. Approve reasons are optional.
pub fn normalize_reason(decision: Decision, reason: Option<&str>) -> Result<Option<String>, GateError> {
    let reason = reason.map(str::trim).filter(|r| !r.is_empty());
    match (decision, reason) {
        (Decision::Reject, None) => Err(GateError::ReasonRequired),
        (_, reason) => Ok(reason.map(str::to_string)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("a rejection requires a non-empty reason")]
    ReasonRequired,

    #[error("gate '{0}' is not armed")]
    NotArmed(String),

    #[error("gate '{gate}' is {state}, not waiting")]
    InvalidState { gate: String, state: GateState },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}
