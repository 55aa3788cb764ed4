//! Human checkpoint types: approval gates, decisions, and parallel-group review.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::ErrorCode;

// ---------------------------------------------------------------------------
// Approval gate
// ---------------------------------------------------------------------------

/// Approval gate lifecycle: `armed -> waiting -> {approved, rejected}`.
/// A rejected gate re-arms back to `waiting` once the rejection branch has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Armed,
    Waiting,
    Approved,
    Rejected,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Armed => "armed",
            GateState::Waiting => "waiting",
            GateState::Approved => "approved",
            GateState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of one gate in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub run_id: Uuid,
    pub gate_id: String,
    pub state: GateState,
    /// Number of times the gate has entered `waiting`.
    pub round: u32,
    pub updated_at: DateTime<Utc>,
}

/// An approve/reject verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

/// Append-only audit record of a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Gate ID, or `{group}/{step}` for a parallel-group review decision.
    pub gate_id: String,
    pub decision: Decision,
    /// Required when `decision` is `reject`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Output revision a group review decision was made against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    pub actor: String,
    pub decided_at: DateTime<Utc>,
}

/// Gate ID under which a group member's review decisions are recorded.
pub fn review_gate_id(group_id: &str, step: &str) -> String {
    format!("{group_id}/{step}")
}

// ---------------------------------------------------------------------------
// Parallel group
// ---------------------------------------------------------------------------

/// Per-step review verdict for a parallel group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    /// Re-invoke only this step with `instruction` folded into its input.
    Retry { instruction: String },
}

/// Outcome of one group member after the group settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed {
        digest: String,
        cache_hit: bool,
    },
    Failed {
        code: ErrorCode,
        message: String,
    },
    /// Completed and awaiting a review decision.
    PendingReview {
        digest: String,
        summary: String,
    },
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

/// Per-step outcomes of a parallel group, keyed by step name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub group_id: String,
    pub outcomes: BTreeMap<String, StepOutcome>,
}

impl GroupResult {
    pub fn failed_steps(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_failed())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn pending_review(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StepOutcome::PendingReview { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
