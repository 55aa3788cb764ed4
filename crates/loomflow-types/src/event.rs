//! Event types for the Loomflow run event bus.
//!
//! `RunEvent` is broadcast on every observable run transition. Delivery is
//! at-least-once with no ordering guarantee across runs; consumers that fall
//! behind re-fetch the run snapshot instead of replaying events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::PhaseKind;
use crate::run::{ErrorCode, RunStatus};

/// Progress events emitted by the run coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunCreated {
        run_id: Uuid,
        pipeline: String,
        timestamp: DateTime<Utc>,
    },

    StepStarted {
        run_id: Uuid,
        step: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    StepCompleted {
        run_id: Uuid,
        step: String,
        digest: String,
        /// True when the output came from the idempotency store.
        cache_hit: bool,
        timestamp: DateTime<Utc>,
    },

    StepFailed {
        run_id: Uuid,
        step: String,
        code: ErrorCode,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// The run suspended on a human decision.
    RunWaiting {
        run_id: Uuid,
        /// Gate, group or phased step the run waits on.
        step: Option<String>,
        status: RunStatus,
        timestamp: DateTime<Utc>,
    },

    PhaseChanged {
        run_id: Uuid,
        step: String,
        phase: PhaseKind,
        timestamp: DateTime<Utc>,
    },

    RunCompleted {
        run_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    RunFailed {
        run_id: Uuid,
        step: Option<String>,
        message: String,
        timestamp: DateTime<Utc>,
    },

    RunCancelled {
        run_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunCreated { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::RunWaiting { run_id, .. }
            | RunEvent::PhaseChanged { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunFailed { run_id, .. }
            | RunEvent::RunCancelled { run_id, .. } => *run_id,
        }
    }

    /// Step the event refers to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            RunEvent::StepStarted { step, .. }
            | RunEvent::StepCompleted { step, .. }
            | RunEvent::StepFailed { step, .. }
            | RunEvent::PhaseChanged { step, .. } => Some(step),
            RunEvent::RunWaiting { step, .. } | RunEvent::RunFailed { step, .. } => {
                step.as_deref()
            }
            _ => None,
        }
    }
}
