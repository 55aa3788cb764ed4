//! Multi-phase sub-workflow state (the image-augmentation wizard).
//!
//! The phase is a tagged enum persisted together with the intermediate data
//! each phase produced, so a reconnecting client sees exactly where the
//! process stands. Transitions are defined in `loomflow-core`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current phase of a sub-workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ImagePhase {
    WaitingSettings,
    Analyzing,
    WaitingPositionReview,
    WaitingInstructions,
    /// Generating candidates for the listed position IDs.
    Generating { targets: Vec<String> },
    WaitingImageReview,
    Inserting,
    WaitingFinalReview,
    Completed,
    Skipped,
}

/// Data-free phase discriminant, used for restart targets and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    WaitingSettings,
    Analyzing,
    WaitingPositionReview,
    WaitingInstructions,
    Generating,
    WaitingImageReview,
    Inserting,
    WaitingFinalReview,
    Completed,
    Skipped,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::WaitingSettings => "waiting_settings",
            PhaseKind::Analyzing => "analyzing",
            PhaseKind::WaitingPositionReview => "waiting_position_review",
            PhaseKind::WaitingInstructions => "waiting_instructions",
            PhaseKind::Generating => "generating",
            PhaseKind::WaitingImageReview => "waiting_image_review",
            PhaseKind::Inserting => "inserting",
            PhaseKind::WaitingFinalReview => "waiting_final_review",
            PhaseKind::Completed => "completed",
            PhaseKind::Skipped => "skipped",
        }
    }

    /// Phases that wait on an external decision.
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            PhaseKind::WaitingSettings
                | PhaseKind::WaitingPositionReview
                | PhaseKind::WaitingInstructions
                | PhaseKind::WaitingImageReview
                | PhaseKind::WaitingFinalReview
        )
    }

    /// Phases driven by an external work call.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            PhaseKind::Analyzing | PhaseKind::Generating | PhaseKind::Inserting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseKind::Completed | PhaseKind::Skipped)
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ImagePhase {
    pub fn kind(&self) -> PhaseKind {
        match self {
            ImagePhase::WaitingSettings => PhaseKind::WaitingSettings,
            ImagePhase::Analyzing => PhaseKind::Analyzing,
            ImagePhase::WaitingPositionReview => PhaseKind::WaitingPositionReview,
            ImagePhase::WaitingInstructions => PhaseKind::WaitingInstructions,
            ImagePhase::Generating { .. } => PhaseKind::Generating,
            ImagePhase::WaitingImageReview => PhaseKind::WaitingImageReview,
            ImagePhase::Inserting => PhaseKind::Inserting,
            ImagePhase::WaitingFinalReview => PhaseKind::WaitingFinalReview,
            ImagePhase::Completed => PhaseKind::Completed,
            ImagePhase::Skipped => PhaseKind::Skipped,
        }
    }
}

/// A proposed insertion point for an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePosition {
    pub id: String,
    /// Where in the document the image goes (heading, paragraph index, ...).
    pub anchor: String,
    #[serde(default)]
    pub description: String,
}

/// A generated image candidate. The payload itself lives in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub digest: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub summary: String,
    /// Generation round that produced it.
    pub round: u32,
}

/// Intermediate data accumulated across phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    #[serde(default)]
    pub positions: Vec<ImagePosition>,
    /// Per-position generation instructions.
    #[serde(default)]
    pub instructions: BTreeMap<String, String>,
    /// Per-position generated candidates.
    #[serde(default)]
    pub candidates: BTreeMap<String, Candidate>,
    /// Document with images inserted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
    /// Completed generation rounds.
    #[serde(default)]
    pub round: u32,
}

/// Phase plus data: the full persisted state of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: ImagePhase,
    #[serde(default)]
    pub data: PhaseData,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            phase: ImagePhase::WaitingSettings,
            data: PhaseData::default(),
        }
    }
}

/// Persisted sub-workflow instance, one per phased step per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub run_id: Uuid,
    pub step: String,
    pub state: PhaseState,
    pub updated_at: DateTime<Utc>,
}

/// A generated image as returned by the work function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub summary: String,
}

/// Inputs to the phase transition function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PhaseEvent {
    SubmitSettings {
        settings: serde_json::Value,
    },
    Skip,
    /// Internal: analysis produced positions.
    AnalysisFinished {
        positions: Vec<ImagePosition>,
    },
    /// Optionally replaces the proposed positions with an edited list.
    ApprovePositions {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        positions: Option<Vec<ImagePosition>>,
    },
    SubmitInstructions {
        instructions: BTreeMap<String, String>,
    },
    /// Internal: generation produced candidates for the targets.
    GenerationFinished {
        candidates: BTreeMap<String, Candidate>,
    },
    ApproveAll,
    RetryImages {
        positions: Vec<String>,
        #[serde(default)]
        instructions: BTreeMap<String, String>,
    },
    /// Internal: insertion produced the final document.
    InsertionFinished {
        document: serde_json::Value,
    },
    Finalize,
    RestartFrom {
        phase: PhaseKind,
        #[serde(default)]
        clear_generated: bool,
    },
}

impl PhaseEvent {
    /// Events a client may submit. The `*Finished` events come only from the engine.
    pub fn is_external(&self) -> bool {
        !matches!(
            self,
            PhaseEvent::AnalysisFinished { .. }
                | PhaseEvent::GenerationFinished { .. }
                | PhaseEvent::InsertionFinished { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            PhaseEvent::SubmitSettings { .. } => "submit_settings",
            PhaseEvent::Skip => "skip",
            PhaseEvent::AnalysisFinished { .. } => "analysis_finished",
            PhaseEvent::ApprovePositions { .. } => "approve_positions",
            PhaseEvent::SubmitInstructions { .. } => "submit_instructions",
            PhaseEvent::GenerationFinished { .. } => "generation_finished",
            PhaseEvent::ApproveAll => "approve_all",
            PhaseEvent::RetryImages { .. } => "retry_images",
            PhaseEvent::InsertionFinished { .. } => "insertion_finished",
            PhaseEvent::Finalize => "finalize",
            PhaseEvent::RestartFrom { .. } => "restart_from",
        }
    }
}
