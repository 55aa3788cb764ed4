//! Transition function for the multi-phase image sub-workflow.
//!
//! `transition` is total over (phase, event): every pair either yields the
//! next state or an `IllegalTransition` error. The input state is never
//! mutated, so a rejected event leaves the persisted state untouched.

use loomflow_types::phase::{ImagePhase, PhaseEvent, PhaseKind, PhaseState};

/// Apply `event` to `state`, returning the next state.
pub fn transition(state: &PhaseState, event: PhaseEvent) -> Result<PhaseState, PhaseError> {
    let current = state.phase.kind();
    let mut data = state.data.clone();

    let phase = match (&state.phase, event) {
        (ImagePhase::WaitingSettings, PhaseEvent::SubmitSettings { settings }) => {
            data.settings = Some(settings);
            ImagePhase::Analyzing
        }
        (ImagePhase::WaitingSettings, PhaseEvent::Skip) => ImagePhase::Skipped,

        (ImagePhase::Analyzing, PhaseEvent::AnalysisFinished { positions }) => {
            data.positions = positions;
            prune_to_positions(&mut data);
            ImagePhase::WaitingPositionReview
        }

        (ImagePhase::WaitingPositionReview, PhaseEvent::ApprovePositions { positions }) => {
            if let Some(positions) = positions {
                data.positions = positions;
                prune_to_positions(&mut data);
            }
            if data.positions.is_empty() {
                return Err(PhaseError::InvalidEvent(
                    "at least one image position is required".to_string(),
                ));
            }
            ImagePhase::WaitingInstructions
        }

        (ImagePhase::WaitingInstructions, PhaseEvent::SubmitInstructions { instructions }) => {
            for id in instructions.keys() {
                if !data.positions.iter().any(|p| &p.id == id) {
                    return Err(PhaseError::InvalidEvent(format!("unknown position '{id}'")));
                }
            }
            data.instructions.extend(instructions);
            let targets: Vec<String> = data
                .positions
                .iter()
                .filter(|p| !data.candidates.contains_key(&p.id))
                .map(|p| p.id.clone())
                .collect();
            if targets.is_empty() {
                ImagePhase::WaitingImageReview
            } else {
                ImagePhase::Generating { targets }
            }
        }

        (ImagePhase::Generating { .. }, PhaseEvent::GenerationFinished { candidates }) => {
            data.candidates.extend(candidates);
            data.round += 1;
            ImagePhase::WaitingImageReview
        }

        (ImagePhase::WaitingImageReview, PhaseEvent::ApproveAll) => ImagePhase::Inserting,
        (
            ImagePhase::WaitingImageReview,
            PhaseEvent::RetryImages {
                positions,
                instructions,
            },
        ) => {
            if positions.is_empty() {
                return Err(PhaseError::InvalidEvent(
                    "retry requires at least one position".to_string(),
                ));
            }
            for id in positions.iter().chain(instructions.keys()) {
                if !data.positions.iter().any(|p| &p.id == id) {
                    return Err(PhaseError::InvalidEvent(format!("unknown position '{id}'")));
                }
            }
            data.instructions.extend(instructions);
            ImagePhase::Generating { targets: positions }
        }

        (ImagePhase::Inserting, PhaseEvent::InsertionFinished { document }) => {
            data.document = Some(document);
            ImagePhase::WaitingFinalReview
        }

        (ImagePhase::WaitingFinalReview, PhaseEvent::Finalize) => ImagePhase::Completed,

        (
            _,
            PhaseEvent::RestartFrom {
                phase: target,
                clear_generated,
            },
        ) if current.is_waiting() && target.is_waiting() && target <= current => {
            if clear_generated {
                data.candidates.clear();
                data.document = None;
            }
            waiting_phase(target)
        }

        (_, event) => {
            return Err(PhaseError::IllegalTransition {
                phase: current,
                event: event.name().to_string(),
            });
        }
    };

    Ok(PhaseState { phase, data })
}

fn waiting_phase(kind: PhaseKind) -> ImagePhase {
    match kind {
        PhaseKind::WaitingPositionReview => ImagePhase::WaitingPositionReview,
        PhaseKind::WaitingInstructions => ImagePhase::WaitingInstructions,
        PhaseKind::WaitingImageReview => ImagePhase::WaitingImageReview,
        PhaseKind::WaitingFinalReview => ImagePhase::WaitingFinalReview,
        _ => ImagePhase::WaitingSettings,
    }
}

/// Drop instructions and candidates for positions that no longer exist.
fn prune_to_positions(data: &mut loomflow_types::phase::PhaseData) {
    let ids: Vec<String> = data.positions.iter().map(|p| p.id.clone()).collect();
    data.instructions.retain(|id, _| ids.contains(id));
    data.candidates.retain(|id, _| ids.contains(id));
}

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("event '{event}' is not allowed in phase '{phase}'")]
    IllegalTransition { phase: PhaseKind, event: String },

    #[error("invalid phase event: {0}")]
    InvalidEvent(String),
}
