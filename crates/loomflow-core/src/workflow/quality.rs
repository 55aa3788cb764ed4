//! Quality retry loop for steps whose output carries a score in [0, 1].
//!
//! Each round calls the executor's `attempt` with the previous round's score
//! and issues folded into the feedback. The loop invokes at most
//! `max_attempts` rounds; the final round either accepts degraded output
//! (`accept_on_final`) or fails the step with `QUALITY_BELOW_THRESHOLD`.

use loomflow_types::pipeline::QualityGate;
use loomflow_types::run::{ErrorCode, StepError};

use crate::repository::artifact::ArtifactStore;
use crate::repository::run::RunRepository;

use super::executor::{AttemptOutcome, ExecutorError, StepCall, StepExecutor, StepResult};

/// Loop-local state, discarded when the loop exits.
#[derive(Debug, Clone, Default)]
pub struct QualityRetryState {
    pub attempt: u32,
    pub last_score: Option<f64>,
    pub feedback: Vec<String>,
}

impl QualityRetryState {
    fn record_shortfall(&mut self, score: f64, gate: &QualityGate, issues: &[String]) {
        self.last_score = Some(score);
        let mut note = format!(
            "Previous attempt scored {score:.2}, below the required {:.2}.",
            gate.threshold
        );
        if !issues.is_empty() {
            note.push_str(" Issues: ");
            note.push_str(&issues.join("; "));
        }
        self.feedback.push(note);
    }
}

/// Warning recorded on a step accepted below its threshold.
pub fn below_threshold_warning(score: f64, threshold: f64) -> String {
    format!("{}: accepted final attempt with score {score:.2} < {threshold:.2}", ErrorCode::QualityBelowThreshold)
}

impl<R: RunRepository, A: ArtifactStore> StepExecutor<R, A> {
    /// Run a gated step under its quality loop.
    pub async fn run_with_quality_gate(
        &self,
        call: &StepCall,
        gate: &QualityGate,
    ) -> Result<StepResult, ExecutorError> {
        if let Some(artifact) = self.lookup(call).await? {
            return self.complete_from_cache(call, artifact).await;
        }

        self.mark_running(call).await?;
        let max_attempts = gate.max_attempts.max(1);
        let mut state = QualityRetryState::default();

        loop {
            state.attempt += 1;
            let mut input = call.input.clone();
            input.feedback.extend(state.feedback.iter().cloned());

            let produced = match self.attempt(call, &input).await? {
                AttemptOutcome::Produced(produced) => produced,
                AttemptOutcome::Failed { error, validation } => {
                    return self.fail(call, error, validation).await;
                }
            };

            // Validation guarantees a score on gated steps.
            let score = produced.output.quality_score.unwrap_or(0.0);
            if score >= gate.threshold {
                tracing::debug!(
                    run_id = %call.run_id,
                    step = call.step.name.as_str(),
                    round = state.attempt,
                    score,
                    "quality gate passed"
                );
                return self.commit(call, produced, Vec::new()).await;
            }

            if state.attempt < max_attempts {
                tracing::info!(
                    run_id = %call.run_id,
                    step = call.step.name.as_str(),
                    round = state.attempt,
                    score,
                    threshold = gate.threshold,
                    "quality below threshold, retrying with feedback"
                );
                let issues = produced.output.issues.clone();
                self.reject_attempt(
                    produced,
                    StepError::new(
                        ErrorCode::QualityBelowThreshold,
                        format!("score {score:.2} below threshold {:.2}", gate.threshold),
                    ),
                )
                .await?;
                state.record_shortfall(score, gate, &issues);
                continue;
            }

            if gate.accept_on_final {
                let warning = below_threshold_warning(score, gate.threshold);
                tracing::warn!(
                    run_id = %call.run_id,
                    step = call.step.name.as_str(),
                    score,
                    threshold = gate.threshold,
                    attempts = state.attempt,
                    "accepting final attempt below quality threshold"
                );
                return self.commit(call, produced, vec![warning]).await;
            }

            let error = StepError::new(
                ErrorCode::QualityBelowThreshold,
                format!(
                    "score {score:.2} below threshold {:.2} after {} attempts",
                    gate.threshold, state.attempt
                ),
            );
            self.reject_attempt(produced, error.clone()).await?;
            return self.fail(call, error, None).await;
        }
    }
}
