//! Step executor: invokes one step's work function with idempotent replay.
//!
//! # Execution flow
//!
//! 1. `lookup` the (run, step, revision) key in the idempotency store. A hit
//!    returns the committed artifact with no side effects.
//! 2. `attempt`: invoke the work function under the step timeout. RETRYABLE
//!    failures (timeouts included) are retried under the step's retry policy,
//!    each invocation recorded as its own attempt. Successful output goes
//!    through the output validator.
//! 3. `commit` the output before returning, then mark the step completed.
//!
//! NON_RETRYABLE and VALIDATION_FAIL are terminal for the step.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use loomflow_types::artifact::ArtifactRef;
use loomflow_types::event::RunEvent;
use loomflow_types::pipeline::PlannedStep;
use loomflow_types::run::{
    AttemptFinish, AttemptStatus, ErrorCode, StepAttempt, StepError, StepStatus, ValidationReport,
};
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::artifact::ArtifactStore;
use crate::repository::run::RunRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::idempotency::{IdempotencyStore, StoreError};
use super::retry::RetryHandler;
use super::validate::{OutputValidator, ValidatedOutput};
use super::work::{BoxStepWork, StepInput, WorkRequest};

// ---------------------------------------------------------------------------
// Call and result types
// ---------------------------------------------------------------------------

/// Everything needed to execute one step of one run.
#[derive(Debug, Clone)]
pub struct StepCall {
    pub run_id: Uuid,
    pub tenant_id: String,
    /// Index of the owning segment.
    pub segment: usize,
    pub step: PlannedStep,
    /// Artifact revision this execution produces.
    pub revision: u32,
    pub input: StepInput,
}

/// Bounded outcome of executing a step.
#[derive(Debug, Clone)]
pub enum StepResult {
    Completed {
        artifact: ArtifactRef,
        /// True when the idempotency store already held the output.
        cache_hit: bool,
        /// Non-fatal warnings, e.g. an accepted below-threshold score.
        warnings: Vec<String>,
    },
    Failed(StepError),
}

impl StepResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, StepResult::Completed { .. })
    }
}

/// Validated output held by a still-running attempt, not yet committed.
#[derive(Debug)]
pub struct ProducedOutput {
    pub output: ValidatedOutput,
    pub attempt: StepAttempt,
}

/// Result of one logical attempt (possibly several retried invocations).
#[derive(Debug)]
pub enum AttemptOutcome {
    Produced(ProducedOutput),
    Failed {
        error: StepError,
        validation: Option<ValidationReport>,
    },
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes single steps against the injected work function.
///
/// Generic over `R: RunRepository` and `A: ArtifactStore` for storage flexibility.
pub struct StepExecutor<R: RunRepository, A: ArtifactStore> {
    checkpoint: Arc<CheckpointManager<R>>,
    store: Arc<IdempotencyStore<A>>,
    work: Arc<BoxStepWork>,
    event_bus: EventBus,
}

impl<R: RunRepository, A: ArtifactStore> StepExecutor<R, A> {
    pub fn new(
        checkpoint: Arc<CheckpointManager<R>>,
        store: Arc<IdempotencyStore<A>>,
        work: Arc<BoxStepWork>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            checkpoint,
            store,
            work,
            event_bus,
        }
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointManager<R>> {
        &self.checkpoint
    }

    pub fn store(&self) -> &Arc<IdempotencyStore<A>> {
        &self.store
    }

    /// Run the step, through the quality retry loop when it is gated.
    pub async fn run(&self, call: &StepCall) -> Result<StepResult, ExecutorError> {
        match &call.step.quality {
            Some(gate) => {
                let gate = gate.clone();
                self.run_with_quality_gate(call, &gate).await
            }
            None => self.execute(call).await,
        }
    }

    /// Execute an ungated step: lookup, attempt, commit.
    pub async fn execute(&self, call: &StepCall) -> Result<StepResult, ExecutorError> {
        if let Some(artifact) = self.lookup(call).await? {
            return self.complete_from_cache(call, artifact).await;
        }

        self.mark_running(call).await?;
        match self.attempt(call, &call.input).await? {
            AttemptOutcome::Produced(produced) => self.commit(call, produced, Vec::new()).await,
            AttemptOutcome::Failed { error, validation } => {
                self.fail(call, error, validation).await
            }
        }
    }

    /// The committed artifact for the call's key, if any.
    pub async fn lookup(&self, call: &StepCall) -> Result<Option<ArtifactRef>, ExecutorError> {
        Ok(self
            .store
            .get_revision(call.run_id, &call.step.name, call.revision)
            .await?)
    }

    /// Return a committed artifact without invoking work.
    pub async fn complete_from_cache(
        &self,
        call: &StepCall,
        artifact: ArtifactRef,
    ) -> Result<StepResult, ExecutorError> {
        let mut record = self
            .checkpoint
            .ensure_step(call.run_id, &call.step.name, call.segment)
            .await?;
        if record.status != StepStatus::Completed {
            record.status = StepStatus::Completed;
            record.error = None;
            record.feedback.clear();
            self.checkpoint.save_step(&mut record).await?;
        }

        tracing::debug!(
            run_id = %call.run_id,
            step = call.step.name.as_str(),
            revision = call.revision,
            "idempotency hit, skipping invocation"
        );
        self.event_bus.publish(RunEvent::StepCompleted {
            run_id: call.run_id,
            step: call.step.name.clone(),
            digest: artifact.digest.clone(),
            cache_hit: true,
            timestamp: Utc::now(),
        });

        Ok(StepResult::Completed {
            artifact,
            cache_hit: true,
            warnings: record.warnings,
        })
    }

    pub async fn mark_running(&self, call: &StepCall) -> Result<(), ExecutorError> {
        let mut record = self
            .checkpoint
            .ensure_step(call.run_id, &call.step.name, call.segment)
            .await?;
        record.status = StepStatus::Running;
        record.revision = call.revision;
        record.error = None;
        self.checkpoint.save_step(&mut record).await?;
        Ok(())
    }

    /// One logical attempt: invoke, retry transient failures, validate.
    ///
    /// On success the returned attempt is still `running`; the caller either
    /// commits it or rejects it.
    pub async fn attempt(
        &self,
        call: &StepCall,
        input: &StepInput,
    ) -> Result<AttemptOutcome, ExecutorError> {
        let step = &call.step;
        let timeout = Duration::from_secs(step.timeout_secs);
        let mut invocations = 0;

        loop {
            let mut attempt = self
                .checkpoint
                .start_attempt(call.run_id, &step.name, call.revision, &input.feedback)
                .await?;
            invocations += 1;

            self.event_bus.publish(RunEvent::StepStarted {
                run_id: call.run_id,
                step: step.name.clone(),
                attempt: attempt.number,
                timestamp: Utc::now(),
            });

            let request = WorkRequest {
                run_id: call.run_id,
                tenant_id: call.tenant_id.clone(),
                step: step.name.clone(),
                target: step.target.clone(),
                attempt: attempt.number,
                config: step.config.clone(),
                input: input.clone(),
            };

            let error = match tokio::time::timeout(timeout, self.work.invoke(&request)).await {
                Ok(Ok(output)) => {
                    let validated = OutputValidator::validate(step, output);
                    if validated.is_valid() {
                        return Ok(AttemptOutcome::Produced(ProducedOutput {
                            output: validated,
                            attempt,
                        }));
                    }

                    let error = StepError::new(ErrorCode::ValidationFail, validated.error_message());
                    self.checkpoint
                        .finish_attempt(
                            &mut attempt,
                            AttemptStatus::Failed,
                            AttemptFinish {
                                error: Some(error.clone()),
                                repairs: validated.repairs.clone(),
                                warnings: Vec::new(),
                                quality_score: validated.quality_score,
                            },
                        )
                        .await?;
                    return Ok(AttemptOutcome::Failed {
                        error,
                        validation: Some(validated.report),
                    });
                }
                Ok(Err(failure)) => StepError::new(failure.kind.code(), failure.message),
                Err(_elapsed) => StepError::new(
                    ErrorCode::Retryable,
                    format!("step timed out after {}s", step.timeout_secs),
                ),
            };

            self.checkpoint
                .finish_attempt(
                    &mut attempt,
                    AttemptStatus::Failed,
                    AttemptFinish {
                        error: Some(error.clone()),
                        ..Default::default()
                    },
                )
                .await?;

            if RetryHandler::should_retry(&step.retry, error.code, invocations) {
                let delay = RetryHandler::backoff_delay(&step.retry, invocations);
                tracing::warn!(
                    run_id = %call.run_id,
                    step = step.name.as_str(),
                    attempt = attempt.number,
                    delay_ms = delay.as_millis() as u64,
                    error = error.message.as_str(),
                    "transient step failure, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Ok(AttemptOutcome::Failed {
                error,
                validation: None,
            });
        }
    }

    /// Commit a produced output, close its attempt and mark the step completed.
    ///
    /// Losing a commit race adopts the artifact that won.
    pub async fn commit(
        &self,
        call: &StepCall,
        produced: ProducedOutput,
        warnings: Vec<String>,
    ) -> Result<StepResult, ExecutorError> {
        let ProducedOutput { output, mut attempt } = produced;
        let step = &call.step.name;

        let stored = self.store.put_payload(&output.payload).await?;
        let artifact = match self
            .store
            .commit(
                &call.tenant_id,
                call.run_id,
                step,
                call.revision,
                &stored.digest,
                stored.size_bytes,
                &output.summary,
            )
            .await
        {
            Ok(artifact) => artifact,
            Err(StoreError::Conflict(key)) => {
                tracing::warn!(
                    run_id = %call.run_id,
                    step = step.as_str(),
                    key = key.as_str(),
                    "commit lost a race, adopting the committed artifact"
                );
                self.store
                    .get_revision(call.run_id, step, call.revision)
                    .await?
                    .ok_or(StoreError::Conflict(key))?
            }
            Err(e) => return Err(e.into()),
        };

        self.checkpoint
            .finish_attempt(
                &mut attempt,
                AttemptStatus::Succeeded,
                AttemptFinish {
                    error: None,
                    repairs: output.repairs.clone(),
                    warnings: warnings.clone(),
                    quality_score: output.quality_score,
                },
            )
            .await?;

        let mut record = self
            .checkpoint
            .ensure_step(call.run_id, step, call.segment)
            .await?;
        record.status = StepStatus::Completed;
        record.revision = call.revision;
        record.error = None;
        record.validation = Some(output.report);
        record.warnings = warnings.clone();
        record.feedback.clear();
        self.checkpoint.save_step(&mut record).await?;

        tracing::info!(
            run_id = %call.run_id,
            step = step.as_str(),
            attempt = attempt.number,
            revision = call.revision,
            digest = artifact.digest.as_str(),
            "step completed"
        );
        self.event_bus.publish(RunEvent::StepCompleted {
            run_id: call.run_id,
            step: step.clone(),
            digest: artifact.digest.clone(),
            cache_hit: false,
            timestamp: Utc::now(),
        });

        Ok(StepResult::Completed {
            artifact,
            cache_hit: false,
            warnings,
        })
    }

    /// Close a produced attempt as failed without committing its output.
    pub async fn reject_attempt(
        &self,
        produced: ProducedOutput,
        error: StepError,
    ) -> Result<(), ExecutorError> {
        let ProducedOutput { output, mut attempt } = produced;
        self.checkpoint
            .finish_attempt(
                &mut attempt,
                AttemptStatus::Failed,
                AttemptFinish {
                    error: Some(error),
                    repairs: output.repairs,
                    warnings: Vec::new(),
                    quality_score: output.quality_score,
                },
            )
            .await?;
        Ok(())
    }

    /// Mark the step terminally failed.
    pub async fn fail(
        &self,
        call: &StepCall,
        error: StepError,
        validation: Option<ValidationReport>,
    ) -> Result<StepResult, ExecutorError> {
        let mut record = self
            .checkpoint
            .ensure_step(call.run_id, &call.step.name, call.segment)
            .await?;
        record.status = StepStatus::Failed;
        record.error = Some(error.clone());
        if validation.is_some() {
            record.validation = validation;
        }
        self.checkpoint.save_step(&mut record).await?;

        tracing::warn!(
            run_id = %call.run_id,
            step = call.step.name.as_str(),
            code = %error.code,
            error = error.message.as_str(),
            "step failed"
        );
        self.event_bus.publish(RunEvent::StepFailed {
            run_id: call.run_id,
            step: call.step.name.clone(),
            code: error.code,
            message: error.message.clone(),
            timestamp: Utc::now(),
        });

        Ok(StepResult::Failed(error))
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Infrastructure errors during step execution.
///
/// Step failures are not errors here: they are `StepResult::Failed`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Idempotency store error.
    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),

    /// A group member task panicked or was aborted.
    #[error("step task for '{0}' did not finish")]
    TaskLost(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
