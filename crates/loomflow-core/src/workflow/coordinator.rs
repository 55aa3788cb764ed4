//! Run coordinator: walks a run's segments and applies external decisions.
//!
//! # Concurrency
//!
//! Each run has a single writer: every operation that mutates a run holds
//! that run's async mutex for its whole duration. Different runs proceed
//! fully concurrently. Inside a parallel group the members run as separate
//! tasks, but only the coordinator holding the run lock spawned them.
//!
//! # Suspension
//!
//! A run suspends at an approval gate, at a parallel group awaiting review,
//! or at a waiting phase of a phased step. Every suspension is written to the
//! checkpoint before `drive` returns, so resumption is a fresh `drive` over
//! reloaded state.
//!
//! # Cancellation
//!
//! `cancel` trips the run's token and then waits for the run lock. `drive`
//! checks the token only at segment boundaries, so an in-flight segment
//! always finishes and commits before the run is marked cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use loomflow_types::approval::{
    ApprovalDecision, Decision, GateRecord, GateState, ReviewVerdict, StepOutcome, review_gate_id,
};
use loomflow_types::config::EngineConfig;
use loomflow_types::event::RunEvent;
use loomflow_types::phase::{
    Candidate, GeneratedImage, ImagePhase, ImagePosition, PhaseData, PhaseEvent, PhaseRecord,
    PhaseState,
};
use loomflow_types::pipeline::{PipelineDefinition, PlanSegment, PlannedStep};
use loomflow_types::run::{
    AttemptFinish, AttemptStatus, ErrorCode, Run, RunFailure, RunSnapshot, RunStatus, StepError,
    StepRecord, StepSnapshot, StepStatus,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::artifact::ArtifactStore;
use crate::repository::run::RunRepository;
use crate::service::hash::ContentHasher;

use super::approval::{ApprovalGate, GateError, normalize_reason};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::step_input;
use super::definition::{DefinitionError, build_run_plan, validate_pipeline};
use super::executor::{ExecutorError, StepCall, StepExecutor, StepResult};
use super::idempotency::{IdempotencyStore, StoreError};
use super::phase::{PhaseError, transition};
use super::retry::RetryHandler;
use super::work::{BoxPhaseWork, BoxStepWork, PhaseRequest, WorkFailure};

// ---------------------------------------------------------------------------
// Segment flow
// ---------------------------------------------------------------------------

/// What the drive loop does after a segment returns.
#[derive(Debug)]
enum SegmentFlow {
    Advance,
    Suspend { status: RunStatus, at: String },
    Fail(RunFailure),
}

fn failure_of(step: &str, error: StepError) -> RunFailure {
    RunFailure {
        step: step.to_string(),
        code: error.code,
        message: error.message,
    }
}

/// Output of one async phase invocation, before it becomes a phase event.
enum PhaseOutput {
    Positions(Vec<ImagePosition>),
    Images(BTreeMap<String, GeneratedImage>),
    Document(serde_json::Value),
}

// ---------------------------------------------------------------------------
// RunCoordinator
// ---------------------------------------------------------------------------

/// Drives runs through their plans.
///
/// Generic over `R: RunRepository` and `A: ArtifactStore` for storage flexibility.
pub struct RunCoordinator<R: RunRepository, A: ArtifactStore> {
    checkpoint: Arc<CheckpointManager<R>>,
    store: Arc<IdempotencyStore<A>>,
    executor: Arc<StepExecutor<R, A>>,
    gate: ApprovalGate<R>,
    phase_work: Arc<BoxPhaseWork>,
    config: EngineConfig,
    event_bus: EventBus,
    /// Single-writer lock per run.
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R, A> RunCoordinator<R, A>
where
    R: RunRepository + 'static,
    A: ArtifactStore + 'static,
{
    pub fn new(
        repo: R,
        artifacts: A,
        hasher: Arc<dyn ContentHasher>,
        work: BoxStepWork,
        phase_work: BoxPhaseWork,
        config: EngineConfig,
    ) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        let checkpoint = Arc::new(CheckpointManager::new(repo));
        let store = Arc::new(IdempotencyStore::new(artifacts, hasher));
        let executor = Arc::new(StepExecutor::new(
            checkpoint.clone(),
            store.clone(),
            Arc::new(work),
            event_bus.clone(),
        ));

        Self {
            gate: ApprovalGate::new(checkpoint.clone()),
            checkpoint,
            store,
            executor,
            phase_work: Arc::new(phase_work),
            config,
            event_bus,
            run_locks: DashMap::new(),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointManager<R>> {
        &self.checkpoint
    }

    pub fn store(&self) -> &Arc<IdempotencyStore<A>> {
        &self.store
    }

    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        self.run_locks.entry(run_id).or_default().clone()
    }

    /// Drop a finished run's lock unless another caller still holds it.
    fn release_lock(&self, run_id: Uuid) {
        self.run_locks
            .remove_if(&run_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn cancel_token(&self, run_id: Uuid) -> CancellationToken {
        self.cancellation_tokens
            .entry(run_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    async fn load(&self, run_id: Uuid) -> Result<Run, CoordinatorError> {
        match self.checkpoint.load_run(run_id).await {
            Ok(run) => Ok(run),
            Err(CheckpointError::RunNotFound(id)) => Err(CoordinatorError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a run, reporting another tenant's run as not found.
    async fn load_owned(&self, run_id: Uuid, tenant_id: &str) -> Result<Run, CoordinatorError> {
        let run = self.load(run_id).await?;
        if run.tenant_id != tenant_id {
            return Err(CoordinatorError::NotFound(run_id));
        }
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    /// Create a run with its plan resolved from `pipeline`.
    ///
    /// The run starts `running`; call `drive` (or `spawn_drive`) to execute it.
    pub async fn create_run(
        &self,
        tenant_id: &str,
        pipeline: &PipelineDefinition,
        input: serde_json::Value,
    ) -> Result<Run, CoordinatorError> {
        if tenant_id.trim().is_empty() {
            return Err(CoordinatorError::Validation(
                "tenant id must not be empty".to_string(),
            ));
        }
        validate_pipeline(pipeline)?;

        let now = Utc::now();
        let run = Run {
            id: Uuid::now_v7(),
            tenant_id: tenant_id.to_string(),
            pipeline: pipeline.name.clone(),
            status: RunStatus::Running,
            cursor: 0,
            current_step: None,
            plan: build_run_plan(pipeline, &self.config),
            input,
            forked_from: None,
            failure: None,
            created_at: now,
            updated_at: now,
        };
        self.checkpoint.create_run(&run).await?;

        self.event_bus.publish(RunEvent::RunCreated {
            run_id: run.id,
            pipeline: run.pipeline.clone(),
            timestamp: now,
        });
        tracing::info!(
            run_id = %run.id,
            tenant = tenant_id,
            pipeline = pipeline.name.as_str(),
            version = pipeline.version.as_str(),
            "run created"
        );
        Ok(run)
    }

    /// Drive a run until it suspends, fails, completes or observes cancellation.
    ///
    /// Waiting and terminal runs are returned untouched.
    pub async fn drive(&self, run_id: Uuid) -> Result<Run, CoordinatorError> {
        let run = {
            let lock = self.run_lock(run_id);
            let _guard = lock.lock().await;
            self.drive_locked(run_id).await?
        };
        if run.status.is_terminal() {
            self.release_lock(run_id);
        }
        Ok(run)
    }

    async fn drive_locked(&self, run_id: Uuid) -> Result<Run, CoordinatorError> {
        let mut run = self.load(run_id).await?;
        if run.status.is_terminal() || run.status.is_waiting() {
            return Ok(run);
        }
        let token = self.cancel_token(run_id);
        if token.is_cancelled() {
            return Ok(run);
        }

        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
            self.checkpoint.save_run(&mut run).await?;
        }
        tracing::info!(run_id = %run_id, cursor = run.cursor, "driving run");

        if let Some(failure) = self.catch_up(&run).await? {
            return self.fail_run(run, failure).await;
        }

        let plan = run.plan.clone();
        while run.cursor < plan.segments.len() {
            if token.is_cancelled() {
                tracing::info!(run_id = %run_id, cursor = run.cursor, "cancellation observed at segment boundary");
                return Ok(run);
            }

            let segment = run.cursor;
            let flow = match &plan.segments[segment] {
                PlanSegment::Step { step } => self.run_step_segment(&run, segment, step).await?,
                PlanSegment::Parallel { id, steps, review } => {
                    self.run_parallel_segment(&run, segment, id, steps, *review)
                        .await?
                }
                PlanSegment::Approval { gate_id, .. } => {
                    self.run_approval_segment(&mut run, gate_id).await?
                }
                PlanSegment::Phased { step } => {
                    self.run_phased_segment(&run, segment, step).await?
                }
            };

            match flow {
                SegmentFlow::Advance => {
                    run.cursor += 1;
                    run.current_step = None;
                    self.checkpoint.save_run(&mut run).await?;
                }
                SegmentFlow::Suspend { status, at } => return self.suspend(run, status, at).await,
                SegmentFlow::Fail(failure) => return self.fail_run(run, failure).await,
            }
        }

        self.complete_run(run).await
    }

    /// Drive a run on a background task.
    pub fn spawn_drive(self: &Arc<Self>, run_id: Uuid) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            match coordinator.drive(run_id).await {
                Ok(run) => {
                    tracing::debug!(run_id = %run_id, status = %run.status, "drive settled")
                }
                Err(e) => tracing::error!(run_id = %run_id, error = %e, "drive failed"),
            }
        })
    }

    /// Re-run steps in earlier segments that were reset to pending, in graph order.
    async fn catch_up(&self, run: &Run) -> Result<Option<RunFailure>, CoordinatorError> {
        for (segment, plan_segment) in run.plan.segments.iter().enumerate().take(run.cursor) {
            match plan_segment {
                PlanSegment::Step { step } => {
                    let Some(record) = self.checkpoint.step(run.id, &step.name).await? else {
                        continue;
                    };
                    if record.status != StepStatus::Pending {
                        continue;
                    }
                    tracing::info!(run_id = %run.id, step = step.name.as_str(), "re-running earlier step");
                    let call = self.step_call(run, segment, step, &record).await?;
                    if let StepResult::Failed(error) = self.executor.run(&call).await? {
                        return Ok(Some(failure_of(&step.name, error)));
                    }
                }
                PlanSegment::Parallel { id, steps, .. } => {
                    let mut calls = Vec::new();
                    for step in steps {
                        let Some(record) = self.checkpoint.step(run.id, &step.name).await? else {
                            continue;
                        };
                        if record.status == StepStatus::Pending {
                            calls.push(self.step_call(run, segment, step, &record).await?);
                        }
                    }
                    if calls.is_empty() {
                        continue;
                    }
                    tracing::info!(run_id = %run.id, group = id.as_str(), members = calls.len(), "re-running earlier group members");
                    let result = self.executor.run_group(id, calls, false).await?;
                    if let Some(failure) = first_failure(steps, &result.outcomes) {
                        return Ok(Some(failure));
                    }
                }
                PlanSegment::Approval { .. } | PlanSegment::Phased { .. } => {}
            }
        }
        Ok(None)
    }

    async fn suspend(
        &self,
        mut run: Run,
        status: RunStatus,
        at: String,
    ) -> Result<Run, CoordinatorError> {
        run.status = status;
        run.current_step = Some(at.clone());
        self.checkpoint.save_run(&mut run).await?;

        tracing::info!(run_id = %run.id, status = %status, at = at.as_str(), "run suspended");
        self.event_bus.publish(RunEvent::RunWaiting {
            run_id: run.id,
            step: Some(at),
            status,
            timestamp: Utc::now(),
        });
        Ok(run)
    }

    async fn fail_run(&self, mut run: Run, failure: RunFailure) -> Result<Run, CoordinatorError> {
        run.status = RunStatus::Failed;
        run.current_step = Some(failure.step.clone());
        let message = format!("{}: {}", failure.code, failure.message);
        let step = failure.step.clone();
        run.failure = Some(failure);
        self.checkpoint.save_run(&mut run).await?;
        self.cancellation_tokens.remove(&run.id);

        tracing::warn!(run_id = %run.id, step = step.as_str(), error = message.as_str(), "run failed");
        self.event_bus.publish(RunEvent::RunFailed {
            run_id: run.id,
            step: Some(step),
            message,
            timestamp: Utc::now(),
        });
        Ok(run)
    }

    async fn complete_run(&self, mut run: Run) -> Result<Run, CoordinatorError> {
        run.status = RunStatus::Completed;
        run.current_step = None;
        self.checkpoint.save_run(&mut run).await?;
        self.cancellation_tokens.remove(&run.id);

        tracing::info!(run_id = %run.id, pipeline = run.pipeline.as_str(), "run completed");
        self.event_bus.publish(RunEvent::RunCompleted {
            run_id: run.id,
            timestamp: Utc::now(),
        });
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Segments
    // -----------------------------------------------------------------------

    async fn step_call(
        &self,
        run: &Run,
        segment: usize,
        step: &PlannedStep,
        record: &StepRecord,
    ) -> Result<StepCall, CoordinatorError> {
        let input = step_input(&self.store, run, segment, &record.feedback).await?;
        Ok(StepCall {
            run_id: run.id,
            tenant_id: run.tenant_id.clone(),
            segment,
            step: step.clone(),
            revision: record.revision,
            input,
        })
    }

    async fn run_step_segment(
        &self,
        run: &Run,
        segment: usize,
        step: &PlannedStep,
    ) -> Result<SegmentFlow, CoordinatorError> {
        let record = self.checkpoint.ensure_step(run.id, &step.name, segment).await?;
        if record.status == StepStatus::Skipped {
            return Ok(SegmentFlow::Advance);
        }

        let call = self.step_call(run, segment, step, &record).await?;
        Ok(match self.executor.run(&call).await? {
            StepResult::Completed { .. } => SegmentFlow::Advance,
            StepResult::Failed(error) => SegmentFlow::Fail(failure_of(&step.name, error)),
        })
    }

    async fn run_parallel_segment(
        &self,
        run: &Run,
        segment: usize,
        group_id: &str,
        steps: &[PlannedStep],
        review: bool,
    ) -> Result<SegmentFlow, CoordinatorError> {
        // Only pending members run; a failed member waits for a retry aimed at it.
        let mut calls = Vec::new();
        for step in steps {
            let record = self.checkpoint.ensure_step(run.id, &step.name, segment).await?;
            if record.status == StepStatus::Pending {
                calls.push(self.step_call(run, segment, step, &record).await?);
            }
        }

        let result = if calls.is_empty() {
            None
        } else {
            Some(self.executor.run_group(group_id, calls, review).await?)
        };

        if !review {
            let failure = match result
                .as_ref()
                .and_then(|result| first_failure(steps, &result.outcomes))
            {
                Some(failure) => Some(failure),
                None => self.failed_member(run, steps).await?,
            };
            return Ok(match failure {
                Some(failure) => SegmentFlow::Fail(failure),
                None => SegmentFlow::Advance,
            });
        }

        if self.group_approved(run, group_id, steps).await? {
            tracing::info!(run_id = %run.id, group = group_id, "parallel group closed");
            Ok(SegmentFlow::Advance)
        } else {
            Ok(SegmentFlow::Suspend {
                status: RunStatus::WaitingApproval,
                at: group_id.to_string(),
            })
        }
    }

    /// First member still failed from an earlier drive.
    async fn failed_member(
        &self,
        run: &Run,
        steps: &[PlannedStep],
    ) -> Result<Option<RunFailure>, CoordinatorError> {
        for step in steps {
            let Some(record) = self.checkpoint.step(run.id, &step.name).await? else {
                continue;
            };
            if record.status == StepStatus::Failed {
                let error = record
                    .error
                    .unwrap_or_else(|| StepError::new(ErrorCode::NonRetryable, "step failed"));
                return Ok(Some(failure_of(&step.name, error)));
            }
        }
        Ok(None)
    }

    /// A reviewed group closes when every member is completed and its most
    /// recent review decision approves the member's current revision.
    async fn group_approved(
        &self,
        run: &Run,
        group_id: &str,
        steps: &[PlannedStep],
    ) -> Result<bool, CoordinatorError> {
        let decisions = self.checkpoint.list_decisions(run.id).await?;
        for step in steps {
            let Some(record) = self.checkpoint.step(run.id, &step.name).await? else {
                return Ok(false);
            };
            let gate = review_gate_id(group_id, &step.name);
            let approved = decisions
                .iter()
                .rev()
                .find(|d| d.gate_id == gate)
                .is_some_and(|d| {
                    d.decision == Decision::Approve && d.revision == Some(record.revision)
                });
            if !(record.status == StepStatus::Completed && approved) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_approval_segment(
        &self,
        run: &mut Run,
        gate_id: &str,
    ) -> Result<SegmentFlow, CoordinatorError> {
        let state = self.checkpoint.gate(run.id, gate_id).await?.map(|g| g.state);
        match state {
            Some(GateState::Approved) => return Ok(SegmentFlow::Advance),
            Some(GateState::Waiting) => {}
            Some(GateState::Rejected) => {
                self.gate.rearm(run, gate_id).await?;
            }
            Some(GateState::Armed) | None => {
                self.gate.arm(run, gate_id).await?;
            }
        }
        Ok(SegmentFlow::Suspend {
            status: RunStatus::WaitingApproval,
            at: gate_id.to_string(),
        })
    }

    async fn run_phased_segment(
        &self,
        run: &Run,
        segment: usize,
        step: &PlannedStep,
    ) -> Result<SegmentFlow, CoordinatorError> {
        let mut record = self.checkpoint.ensure_step(run.id, &step.name, segment).await?;
        if record.status.is_settled() {
            return Ok(SegmentFlow::Advance);
        }

        let mut phase = match self.checkpoint.phase(run.id, &step.name).await? {
            Some(phase) => phase,
            None => {
                let mut phase = PhaseRecord {
                    run_id: run.id,
                    step: step.name.clone(),
                    state: PhaseState::default(),
                    updated_at: Utc::now(),
                };
                self.checkpoint.save_phase(&mut phase).await?;
                self.publish_phase(&phase);
                phase
            }
        };

        loop {
            let kind = phase.state.phase.kind();
            if kind.is_waiting() {
                return Ok(SegmentFlow::Suspend {
                    status: RunStatus::WaitingImageInput,
                    at: step.name.clone(),
                });
            }

            match &phase.state.phase {
                ImagePhase::Completed => {
                    self.complete_phased_step(run, step, &mut record, &phase.state.data)
                        .await?;
                    return Ok(SegmentFlow::Advance);
                }
                ImagePhase::Skipped => {
                    record.status = StepStatus::Skipped;
                    self.checkpoint.save_step(&mut record).await?;
                    tracing::info!(run_id = %run.id, step = step.name.as_str(), "phased step skipped");
                    return Ok(SegmentFlow::Advance);
                }
                _ => {}
            }

            if record.status != StepStatus::Running {
                record.status = StepStatus::Running;
                record.error = None;
                self.checkpoint.save_step(&mut record).await?;
            }

            let event = match self
                .run_phase_work(run, segment, step, &record, &phase.state)
                .await?
            {
                Ok(event) => event,
                Err(error) => {
                    record.status = StepStatus::Failed;
                    record.error = Some(error.clone());
                    self.checkpoint.save_step(&mut record).await?;
                    self.event_bus.publish(RunEvent::StepFailed {
                        run_id: run.id,
                        step: step.name.clone(),
                        code: error.code,
                        message: error.message.clone(),
                        timestamp: Utc::now(),
                    });
                    return Ok(SegmentFlow::Fail(failure_of(&step.name, error)));
                }
            };

            phase.state = transition(&phase.state, event)?;
            self.checkpoint.save_phase(&mut phase).await?;
            self.publish_phase(&phase);
        }
    }

    /// Invoke the phase work for an async phase under the step's retry policy.
    async fn run_phase_work(
        &self,
        run: &Run,
        segment: usize,
        step: &PlannedStep,
        record: &StepRecord,
        state: &PhaseState,
    ) -> Result<Result<PhaseEvent, StepError>, CoordinatorError> {
        let input = step_input(&self.store, run, segment, &record.feedback).await?;
        let targets = match &state.phase {
            ImagePhase::Generating { targets } => targets.clone(),
            _ => Vec::new(),
        };
        let images = if matches!(state.phase, ImagePhase::Inserting) {
            self.candidate_payloads(&state.data).await?
        } else {
            BTreeMap::new()
        };
        let timeout = Duration::from_secs(step.timeout_secs);
        let mut invocations = 0;

        loop {
            let mut attempt = self
                .checkpoint
                .start_attempt(run.id, &step.name, record.revision, &record.feedback)
                .await?;
            invocations += 1;
            self.event_bus.publish(RunEvent::StepStarted {
                run_id: run.id,
                step: step.name.clone(),
                attempt: attempt.number,
                timestamp: Utc::now(),
            });

            let request = PhaseRequest {
                run_id: run.id,
                tenant_id: run.tenant_id.clone(),
                step: step.name.clone(),
                target: step.target.clone(),
                attempt: attempt.number,
                config: step.config.clone(),
                input: input.clone(),
                data: state.data.clone(),
                targets: targets.clone(),
                images: images.clone(),
            };

            let error = match tokio::time::timeout(timeout, self.invoke_phase(&state.phase, &request)).await {
                Ok(Ok(output)) => {
                    self.checkpoint
                        .finish_attempt(&mut attempt, AttemptStatus::Succeeded, AttemptFinish::default())
                        .await?;
                    let event = self.phase_event(output, &state.data, &targets).await?;
                    return Ok(Ok(event));
                }
                Ok(Err(failure)) => StepError::new(failure.kind.code(), failure.message),
                Err(_elapsed) => StepError::new(
                    ErrorCode::Retryable,
                    format!("phase work timed out after {}s", step.timeout_secs),
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
                    run_id = %run.id,
                    step = step.name.as_str(),
                    phase = %state.phase.kind(),
                    delay_ms = delay.as_millis() as u64,
                    error = error.message.as_str(),
                    "transient phase failure, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            return Ok(Err(error));
        }
    }

    async fn invoke_phase(
        &self,
        phase: &ImagePhase,
        request: &PhaseRequest,
    ) -> Result<PhaseOutput, WorkFailure> {
        match phase {
            ImagePhase::Analyzing => self.phase_work.analyze(request).await.map(PhaseOutput::Positions),
            ImagePhase::Generating { .. } => {
                self.phase_work.generate(request).await.map(PhaseOutput::Images)
            }
            _ => self.phase_work.insert(request).await.map(PhaseOutput::Document),
        }
    }

    /// Turn phase work output into the internal event that finishes the phase.
    ///
    /// Generated images are stored as blobs; only their digests enter the phase data.
    async fn phase_event(
        &self,
        output: PhaseOutput,
        data: &PhaseData,
        targets: &[String],
    ) -> Result<PhaseEvent, CoordinatorError> {
        Ok(match output {
            PhaseOutput::Positions(positions) => PhaseEvent::AnalysisFinished { positions },
            PhaseOutput::Images(images) => {
                let round = data.round + 1;
                let mut candidates = BTreeMap::new();
                for (position, image) in images {
                    if !targets.contains(&position) {
                        tracing::warn!(position = position.as_str(), "ignoring image for a position that was not requested");
                        continue;
                    }
                    let stored = self.store.put_payload(&image.payload).await?;
                    candidates.insert(
                        position,
                        Candidate {
                            digest: stored.digest,
                            size_bytes: stored.size_bytes,
                            summary: image.summary,
                            round,
                        },
                    );
                }
                PhaseEvent::GenerationFinished { candidates }
            }
            PhaseOutput::Document(document) => PhaseEvent::InsertionFinished { document },
        })
    }

    async fn candidate_payloads(
        &self,
        data: &PhaseData,
    ) -> Result<BTreeMap<String, serde_json::Value>, CoordinatorError> {
        let mut images = BTreeMap::new();
        for (position, candidate) in &data.candidates {
            let payload = self.store.read_payload(&candidate.digest).await?;
            images.insert(position.clone(), payload);
        }
        Ok(images)
    }

    /// Commit the finished document as the phased step's artifact.
    async fn complete_phased_step(
        &self,
        run: &Run,
        step: &PlannedStep,
        record: &mut StepRecord,
        data: &PhaseData,
    ) -> Result<(), CoordinatorError> {
        let document = data.document.clone().ok_or_else(|| {
            CoordinatorError::InvalidState(format!(
                "phased step '{}' completed without a document",
                step.name
            ))
        })?;
        let stored = self.store.put_payload(&document).await?;
        let summary = format!("{} with {} images", step.display_name, data.candidates.len());

        let artifact = match self
            .store
            .commit(
                &run.tenant_id,
                run.id,
                &step.name,
                record.revision,
                &stored.digest,
                stored.size_bytes,
                &summary,
            )
            .await
        {
            Ok(artifact) => artifact,
            Err(StoreError::Conflict(key)) => {
                tracing::warn!(
                    run_id = %run.id,
                    step = step.name.as_str(),
                    key = key.as_str(),
                    "commit lost a race, adopting the committed artifact"
                );
                self.store
                    .get_revision(run.id, &step.name, record.revision)
                    .await?
                    .ok_or(StoreError::Conflict(key))?
            }
            Err(e) => return Err(e.into()),
        };

        record.status = StepStatus::Completed;
        record.error = None;
        self.checkpoint.save_step(record).await?;

        tracing::info!(
            run_id = %run.id,
            step = step.name.as_str(),
            digest = artifact.digest.as_str(),
            "phased step completed"
        );
        self.event_bus.publish(RunEvent::StepCompleted {
            run_id: run.id,
            step: step.name.clone(),
            digest: artifact.digest,
            cache_hit: false,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn publish_phase(&self, record: &PhaseRecord) {
        self.event_bus.publish(RunEvent::PhaseChanged {
            run_id: record.run_id,
            step: record.step.clone(),
            phase: record.state.phase.kind(),
            timestamp: Utc::now(),
        });
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    /// The gate the run is suspended on, with its rejection branch.
    fn waiting_gate(run: &Run) -> Result<(String, Vec<String>), CoordinatorError> {
        if run.status != RunStatus::WaitingApproval {
            return Err(CoordinatorError::InvalidState(format!(
                "run is {}, not waiting on an approval gate",
                run.status
            )));
        }
        match run.plan.segments.get(run.cursor) {
            Some(PlanSegment::Approval {
                gate_id, on_reject, ..
            }) => Ok((gate_id.clone(), on_reject.clone())),
            _ => Err(CoordinatorError::InvalidState(
                "run is not waiting on an approval gate".to_string(),
            )),
        }
    }

    /// Approve the gate the run waits on. The caller drives the run afterwards.
    pub async fn approve(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        actor: &str,
    ) -> Result<Run, CoordinatorError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_owned(run_id, tenant_id).await?;
        let (gate_id, _) = Self::waiting_gate(&run)?;
        self.gate
            .decide(&mut run, &gate_id, Decision::Approve, None, actor)
            .await?;
        Ok(run)
    }

    /// Reject the gate the run waits on and schedule its rejection branch.
    ///
    /// An empty reason fails before the run is even loaded.
    pub async fn reject(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<Run, CoordinatorError> {
        let reason = normalize_reason(Decision::Reject, Some(reason))?.unwrap_or_default();

        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_owned(run_id, tenant_id).await?;
        let (gate_id, on_reject) = Self::waiting_gate(&run)?;
        self.gate
            .decide(&mut run, &gate_id, Decision::Reject, Some(&reason), actor)
            .await?;

        for step in &on_reject {
            self.reset_step(&run, step, Some(format!("Rejected at {gate_id}: {reason}")))
                .await?;
        }

        run.status = RunStatus::Running;
        run.current_step = None;
        self.checkpoint.save_run(&mut run).await?;
        tracing::info!(run_id = %run_id, gate = gate_id.as_str(), rework = on_reject.len(), "rejection branch scheduled");
        Ok(run)
    }

    /// Record per-member review decisions for the group the run waits on.
    ///
    /// All decisions are validated before any is recorded. A retry re-runs only
    /// its member, with the instruction folded into the member's feedback.
    pub async fn review_group(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        decisions: BTreeMap<String, ReviewVerdict>,
        actor: &str,
    ) -> Result<Run, CoordinatorError> {
        if decisions.is_empty() {
            return Err(CoordinatorError::Validation(
                "at least one review decision is required".to_string(),
            ));
        }
        for (step, verdict) in &decisions {
            if let ReviewVerdict::Retry { instruction } = verdict {
                if instruction.trim().is_empty() {
                    return Err(CoordinatorError::Validation(format!(
                        "retry of '{step}' requires an instruction"
                    )));
                }
            }
        }

        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_owned(run_id, tenant_id).await?;
        let group = match (run.status, run.plan.segments.get(run.cursor)) {
            (
                RunStatus::WaitingApproval,
                Some(PlanSegment::Parallel {
                    id, steps, review: true,
                }),
            ) => Some((id.clone(), steps.iter().map(|s| s.name.clone()).collect::<Vec<_>>())),
            _ => None,
        };
        let Some((group_id, members)) = group else {
            return Err(CoordinatorError::InvalidState(
                "run is not waiting on a group review".to_string(),
            ));
        };

        for (step, verdict) in &decisions {
            if !members.contains(step) {
                return Err(CoordinatorError::Validation(format!(
                    "step '{step}' is not a member of group '{group_id}'"
                )));
            }
            if *verdict == ReviewVerdict::Approve {
                let completed = self
                    .checkpoint
                    .step(run.id, step)
                    .await?
                    .is_some_and(|record| record.status == StepStatus::Completed);
                if !completed {
                    return Err(CoordinatorError::Validation(format!(
                        "step '{step}' has no completed output to approve"
                    )));
                }
            }
        }

        for (step, verdict) in decisions {
            let reviewed = self.checkpoint.step(run.id, &step).await?.map(|r| r.revision);
            let (decision, instruction) = match verdict {
                ReviewVerdict::Approve => (Decision::Approve, None),
                ReviewVerdict::Retry { instruction } => {
                    (Decision::Reject, Some(instruction.trim().to_string()))
                }
            };
            let record = ApprovalDecision {
                id: Uuid::now_v7(),
                run_id: run.id,
                gate_id: review_gate_id(&group_id, &step),
                decision,
                reason: instruction.clone(),
                revision: reviewed,
                actor: actor.to_string(),
                decided_at: Utc::now(),
            };
            self.checkpoint.append_decision(&record).await?;

            if let Some(instruction) = instruction {
                self.reset_step(&run, &step, Some(format!("Reviewer: {instruction}")))
                    .await?;
            }
            tracing::info!(
                run_id = %run_id,
                group = group_id.as_str(),
                step = step.as_str(),
                decision = decision.as_str(),
                actor,
                "review decision recorded"
            );
        }

        run.status = RunStatus::Running;
        run.current_step = None;
        self.checkpoint.save_run(&mut run).await?;
        Ok(run)
    }

    /// Apply an external event to the phased step the run waits on.
    ///
    /// Leaving the waiting phases puts the run back to `running`.
    pub async fn submit_phase_event(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        step: &str,
        event: PhaseEvent,
    ) -> Result<PhaseRecord, CoordinatorError> {
        if !event.is_external() {
            return Err(CoordinatorError::Validation(format!(
                "event '{}' is emitted by the engine",
                event.name()
            )));
        }

        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_owned(run_id, tenant_id).await?;
        if run.status != RunStatus::WaitingImageInput || run.current_step.as_deref() != Some(step) {
            return Err(CoordinatorError::InvalidState(format!(
                "run is not waiting for input on step '{step}'"
            )));
        }
        let mut record = self.checkpoint.phase(run.id, step).await?.ok_or_else(|| {
            CoordinatorError::InvalidState(format!("step '{step}' has no phase state"))
        })?;

        let event_name = event.name();
        record.state = transition(&record.state, event)?;
        self.checkpoint.save_phase(&mut record).await?;
        self.publish_phase(&record);

        let phase = record.state.phase.kind();
        tracing::info!(run_id = %run_id, step, event = event_name, phase = %phase, "phase event applied");

        if !phase.is_waiting() {
            run.status = RunStatus::Running;
            run.current_step = None;
            self.checkpoint.save_run(&mut run).await?;
        }
        Ok(record)
    }

    /// Reset a step for re-execution under a new revision.
    ///
    /// The revision only moves when the current one already holds a commit,
    /// so earlier outputs stay intact and the idempotency lookup misses.
    async fn reset_step(
        &self,
        run: &Run,
        name: &str,
        feedback: Option<String>,
    ) -> Result<StepRecord, CoordinatorError> {
        let segment = run.plan.segment_of(name).ok_or_else(|| {
            CoordinatorError::Validation(format!("step '{name}' is not in the run plan"))
        })?;
        let mut record = self.checkpoint.ensure_step(run.id, name, segment).await?;
        if self
            .store
            .get_revision(run.id, name, record.revision)
            .await?
            .is_some()
        {
            record.revision += 1;
        }
        record.status = StepStatus::Pending;
        record.error = None;
        record.validation = None;
        record.warnings.clear();
        if let Some(feedback) = feedback {
            record.feedback.push(feedback);
        }
        self.checkpoint.save_step(&mut record).await?;

        tracing::debug!(run_id = %run.id, step = name, revision = record.revision, "step reset for re-execution");
        Ok(record)
    }

    /// Re-invoke one step of the same run, bypassing its committed output.
    pub async fn retry_step(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        step: &str,
    ) -> Result<Run, CoordinatorError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_owned(run_id, tenant_id).await?;
        if !(run.status == RunStatus::Failed || run.status.is_waiting()) {
            return Err(CoordinatorError::InvalidState(format!(
                "cannot retry a step of a {} run",
                run.status
            )));
        }
        let segment = run.plan.segment_of(step).ok_or_else(|| {
            CoordinatorError::Validation(format!("step '{step}' is not in the run plan"))
        })?;
        if segment > run.cursor {
            return Err(CoordinatorError::InvalidState(format!(
                "step '{step}' has not been reached"
            )));
        }

        if matches!(run.plan.segments[segment], PlanSegment::Phased { .. }) {
            let mut record = self.checkpoint.ensure_step(run.id, step, segment).await?;
            if record.status != StepStatus::Failed {
                return Err(CoordinatorError::InvalidState(format!(
                    "phased step '{step}' advances through phase events"
                )));
            }
            record.status = StepStatus::Pending;
            record.error = None;
            self.checkpoint.save_step(&mut record).await?;
        } else {
            self.reset_step(&run, step, None).await?;
        }

        run.status = RunStatus::Running;
        run.failure = None;
        run.current_step = None;
        self.checkpoint.save_run(&mut run).await?;
        tracing::info!(run_id = %run_id, step, "step retry scheduled");
        Ok(run)
    }

    /// Fork a new run that reuses this run's outputs before `step`.
    ///
    /// Every earlier step must be completed or skipped. Resuming at a group
    /// member re-runs the whole group.
    pub async fn resume(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        step: &str,
    ) -> Result<Run, CoordinatorError> {
        let source = self.load_owned(run_id, tenant_id).await?;
        let segment = source.plan.segment_of(step).ok_or_else(|| {
            CoordinatorError::Validation(format!("step '{step}' is not in the run plan"))
        })?;

        let mut carried = Vec::new();
        for (index, plan_segment) in source.plan.segments.iter().enumerate().take(segment) {
            for planned in plan_segment.steps() {
                let skipped = self
                    .checkpoint
                    .step(source.id, &planned.name)
                    .await?
                    .is_some_and(|record| record.status == StepStatus::Skipped);
                if !skipped && self.store.get(source.id, &planned.name).await?.is_none() {
                    return Err(CoordinatorError::InvalidState(format!(
                        "step '{}' has no committed output to resume from",
                        planned.name
                    )));
                }
                carried.push((planned.name.clone(), index, skipped));
            }
        }

        let forked = self.store.fork(&source, step).await?;
        let now = Utc::now();
        let run = Run {
            id: forked.run_id,
            tenant_id: source.tenant_id.clone(),
            pipeline: source.pipeline.clone(),
            status: RunStatus::Running,
            cursor: segment,
            current_step: None,
            plan: source.plan.clone(),
            input: source.input.clone(),
            forked_from: Some(source.id),
            failure: None,
            created_at: now,
            updated_at: now,
        };
        self.checkpoint.create_run(&run).await?;

        for (name, index, skipped) in carried {
            let mut record = StepRecord::new(run.id, &name, index);
            record.status = if skipped {
                StepStatus::Skipped
            } else {
                StepStatus::Completed
            };
            self.checkpoint.save_step(&mut record).await?;
        }

        for plan_segment in source.plan.segments.iter().take(segment) {
            match plan_segment {
                PlanSegment::Approval { gate_id, .. } => {
                    let mut gate = GateRecord {
                        run_id: run.id,
                        gate_id: gate_id.clone(),
                        state: GateState::Approved,
                        round: 1,
                        updated_at: now,
                    };
                    self.checkpoint.save_gate(&mut gate).await?;
                }
                PlanSegment::Phased { step } => {
                    if let Some(mut phase) = self.checkpoint.phase(source.id, &step.name).await? {
                        phase.run_id = run.id;
                        self.checkpoint.save_phase(&mut phase).await?;
                    }
                }
                PlanSegment::Step { .. } | PlanSegment::Parallel { .. } => {}
            }
        }

        self.event_bus.publish(RunEvent::RunCreated {
            run_id: run.id,
            pipeline: run.pipeline.clone(),
            timestamp: now,
        });
        tracing::info!(
            source_run = %source.id,
            new_run = %run.id,
            resume_step = step,
            copied = forked.copied.len(),
            "run resumed as fork"
        );
        Ok(run)
    }

    /// Cancel a run. Waits for the in-flight segment; committed outputs stay.
    pub async fn cancel(&self, run_id: Uuid, tenant_id: &str) -> Result<Run, CoordinatorError> {
        let current = self.load_owned(run_id, tenant_id).await?;
        if current.status.is_terminal() {
            return Err(CoordinatorError::InvalidState(format!(
                "run is already {}",
                current.status
            )));
        }
        self.cancel_token(run_id).cancel();

        let run = {
            let lock = self.run_lock(run_id);
            let _guard = lock.lock().await;

            let mut run = self.load(run_id).await?;
            if run.status.is_terminal() {
                self.cancellation_tokens.remove(&run_id);
                return Err(CoordinatorError::InvalidState(format!(
                    "run is already {}",
                    run.status
                )));
            }
            run.status = RunStatus::Cancelled;
            run.current_step = None;
            self.checkpoint.save_run(&mut run).await?;
            run
        };
        self.cancellation_tokens.remove(&run_id);
        self.release_lock(run_id);

        tracing::info!(run_id = %run_id, "run cancelled");
        self.event_bus.publish(RunEvent::RunCancelled {
            run_id,
            timestamp: Utc::now(),
        });
        Ok(run)
    }

    // -----------------------------------------------------------------------
    // Queries and recovery
    // -----------------------------------------------------------------------

    /// Run, steps with attempts and latest artifacts, gates, decisions, phases.
    pub async fn snapshot(&self, run_id: Uuid, tenant_id: &str) -> Result<RunSnapshot, CoordinatorError> {
        let run = self.load_owned(run_id, tenant_id).await?;

        let mut steps = Vec::new();
        for record in self.checkpoint.list_steps(run.id).await? {
            let attempts = self
                .checkpoint
                .list_attempts(run.id, Some(&record.name))
                .await?;
            let artifact = self.store.get(run.id, &record.name).await?;
            steps.push(StepSnapshot {
                step: record,
                attempts,
                artifact,
            });
        }

        Ok(RunSnapshot {
            gates: self.checkpoint.list_gates(run.id).await?,
            decisions: self.checkpoint.list_decisions(run.id).await?,
            phases: self.checkpoint.list_phases(run.id).await?,
            run,
            steps,
        })
    }

    pub async fn list_runs(&self, tenant_id: &str, limit: u32) -> Result<Vec<Run>, CoordinatorError> {
        Ok(self.checkpoint.list_runs(tenant_id, limit).await?)
    }

    /// Repair state left by a crash and return the runs that need driving.
    ///
    /// Attempts left `running` close as succeeded when their revision was
    /// committed and as failed (`RETRYABLE`) otherwise. Steps left `running`
    /// settle the same way.
    pub async fn recover_interrupted_runs(&self) -> Result<Vec<Uuid>, CoordinatorError> {
        let runs = self.checkpoint.interrupted_runs().await?;
        let mut recovered = Vec::with_capacity(runs.len());

        for run in runs {
            let lock = self.run_lock(run.id);
            let _guard = lock.lock().await;

            for mut attempt in self.checkpoint.list_attempts(run.id, None).await? {
                if attempt.status != AttemptStatus::Running {
                    continue;
                }
                let committed = self
                    .store
                    .get_revision(run.id, &attempt.step, attempt.revision)
                    .await?
                    .is_some();
                let (status, finish) = if committed {
                    (AttemptStatus::Succeeded, AttemptFinish::default())
                } else {
                    (
                        AttemptStatus::Failed,
                        AttemptFinish {
                            error: Some(StepError::new(
                                ErrorCode::Retryable,
                                "interrupted before completion",
                            )),
                            ..Default::default()
                        },
                    )
                };
                self.checkpoint.finish_attempt(&mut attempt, status, finish).await?;
            }

            for mut record in self.checkpoint.list_steps(run.id).await? {
                if record.status != StepStatus::Running {
                    continue;
                }
                let committed = self
                    .store
                    .get_revision(run.id, &record.name, record.revision)
                    .await?
                    .is_some();
                record.status = if committed {
                    StepStatus::Completed
                } else {
                    StepStatus::Pending
                };
                self.checkpoint.save_step(&mut record).await?;
            }

            tracing::info!(run_id = %run.id, status = %run.status, "recovered interrupted run");
            recovered.push(run.id);
        }

        Ok(recovered)
    }
}

/// The first failed member in plan order.
fn first_failure(steps: &[PlannedStep], outcomes: &BTreeMap<String, StepOutcome>) -> Option<RunFailure> {
    steps.iter().find_map(|step| match outcomes.get(&step.name) {
        Some(StepOutcome::Failed { code, message }) => Some(RunFailure {
            step: step.name.clone(),
            code: *code,
            message: message.clone(),
        }),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// CoordinatorError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("run not found: {0}")]
    NotFound(Uuid),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
