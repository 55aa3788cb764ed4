//! In-memory doubles and fixtures shared by the engine tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use loomflow_types::approval::{ApprovalDecision, GateRecord};
use loomflow_types::artifact::{ArtifactRef, output_key};
use loomflow_types::config::EngineConfig;
use loomflow_types::error::RepositoryError;
use loomflow_types::phase::{GeneratedImage, ImagePosition, PhaseRecord};
use loomflow_types::pipeline::{
    OutputFormat, PlanSegment, PlannedStep, QualityGate, RetryPolicy, RunPlan,
};
use loomflow_types::run::{Run, RunStatus, StepAttempt, StepRecord};
use serde_json::json;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::artifact::ArtifactStore;
use crate::repository::run::RunRepository;
use crate::service::hash::ContentHasher;
use crate::workflow::checkpoint::CheckpointManager;
use crate::workflow::coordinator::RunCoordinator;
use crate::workflow::definition::parse_pipeline_yaml;
use crate::workflow::executor::{StepCall, StepExecutor};
use crate::workflow::idempotency::IdempotencyStore;
use crate::workflow::work::{
    BoxPhaseWork, BoxStepWork, PhaseRequest, PhaseWork, StepInput, StepWork, WorkFailure,
    WorkOutput, WorkRequest,
};

pub const TENANT: &str = "acme";

// ---------------------------------------------------------------------------
// MemoryRunRepository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunState {
    runs: HashMap<Uuid, Run>,
    steps: BTreeMap<(Uuid, String), StepRecord>,
    attempts: Vec<StepAttempt>,
    gates: BTreeMap<(Uuid, String), GateRecord>,
    decisions: Vec<ApprovalDecision>,
    phases: BTreeMap<(Uuid, String), PhaseRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryRunRepository {
    state: Arc<Mutex<RunState>>,
}

impl MemoryRunRepository {
    /// Insert a run without going through the async trait.
    pub fn seed(&self, run: Run) {
        self.state.lock().unwrap().runs.insert(run.id, run);
    }
}

impl RunRepository for MemoryRunRepository {
    async fn create_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if state.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(run.id.to_string()));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        match state.runs.get_mut(&run.id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<Run>, RepositoryError> {
        Ok(self.state.lock().unwrap().runs.get(run_id).cloned())
    }

    async fn list_runs(&self, tenant_id: &str, limit: u32) -> Result<Vec<Run>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<Run>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        runs.sort_by_key(|r| (r.created_at, r.id));
        Ok(runs)
    }

    async fn upsert_step(&self, step: &StepRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state
            .steps
            .insert((step.run_id, step.name.clone()), step.clone());
        Ok(())
    }

    async fn get_step(&self, run_id: &Uuid, name: &str) -> Result<Option<StepRecord>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.steps.get(&(*run_id, name.to_string())).cloned())
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut steps: Vec<StepRecord> = state
            .steps
            .values()
            .filter(|s| s.run_id == *run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| (a.segment, &a.name).cmp(&(b.segment, &b.name)));
        Ok(steps)
    }

    async fn create_attempt(&self, attempt: &StepAttempt) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let taken = state.attempts.iter().any(|a| {
            a.run_id == attempt.run_id && a.step == attempt.step && a.number == attempt.number
        });
        if taken {
            return Err(RepositoryError::Conflict(format!(
                "{}/{}/attempts/{}",
                attempt.run_id, attempt.step, attempt.number
            )));
        }
        state.attempts.push(attempt.clone());
        Ok(())
    }

    async fn finish_attempt(&self, attempt: &StepAttempt) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .attempts
            .iter_mut()
            .find(|a| {
                a.run_id == attempt.run_id && a.step == attempt.step && a.number == attempt.number
            })
            .ok_or(RepositoryError::NotFound)?;
        if stored.status != loomflow_types::run::AttemptStatus::Running {
            return Err(RepositoryError::Conflict(format!(
                "{}/{}/attempts/{}",
                attempt.run_id, attempt.step, attempt.number
            )));
        }
        *stored = attempt.clone();
        Ok(())
    }

    async fn list_attempts(
        &self,
        run_id: &Uuid,
        step: Option<&str>,
    ) -> Result<Vec<StepAttempt>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut attempts: Vec<StepAttempt> = state
            .attempts
            .iter()
            .filter(|a| a.run_id == *run_id && step.is_none_or(|s| a.step == s))
            .cloned()
            .collect();
        attempts.sort_by(|a, b| (&a.step, a.number).cmp(&(&b.step, b.number)));
        Ok(attempts)
    }

    async fn save_gate(&self, gate: &GateRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state
            .gates
            .insert((gate.run_id, gate.gate_id.clone()), gate.clone());
        Ok(())
    }

    async fn get_gate(&self, run_id: &Uuid, gate_id: &str) -> Result<Option<GateRecord>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.gates.get(&(*run_id, gate_id.to_string())).cloned())
    }

    async fn list_gates(&self, run_id: &Uuid) -> Result<Vec<GateRecord>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .gates
            .values()
            .filter(|g| g.run_id == *run_id)
            .cloned()
            .collect())
    }

    async fn append_decision(&self, decision: &ApprovalDecision) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().decisions.push(decision.clone());
        Ok(())
    }

    async fn list_decisions(&self, run_id: &Uuid) -> Result<Vec<ApprovalDecision>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .decisions
            .iter()
            .filter(|d| d.run_id == *run_id)
            .cloned()
            .collect())
    }

    async fn save_phase(&self, record: &PhaseRecord) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state
            .phases
            .insert((record.run_id, record.step.clone()), record.clone());
        Ok(())
    }

    async fn get_phase(&self, run_id: &Uuid, step: &str) -> Result<Option<PhaseRecord>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state.phases.get(&(*run_id, step.to_string())).cloned())
    }

    async fn list_phases(&self, run_id: &Uuid) -> Result<Vec<PhaseRecord>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .phases
            .values()
            .filter(|p| p.run_id == *run_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ArtifactState {
    blobs: HashMap<String, Vec<u8>>,
    artifacts: BTreeMap<(Uuid, String, u32), ArtifactRef>,
}

#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    state: Arc<Mutex<ArtifactState>>,
}

impl ArtifactStore for MemoryArtifactStore {
    async fn put_blob(&self, digest: &str, bytes: &[u8]) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        state
            .blobs
            .entry(digest.to_string())
            .or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    async fn read_blob(&self, digest: &str) -> Result<Option<Vec<u8>>, RepositoryError> {
        Ok(self.state.lock().unwrap().blobs.get(digest).cloned())
    }

    async fn commit(&self, artifact: &ArtifactRef) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let key = (artifact.run_id, artifact.step.clone(), artifact.revision);
        if state.artifacts.contains_key(&key) {
            return Err(RepositoryError::Conflict(output_key(
                &artifact.tenant_id,
                &artifact.run_id,
                &artifact.step,
                artifact.revision,
            )));
        }
        state.artifacts.insert(key, artifact.clone());
        Ok(())
    }

    async fn get_latest(&self, run_id: &Uuid, step: &str) -> Result<Option<ArtifactRef>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .artifacts
            .values()
            .filter(|a| a.run_id == *run_id && a.step == step)
            .max_by_key(|a| a.revision)
            .cloned())
    }

    async fn get_revision(
        &self,
        run_id: &Uuid,
        step: &str,
        revision: u32,
    ) -> Result<Option<ArtifactRef>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .artifacts
            .get(&(*run_id, step.to_string(), revision))
            .cloned())
    }

    async fn list_artifacts(&self, run_id: &Uuid) -> Result<Vec<ArtifactRef>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .artifacts
            .values()
            .filter(|a| a.run_id == *run_id)
            .cloned()
            .collect())
    }
}

/// Non-cryptographic hasher for tests.
pub struct TestHasher;

impl ContentHasher for TestHasher {
    fn compute_hash(&self, content: &[u8]) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        content.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        multiplier: 2.0,
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry: fast_retry(),
        ..EngineConfig::default()
    }
}

/// An ungated step with the fast test retry policy.
pub fn planned(name: &str) -> PlannedStep {
    PlannedStep {
        name: name.to_string(),
        display_name: name.to_string(),
        target: name.to_string(),
        config: json!({}),
        timeout_secs: 30,
        retry: fast_retry(),
        quality: None,
        expect: OutputFormat::Any,
    }
}

pub fn gated(name: &str, threshold: f64, max_attempts: u32, accept_on_final: bool) -> PlannedStep {
    PlannedStep {
        quality: Some(QualityGate {
            threshold,
            max_attempts,
            accept_on_final,
        }),
        ..planned(name)
    }
}

/// Plan: a | (b, c) | gate (rejects to a) | d.
pub fn sample_run() -> Run {
    let now = Utc::now();
    Run {
        id: Uuid::now_v7(),
        tenant_id: TENANT.to_string(),
        pipeline: "sample".to_string(),
        status: RunStatus::Running,
        cursor: 0,
        current_step: None,
        plan: RunPlan {
            pipeline: "sample".to_string(),
            version: "1.0.0".to_string(),
            segments: vec![
                PlanSegment::Step { step: planned("a") },
                PlanSegment::Parallel {
                    id: "g".to_string(),
                    steps: vec![planned("b"), planned("c")],
                    review: false,
                },
                PlanSegment::Approval {
                    gate_id: "gate".to_string(),
                    prompt: "Ship it?".to_string(),
                    on_reject: vec!["a".to_string()],
                },
                PlanSegment::Step { step: planned("d") },
            ],
        },
        input: json!({"topic": "rust"}),
        forked_from: None,
        failure: None,
        created_at: now,
        updated_at: now,
    }
}

// ---------------------------------------------------------------------------
// ScriptedWork
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    queued: HashMap<String, VecDeque<Result<WorkOutput, WorkFailure>>>,
    requests: HashMap<String, Vec<WorkRequest>>,
    delays: HashMap<String, Duration>,
}

/// Step work that replays queued results per step and succeeds otherwise.
#[derive(Clone, Default)]
pub struct ScriptedWork {
    script: Arc<Mutex<Script>>,
}

impl ScriptedWork {
    pub fn push_output(&self, step: &str, output: WorkOutput) {
        let mut script = self.script.lock().unwrap();
        script
            .queued
            .entry(step.to_string())
            .or_default()
            .push_back(Ok(output));
    }

    pub fn push_failure(&self, step: &str, failure: WorkFailure) {
        let mut script = self.script.lock().unwrap();
        script
            .queued
            .entry(step.to_string())
            .or_default()
            .push_back(Err(failure));
    }

    /// Hold every invocation of `step` for `delay` after it is recorded.
    pub fn set_delay(&self, step: &str, delay: Duration) {
        let mut script = self.script.lock().unwrap();
        script.delays.insert(step.to_string(), delay);
    }

    pub fn push_score(&self, step: &str, score: f64) {
        self.push_score_with_issues(step, score, &[]);
    }

    pub fn push_score_with_issues(&self, step: &str, score: f64, issues: &[&str]) {
        self.push_output(
            step,
            WorkOutput {
                payload: json!({"step": step, "score": score}),
                summary: format!("{step} scored {score}"),
                quality_score: Some(score),
                issues: issues.iter().map(|i| i.to_string()).collect(),
            },
        );
    }

    pub fn calls(&self, step: &str) -> usize {
        self.requests(step).len()
    }

    pub fn requests(&self, step: &str) -> Vec<WorkRequest> {
        let script = self.script.lock().unwrap();
        script.requests.get(step).cloned().unwrap_or_default()
    }
}

impl StepWork for ScriptedWork {
    async fn invoke(&self, request: &WorkRequest) -> Result<WorkOutput, WorkFailure> {
        let (next, delay) = {
            let mut script = self.script.lock().unwrap();
            script
                .requests
                .entry(request.step.clone())
                .or_default()
                .push(request.clone());
            let next = script
                .queued
                .get_mut(&request.step)
                .and_then(|queue| queue.pop_front());
            (next, script.delays.get(&request.step).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        next.unwrap_or_else(|| {
            Ok(WorkOutput {
                payload: json!({"step": request.step, "attempt": request.attempt}),
                summary: format!("{} output", request.step),
                quality_score: Some(1.0),
                issues: vec![],
            })
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedPhaseWork
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PhaseScript {
    failures: HashMap<String, VecDeque<WorkFailure>>,
    requests: HashMap<String, Vec<PhaseRequest>>,
}

/// Phase work that proposes two positions and draws one image per target.
#[derive(Clone, Default)]
pub struct ScriptedPhaseWork {
    script: Arc<Mutex<PhaseScript>>,
}

impl ScriptedPhaseWork {
    /// Queue a failure for `operation` ("analyze", "generate" or "insert").
    pub fn push_failure(&self, operation: &str, failure: WorkFailure) {
        let mut script = self.script.lock().unwrap();
        script
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(failure);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.requests(operation).len()
    }

    pub fn requests(&self, operation: &str) -> Vec<PhaseRequest> {
        let script = self.script.lock().unwrap();
        script.requests.get(operation).cloned().unwrap_or_default()
    }

    fn record(&self, operation: &str, request: &PhaseRequest) -> Result<(), WorkFailure> {
        let mut script = self.script.lock().unwrap();
        script
            .requests
            .entry(operation.to_string())
            .or_default()
            .push(request.clone());
        match script
            .failures
            .get_mut(operation)
            .and_then(|queue| queue.pop_front())
        {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl PhaseWork for ScriptedPhaseWork {
    async fn analyze(&self, request: &PhaseRequest) -> Result<Vec<ImagePosition>, WorkFailure> {
        self.record("analyze", request)?;
        Ok(["p1", "p2"]
            .into_iter()
            .map(|id| ImagePosition {
                id: id.to_string(),
                anchor: format!("section {id}"),
                description: format!("illustration for {id}"),
            })
            .collect())
    }

    async fn generate(
        &self,
        request: &PhaseRequest,
    ) -> Result<BTreeMap<String, GeneratedImage>, WorkFailure> {
        self.record("generate", request)?;
        Ok(request
            .targets
            .iter()
            .map(|id| {
                let image = GeneratedImage {
                    payload: json!({"position": id, "attempt": request.attempt}),
                    summary: format!("image for {id}"),
                };
                (id.clone(), image)
            })
            .collect())
    }

    async fn insert(&self, request: &PhaseRequest) -> Result<serde_json::Value, WorkFailure> {
        self.record("insert", request)?;
        Ok(json!({
            "body": "illustrated document",
            "images": request.images.keys().collect::<Vec<_>>(),
        }))
    }
}

// ---------------------------------------------------------------------------
// TestEngine (executor level)
// ---------------------------------------------------------------------------

pub struct TestEngine {
    pub executor: Arc<StepExecutor<MemoryRunRepository, MemoryArtifactStore>>,
    pub checkpoint: Arc<CheckpointManager<MemoryRunRepository>>,
    pub work: ScriptedWork,
    pub run: Run,
}

impl TestEngine {
    pub fn new() -> Self {
        let repo = MemoryRunRepository::default();
        let run = sample_run();
        repo.seed(run.clone());

        let checkpoint = Arc::new(CheckpointManager::new(repo));
        let store = Arc::new(IdempotencyStore::new(
            MemoryArtifactStore::default(),
            Arc::new(TestHasher),
        ));
        let work = ScriptedWork::default();
        let executor = Arc::new(StepExecutor::new(
            checkpoint.clone(),
            store,
            Arc::new(BoxStepWork::new(work.clone())),
            EventBus::new(64),
        ));

        Self {
            executor,
            checkpoint,
            work,
            run,
        }
    }

    pub fn call(&self, _name: &str, step: PlannedStep) -> StepCall {
        StepCall {
            run_id: self.run.id,
            tenant_id: self.run.tenant_id.clone(),
            segment: 0,
            step,
            revision: 0,
            input: StepInput::default(),
        }
    }

    pub async fn attempts(&self, step: &str) -> Vec<StepAttempt> {
        self.checkpoint
            .list_attempts(self.run.id, Some(step))
            .await
            .unwrap()
    }

    pub async fn step_record(&self, step: &str) -> StepRecord {
        self.checkpoint.step(self.run.id, step).await.unwrap().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Harness (coordinator level)
// ---------------------------------------------------------------------------

pub struct Harness {
    pub coordinator: Arc<RunCoordinator<MemoryRunRepository, MemoryArtifactStore>>,
    pub work: ScriptedWork,
    pub phase_work: ScriptedPhaseWork,
}

impl Harness {
    pub fn new() -> Self {
        let work = ScriptedWork::default();
        let phase_work = ScriptedPhaseWork::default();
        let coordinator = RunCoordinator::new(
            MemoryRunRepository::default(),
            MemoryArtifactStore::default(),
            Arc::new(TestHasher),
            BoxStepWork::new(work.clone()),
            BoxPhaseWork::new(phase_work.clone()),
            test_config(),
        );
        Self {
            coordinator: Arc::new(coordinator),
            work,
            phase_work,
        }
    }

    /// Create a run of the YAML pipeline without driving it.
    pub async fn create(&self, yaml: &str) -> Run {
        let pipeline = parse_pipeline_yaml(yaml).unwrap();
        self.coordinator
            .create_run(TENANT, &pipeline, json!({"topic": "rust"}))
            .await
            .unwrap()
    }

    /// Create a run and drive it until it settles or suspends.
    pub async fn start(&self, yaml: &str) -> Run {
        let run = self.create(yaml).await;
        self.coordinator.drive(run.id).await.unwrap()
    }

    pub async fn submit(
        &self,
        run_id: Uuid,
        event: loomflow_types::phase::PhaseEvent,
    ) -> PhaseRecord {
        self.coordinator
            .submit_phase_event(run_id, TENANT, "images", event)
            .await
            .unwrap()
    }

    pub async fn phase(&self, run_id: Uuid) -> PhaseRecord {
        self.coordinator
            .checkpoint()
            .phase(run_id, "images")
            .await
            .unwrap()
            .unwrap()
    }
}
