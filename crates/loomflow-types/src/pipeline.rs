//! Pipeline domain types for Loomflow.
//!
//! A `PipelineDefinition` is the authored form (YAML on disk). At run creation
//! it is resolved once into a `RunPlan`, the immutable step-graph snapshot that
//! the engine walks. Per-step policies (retry caps, quality gates, timeouts)
//! live on the plan so they are never re-derived during execution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pipeline Definition (authored form)
// ---------------------------------------------------------------------------

/// The authored pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name, unique within a data directory (e.g. "longform-article").
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.2.0").
    pub version: String,
    /// Ordered segments. Segments run strictly in this order.
    pub segments: Vec<SegmentDefinition>,
    /// Extensible metadata passed through untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One unit of the ordered step graph.
///
/// Internally tagged by `type`:
/// ```yaml
/// - type: parallel
///   id: sections
///   review: true
///   steps:
///     - id: intro
///       target: write-section
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentDefinition {
    /// A single step.
    Step(StepSpec),
    /// Independent steps executed concurrently.
    Parallel {
        id: String,
        steps: Vec<StepSpec>,
        /// When true the group ends in a per-step human review.
        #[serde(default)]
        review: bool,
    },
    /// Human approval checkpoint.
    Approval(ApprovalSpec),
    /// Multi-phase sub-workflow step.
    Phased(PhasedSpec),
}

/// A single step in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step ID, unique within the pipeline (e.g. "outline").
    pub id: String,
    /// Human-readable name (defaults to the ID).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Work target handed to the work function (route name or absolute URL).
    pub target: String,
    /// Step-specific configuration passed to the work function.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Per-invocation timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Retry policy for RETRYABLE failures (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Quality acceptance policy. Only steps whose output carries a score set this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityGate>,
    /// Expected payload shape.
    #[serde(default)]
    pub expect: OutputFormat,
}

/// Approval gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSpec {
    /// Gate ID, unique within the pipeline.
    pub id: String,
    /// Prompt shown to the reviewer.
    pub prompt: String,
    /// Upstream steps re-invoked (with the rejection reason) when the gate is rejected.
    #[serde(default)]
    pub on_reject: Vec<String>,
}

/// Multi-phase sub-workflow step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasedSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Work target for the analyze / generate / insert phases.
    pub target: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Expected shape of a step's output payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Any non-empty JSON value.
    #[default]
    Any,
    /// A JSON object or array.
    Json,
    /// A non-empty string.
    Text,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Any => "any",
            OutputFormat::Json => "json",
            OutputFormat::Text => "text",
        }
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for RETRYABLE failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of invocations, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default 500).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay in milliseconds (default 30000).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays (default 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Acceptance policy for steps whose output carries a quality score in [0, 1].
///
/// `accept_on_final` has no default: every gated step must state whether it
/// may degrade to best effort or must fail hard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    /// Minimum accepted score.
    pub threshold: f64,
    /// Maximum executor calls for one loop invocation.
    pub max_attempts: u32,
    /// Accept the final below-threshold result with a warning instead of failing.
    pub accept_on_final: bool,
}

// ---------------------------------------------------------------------------
// Run Plan (resolved snapshot)
// ---------------------------------------------------------------------------

/// The resolved, immutable step graph stored on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    pub pipeline: String,
    pub version: String,
    pub segments: Vec<PlanSegment>,
}

/// A resolved segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanSegment {
    Step {
        step: PlannedStep,
    },
    Parallel {
        id: String,
        steps: Vec<PlannedStep>,
        review: bool,
    },
    Approval {
        gate_id: String,
        prompt: String,
        on_reject: Vec<String>,
    },
    Phased {
        step: PlannedStep,
    },
}

impl PlanSegment {
    /// The segment's identifier (step name, group ID, or gate ID).
    pub fn id(&self) -> &str {
        match self {
            PlanSegment::Step { step } | PlanSegment::Phased { step } => &step.name,
            PlanSegment::Parallel { id, .. } => id,
            PlanSegment::Approval { gate_id, .. } => gate_id,
        }
    }

    /// Steps owned by this segment (empty for approval gates).
    pub fn steps(&self) -> Vec<&PlannedStep> {
        match self {
            PlanSegment::Step { step } | PlanSegment::Phased { step } => vec![step],
            PlanSegment::Parallel { steps, .. } => steps.iter().collect(),
            PlanSegment::Approval { .. } => Vec::new(),
        }
    }
}

/// A step with every policy resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub name: String,
    pub display_name: String,
    pub target: String,
    pub config: serde_json::Value,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityGate>,
    pub expect: OutputFormat,
}

impl RunPlan {
    /// Index of the segment that owns `step`.
    pub fn segment_of(&self, step: &str) -> Option<usize> {
        self.segments
            .iter()
            .position(|seg| seg.steps().iter().any(|s| s.name == step))
    }

    /// Index of the approval gate `gate_id`.
    pub fn gate_segment(&self, gate_id: &str) -> Option<usize> {
        self.segments.iter().position(
            |seg| matches!(seg, PlanSegment::Approval { gate_id: id, .. } if id == gate_id),
        )
    }

    /// Look up a planned step by name.
    pub fn step(&self, name: &str) -> Option<&PlannedStep> {
        self.segments
            .iter()
            .flat_map(|seg| seg.steps())
            .find(|s| s.name == name)
    }

    /// All step names in graph order.
    pub fn step_names(&self) -> Vec<String> {
        self.segments
            .iter()
            .flat_map(|seg| seg.steps())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Names of all steps in segments strictly before `segment`.
    pub fn steps_before(&self, segment: usize) -> Vec<String> {
        self.segments
            .iter()
            .take(segment)
            .flat_map(|seg| seg.steps())
            .map(|s| s.name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
