//! Work capabilities: the external functions steps and phases invoke.
//!
//! `StepWork` and `PhaseWork` use RPITIT like the repository traits. For
//! runtime selection (HTTP adapter vs. test doubles) each has an object-safe
//! `*Dyn` twin with boxed futures, a blanket impl, and a `Box*` wrapper:
//! 1. Define an object-safe trait with boxed futures
//! 2. Blanket-impl it for every implementation of the RPITIT trait
//! 3. The wrapper holds `Box<dyn ...>` and delegates

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use loomflow_types::phase::{GeneratedImage, ImagePosition, PhaseData};
use loomflow_types::run::ErrorCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Input assembled for one step invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    /// The run's initial input payload.
    pub run_input: serde_json::Value,
    /// Latest committed outputs of all steps in earlier segments.
    #[serde(default)]
    pub upstream: BTreeMap<String, serde_json::Value>,
    /// Rejection reasons, review instructions and quality feedback.
    #[serde(default)]
    pub feedback: Vec<String>,
}

/// One call to a step's work function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub step: String,
    pub target: String,
    /// Attempt number of this invocation.
    pub attempt: u32,
    pub config: serde_json::Value,
    pub input: StepInput,
}

/// Successful work function result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutput {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub summary: String,
    /// Quality score in [0, 1], required on quality-gated steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    /// Problems the work function noticed in its own output.
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Failure classes a work function may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Retryable,
    NonRetryable,
    ValidationFail,
}

impl FailureKind {
    pub fn code(&self) -> ErrorCode {
        match self {
            FailureKind::Retryable => ErrorCode::Retryable,
            FailureKind::NonRetryable => ErrorCode::NonRetryable,
            FailureKind::ValidationFail => ErrorCode::ValidationFail,
        }
    }
}

/// Classified work function failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl WorkFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::NonRetryable,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ValidationFail,
            message: message.into(),
        }
    }
}

impl fmt::Display for WorkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

/// One call into a multi-phase sub-workflow's async phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRequest {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub step: String,
    pub target: String,
    pub attempt: u32,
    pub config: serde_json::Value,
    pub input: StepInput,
    /// Intermediate data collected so far.
    pub data: PhaseData,
    /// Position IDs to generate for (generate only).
    #[serde(default)]
    pub targets: Vec<String>,
    /// Approved image payloads keyed by position (insert only).
    #[serde(default)]
    pub images: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// StepWork
// ---------------------------------------------------------------------------

/// The injected capability that performs a step's external work.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StepWork: Send + Sync {
    fn invoke(
        &self,
        request: &WorkRequest,
    ) -> impl Future<Output = Result<WorkOutput, WorkFailure>> + Send;
}

/// Object-safe version of [`StepWork`] with boxed futures.
pub trait StepWorkDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a WorkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<WorkOutput, WorkFailure>> + Send + 'a>>;
}

impl<T: StepWork> StepWorkDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a WorkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<WorkOutput, WorkFailure>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased step work for runtime selection.
pub struct BoxStepWork {
    inner: Box<dyn StepWorkDyn + Send + Sync>,
}

impl BoxStepWork {
    pub fn new<T: StepWork + 'static>(work: T) -> Self {
        Self {
            inner: Box::new(work),
        }
    }

    pub async fn invoke(&self, request: &WorkRequest) -> Result<WorkOutput, WorkFailure> {
        self.inner.invoke_boxed(request).await
    }
}

impl fmt::Debug for BoxStepWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxStepWork").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// PhaseWork
// ---------------------------------------------------------------------------

/// The injected capability behind the analyze / generate / insert phases.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait PhaseWork: Send + Sync {
    /// Propose image positions for the document.
    fn analyze(
        &self,
        request: &PhaseRequest,
    ) -> impl Future<Output = Result<Vec<ImagePosition>, WorkFailure>> + Send;

    /// Generate one image per entry of `request.targets`.
    fn generate(
        &self,
        request: &PhaseRequest,
    ) -> impl Future<Output = Result<BTreeMap<String, GeneratedImage>, WorkFailure>> + Send;

    /// Insert the approved images, returning the final document.
    fn insert(
        &self,
        request: &PhaseRequest,
    ) -> impl Future<Output = Result<serde_json::Value, WorkFailure>> + Send;
}

pub type BoxedPhaseFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, WorkFailure>> + Send + 'a>>;

/// Object-safe version of [`PhaseWork`] with boxed futures.
pub trait PhaseWorkDyn: Send + Sync {
    fn analyze_boxed<'a>(
        &'a self,
        request: &'a PhaseRequest,
    ) -> BoxedPhaseFuture<'a, Vec<ImagePosition>>;

    fn generate_boxed<'a>(
        &'a self,
        request: &'a PhaseRequest,
    ) -> BoxedPhaseFuture<'a, BTreeMap<String, GeneratedImage>>;

    fn insert_boxed<'a>(
        &'a self,
        request: &'a PhaseRequest,
    ) -> BoxedPhaseFuture<'a, serde_json::Value>;
}

impl<T: PhaseWork> PhaseWorkDyn for T {
    fn analyze_boxed<'a>(
        &'a self,
        request: &'a PhaseRequest,
    ) -> BoxedPhaseFuture<'a, Vec<ImagePosition>> {
        Box::pin(self.analyze(request))
    }

    fn generate_boxed<'a>(
        &'a self,
        request: &'a PhaseRequest,
    ) -> BoxedPhaseFuture<'a, BTreeMap<String, GeneratedImage>> {
        Box::pin(self.generate(request))
    }

    fn insert_boxed<'a>(
        &'a self,
        request: &'a PhaseRequest,
    ) -> BoxedPhaseFuture<'a, serde_json::Value> {
        Box::pin(self.insert(request))
    }
}

/// Type-erased phase work for runtime selection.
pub struct BoxPhaseWork {
    inner: Box<dyn PhaseWorkDyn + Send + Sync>,
}

impl BoxPhaseWork {
    pub fn new<T: PhaseWork + 'static>(work: T) -> Self {
        Self {
            inner: Box::new(work),
        }
    }

    pub async fn analyze(&self, request: &PhaseRequest) -> Result<Vec<ImagePosition>, WorkFailure> {
        self.inner.analyze_boxed(request).await
    }

    pub async fn generate(
        &self,
        request: &PhaseRequest,
    ) -> Result<BTreeMap<String, GeneratedImage>, WorkFailure> {
        self.inner.generate_boxed(request).await
    }

    pub async fn insert(&self, request: &PhaseRequest) -> Result<serde_json::Value, WorkFailure> {
        self.inner.insert_boxed(request).await
    }
}

impl fmt::Debug for BoxPhaseWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxPhaseWork").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl StepWork for Echo {
        async fn invoke(&self, request: &WorkRequest) -> Result<WorkOutput, WorkFailure> {
            if request.step == "broken" {
                return Err(WorkFailure::non_retryable("unauthorized"));
            }
            Ok(WorkOutput {
                payload: json!({ "echo": request.step }),
                summary: String::new(),
                quality_score: None,
                issues: vec![],
            })
        }
    }

    fn request(step: &str) -> WorkRequest {
        WorkRequest {
            run_id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            step: step.to_string(),
            target: step.to_string(),
            attempt: 1,
            config: json!({}),
            input: StepInput::default(),
        }
    }

    #[tokio::test]
    async fn box_step_work_delegates() {
        let work = BoxStepWork::new(Echo);
        let output = work.invoke(&request("outline")).await.unwrap();
        assert_eq!(output.payload, json!({"echo": "outline"}));

        let failure = work.invoke(&request("broken")).await.unwrap_err();
        assert_eq!(failure.kind.code(), ErrorCode::NonRetryable);
        assert_eq!(failure.to_string(), "NON_RETRYABLE: unauthorized");
    }

    #[test]
    fn work_output_decodes_with_optional_fields() {
        let output: WorkOutput = serde_json::from_value(json!({"payload": "text"})).unwrap();
        assert_eq!(output.summary, "");
        assert!(output.quality_score.is_none());
        assert!(output.issues.is_empty());
    }
}
