//! HTTP work adapters.
//!
//! `HttpStepWork` POSTs the `WorkRequest` JSON to `{base_url}/{target}` (or to
//! `target` itself when it is an absolute URL) and expects a `WorkOutput`
//! body. `HttpPhaseWork` POSTs a `PhaseRequest` to
//! `{base_url}/{target}/{analyze|generate|insert}`.
//!
//! Failure classification:
//! - timeout, connection error, 429 and 5xx: `RETRYABLE`
//! - 422 or an undecodable body: `VALIDATION_FAIL`
//! - any other non-success status: `NON_RETRYABLE`

use std::collections::BTreeMap;
use std::time::Duration;

use loomflow_core::workflow::work::{
    PhaseRequest, PhaseWork, StepWork, WorkFailure, WorkOutput, WorkRequest,
};
use loomflow_types::config::WorkConfig;
use loomflow_types::phase::{GeneratedImage, ImagePosition};
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Longest slice of an error body carried into a failure message.
const MAX_ERROR_BODY: usize = 512;

// ---------------------------------------------------------------------------
// Shared client
// ---------------------------------------------------------------------------

/// JSON-over-HTTP client shared by the step and phase adapters.
#[derive(Clone)]
pub struct HttpWorkClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpWorkClient {
    /// Build the client with the configured timeout and user agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend or resolver cannot be initialized.
    pub fn new(config: &WorkConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("loomflow/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Resolve a step target, optionally suffixed with a phase operation.
    pub fn endpoint(&self, target: &str, operation: Option<&str>) -> String {
        let base = if target.starts_with("http://") || target.starts_with("https://") {
            target.trim_end_matches('/').to_string()
        } else {
            format!("{}/{}", self.base_url, target.trim_matches('/'))
        };
        match operation {
            Some(op) => format!("{base}/{op}"),
            None => base,
        }
    }

    async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, WorkFailure>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &error_body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| WorkFailure::retryable(format!("failed to read response from {url}: {e}")))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| WorkFailure::validation(format!("undecodable response from {url}: {e}")))
    }
}

fn classify_transport(url: &str, err: &reqwest::Error) -> WorkFailure {
    if err.is_timeout() {
        WorkFailure::retryable(format!("request to {url} timed out"))
    } else if err.is_connect() || err.is_request() {
        WorkFailure::retryable(format!("request to {url} failed: {err}"))
    } else {
        WorkFailure::non_retryable(format!("request to {url} failed: {err}"))
    }
}

fn classify_status(status: u16, body: &str) -> WorkFailure {
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };

    match status {
        429 | 500..=599 => WorkFailure::retryable(message),
        422 => WorkFailure::validation(message),
        _ => WorkFailure::non_retryable(message),
    }
}

// ---------------------------------------------------------------------------
// HttpStepWork
// ---------------------------------------------------------------------------

/// `StepWork` over HTTP.
pub struct HttpStepWork {
    client: HttpWorkClient,
}

impl HttpStepWork {
    pub fn new(client: HttpWorkClient) -> Self {
        Self { client }
    }
}

impl StepWork for HttpStepWork {
    async fn invoke(&self, request: &WorkRequest) -> Result<WorkOutput, WorkFailure> {
        let url = self.client.endpoint(&request.target, None);
        debug!(
            run_id = %request.run_id,
            step = %request.step,
            attempt = request.attempt,
            url = %url,
            "invoking step work"
        );
        self.client.post_json(&url, request).await
    }
}

// ---------------------------------------------------------------------------
// HttpPhaseWork
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AnalyzeResponse {
    positions: Vec<ImagePosition>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    images: BTreeMap<String, GeneratedImage>,
}

#[derive(Deserialize)]
struct InsertResponse {
    document: serde_json::Value,
}

/// `PhaseWork` over HTTP.
pub struct HttpPhaseWork {
    client: HttpWorkClient,
}

impl HttpPhaseWork {
    pub fn new(client: HttpWorkClient) -> Self {
        Self { client }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: &PhaseRequest,
        operation: &str,
    ) -> Result<T, WorkFailure> {
        let url = self.client.endpoint(&request.target, Some(operation));
        debug!(
            run_id = %request.run_id,
            step = %request.step,
            operation,
            attempt = request.attempt,
            "invoking phase work"
        );
        self.client.post_json(&url, request).await
    }
}

impl PhaseWork for HttpPhaseWork {
    async fn analyze(&self, request: &PhaseRequest) -> Result<Vec<ImagePosition>, WorkFailure> {
        let response: AnalyzeResponse = self.call(request, "analyze").await?;
        Ok(response.positions)
    }

    async fn generate(
        &self,
        request: &PhaseRequest,
    ) -> Result<BTreeMap<String, GeneratedImage>, WorkFailure> {
        let response: GenerateResponse = self.call(request, "generate").await?;
        let unexpected: Vec<&String> = response
            .images
            .keys()
            .filter(|id| !request.targets.contains(id))
            .collect();
        if !unexpected.is_empty() {
            return Err(WorkFailure::validation(format!(
                "generated images for unrequested positions: {unexpected:?}"
            )));
        }
        Ok(response.images)
    }

    async fn insert(&self, request: &PhaseRequest) -> Result<serde_json::Value, WorkFailure> {
        let response: InsertResponse = self.call(request, "insert").await?;
        Ok(response.document)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use loomflow_core::workflow::work::{FailureKind, StepInput};
    use loomflow_types::phase::PhaseData;
    use serde_json::{Value, json};
    use uuid::Uuid;

    async fn outline(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({
            "payload": {
                "step": body["step"],
                "topic": body["input"]["run_input"]["topic"],
            },
            "summary": "outline ready",
            "quality_score": 0.8,
        }))
    }

    async fn unavailable() -> (StatusCode, &'static str) {
        (StatusCode::SERVICE_UNAVAILABLE, "try later")
    }

    async fn limited() -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }

    async fn unprocessable() -> (StatusCode, &'static str) {
        (StatusCode::UNPROCESSABLE_ENTITY, "payload missing")
    }

    async fn forbidden() -> StatusCode {
        StatusCode::FORBIDDEN
    }

    async fn garbage() -> &'static str {
        "this is not json"
    }

    async fn slow() -> Json<Value> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Json(json!({"payload": {}, "summary": "late"}))
    }

    async fn analyze() -> Json<Value> {
        Json(json!({"positions": [{"id": "p1", "anchor": "intro"}]}))
    }

    async fn generate(Json(body): Json<Value>) -> Json<Value> {
        let mut images = serde_json::Map::new();
        for target in body["targets"].as_array().cloned().unwrap_or_default() {
            let id = target.as_str().unwrap_or_default().to_string();
            images.insert(id.clone(), json!({"payload": {"image": id}, "summary": "img"}));
        }
        Json(json!({ "images": images }))
    }

    async fn generate_extra() -> Json<Value> {
        Json(json!({"images": {"zz": {"payload": "x"}}}))
    }

    async fn insert(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({"document": {"images": body["images"]}}))
    }

    async fn spawn_worker() -> String {
        let app = Router::new()
            .route("/outline", post(outline))
            .route("/unavailable", post(unavailable))
            .route("/limited", post(limited))
            .route("/unprocessable", post(unprocessable))
            .route("/forbidden", post(forbidden))
            .route("/garbage", post(garbage))
            .route("/slow", post(slow))
            .route("/images/analyze", post(analyze))
            .route("/images/generate", post(generate))
            .route("/images/insert", post(insert))
            .route("/extra/generate", post(generate_extra));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str) -> HttpWorkClient {
        HttpWorkClient::new(&WorkConfig {
            base_url: base_url.to_string(),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    fn work_request(target: &str) -> WorkRequest {
        WorkRequest {
            run_id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            step: "outline".to_string(),
            target: target.to_string(),
            attempt: 1,
            config: json!({}),
            input: StepInput {
                run_input: json!({"topic": "rust"}),
                ..Default::default()
            },
        }
    }

    fn phase_request(target: &str, targets: &[&str]) -> PhaseRequest {
        PhaseRequest {
            run_id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            step: "images".to_string(),
            target: target.to_string(),
            attempt: 1,
            config: json!({}),
            input: StepInput::default(),
            data: PhaseData::default(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            images: BTreeMap::from([("p1".to_string(), json!({"image": "p1"}))]),
        }
    }

    #[test]
    fn endpoint_joins_relative_and_keeps_absolute_targets() {
        let client = client("http://workers:8700/");
        assert_eq!(client.endpoint("outline", None), "http://workers:8700/outline");
        assert_eq!(
            client.endpoint("images", Some("analyze")),
            "http://workers:8700/images/analyze"
        );
        assert_eq!(
            client.endpoint("https://gpu.example.com/render/", Some("generate")),
            "https://gpu.example.com/render/generate"
        );
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429, "").kind, FailureKind::Retryable);
        assert_eq!(classify_status(502, "").kind, FailureKind::Retryable);
        assert_eq!(classify_status(422, "").kind, FailureKind::ValidationFail);
        assert_eq!(classify_status(401, "").kind, FailureKind::NonRetryable);
        assert_eq!(classify_status(404, "nope").message, "HTTP 404: nope");
    }

    #[tokio::test]
    async fn step_work_posts_request_and_decodes_output() {
        let base = spawn_worker().await;
        let work = HttpStepWork::new(client(&base));

        let output = work.invoke(&work_request("outline")).await.unwrap();
        assert_eq!(output.payload, json!({"step": "outline", "topic": "rust"}));
        assert_eq!(output.summary, "outline ready");
        assert_eq!(output.quality_score, Some(0.8));
        assert!(output.issues.is_empty());
    }

    #[tokio::test]
    async fn step_work_honors_absolute_targets() {
        let base = spawn_worker().await;
        // The base URL points nowhere; the absolute target must win.
        let work = HttpStepWork::new(client("http://127.0.0.1:9"));

        let output = work
            .invoke(&work_request(&format!("{base}/outline")))
            .await
            .unwrap();
        assert_eq!(output.summary, "outline ready");
    }

    #[tokio::test]
    async fn step_work_classifies_failures() {
        let base = spawn_worker().await;
        let work = HttpStepWork::new(client(&base));

        for (target, kind) in [
            ("unavailable", FailureKind::Retryable),
            ("limited", FailureKind::Retryable),
            ("unprocessable", FailureKind::ValidationFail),
            ("forbidden", FailureKind::NonRetryable),
            ("missing", FailureKind::NonRetryable),
            ("garbage", FailureKind::ValidationFail),
        ] {
            let failure = work.invoke(&work_request(target)).await.unwrap_err();
            assert_eq!(failure.kind, kind, "target {target}: {failure}");
        }

        let failure = work.invoke(&work_request("unavailable")).await.unwrap_err();
        assert_eq!(failure.message, "HTTP 503: try later");
    }

    #[tokio::test]
    async fn configured_request_timeout_applies() {
        let base = spawn_worker().await;
        let client = HttpWorkClient::new(&WorkConfig {
            base_url: base,
            request_timeout_secs: 1,
        })
        .unwrap();
        let work = HttpStepWork::new(client);

        let failure = work.invoke(&work_request("slow")).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Retryable);
        assert!(failure.message.contains("timed out"), "{failure}");
    }

    #[tokio::test]
    async fn connection_refused_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let work = HttpStepWork::new(client(&format!("http://{addr}")));
        let failure = work.invoke(&work_request("outline")).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Retryable);
    }

    #[tokio::test]
    async fn phase_work_round_trips_each_operation() {
        let base = spawn_worker().await;
        let work = HttpPhaseWork::new(client(&base));

        let positions = work.analyze(&phase_request("images", &[])).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].id, "p1");
        assert_eq!(positions[0].description, "");

        let images = work
            .generate(&phase_request("images", &["p1", "p2"]))
            .await
            .unwrap();
        assert_eq!(images.keys().collect::<Vec<_>>(), vec!["p1", "p2"]);
        assert_eq!(images["p2"].payload, json!({"image": "p2"}));

        let document = work.insert(&phase_request("images", &[])).await.unwrap();
        assert_eq!(document, json!({"images": {"p1": {"image": "p1"}}}));
    }

    #[tokio::test]
    async fn phase_work_rejects_images_for_unrequested_positions() {
        let base = spawn_worker().await;
        let work = HttpPhaseWork::new(client(&base));

        let failure = work
            .generate(&phase_request("extra", &["p1"]))
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ValidationFail);
    }
}
