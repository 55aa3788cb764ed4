//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`, except `/health`.
//! Middleware: CORS, request tracing.

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .merge(handlers::run::run_routes())
        .merge(handlers::pipeline::pipeline_routes())
        .route("/ws/events", get(handlers::ws::ws_handler));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness check (no tenant required).
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use loomflow_core::workflow::work::{
        BoxPhaseWork, BoxStepWork, PhaseRequest, PhaseWork, StepWork, WorkFailure, WorkOutput,
        WorkRequest,
    };
    use loomflow_types::config::EngineConfig;
    use loomflow_types::phase::{GeneratedImage, ImagePosition};

    const BRIEF_YAML: &str = r#"
name: brief
version: "1.0.0"
segments:
  - type: step
    id: outline
    target: outline
  - type: approval
    id: editor
    prompt: "Publish the brief?"
    on_reject: [outline]
  - type: step
    id: publish
    target: publish
"#;

    struct EchoWork;

    impl StepWork for EchoWork {
        async fn invoke(&self, request: &WorkRequest) -> Result<WorkOutput, WorkFailure> {
            Ok(WorkOutput {
                payload: json!({ "step": request.step, "attempt": request.attempt }),
                summary: format!("{} done", request.step),
                quality_score: None,
                issues: vec![],
            })
        }
    }

    struct NoImages;

    impl PhaseWork for NoImages {
        async fn analyze(&self, _request: &PhaseRequest) -> Result<Vec<ImagePosition>, WorkFailure> {
            Ok(vec![])
        }

        async fn generate(
            &self,
            _request: &PhaseRequest,
        ) -> Result<BTreeMap<String, GeneratedImage>, WorkFailure> {
            Ok(BTreeMap::new())
        }

        async fn insert(&self, request: &PhaseRequest) -> Result<Value, WorkFailure> {
            Ok(json!({ "step": request.step }))
        }
    }

    async fn test_router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pipelines = dir.path().join("pipelines");
        std::fs::create_dir_all(&pipelines).unwrap();
        std::fs::write(pipelines.join("brief.yaml"), BRIEF_YAML).unwrap();

        let state = AppState::with_work(
            dir.path().to_path_buf(),
            EngineConfig::default(),
            BoxStepWork::new(EchoWork),
            BoxPhaseWork::new(NoImages),
        )
        .await
        .unwrap();
        (build_router(state), dir)
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        tenant: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tenant) = tenant {
            builder = builder.header("X-Tenant-Id", tenant);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn wait_for_status(router: &Router, run_id: &str, tenant: &str, want: &str) -> Value {
        for _ in 0..200 {
            let (status, body) =
                send(router, "GET", &format!("/api/v1/runs/{run_id}"), Some(tenant), None).await;
            assert_eq!(status, StatusCode::OK);
            if body["data"]["run"]["status"] == want {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never reached {want}");
    }

    async fn start_brief(router: &Router, tenant: &str) -> String {
        let (status, body) = send(
            router,
            "POST",
            "/api/v1/runs",
            Some(tenant),
            Some(json!({"pipeline": "brief", "input": {"topic": "tides"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["data"]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (router, _dir) = test_router().await;
        let (status, body) = send(&router, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_list_pipelines() {
        let (router, _dir) = test_router().await;
        let (status, body) = send(&router, "GET", "/api/v1/pipelines", None, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["name"], "brief");
        assert_eq!(body["data"][0]["steps"], 2);
        assert_eq!(body["data"][0]["segments"], 3);
    }

    #[tokio::test]
    async fn test_run_routes_require_tenant() {
        let (router, _dir) = test_router().await;
        let (status, body) = send(
            &router,
            "POST",
            "/api/v1/runs",
            None,
            Some(json!({"pipeline": "brief"})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_pipeline_is_not_found() {
        let (router, _dir) = test_router().await;
        let (status, body) = send(
            &router,
            "POST",
            "/api/v1/runs",
            Some("acme"),
            Some(json!({"pipeline": "missing"})),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_run_waits_for_approval_then_completes() {
        let (router, _dir) = test_router().await;
        let run_id = start_brief(&router, "acme").await;

        let waiting = wait_for_status(&router, &run_id, "acme", "waiting_approval").await;
        assert_eq!(waiting["data"]["run"]["current_step"], "editor");
        assert_eq!(
            waiting["_links"]["self"],
            format!("/api/v1/runs/{run_id}")
        );

        let (status, _) = send(
            &router,
            "POST",
            &format!("/api/v1/runs/{run_id}/approve"),
            Some("acme"),
            Some(json!({"actor": "dana"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let done = wait_for_status(&router, &run_id, "acme", "completed").await;
        let decisions = done["data"]["decisions"].as_array().unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0]["actor"], "dana");
        assert_eq!(decisions[0]["decision"], "approve");
    }

    #[tokio::test]
    async fn test_reject_requires_reason() {
        let (router, _dir) = test_router().await;
        let run_id = start_brief(&router, "acme").await;
        wait_for_status(&router, &run_id, "acme", "waiting_approval").await;

        let (status, body) = send(
            &router,
            "POST",
            &format!("/api/v1/runs/{run_id}/reject"),
            Some("acme"),
            Some(json!({"reason": "   "})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "VALIDATION_ERROR");
        wait_for_status(&router, &run_id, "acme", "waiting_approval").await;
    }

    #[tokio::test]
    async fn test_other_tenant_sees_not_found() {
        let (router, _dir) = test_router().await;
        let run_id = start_brief(&router, "acme").await;

        let (status, body) = send(
            &router,
            "GET",
            &format!("/api/v1/runs/{run_id}"),
            Some("globex"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "RUN_NOT_FOUND");

        let (_, listed) = send(&router, "GET", "/api/v1/runs", Some("globex"), None).await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_then_decisions_are_invalid_state() {
        let (router, _dir) = test_router().await;
        let run_id = start_brief(&router, "acme").await;
        wait_for_status(&router, &run_id, "acme", "waiting_approval").await;

        let (status, body) = send(
            &router,
            "DELETE",
            &format!("/api/v1/runs/{run_id}"),
            Some("acme"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "cancelled");

        let (status, body) = send(
            &router,
            "POST",
            &format!("/api/v1/runs/{run_id}/approve"),
            Some("acme"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errors"][0]["code"], "INVALID_STATE");
    }
}
