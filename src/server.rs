//! HTTP surface (§6): health and metrics probes plus the operator-facing
//! submission/query/approval routes `core-cli` drives.
//!
//! Grounded in the donor's `create_router`/`serve`/
//! `serve_with_graceful_shutdown` trio, extended with real routes the way
//! `rest_api.rs` extends past the donor's bare health check.

use crate::comm_manager::{HealthReport, HealthStatus};
use crate::domain_types::{TemplateId, WorkflowId};
use crate::error::CoreError;
use crate::metrics::MetricsSnapshot;
use crate::queue::QueueStats;
use crate::workflow::{ApprovalDecision, RfpDocument, WorkflowEngine, WorkflowState};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Malformed(_) | CoreError::StateConflict(_) => StatusCode::BAD_REQUEST,
            CoreError::Timeout { .. } | CoreError::Exhausted { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::BreakerOpen { .. } | CoreError::Unavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Request body for `POST /rfps`.
#[derive(Debug, Deserialize)]
pub struct SubmitRfpRequest {
    /// The RFP document to process.
    pub document: RfpDocument,
    /// Explicit template override; omitted selects by predicate.
    pub template_id: Option<TemplateId>,
}

#[derive(Debug, Serialize)]
struct SubmitRfpResponse {
    workflow_id: WorkflowId,
}

/// Request body for `POST /workflows/:id/cancel`.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// Human-readable reason recorded in the audit trail.
    pub reason: String,
}

/// Request body for `POST /workflows/:id/approvals`.
#[derive(Debug, Deserialize)]
pub struct SubmitApprovalRequest {
    /// The decision made.
    pub decision: ApprovalDecision,
    /// Who made it, recorded in the audit trail.
    pub decided_by: String,
}

async fn submit_rfp(
    State(engine): State<Arc<WorkflowEngine>>,
    Json(request): Json<SubmitRfpRequest>,
) -> Result<Json<SubmitRfpResponse>, CoreError> {
    let workflow_id = engine.submit(request.document, request.template_id).await?;
    Ok(Json(SubmitRfpResponse { workflow_id }))
}

async fn get_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path(workflow_id): Path<WorkflowId>,
) -> Result<Json<WorkflowState>, CoreError> {
    let state = engine
        .get(workflow_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("workflow {workflow_id}")))?;
    Ok(Json(state))
}

async fn list_workflows(
    State(engine): State<Arc<WorkflowEngine>>,
) -> Result<Json<Vec<WorkflowState>>, CoreError> {
    Ok(Json(engine.list().await?))
}

async fn cancel_workflow(
    State(engine): State<Arc<WorkflowEngine>>,
    Path(workflow_id): Path<WorkflowId>,
    Json(request): Json<CancelRequest>,
) -> Result<StatusCode, CoreError> {
    engine.cancel(workflow_id, request.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_approval(
    State(engine): State<Arc<WorkflowEngine>>,
    Path(workflow_id): Path<WorkflowId>,
    Json(request): Json<SubmitApprovalRequest>,
) -> Result<StatusCode, CoreError> {
    engine
        .submit_approval(workflow_id, request.decision, &request.decided_by)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(engine): State<Arc<WorkflowEngine>>) -> (StatusCode, Json<HealthReport>) {
    let report = engine.health_report().await;
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report))
}

async fn metrics(State(engine): State<Arc<WorkflowEngine>>) -> impl IntoResponse {
    let snapshot = engine.metrics_snapshot();
    let queues = engine.queue_snapshots().await;
    let body = render_metrics_text(&snapshot, &queues);
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// Renders `snapshot`/`queues` in Prometheus's line-oriented text exposition
/// format (§6 `GET /metrics`).
fn render_metrics_text(snapshot: &MetricsSnapshot, queues: &[(String, QueueStats)]) -> String {
    let mut out = String::new();
    for (kind, count) in &snapshot.by_kind {
        let _ = writeln!(out, "core_messages_total{{kind=\"{kind}\"}} {count}");
    }
    for (priority, count) in &snapshot.by_priority {
        let _ = writeln!(out, "core_messages_total{{priority=\"{priority}\"}} {count}");
    }
    for (agent_id, stats) in queues {
        let size: usize = stats.size_by_lane.iter().sum();
        let _ = writeln!(out, "core_queue_size{{agent_id=\"{agent_id}\"}} {size}");
    }
    let quantiles = [
        ("p50", snapshot.end_to_end_latency.p50_ms),
        ("p95", snapshot.end_to_end_latency.p95_ms),
        ("p99", snapshot.end_to_end_latency.p99_ms),
    ];
    for (quantile, value) in quantiles {
        if let Some(value) = value {
            let _ = writeln!(out, "core_request_latency_ms{{quantile=\"{quantile}\"}} {value}");
        }
    }
    let _ = writeln!(out, "core_uptime_seconds {}", snapshot.uptime_seconds);
    out
}

/// Builds the router exposing `/health`, `/metrics`, and the operator
/// routes, all dispatching to `engine`.
#[must_use]
pub fn create_router(engine: Arc<WorkflowEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/rfps", post(submit_rfp))
        .route("/workflows", get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workflows/{id}/approvals", post(submit_approval))
        .with_state(engine)
}

/// Binds a listener at `addr` for the given router (for testing with a
/// fixed or OS-chosen port — pass port `0` for the latter).
///
/// # Errors
/// Returns an error if the port cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    Ok((listener, actual_addr))
}

/// Serves `router` on `listener` until the process is killed.
///
/// # Errors
/// Returns an error if the server fails during operation.
pub async fn serve(listener: TcpListener, router: Router) -> Result<(), std::io::Error> {
    axum::serve(listener, router)
        .await
        .map_err(std::io::Error::other)?;
    Ok(())
}

/// Serves `router` on `listener` until `shutdown_token` is cancelled.
///
/// # Errors
/// Returns an error if the server fails during operation.
pub async fn serve_with_graceful_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> Result<(), std::io::Error> {
    let shutdown_signal = async move {
        shutdown_token.cancelled().await;
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(std::io::Error::other)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm_manager::CommManagerConfig;
    use crate::kv::memory::MemoryKvStore;
    use crate::kv::KvStore;
    use crate::progress::ProgressTracker;
    use crate::workflow::TemplateStore;
    use std::time::Duration;
    use tokio::time::timeout;

    fn engine() -> Arc<WorkflowEngine> {
        let kv: Arc<dyn KvStore> =
            Arc::new(MemoryKvStore::new("/tmp/server-test.ndjson"));
        let (comm, _rx) = crate::comm_manager::CommunicationManager::new(
            CommManagerConfig::default(),
            Arc::clone(&kv),
        );
        let progress = Arc::new(ProgressTracker::new(Arc::clone(&comm), Arc::clone(&kv)));
        let templates = Arc::new(TemplateStore::new(Vec::new()));
        WorkflowEngine::new(comm, kv, progress, templates)
    }

    #[tokio::test]
    async fn health_route_reports_healthy_with_no_registered_agents() {
        let router = create_router(engine());
        let (listener, addr) = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let handle = tokio::spawn(serve(listener, router));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = reqwest::Client::new();
        let response = timeout(
            Duration::from_secs(1),
            client.get(format!("http://{addr}/health")).send(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(response.status().is_success());
        let report: HealthReport = response.json().await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.components["queues"].status, HealthStatus::Healthy);
        handle.abort();
    }

    #[tokio::test]
    async fn metrics_route_returns_prometheus_text() {
        let router = create_router(engine());
        let (listener, addr) = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let handle = tokio::spawn(serve(listener, router));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = reqwest::Client::new();
        let response = timeout(
            Duration::from_secs(1),
            client.get(format!("http://{addr}/metrics")).send(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(response.status().is_success());
        let body = response.text().await.unwrap();
        assert!(body.contains("core_uptime_seconds"));
        handle.abort();
    }

    #[test]
    fn render_metrics_text_includes_every_metric_family() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.by_kind.insert("request".to_string(), 3);
        snapshot.by_priority.insert("urgent".to_string(), 1);
        snapshot.end_to_end_latency.p50_ms = Some(12);
        snapshot.uptime_seconds = 42;
        let queues = vec![("technical-1".to_string(), QueueStats::default())];

        let text = render_metrics_text(&snapshot, &queues);
        assert!(text.contains("core_messages_total{kind=\"request\"} 3"));
        assert!(text.contains("core_messages_total{priority=\"urgent\"} 1"));
        assert!(text.contains("core_queue_size{agent_id=\"technical-1\"} 0"));
        assert!(text.contains("core_request_latency_ms{quantile=\"p50\"} 12"));
        assert!(text.contains("core_uptime_seconds 42"));
    }

    #[tokio::test]
    async fn list_workflows_route_starts_empty() {
        let router = create_router(engine());
        let (listener, addr) = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let handle = tokio::spawn(serve(listener, router));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = reqwest::Client::new();
        let response = timeout(
            Duration::from_secs(1),
            client.get(format!("http://{addr}/workflows")).send(),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(response.status().is_success());
        let body: Vec<WorkflowState> = response.json().await.unwrap();
        assert!(body.is_empty());
        handle.abort();
    }
}
