//! Health, status and control API.
//!
//! Served on the main port next to the inference traffic. Every state-changing
//! endpoint requires POST; other methods get 405.
//!
//! ## Endpoints
//!
//! | Method   | Path                   | Description                                  |
//! |----------|------------------------|----------------------------------------------|
//! | GET      | `/healthz`             | Liveness, always 200                         |
//! | GET      | `/readyz`              | 200 if the local backend answers, else 503   |
//! | GET      | `/status`              | Full gateway snapshot                        |
//! | POST     | `/control/start`       | Start the managed worker (background)        |
//! | POST     | `/control/stop`        | Stop the managed worker (background)         |
//! | POST     | `/control/pause`       | Disable idle shutdown                        |
//! | POST     | `/control/resume`      | Re-enable idle shutdown, reset the timer     |
//! | POST     | `/control/ttl?ttl=30m` | Change the idle timeout, reset the timer     |
//! | GET/POST | `/control/mode`        | Read or change the routing mode              |
//! | GET      | `/control/operations`  | Worker commands still running                |
//! | POST     | `/control/kill?target` | Kill the command running for a target        |
//! | GET      | `/events`              | Worker command output as Server-Sent Events  |
//! | GET      | `/fleet`               | Fleet discovery snapshot                     |

use crate::executor::ExecEvent;
use crate::gateway::Gateway;
use crate::types::{RoutingMode, TtlError};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

/// Build the control API routes. State is supplied by the caller.
pub fn control_router() -> Router<Gateway> {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route("/status", get(status))
        .route("/control/start", post(force_start))
        .route("/control/stop", post(force_stop))
        .route("/control/pause", post(pause))
        .route("/control/resume", post(resume))
        .route("/control/ttl", post(set_ttl))
        .route("/control/mode", get(get_mode).post(set_mode))
        .route("/control/operations", get(operations))
        .route("/control/kill", post(kill))
        .route("/events", get(events))
        .route("/fleet", get(fleet))
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StatusMessage {
    status: &'static str,
    message: String,
}

#[derive(Deserialize)]
struct TtlQuery {
    ttl: Option<String>,
}

#[derive(Deserialize)]
struct KillQuery {
    target: Option<String>,
}

#[derive(Deserialize)]
struct SetModeRequest {
    mode: String,
}

#[derive(Serialize)]
struct ModeResponse {
    mode: RoutingMode,
}

fn message(status: &'static str, message: impl Into<String>) -> Json<StatusMessage> {
    Json(StatusMessage {
        status,
        message: message.into(),
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(gateway): State<Gateway>) -> impl IntoResponse {
    if gateway.local_reachable().await {
        (
            StatusCode::OK,
            Json(json!({ "status": "ready", "worker": "running" })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "worker": gateway.state().await })),
        )
    }
}

async fn status(State(gateway): State<Gateway>) -> impl IntoResponse {
    Json(gateway.status().await)
}

async fn force_start(State(gateway): State<Gateway>) -> impl IntoResponse {
    info!("Manual worker start requested");
    gateway.force_start();
    (
        StatusCode::ACCEPTED,
        message("starting", "Worker start initiated"),
    )
}

async fn force_stop(State(gateway): State<Gateway>) -> impl IntoResponse {
    info!("Manual worker stop requested");
    gateway.force_stop();
    (
        StatusCode::ACCEPTED,
        message("stopping", "Worker stop initiated"),
    )
}

async fn pause(State(gateway): State<Gateway>) -> impl IntoResponse {
    gateway.pause().await;
    message(
        "paused",
        "Auto-scaling paused. Worker will not auto-shutdown.",
    )
}

async fn resume(State(gateway): State<Gateway>) -> impl IntoResponse {
    gateway.resume().await;
    message("resumed", "Auto-scaling resumed. Idle timer reset.")
}

async fn set_ttl(
    State(gateway): State<Gateway>,
    Query(query): Query<TtlQuery>,
) -> impl IntoResponse {
    match gateway.set_ttl(query.ttl.as_deref().unwrap_or("")).await {
        Ok(applied) => {
            let ttl = humantime::format_duration(applied).to_string();
            (
                StatusCode::OK,
                Json(json!({
                    "status": "updated",
                    "idle_timeout": ttl,
                    "message": format!("Idle timeout set to {}. Timer reset.", ttl),
                })),
            )
        }
        Err(e @ TtlError::Missing) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
        Err(TtlError::Invalid(e)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid duration format",
                "detail": e.to_string(),
                "example": "15m, 1h, 30m",
            })),
        ),
    }
}

async fn get_mode(State(gateway): State<Gateway>) -> impl IntoResponse {
    Json(ModeResponse {
        mode: gateway.mode().await,
    })
}

async fn set_mode(
    State(gateway): State<Gateway>,
    Json(body): Json<SetModeRequest>,
) -> impl IntoResponse {
    match body.mode.parse::<RoutingMode>() {
        Ok(mode) => {
            gateway.set_mode(mode).await;
            (StatusCode::OK, Json(json!({ "mode": mode })))
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))),
    }
}

async fn operations(State(gateway): State<Gateway>) -> impl IntoResponse {
    Json(gateway.executor().active_operations())
}

async fn kill(State(gateway): State<Gateway>, Query(query): Query<KillQuery>) -> impl IntoResponse {
    let Some(target) = query.target.filter(|t| !t.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "target parameter required (e.g., ?target=remote)" })),
        );
    };
    match gateway.executor().kill(&target) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "killed", "target": target })),
        ),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))),
    }
}

async fn events(
    State(gateway): State<Gateway>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = gateway.executor().subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(event) = sse_event(&event) {
                        return Some((Ok(event), rx));
                    }
                }
                // Slow subscriber: skip what was dropped, never block the producer
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event subscriber lagging");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: &ExecEvent) -> Option<Event> {
    let name = serde_json::to_value(&event.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))?;
    Event::default().event(name).json_data(event).ok()
}

async fn fleet(State(gateway): State<Gateway>) -> impl IntoResponse {
    let Some(fleet) = gateway.fleet() else {
        return Json(json!({
            "enabled": false,
            "message": "Fleet API not configured",
        }));
    };

    let nodes = fleet.nodes().await;
    let gpu_workers = fleet.gpu_workers().await;
    let mut body = json!({
        "enabled": true,
        "total_nodes": nodes.len(),
        "gpu_workers": gpu_workers.len(),
        "nodes": nodes,
    });
    if let Some(best) = fleet.best_gpu_worker().await {
        body["best_worker"] = json!({
            "id": best.id,
            "nebula_ip": best.nebula_ip,
            "health": best.health,
            "backend_url": fleet.backend_url(&best),
        });
    }
    Json(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_test_app() -> (Router, Gateway) {
        let config = Config {
            local_url: "http://127.0.0.1:1".to_string(),
            probe_timeout_ms: 500,
            ..Default::default()
        };
        let gateway = Gateway::new(config, None, None);
        (control_router().with_state(gateway.clone()), gateway)
    }

    async fn send(app: Router, method: &str, uri: &str, body: Body) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let (app, _) = make_test_app();
        let (status, json) = send(app.clone(), "GET", "/healthz", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");

        let (status, json) = send(app, "GET", "/readyz", Body::empty()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "not_ready");
        assert_eq!(json["worker"], "unknown");
    }

    #[tokio::test]
    async fn test_ttl_endpoint() {
        let (app, gateway) = make_test_app();

        let (status, json) = send(app.clone(), "POST", "/control/ttl?ttl=1m", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["idle_timeout"], "5m");

        let (status, _) = send(app.clone(), "POST", "/control/ttl?ttl=2h", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(gateway.status().await.idle_timeout, "2h");

        let (status, json) = send(app.clone(), "POST", "/control/ttl?ttl=whenever", Body::empty()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid duration format");

        let (status, _) = send(app, "POST", "/control/ttl", Body::empty()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_control_requires_post() {
        let (app, _) = make_test_app();
        for path in ["/control/start", "/control/stop", "/control/pause", "/control/resume"] {
            let (status, _) = send(app.clone(), "GET", path, Body::empty()).await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{}", path);
        }
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (app, gateway) = make_test_app();
        let (status, json) = send(app.clone(), "POST", "/control/pause", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "paused");
        assert!(gateway.idle().await.paused);

        let (status, _) = send(app, "POST", "/control/resume", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!gateway.idle().await.paused);
    }

    #[tokio::test]
    async fn test_mode_endpoint() {
        let (app, gateway) = make_test_app();
        let (status, _) = send(
            app.clone(),
            "POST",
            "/control/mode",
            Body::from(r#"{"mode": "local"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(gateway.mode().await, RoutingMode::Local);

        let (status, json) = send(app.clone(), "GET", "/control/mode", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"], "local");

        let (status, _) = send(app, "POST", "/control/mode", Body::from(r#"{"mode": "mac"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(gateway.mode().await, RoutingMode::Local);
    }

    #[tokio::test]
    async fn test_force_start_is_accepted() {
        let (app, _) = make_test_app();
        let (status, json) = send(app, "POST", "/control/start", Body::empty()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["status"], "starting");
    }

    #[tokio::test]
    async fn test_kill_without_running_command() {
        let (app, _) = make_test_app();
        let (status, _) = send(app.clone(), "POST", "/control/kill?target=remote", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(app.clone(), "POST", "/control/kill", Body::empty()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(app, "GET", "/control/operations", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_fleet_disabled() {
        let (app, _) = make_test_app();
        let (status, json) = send(app, "GET", "/fleet", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["enabled"], false);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (app, _) = make_test_app();
        let (status, json) = send(app, "GET", "/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["worker_state"], "unknown");
        assert_eq!(json["mode"], "auto");
        assert_eq!(json["requests_total"], 0);
        assert_eq!(json["remote"]["state"], "not_configured");
        assert_eq!(json["idle_timeout"], "40m");
    }
}
