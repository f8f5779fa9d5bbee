//! Inbound inference traffic.
//!
//! Non-streaming `POST /api/generate` and `POST /api/chat` calls go through
//! the broker while it is connected. Everything else, and every broker
//! failure, takes the direct path: pick a backend per the routing mode and
//! forward the request unchanged.

use crate::broker::InferenceRequest;
use crate::gateway::Gateway;
use crate::proxy::json_response;
use crate::types::{Backend, GatewayError, RoutingMode};
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BROKER_PATHS: [&str; 2] = ["/api/generate", "/api/chat"];

/// Body fields the broker path needs. Anything else in the body is ignored.
#[derive(Debug, Deserialize)]
struct InferenceCall {
    model: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    options: HashMap<String, serde_json::Value>,
    #[serde(default)]
    priority: u8,
}

/// Axum fallback handler for all inference and passthrough traffic.
pub async fn handle(State(gateway): State<Gateway>, req: Request<Body>) -> Response<Body> {
    gateway.count_request();

    let req = if wants_broker(&gateway, &req) {
        match try_broker(&gateway, req).await {
            Ok(resp) => return resp,
            Err(req) => req,
        }
    } else {
        req
    };

    proxy_direct(&gateway, req).await
}

fn wants_broker(gateway: &Gateway, req: &Request<Body>) -> bool {
    req.method() == Method::POST
        && BROKER_PATHS.contains(&req.uri().path())
        && gateway.connected_broker().is_some()
}

/// Serve a request through the broker, or hand it back (body intact) for
/// the direct path.
async fn try_broker(gateway: &Gateway, req: Request<Body>) -> Result<Response<Body>, Request<Body>> {
    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return Ok(json_response(
                StatusCode::BAD_REQUEST,
                json!({ "error": "failed to read request body" }),
            ));
        }
    };
    let replay = |bytes: Bytes| Request::from_parts(parts, Body::from(bytes));

    let call: InferenceCall = match serde_json::from_slice(&body_bytes) {
        Ok(call) => call,
        Err(e) => {
            debug!(error = %e, "Body is not an inference call, proxying directly");
            return Err(replay(body_bytes));
        }
    };
    if call.stream {
        debug!(model = %call.model, "Streaming request, proxying directly");
        return Err(replay(body_bytes));
    }
    let Some(broker) = gateway.connected_broker() else {
        return Err(replay(body_bytes));
    };

    let mut request = InferenceRequest::new(call.model, call.prompt);
    request.options = call.options;
    request.priority = call.priority;

    let started = Instant::now();
    let timeout = broker_timeout(gateway);
    debug!(id = %request.id, model = %request.model, "Routing through broker");
    match broker.publish(&request, timeout).await {
        Ok(resp) => {
            gateway.record_broker_route().await;
            info!(
                id = %request.id,
                worker = %resp.worker_id,
                elapsed = ?started.elapsed(),
                "Broker request completed"
            );
            Ok(json_response(
                StatusCode::OK,
                json!({
                    "model": resp.model,
                    "response": resp.response,
                    "done": resp.done,
                    // milliseconds to nanoseconds
                    "total_duration": resp.duration.saturating_mul(1_000_000),
                }),
            ))
        }
        Err(e) => {
            warn!(id = %request.id, error = %e, "Broker failed, falling back to direct proxy");
            Err(replay(body_bytes))
        }
    }
}

fn broker_timeout(gateway: &Gateway) -> Duration {
    gateway
        .config()
        .broker
        .as_ref()
        .map(|b| b.timeout())
        .unwrap_or(Duration::from_secs(5 * 60))
}

async fn proxy_direct(gateway: &Gateway, req: Request<Body>) -> Response<Body> {
    let (backend, url) = match gateway.select_backend().await {
        Ok(selected) => selected,
        Err(e) => {
            warn!(error = %e, path = %req.uri().path(), "No backend available");
            return e.into_response();
        }
    };
    gateway.record_route(backend, &url).await;
    debug!(backend = %backend, url = %url, path = %req.uri().path(), "Proxying request");

    match gateway.proxy().forward(req, &url).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let mode = self.mode();
        let (status, error, message) = match &self {
            GatewayError::BackendConnection(_) => {
                return json_response(
                    StatusCode::BAD_GATEWAY,
                    json!({
                        "error": "backend unavailable",
                        "hint": "worker may be starting up",
                    }),
                );
            }
            GatewayError::NotConfigured { backend, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{} not configured", backend),
                format!("No {} backend URL configured", backend),
            ),
            GatewayError::Unreachable { .. } | GatewayError::ColdStart { .. }
                if mode == Some(RoutingMode::Auto) =>
            {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "no workers available".to_string(),
                    "All LLM workers are offline. Retry in 2-3 minutes.".to_string(),
                )
            }
            GatewayError::Unreachable { backend, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("{} worker unavailable", backend),
                unreachable_message(*backend).to_string(),
            ),
            GatewayError::ColdStart { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "remote worker unavailable".to_string(),
                "Remote worker is starting. Retry in 2-3 minutes.".to_string(),
            ),
        };

        json_response(
            status,
            json!({
                "error": error,
                "message": message,
                "mode": mode,
            }),
        )
    }
}

fn unreachable_message(backend: Backend) -> &'static str {
    match backend {
        Backend::Local => "Local backend is not responding",
        Backend::Remote => "Remote worker is starting. Retry in 2-3 minutes.",
        Backend::Auxiliary => "Auxiliary endpoint is not responding",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_not_configured_response() {
        let resp = GatewayError::NotConfigured {
            backend: Backend::Remote,
            mode: RoutingMode::Remote,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "remote not configured");
        assert_eq!(json["mode"], "remote");
    }

    #[tokio::test]
    async fn test_auto_mode_reports_no_workers() {
        let resp = GatewayError::ColdStart {
            mode: RoutingMode::Auto,
            source: crate::types::StartError::Timeout(Duration::from_secs(300)),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "no workers available");
        assert_eq!(json["mode"], "auto");
    }

    #[tokio::test]
    async fn test_local_unreachable_names_mode() {
        let resp = GatewayError::Unreachable {
            backend: Backend::Local,
            mode: RoutingMode::Local,
        }
        .into_response();
        let json = body_json(resp).await;
        assert_eq!(json["error"], "local worker unavailable");
        assert_eq!(json["mode"], "local");
    }

    #[tokio::test]
    async fn test_backend_connection_is_bad_gateway() {
        let resp = GatewayError::BackendConnection("connection refused".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "backend unavailable");
        assert_eq!(json["hint"], "worker may be starting up");
    }

    #[test]
    fn test_inference_call_defaults_to_non_streaming() {
        let call: InferenceCall =
            serde_json::from_str(r#"{"model": "llama3", "prompt": "hi"}"#).unwrap();
        assert!(!call.stream);
        assert_eq!(call.priority, 0);
        assert!(serde_json::from_str::<InferenceCall>(r#"{"prompt": "no model"}"#).is_err());
    }
}
