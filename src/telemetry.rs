//! Prometheus metrics for the separate metrics listener.
//!
//! The recorder is owned by the metrics router rather than installed
//! globally. Each scrape probes the managed worker, copies the gateway's
//! counters and lifecycle into the recorder and renders the text exposition.

use crate::gateway::Gateway;
use crate::types::WorkerState;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusRecorder};
use std::sync::Arc;

#[derive(Clone)]
struct MetricsState {
    gateway: Gateway,
    recorder: Arc<PrometheusRecorder>,
}

/// Router serving `GET /metrics`.
pub fn metrics_router(gateway: Gateway) -> Router {
    let recorder = Arc::new(PrometheusBuilder::new().build_recorder());
    metrics::with_local_recorder(recorder.as_ref(), describe);
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(MetricsState { gateway, recorder })
}

async fn scrape(State(state): State<MetricsState>) -> impl IntoResponse {
    let body = render(&state.gateway, &state.recorder).await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Sync the gateway into the recorder and render the text exposition.
pub async fn render(gateway: &Gateway, recorder: &PrometheusRecorder) -> String {
    // Checked live: a worker that died while Running must not report up
    let up = gateway.managed_reachable().await;
    let idle = gateway.idle().await;
    let counters = gateway.counters();
    let warmup = gateway.config().warmup_timeout();

    metrics::with_local_recorder(recorder, || {
        gauge!("llmgate_worker_up").set(flag(up));
        gauge!("llmgate_worker_starting").set(flag(idle.state == WorkerState::Starting));
        gauge!("llmgate_idle_seconds").set(idle.idle.as_secs_f64().floor());
        gauge!("llmgate_idle_timeout_seconds").set(idle.timeout.as_secs_f64());
        gauge!("llmgate_warmup_timeout_seconds").set(warmup.as_secs_f64());
        gauge!("llmgate_paused").set(flag(idle.paused));

        counter!("llmgate_requests_total").absolute(counters.requests_total);
        counter!("llmgate_requests_blocked_total").absolute(counters.requests_blocked);
        counter!("llmgate_cold_starts_total").absolute(counters.cold_starts);
        for (backend, routed) in [
            ("local", counters.local_routed),
            ("remote", counters.remote_routed),
            ("auxiliary", counters.auxiliary_routed),
            ("broker", counters.broker_routed),
        ] {
            counter!("llmgate_routed_total", "backend" => backend).absolute(routed);
        }
    });

    recorder.handle().render()
}

fn flag(on: bool) -> f64 {
    if on { 1.0 } else { 0.0 }
}

fn describe() {
    // -- Lifecycle --
    describe_gauge!(
        "llmgate_worker_up",
        "1 if the managed worker answered its probe at scrape time"
    );
    describe_gauge!(
        "llmgate_worker_starting",
        "1 while a cold start is in flight"
    );
    describe_gauge!("llmgate_paused", "1 while idle shutdown is paused");
    describe_gauge!(
        "llmgate_idle_seconds",
        Unit::Seconds,
        "Time since the last routed request"
    );
    describe_gauge!(
        "llmgate_idle_timeout_seconds",
        Unit::Seconds,
        "Idle time after which the worker is stopped"
    );
    describe_gauge!(
        "llmgate_warmup_timeout_seconds",
        Unit::Seconds,
        "How long a request waits for a cold start"
    );

    // -- Traffic --
    describe_counter!("llmgate_requests_total", "Total inbound requests");
    describe_counter!(
        "llmgate_requests_blocked_total",
        "Requests that had to wait on a cold start"
    );
    describe_counter!("llmgate_cold_starts_total", "Cold starts initiated");
    describe_counter!("llmgate_routed_total", "Requests routed, by backend");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn gateway() -> Gateway {
        let config = Config {
            local_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        Gateway::new(config, None, None)
    }

    #[tokio::test]
    async fn test_render_reflects_counters() {
        let gw = gateway();
        gw.count_request();
        gw.count_request();
        gw.record_route(crate::types::Backend::Local, "http://127.0.0.1:1")
            .await;

        let recorder = PrometheusBuilder::new().build_recorder();
        let text = render(&gw, &recorder).await;
        assert!(text.contains("llmgate_requests_total 2"), "{}", text);
        assert!(text.contains("llmgate_worker_up 0"), "{}", text);
        assert!(text.contains("llmgate_idle_timeout_seconds 2400"), "{}", text);
        assert!(text.contains("llmgate_warmup_timeout_seconds 300"), "{}", text);
        assert!(
            text.contains(r#"llmgate_routed_total{backend="local"} 1"#),
            "{}",
            text
        );

        // Counters stay absolute across scrapes
        gw.count_request();
        let text = render(&gw, &recorder).await;
        assert!(text.contains("llmgate_requests_total 3"), "{}", text);
    }

    #[tokio::test]
    async fn test_worker_up_tracks_backend_reachability() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let healthy = Arc::new(AtomicBool::new(true));
        let flag_for_backend = healthy.clone();
        let app = Router::new().route(
            "/api/tags",
            get(move || {
                let healthy = flag_for_backend.load(Ordering::SeqCst);
                async move {
                    if healthy {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let gw = Gateway::new(
            Config {
                remote_url: Some(format!("http://{}", addr)),
                probe_timeout_ms: 500,
                ..Default::default()
            },
            None,
            None,
        );
        let recorder = PrometheusBuilder::new().build_recorder();

        let text = render(&gw, &recorder).await;
        assert!(text.contains("llmgate_worker_up 1"), "{}", text);
        assert_eq!(gw.state().await, WorkerState::Running);

        // Backend goes down while the lifecycle still says Running
        healthy.store(false, Ordering::SeqCst);
        let text = render(&gw, &recorder).await;
        assert!(text.contains("llmgate_worker_up 0"), "{}", text);
        assert_eq!(gw.state().await, WorkerState::Running);
    }

    #[tokio::test]
    async fn test_two_gateways_do_not_share_metrics() {
        let a = gateway();
        let b = gateway();
        a.count_request();

        let text_b = render(&b, &PrometheusBuilder::new().build_recorder()).await;
        assert!(text_b.contains("llmgate_requests_total 0"), "{}", text_b);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = metrics_router(gateway());
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("# HELP llmgate_cold_starts_total"), "{}", text);
    }
}
