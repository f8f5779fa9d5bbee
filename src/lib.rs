//! # llmgate
//!
//! Cold-start aware gateway in front of LLM inference backends.
//!
//! This crate provides:
//! - **Gateway**: routing mode, lifecycle state machine and cold-start coordination
//! - **Executor**: runs the external worker-control command and streams its output
//! - **Watcher**: stops the managed worker after a period without traffic
//! - **Broker / Fleet**: optional NATS offload path and dynamic remote discovery
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           llmgate                            │
//! │  handler ──► broker (NATS, non-streaming only)               │
//! │     │            │ failure / streaming                       │
//! │     ▼            ▼                                           │
//! │  gateway ── select_backend(mode) ── cold start ──► executor  │
//! │     │                                     ▲        (warm)    │
//! │     ▼                                     │                  │
//! │  proxy ──► [local]  [remote | fleet]  [auxiliary]            │
//! │                                           │                  │
//! │  watcher ── idle timeout ─────────────────┘ (stop)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod broker;
mod config;
pub mod control;
pub mod executor;
pub mod fleet;
mod gateway;
pub mod handler;
pub mod proxy;
pub mod telemetry;
mod types;
pub mod watcher;

pub use broker::{Broker, BrokerError, InferenceRequest, InferenceResponse, NatsBroker};
pub use config::{BrokerConfig, Config, FleetConfig};
pub use executor::{EventKind, ExecError, ExecEvent, Executor, Operation};
pub use fleet::{FleetClient, FleetNode};
pub use gateway::{CounterSnapshot, Gateway, GatewayStatus, MANAGED_TARGET};
pub use types::{Backend, GatewayError, RoutingMode, StartError, StopError, TtlError, WorkerState};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Build the complete llmgate stack
///
/// Returns:
/// - The main Axum router (control API + inference fallback)
/// - An optional metrics router (when `config.metrics_port > 0`)
/// - The gateway handle, for spawning the background loops
pub async fn build_app(config: Config) -> Result<(axum::Router, Option<axum::Router>, Gateway)> {
    let broker = match &config.broker {
        Some(broker_config) => match NatsBroker::connect(broker_config.clone()).await {
            Ok(broker) => Some(Arc::new(broker) as Arc<dyn Broker>),
            Err(e) => {
                // Direct routing still works without the broker
                warn!(error = %e, url = %broker_config.url, "Broker unavailable, continuing without it");
                None
            }
        },
        None => None,
    };

    let fleet = config
        .fleet
        .as_ref()
        .map(FleetClient::new)
        .transpose()
        .context("Failed to build fleet client")?;

    info!(
        local = %config.local_url,
        remote = ?config.remote_url,
        auxiliary = ?config.auxiliary_url,
        broker = broker.is_some(),
        fleet = fleet.is_some(),
        "Building llmgate"
    );

    let metrics_port = config.metrics_port;
    let gateway = Gateway::new(config, broker, fleet);

    let app = router(gateway.clone());
    let metrics = (metrics_port > 0).then(|| telemetry::metrics_router(gateway.clone()));

    Ok((app, metrics, gateway))
}

/// Main router for a gateway: control API plus the inference fallback.
pub fn router(gateway: Gateway) -> axum::Router {
    control::control_router()
        .fallback(handler::handle)
        .with_state(gateway)
}
