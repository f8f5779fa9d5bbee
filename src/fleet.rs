//! Fleet discovery client.
//!
//! When a fleet service is configured, the remote backend's address is not
//! static: it is derived from the best connected GPU worker in the fleet's
//! node list, which is cached and refreshed periodically.

use crate::config::FleetConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const GPU_WORKER: &str = "NODE_TYPE_GPU_WORKER";
const HEALTHY: &str = "HEALTH_STATE_HEALTHY";

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("failed to build fleet HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("fleet request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("fleet API returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("fleet refresh timed out after {0:?}")]
    Timeout(Duration),
}

/// A node as reported by the fleet API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub instance_id: String,
    pub nebula_ip: String,
    pub public_ip: String,
    pub connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub stream_active: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub health: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub health_status: String,
    pub uptime_seconds: u64,
    pub gpu_count: u32,
}

impl FleetNode {
    pub fn is_gpu_worker(&self) -> bool {
        self.node_type == GPU_WORKER && self.connected
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HEALTHY
    }
}

#[derive(Clone)]
pub struct FleetClient {
    inner: Arc<FleetInner>,
}

struct FleetInner {
    http: reqwest::Client,
    base_url: String,
    worker_port: u16,
    refresh_interval: Duration,
    request_timeout: Duration,
    cache: RwLock<FleetCache>,
}

#[derive(Default)]
struct FleetCache {
    nodes: Vec<FleetNode>,
    refreshed_at: Option<Instant>,
}

impl FleetClient {
    pub fn new(config: &FleetConfig) -> Result<Self, FleetError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(FleetError::Client)?;
        Ok(Self {
            inner: Arc::new(FleetInner {
                http,
                base_url: config.url.trim_end_matches('/').to_string(),
                worker_port: config.worker_port,
                refresh_interval: config.refresh_interval(),
                request_timeout: config.request_timeout(),
                cache: RwLock::new(FleetCache::default()),
            }),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.inner.base_url.is_empty()
    }

    /// Fetch the node list and replace the cache. Returns the node count.
    pub async fn refresh(&self) -> Result<usize, FleetError> {
        let url = format!("{}/api/v1/nodes", self.inner.base_url);
        let response = self.inner.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FleetError::Status(response.status()));
        }
        let nodes: Vec<FleetNode> = response.json().await?;
        let count = nodes.len();

        let mut cache = self.inner.cache.write().await;
        cache.nodes = nodes;
        cache.refreshed_at = Some(Instant::now());
        debug!(nodes = count, "Fleet refreshed");
        Ok(count)
    }

    /// Refresh if the cache is older than the refresh interval. Failures are
    /// logged and the stale cache is kept.
    pub async fn refresh_if_stale(&self, deadline: Duration) {
        let stale = {
            let cache = self.inner.cache.read().await;
            cache
                .refreshed_at
                .is_none_or(|at| at.elapsed() > self.inner.refresh_interval)
        };
        if !stale {
            return;
        }
        let result = match tokio::time::timeout(deadline, self.refresh()).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::Timeout(deadline)),
        };
        if let Err(e) = result {
            warn!(error = %e, "Fleet refresh failed");
        }
    }

    pub async fn nodes(&self) -> Vec<FleetNode> {
        self.inner.cache.read().await.nodes.clone()
    }

    /// Connected GPU workers.
    pub async fn gpu_workers(&self) -> Vec<FleetNode> {
        self.inner
            .cache
            .read()
            .await
            .nodes
            .iter()
            .filter(|n| n.is_gpu_worker())
            .cloned()
            .collect()
    }

    /// Healthy workers first, then the one with the most GPUs.
    pub async fn best_gpu_worker(&self) -> Option<FleetNode> {
        self.gpu_workers()
            .await
            .into_iter()
            .max_by_key(|n| (n.is_healthy(), n.gpu_count))
    }

    /// Backend URL of the best GPU worker, if any.
    pub async fn remote_url(&self) -> Option<String> {
        self.best_gpu_worker()
            .await
            .map(|node| self.backend_url(&node))
    }

    pub fn backend_url(&self, node: &FleetNode) -> String {
        format!("http://{}:{}", node.nebula_ip, self.inner.worker_port)
    }

    pub fn request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    /// Refresh the cache on a fixed interval for the lifetime of the process.
    pub fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.inner.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                url = %client.inner.base_url,
                interval = ?client.inner.refresh_interval,
                "Fleet refresh loop started"
            );
            loop {
                interval.tick().await;
                if let Err(e) = client.refresh().await {
                    warn!(error = %e, "Fleet refresh failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Json, Router};

    fn node(id: &str, ip: &str, healthy: bool, gpus: u32) -> serde_json::Value {
        let health = if healthy { HEALTHY } else { "HEALTH_STATE_DEGRADED" };
        serde_json::json!({
            "id": id,
            "type": GPU_WORKER,
            "nebula_ip": ip,
            "connected": true,
            "health": health,
            "gpu_count": gpus,
        })
    }

    async fn spawn_fleet(nodes: serde_json::Value) -> String {
        let app = Router::new().route(
            "/api/v1/nodes",
            get(move || {
                let nodes = nodes.clone();
                async move { Json(nodes) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(url: &str) -> FleetClient {
        let config: FleetConfig =
            serde_json::from_value(serde_json::json!({ "url": url })).unwrap();
        FleetClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_best_worker_prefers_healthy_then_gpu_count() {
        let url = spawn_fleet(serde_json::json!([
            node("a", "10.0.0.1", false, 8),
            node("b", "10.0.0.2", true, 1),
            node("c", "10.0.0.3", true, 4),
            { "id": "cp", "type": "NODE_TYPE_CONTROL_PLANE", "connected": true },
            { "id": "gone", "type": GPU_WORKER, "connected": false, "gpu_count": 16 },
        ]))
        .await;
        let fleet = client(&url);

        assert_eq!(fleet.refresh().await.unwrap(), 5);
        assert_eq!(fleet.nodes().await.len(), 5);
        assert_eq!(fleet.gpu_workers().await.len(), 3);
        assert_eq!(fleet.best_gpu_worker().await.unwrap().id, "c");
        assert_eq!(
            fleet.remote_url().await.as_deref(),
            Some("http://10.0.0.3:11434")
        );
    }

    #[tokio::test]
    async fn test_no_workers_means_no_remote() {
        let url = spawn_fleet(serde_json::json!([])).await;
        let fleet = client(&url);
        fleet.refresh_if_stale(Duration::from_secs(5)).await;
        assert!(fleet.remote_url().await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_cache() {
        let fleet = client("http://127.0.0.1:1");
        assert!(fleet.refresh().await.is_err());
        fleet.refresh_if_stale(Duration::from_secs(5)).await;
        assert!(fleet.nodes().await.is_empty());
        assert!(fleet.is_configured());
    }
}
