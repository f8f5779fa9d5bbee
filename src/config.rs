//! Configuration for llmgate

use anyhow::{Context, Result, bail};
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lower bound for the idle timeout.
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Upper bound for the idle timeout.
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Clamp an idle timeout into `[5m, 24h]`.
pub fn clamp_idle_timeout(timeout: Duration) -> Duration {
    timeout.clamp(MIN_IDLE_TIMEOUT, MAX_IDLE_TIMEOUT)
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy port (inference traffic, status and control API)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Co-located GPU backend
    #[serde(default = "default_local_url")]
    pub local_url: String,

    /// Cloud GPU backend that is cold-started on demand. When a fleet is
    /// configured, the fleet's best worker takes precedence.
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Auxiliary developer endpoint
    #[serde(default)]
    pub auxiliary_url: Option<String>,

    /// Worker-control command, invoked as `<command> <action> [args...]`
    /// with action one of `warm`, `stop`.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,

    /// Seconds of inactivity before the remote worker is stopped.
    /// Clamped to [5m, 24h].
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How long a request waits for a cold start before giving up
    #[serde(default = "default_warmup_timeout")]
    pub warmup_timeout_secs: u64,

    /// Upper bound on the `warm` command itself
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Upper bound on the `stop` command
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Cheap endpoint used for reachability probes
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Reachability probe timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// How often the idle watcher evaluates the idle timer
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,

    /// Message broker offload for non-streaming inference calls
    #[serde(default)]
    pub broker: Option<BrokerConfig>,

    /// Fleet discovery service supplying the remote address dynamically
    #[serde(default)]
    pub fleet: Option<FleetConfig>,
}

/// NATS broker configuration.
///
/// ```json
/// { "url": "nats://nats:4222", "subject_prefix": "llm.inference" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker server URL
    pub url: String,

    /// Subject prefix for normal-priority inference requests
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Subject prefix for explicitly prioritised requests
    #[serde(default = "default_priority_prefix")]
    pub priority_prefix: String,

    /// How long to wait for a worker reply
    #[serde(default = "default_broker_timeout")]
    pub timeout_secs: u64,
}

/// Fleet discovery service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Base URL of the fleet API (`GET {url}/api/v1/nodes`)
    pub url: String,

    /// Cached node list is considered stale after this many seconds
    #[serde(default = "default_fleet_refresh")]
    pub refresh_interval_secs: u64,

    /// Port the inference server listens on for discovered workers
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,

    /// HTTP timeout for fleet API calls
    #[serde(default = "default_fleet_timeout")]
    pub request_timeout_secs: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_local_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_worker_command() -> String {
    "/app/llm-worker.sh".to_string()
}

fn default_idle_timeout() -> u64 {
    40 * 60
}

fn default_warmup_timeout() -> u64 {
    5 * 60
}

fn default_start_timeout() -> u64 {
    10 * 60
}

fn default_stop_timeout() -> u64 {
    5 * 60
}

fn default_probe_path() -> String {
    "/api/tags".to_string()
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_idle_check_interval() -> u64 {
    60
}

fn default_subject_prefix() -> String {
    "llm.inference".to_string()
}

fn default_priority_prefix() -> String {
    "llm.priority".to_string()
}

fn default_broker_timeout() -> u64 {
    5 * 60
}

fn default_fleet_refresh() -> u64 {
    30
}

fn default_worker_port() -> u16 {
    11434
}

fn default_fleet_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            metrics_port: default_metrics_port(),
            local_url: default_local_url(),
            remote_url: None,
            auxiliary_url: None,
            worker_command: default_worker_command(),
            idle_timeout_secs: default_idle_timeout(),
            warmup_timeout_secs: default_warmup_timeout(),
            start_timeout_secs: default_start_timeout(),
            stop_timeout_secs: default_stop_timeout(),
            probe_path: default_probe_path(),
            probe_timeout_ms: default_probe_timeout(),
            idle_check_interval_secs: default_idle_check_interval(),
            broker: None,
            fleet: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate configuration, rejecting backend URLs the proxy could never
    /// forward to.
    pub fn validate(&self) -> Result<()> {
        check_url("local_url", &self.local_url)?;
        if let Some(ref url) = self.remote_url {
            check_url("remote_url", url)?;
        }
        if let Some(ref url) = self.auxiliary_url {
            check_url("auxiliary_url", url)?;
        }
        if self.worker_command.trim().is_empty() {
            bail!("worker_command must not be empty");
        }
        if let Some(ref fleet) = self.fleet
            && fleet.url.trim().is_empty()
        {
            bail!("fleet.url must not be empty when a fleet section is present");
        }

        let requested = Duration::from_secs(self.idle_timeout_secs);
        let clamped = self.idle_timeout();
        if requested != clamped {
            tracing::warn!(
                requested = ?requested,
                applied = ?clamped,
                "idle_timeout_secs outside [5m, 24h], clamping"
            );
        }
        Ok(())
    }

    /// Effective idle timeout, always within `[5m, 24h]`
    pub fn idle_timeout(&self) -> Duration {
        clamp_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_secs(self.warmup_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }
}

impl BrokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl FleetConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn check_url(field: &str, url: &str) -> Result<()> {
    let uri: Uri = url
        .parse()
        .with_context(|| format!("Invalid URL for {}: {}", field, url))?;
    if !matches!(uri.scheme_str(), Some("http" | "https")) || uri.authority().is_none() {
        bail!("{} must be an http(s):// URL with a host, got {}", field, url);
    }
    Ok(())
}
