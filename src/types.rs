//! Shared domain types used across the codebase.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle state of the managed (cold-startable) worker.
///
/// Distinct from network reachability: a worker can be `Unknown` yet
/// reachable, in which case the next successful probe reconciles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl WorkerState {
    /// Whether a cold start may begin from this state.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Unknown | Self::Running)
    }

    /// Whether the stop sequence may begin from this state.
    pub fn can_stop(self) -> bool {
        self == Self::Running
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backend family may serve a request.
///
/// Independent of [`WorkerState`]: changing the mode never starts or stops
/// anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Prefer local, fall back to remote, cold-start as a last resort
    #[default]
    Auto,
    /// Local backend only
    Local,
    /// Remote backend only, cold-started on demand
    Remote,
    /// Auxiliary developer endpoint only
    Auxiliary,
}

impl RoutingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Auxiliary => "auxiliary",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "auxiliary" | "aux" => Ok(Self::Auxiliary),
            other => Err(format!(
                "unknown routing mode: {other}. Use 'auto', 'local', 'remote' or 'auxiliary'."
            )),
        }
    }
}

/// A backend tier the gateway can forward to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Local,
    Remote,
    Auxiliary,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Auxiliary => "auxiliary",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request could not be routed to any backend.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{backend} backend not configured")]
    NotConfigured { backend: Backend, mode: RoutingMode },

    #[error("{backend} backend unreachable")]
    Unreachable { backend: Backend, mode: RoutingMode },

    #[error("cold start did not produce a reachable worker: {source}")]
    ColdStart {
        mode: RoutingMode,
        #[source]
        source: StartError,
    },

    #[error("backend connection failed: {0}")]
    BackendConnection(String),
}

impl GatewayError {
    pub fn mode(&self) -> Option<RoutingMode> {
        match self {
            Self::NotConfigured { mode, .. }
            | Self::Unreachable { mode, .. }
            | Self::ColdStart { mode, .. } => Some(*mode),
            Self::BackendConnection(_) => None,
        }
    }
}

/// Outcome of a failed cold-start wait, shared by every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("timed out after {0:?} waiting for worker start")]
    Timeout(Duration),

    #[error("worker start failed: {0}")]
    Failed(String),

    #[error("start completed but worker not reachable")]
    NotReachable,

    #[error("start signal dropped before completion")]
    Aborted,

    #[error("worker is {0}, cannot start")]
    InvalidState(WorkerState),
}

/// Errors from the stop sequence.
#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("worker is {0}, not running")]
    NotRunning(WorkerState),

    #[error("worker stop command exited with code {0}")]
    ExitCode(i32),

    #[error(transparent)]
    Exec(#[from] crate::executor::ExecError),
}

/// Errors from parsing an idle-timeout override.
#[derive(Debug, thiserror::Error)]
pub enum TtlError {
    #[error("ttl parameter required (e.g., ?ttl=30m)")]
    Missing,

    #[error("invalid duration format: {0}")]
    Invalid(#[from] humantime::DurationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        assert!(WorkerState::Stopped.can_start());
        assert!(WorkerState::Unknown.can_start());
        assert!(WorkerState::Running.can_start());
        assert!(!WorkerState::Starting.can_start());
        assert!(!WorkerState::Stopping.can_start());

        assert!(WorkerState::Running.can_stop());
        assert!(!WorkerState::Unknown.can_stop());
        assert!(!WorkerState::Stopping.can_stop());
    }

    #[test]
    fn test_routing_mode_parse() {
        assert_eq!("auto".parse::<RoutingMode>(), Ok(RoutingMode::Auto));
        assert_eq!(" Remote ".parse::<RoutingMode>(), Ok(RoutingMode::Remote));
        assert_eq!("aux".parse::<RoutingMode>(), Ok(RoutingMode::Auxiliary));
        assert!("mac".parse::<RoutingMode>().is_err());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&WorkerState::Starting).unwrap();
        assert_eq!(json, "\"starting\"");
        let mode: RoutingMode = serde_json::from_str("\"auxiliary\"").unwrap();
        assert_eq!(mode, RoutingMode::Auxiliary);
    }
}
