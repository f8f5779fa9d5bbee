//! Idle watcher: stops the managed worker after a period without traffic.

use crate::gateway::Gateway;
use crate::types::StopError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one watcher tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Managed worker not reachable, nothing to stop
    Unreachable,
    /// Idle shutdown is paused
    Paused,
    /// Still within the idle timeout
    Active,
    /// Timeout reached and the worker was stopped
    Stopped,
    /// Timeout reached but the stop was skipped or failed
    StopFailed,
}

/// Whether the idle timer has run out.
pub fn should_stop(idle: Duration, timeout: Duration, paused: bool) -> bool {
    !paused && idle >= timeout
}

/// Evaluate the idle timer once and act on it.
pub async fn tick(gateway: &Gateway) -> TickOutcome {
    if !gateway.managed_reachable().await {
        return TickOutcome::Unreachable;
    }

    let idle = gateway.idle().await;
    if idle.paused {
        debug!(idle = ?round_secs(idle.idle), "Idle shutdown paused");
        return TickOutcome::Paused;
    }
    debug!(idle = ?round_secs(idle.idle), timeout = ?idle.timeout, "Idle check");
    if !should_stop(idle.idle, idle.timeout, idle.paused) {
        return TickOutcome::Active;
    }

    info!(idle = ?round_secs(idle.idle), timeout = ?idle.timeout, "Idle timeout reached, stopping worker");
    match gateway.stop_worker().await {
        Ok(()) => TickOutcome::Stopped,
        Err(StopError::NotRunning(state)) => {
            debug!(state = %state, "Stop skipped");
            TickOutcome::StopFailed
        }
        Err(e) => {
            warn!(error = %e, "Idle stop failed");
            TickOutcome::StopFailed
        }
    }
}

/// Spawn the watcher loop for the lifetime of the process.
pub fn spawn(gateway: Gateway) -> JoinHandle<()> {
    let interval = gateway.config().idle_check_interval();
    info!(interval = ?interval, "Spawning idle watcher");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so startup never stops anything
        ticker.tick().await;

        loop {
            ticker.tick().await;
            tick(&gateway).await;
        }
    })
}

fn round_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs())
}
