//! Gateway: lifecycle state machine, routing policy and cold-start
//! coordination for the managed worker.
//!
//! The managed worker is the remote tier (or the local tier when no remote is
//! configured). It is brought up by the `warm` worker command and taken down
//! by `stop`. Lifecycle state, routing mode and the activity timestamp share
//! one lock; counters are lock-free.

use crate::broker::Broker;
use crate::config::{Config, clamp_idle_timeout};
use crate::executor::Executor;
use crate::fleet::FleetClient;
use crate::proxy::Proxy;
use crate::types::{Backend, GatewayError, RoutingMode, StartError, StopError, TtlError, WorkerState};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Executor target for the managed worker.
pub const MANAGED_TARGET: &str = "remote";

type StartOutcome = Result<(), StartError>;

struct Lifecycle {
    state: WorkerState,
    mode: RoutingMode,
    last_activity: Instant,
    paused: bool,
    idle_timeout: Duration,
    /// Present exactly while `state == Starting`
    start_signal: Option<watch::Receiver<Option<StartOutcome>>>,
    active_target: Option<String>,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    blocked: AtomicU64,
    cold_starts: AtomicU64,
    local_routed: AtomicU64,
    remote_routed: AtomicU64,
    auxiliary_routed: AtomicU64,
    broker_routed: AtomicU64,
}

/// Point-in-time copy of the gateway counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub requests_total: u64,
    pub requests_blocked: u64,
    pub cold_starts: u64,
    pub local_routed: u64,
    pub remote_routed: u64,
    pub auxiliary_routed: u64,
    pub broker_routed: u64,
}

/// Idle-timer view used by the watcher and metrics.
#[derive(Debug, Clone, Copy)]
pub struct IdleSnapshot {
    pub idle: Duration,
    pub timeout: Duration,
    pub paused: bool,
    pub state: WorkerState,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub url: Option<String>,
    pub state: &'static str,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub worker_state: WorkerState,
    pub worker_ready: bool,
    pub paused: bool,
    pub mode: RoutingMode,
    pub active_target: Option<String>,
    pub idle: String,
    pub idle_timeout: String,
    pub until_shutdown: String,
    pub requests_total: u64,
    pub requests_blocked: u64,
    pub cold_starts: u64,
    pub routed: RoutedStatus,
    pub broker_connected: bool,
    pub fleet_configured: bool,
    pub local: BackendStatus,
    pub remote: BackendStatus,
    pub auxiliary: BackendStatus,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RoutedStatus {
    pub local: u64,
    pub remote: u64,
    pub auxiliary: u64,
    pub broker: u64,
}

struct GatewayInner {
    config: Config,
    proxy: Proxy,
    executor: Executor,
    broker: Option<Arc<dyn Broker>>,
    fleet: Option<FleetClient>,
    lifecycle: RwLock<Lifecycle>,
    counters: Counters,
}

/// The gateway. Construct once and share; clones are cheap handles.
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Clone for Gateway {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Gateway {
    pub fn new(config: Config, broker: Option<Arc<dyn Broker>>, fleet: Option<FleetClient>) -> Self {
        let proxy = Proxy::new(config.probe_path.clone(), config.probe_timeout());
        let executor = Executor::new(config.worker_command.clone());
        let lifecycle = Lifecycle {
            state: WorkerState::Unknown,
            mode: RoutingMode::default(),
            last_activity: Instant::now(),
            paused: false,
            idle_timeout: config.idle_timeout(),
            start_signal: None,
            active_target: None,
        };
        Self {
            inner: Arc::new(GatewayInner {
                config,
                proxy,
                executor,
                broker,
                fleet,
                lifecycle: RwLock::new(lifecycle),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn proxy(&self) -> &Proxy {
        &self.inner.proxy
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn fleet(&self) -> Option<&FleetClient> {
        self.inner.fleet.as_ref()
    }

    /// The broker, only while it reports itself connected.
    pub fn connected_broker(&self) -> Option<&Arc<dyn Broker>> {
        self.inner.broker.as_ref().filter(|b| b.is_connected())
    }

    pub async fn state(&self) -> WorkerState {
        self.inner.lifecycle.read().await.state
    }

    pub async fn mode(&self) -> RoutingMode {
        self.inner.lifecycle.read().await.mode
    }

    /// Change the routing mode. Never starts or stops anything.
    pub async fn set_mode(&self, mode: RoutingMode) {
        let mut lc = self.inner.lifecycle.write().await;
        if lc.mode != mode {
            info!(from = %lc.mode, to = %mode, "Routing mode changed");
        }
        lc.mode = mode;
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.inner.counters;
        CounterSnapshot {
            requests_total: c.requests.load(Ordering::Relaxed),
            requests_blocked: c.blocked.load(Ordering::Relaxed),
            cold_starts: c.cold_starts.load(Ordering::Relaxed),
            local_routed: c.local_routed.load(Ordering::Relaxed),
            remote_routed: c.remote_routed.load(Ordering::Relaxed),
            auxiliary_routed: c.auxiliary_routed.load(Ordering::Relaxed),
            broker_routed: c.broker_routed.load(Ordering::Relaxed),
        }
    }

    pub fn count_request(&self) {
        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request served through the broker.
    pub async fn record_broker_route(&self) {
        self.inner.counters.broker_routed.fetch_add(1, Ordering::Relaxed);
        self.touch().await;
    }

    /// Record the backend chosen for a direct request and reset the idle timer.
    pub async fn record_route(&self, backend: Backend, url: &str) {
        let counter = match backend {
            Backend::Local => &self.inner.counters.local_routed,
            Backend::Remote => &self.inner.counters.remote_routed,
            Backend::Auxiliary => &self.inner.counters.auxiliary_routed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut lc = self.inner.lifecycle.write().await;
        if lc.active_target.as_deref() != Some(url) {
            lc.active_target = Some(url.to_string());
        }
        lc.last_activity = lc.last_activity.max(Instant::now());
    }

    /// Reset the idle timer to now.
    pub async fn touch(&self) {
        let mut lc = self.inner.lifecycle.write().await;
        lc.last_activity = lc.last_activity.max(Instant::now());
    }

    pub async fn idle(&self) -> IdleSnapshot {
        let lc = self.inner.lifecycle.read().await;
        IdleSnapshot {
            idle: lc.last_activity.elapsed(),
            timeout: lc.idle_timeout,
            paused: lc.paused,
            state: lc.state,
        }
    }

    /// Disable idle shutdown. The timer keeps running.
    pub async fn pause(&self) {
        let mut lc = self.inner.lifecycle.write().await;
        if !lc.paused {
            info!("Idle shutdown paused");
        }
        lc.paused = true;
    }

    /// Re-enable idle shutdown and reset the timer.
    pub async fn resume(&self) {
        let mut lc = self.inner.lifecycle.write().await;
        lc.paused = false;
        lc.last_activity = Instant::now().max(lc.last_activity);
        info!("Idle shutdown resumed, timer reset");
    }

    /// Parse a human duration ("30m", "2h"), clamp it to [5m, 24h], apply it
    /// and reset the timer. Returns the value applied.
    pub async fn set_ttl(&self, ttl: &str) -> Result<Duration, TtlError> {
        let ttl = ttl.trim();
        if ttl.is_empty() {
            return Err(TtlError::Missing);
        }
        let requested = humantime::parse_duration(ttl)?;
        let applied = clamp_idle_timeout(requested);

        let mut lc = self.inner.lifecycle.write().await;
        lc.idle_timeout = applied;
        lc.last_activity = Instant::now().max(lc.last_activity);
        info!(
            requested = %humantime::format_duration(requested),
            applied = %humantime::format_duration(applied),
            "Idle timeout changed, timer reset"
        );
        Ok(applied)
    }

    /// Whether any remote backend is configured, statically or via the fleet.
    pub fn remote_configured(&self) -> bool {
        self.inner.config.remote_url.is_some()
            || self.inner.fleet.as_ref().is_some_and(|f| f.is_configured())
    }

    /// Current remote address: the fleet's best GPU worker when available,
    /// otherwise the static configuration.
    pub async fn remote_url(&self) -> Option<String> {
        if let Some(fleet) = &self.inner.fleet
            && fleet.is_configured()
        {
            fleet.refresh_if_stale(fleet.request_timeout()).await;
            if let Some(url) = fleet.remote_url().await {
                return Some(url);
            }
        }
        self.inner.config.remote_url.clone()
    }

    /// Probe the managed worker. A success reconciles `Unknown`/`Stopped`
    /// to `Running`.
    pub async fn managed_reachable(&self) -> bool {
        let url = if self.remote_configured() {
            self.remote_url().await
        } else {
            Some(self.inner.config.local_url.clone())
        };
        let reachable = match url {
            Some(url) => self.inner.proxy.probe(&url).await,
            None => false,
        };
        if reachable {
            self.reconcile_running().await;
        }
        reachable
    }

    /// Local backend reachability, used for readiness.
    pub async fn local_reachable(&self) -> bool {
        self.inner.proxy.probe(&self.inner.config.local_url).await
    }

    async fn reconcile_running(&self) {
        let state = self.inner.lifecycle.read().await.state;
        if !matches!(state, WorkerState::Unknown | WorkerState::Stopped) {
            return;
        }
        let mut lc = self.inner.lifecycle.write().await;
        if matches!(lc.state, WorkerState::Unknown | WorkerState::Stopped) {
            info!(from = %lc.state, "Managed worker reachable, marking running");
            lc.state = WorkerState::Running;
        }
    }

    async fn reachable_remote(&self) -> Option<String> {
        let url = self.remote_url().await?;
        if self.inner.proxy.probe(&url).await {
            self.reconcile_running().await;
            Some(url)
        } else {
            None
        }
    }

    /// Pick a backend for a direct request according to the routing mode,
    /// cold-starting the managed worker where the mode allows it.
    pub async fn select_backend(&self) -> Result<(Backend, String), GatewayError> {
        let mode = self.mode().await;
        let local = &self.inner.config.local_url;

        match mode {
            RoutingMode::Auxiliary => {
                let url = self
                    .inner
                    .config
                    .auxiliary_url
                    .clone()
                    .ok_or(GatewayError::NotConfigured {
                        backend: Backend::Auxiliary,
                        mode,
                    })?;
                if self.inner.proxy.probe(&url).await {
                    Ok((Backend::Auxiliary, url))
                } else {
                    Err(GatewayError::Unreachable {
                        backend: Backend::Auxiliary,
                        mode,
                    })
                }
            }
            RoutingMode::Local => {
                if self.inner.proxy.probe(local).await {
                    Ok((Backend::Local, local.clone()))
                } else {
                    Err(GatewayError::Unreachable {
                        backend: Backend::Local,
                        mode,
                    })
                }
            }
            RoutingMode::Remote => {
                if !self.remote_configured() {
                    return Err(GatewayError::NotConfigured {
                        backend: Backend::Remote,
                        mode,
                    });
                }
                if let Some(url) = self.reachable_remote().await {
                    return Ok((Backend::Remote, url));
                }
                self.cold_start(mode).await?;
                self.reachable_remote()
                    .await
                    .map(|url| (Backend::Remote, url))
                    .ok_or(GatewayError::Unreachable {
                        backend: Backend::Remote,
                        mode,
                    })
            }
            RoutingMode::Auto => {
                if self.inner.proxy.probe(local).await {
                    return Ok((Backend::Local, local.clone()));
                }
                if let Some(url) = self.reachable_remote().await {
                    return Ok((Backend::Remote, url));
                }
                self.cold_start(mode).await?;
                if self.inner.proxy.probe(local).await {
                    return Ok((Backend::Local, local.clone()));
                }
                self.reachable_remote()
                    .await
                    .map(|url| (Backend::Remote, url))
                    .ok_or(GatewayError::Unreachable {
                        backend: Backend::Remote,
                        mode,
                    })
            }
        }
    }

    async fn cold_start(&self, mode: RoutingMode) -> Result<(), GatewayError> {
        self.inner.counters.blocked.fetch_add(1, Ordering::Relaxed);
        self.ensure_running(self.inner.config.warmup_timeout())
            .await
            .map_err(|source| GatewayError::ColdStart { mode, source })
    }

    /// Make sure the managed worker is up, starting it at most once no matter
    /// how many callers ask concurrently.
    ///
    /// `deadline` bounds only this caller's wait. The start itself runs in
    /// the background to completion, so a caller giving up never cancels it.
    pub async fn ensure_running(&self, deadline: Duration) -> Result<(), StartError> {
        if self.managed_reachable().await {
            return Ok(());
        }

        let mut lc = self.inner.lifecycle.write().await;
        let existing = match (lc.state, &lc.start_signal) {
            (WorkerState::Starting, Some(signal)) => Some(signal.clone()),
            (state, _) if state.can_start() => None,
            (state, _) => return Err(StartError::InvalidState(state)),
        };

        let mut signal = match existing {
            Some(signal) => {
                drop(lc);
                debug!("Cold start already in flight, joining");
                signal
            }
            None => {
                let (tx, rx) = watch::channel(None);
                lc.state = WorkerState::Starting;
                lc.start_signal = Some(rx.clone());
                drop(lc);

                let n = self.inner.counters.cold_starts.fetch_add(1, Ordering::Relaxed) + 1;
                info!(cold_start = n, "Cold start initiated");
                let gateway = self.clone();
                tokio::spawn(async move {
                    let outcome = gateway.run_start().await;
                    // Every waiter sees the same outcome
                    tx.send_replace(Some(outcome));
                });
                rx
            }
        };

        let waited = tokio::time::timeout(deadline, signal.wait_for(|o| o.is_some())).await;
        match waited {
            Ok(Ok(outcome)) => outcome.clone().unwrap_or(Err(StartError::Aborted)),
            Ok(Err(_)) => Err(StartError::Aborted),
            Err(_) => {
                warn!(deadline = ?deadline, "Gave up waiting for cold start, start continues");
                Err(StartError::Timeout(deadline))
            }
        }
    }

    /// Run the `warm` command and settle the lifecycle state.
    async fn run_start(&self) -> StartOutcome {
        let started = Instant::now();
        let result = self
            .inner
            .executor
            .execute_sync(MANAGED_TARGET, "warm", &[], self.inner.config.start_timeout())
            .await;

        let outcome = match result {
            Ok(0) => {
                if self.probe_managed_url().await {
                    Ok(())
                } else {
                    Err(StartError::NotReachable)
                }
            }
            Ok(code) => Err(StartError::Failed(format!("warm exited with code {}", code))),
            Err(e) => Err(StartError::Failed(e.to_string())),
        };

        let mut lc = self.inner.lifecycle.write().await;
        lc.start_signal = None;
        match &outcome {
            Ok(()) => {
                lc.state = WorkerState::Running;
                lc.last_activity = Instant::now().max(lc.last_activity);
                info!(elapsed = ?started.elapsed(), "Worker started");
            }
            Err(e) => {
                // Ambiguous: never report a failed start as a clean stop
                lc.state = WorkerState::Unknown;
                warn!(error = %e, elapsed = ?started.elapsed(), "Worker start failed");
            }
        }
        outcome
    }

    /// Probe the managed worker without touching the lifecycle state.
    async fn probe_managed_url(&self) -> bool {
        let url = if self.remote_configured() {
            self.remote_url().await
        } else {
            Some(self.inner.config.local_url.clone())
        };
        match url {
            Some(url) => self.inner.proxy.probe(&url).await,
            None => false,
        }
    }

    /// Run the stop sequence. Only proceeds from `Running`, which makes
    /// concurrent stop attempts safe: the loser sees `Stopping` and skips.
    pub async fn stop_worker(&self) -> Result<(), StopError> {
        self.managed_reachable().await;
        {
            let mut lc = self.inner.lifecycle.write().await;
            if !lc.state.can_stop() {
                return Err(StopError::NotRunning(lc.state));
            }
            lc.state = WorkerState::Stopping;
        }
        info!("Stopping worker");

        let result = self
            .inner
            .executor
            .execute_sync(MANAGED_TARGET, "stop", &[], self.inner.config.stop_timeout())
            .await;
        let (state, outcome) = match result {
            Ok(0) => (WorkerState::Stopped, Ok(())),
            Ok(code) => (WorkerState::Unknown, Err(StopError::ExitCode(code))),
            Err(e) => (WorkerState::Unknown, Err(StopError::Exec(e))),
        };

        let mut lc = self.inner.lifecycle.write().await;
        lc.state = state;
        match &outcome {
            Ok(()) => info!("Worker stopped"),
            Err(e) => warn!(error = %e, "Worker stop failed, state unknown"),
        }
        outcome
    }

    /// Start the managed worker in the background.
    pub fn force_start(&self) {
        let gateway = self.clone();
        tokio::spawn(async move {
            let deadline = gateway.inner.config.start_timeout();
            if let Err(e) = gateway.ensure_running(deadline).await {
                warn!(error = %e, "Forced start did not complete");
            }
        });
    }

    /// Stop the managed worker in the background.
    pub fn force_stop(&self) {
        let gateway = self.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.stop_worker().await {
                warn!(error = %e, "Forced stop skipped or failed");
            }
        });
    }

    /// Move the activity timestamp into the past.
    #[cfg(test)]
    pub(crate) async fn backdate_activity(&self, by: Duration) {
        let mut lc = self.inner.lifecycle.write().await;
        if let Some(earlier) = Instant::now().checked_sub(by) {
            lc.last_activity = earlier;
        }
    }

    /// Full status snapshot, probing every backend tier.
    pub async fn status(&self) -> GatewayStatus {
        let remote_url = self.remote_url().await;
        let auxiliary_url = self.inner.config.auxiliary_url.clone();
        let local_url = self.inner.config.local_url.clone();

        let local_ready = self.inner.proxy.probe(&local_url).await;
        let remote_ready = match &remote_url {
            Some(url) => self.inner.proxy.probe(url).await,
            None => false,
        };
        let auxiliary_ready = match &auxiliary_url {
            Some(url) => self.inner.proxy.probe(url).await,
            None => false,
        };
        if remote_ready {
            self.reconcile_running().await;
        }

        let counters = self.counters();
        let lc = self.inner.lifecycle.read().await;
        let idle = lc.last_activity.elapsed();
        let until_shutdown = lc.idle_timeout.saturating_sub(idle);

        GatewayStatus {
            worker_state: lc.state,
            worker_ready: local_ready,
            paused: lc.paused,
            mode: lc.mode,
            active_target: lc.active_target.clone(),
            idle: format_secs(idle),
            idle_timeout: format_secs(lc.idle_timeout),
            until_shutdown: format_secs(until_shutdown),
            requests_total: counters.requests_total,
            requests_blocked: counters.requests_blocked,
            cold_starts: counters.cold_starts,
            routed: RoutedStatus {
                local: counters.local_routed,
                remote: counters.remote_routed,
                auxiliary: counters.auxiliary_routed,
                broker: counters.broker_routed,
            },
            broker_connected: self.connected_broker().is_some(),
            fleet_configured: self.inner.fleet.as_ref().is_some_and(|f| f.is_configured()),
            local: backend_status(Some(local_url), local_ready),
            remote: backend_status(remote_url, remote_ready),
            auxiliary: backend_status(auxiliary_url, auxiliary_ready),
        }
    }
}

fn backend_status(url: Option<String>, ready: bool) -> BackendStatus {
    let state = match (&url, ready) {
        (None, _) => "not_configured",
        (Some(_), true) => "running",
        (Some(_), false) => "stopped",
    };
    BackendStatus { url, state, ready }
}

/// Whole seconds in humantime notation ("1h 5m 3s").
fn format_secs(d: Duration) -> String {
    humantime::format_duration(Duration::from_secs(d.as_secs())).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("worker.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    /// Gateway whose backends are all unreachable.
    fn gateway(worker_command: &str) -> Gateway {
        let config = Config {
            local_url: "http://127.0.0.1:1".to_string(),
            remote_url: Some("http://127.0.0.1:2".to_string()),
            worker_command: worker_command.to_string(),
            probe_timeout_ms: 500,
            ..Default::default()
        };
        Gateway::new(config, None, None)
    }

    #[tokio::test]
    async fn test_set_ttl_clamps() {
        let gw = gateway("true");
        assert_eq!(gw.set_ttl("1m").await.unwrap(), Duration::from_secs(300));
        assert_eq!(gw.set_ttl("48h").await.unwrap(), Duration::from_secs(86400));
        assert_eq!(gw.set_ttl("30m").await.unwrap(), Duration::from_secs(1800));
        assert!(matches!(gw.set_ttl("").await, Err(TtlError::Missing)));
        assert!(matches!(gw.set_ttl("soon").await, Err(TtlError::Invalid(_))));
        assert_eq!(gw.idle().await.timeout, Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_status_reports_new_ttl() {
        let gw = gateway("true");
        gw.set_ttl("2h").await.unwrap();
        let status = gw.status().await;
        assert_eq!(status.idle_timeout, "2h");
        assert_eq!(status.worker_state, WorkerState::Unknown);
        assert!(!status.worker_ready);
        assert_eq!(status.auxiliary.state, "not_configured");
        assert_eq!(status.remote.state, "stopped");
    }

    #[tokio::test]
    async fn test_pause_keeps_timer_resume_resets_it() {
        let gw = gateway("true");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let before = gw.idle().await.idle;
        gw.pause().await;
        gw.pause().await;
        let paused = gw.idle().await;
        assert!(paused.paused);
        assert!(paused.idle >= before);

        gw.resume().await;
        let resumed = gw.idle().await;
        assert!(!resumed.paused);
        assert!(resumed.idle < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_mode_change_never_touches_state() {
        let gw = gateway("true");
        gw.set_mode(RoutingMode::Remote).await;
        assert_eq!(gw.mode().await, RoutingMode::Remote);
        assert_eq!(gw.state().await, WorkerState::Unknown);
        assert_eq!(gw.counters().cold_starts, 0);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_one_failed_start() {
        let dir = tempfile::tempdir().unwrap();
        let count = dir.path().join("count");
        let script = write_script(
            dir.path(),
            &format!("echo \"$1\" >> {}\nsleep 0.5\nexit 1", count.display()),
        );
        let gw = gateway(&script);

        let (a, b, c) = tokio::join!(
            gw.ensure_running(Duration::from_secs(10)),
            gw.ensure_running(Duration::from_secs(10)),
            gw.ensure_running(Duration::from_secs(10)),
        );
        let expected = Err(StartError::Failed("warm exited with code 1".to_string()));
        assert_eq!(a, expected);
        assert_eq!(b, expected);
        assert_eq!(c, expected);

        let invocations = std::fs::read_to_string(&count).unwrap();
        assert_eq!(invocations.lines().collect::<Vec<_>>(), vec!["warm"]);
        assert_eq!(gw.counters().cold_starts, 1);
        // Failed start is ambiguous, not a clean stop
        assert_eq!(gw.state().await, WorkerState::Unknown);
    }

    #[tokio::test]
    async fn test_caller_deadline_does_not_cancel_start() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleep 1\nexit 0");
        let gw = gateway(&script);

        let result = gw.ensure_running(Duration::from_millis(100)).await;
        assert_eq!(result, Err(StartError::Timeout(Duration::from_millis(100))));
        assert_eq!(gw.state().await, WorkerState::Starting);

        // The start runs on; the backend never comes up so it lands in Unknown
        for _ in 0..100 {
            if gw.state().await != WorkerState::Starting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(gw.state().await, WorkerState::Unknown);
        assert_eq!(gw.counters().cold_starts, 1);
    }

    #[tokio::test]
    async fn test_stop_skipped_unless_running() {
        let gw = gateway("true");
        let err = gw.stop_worker().await.unwrap_err();
        assert!(matches!(err, StopError::NotRunning(WorkerState::Unknown)));
    }

    #[tokio::test]
    async fn test_local_mode_never_cold_starts() {
        let gw = gateway("true");
        gw.set_mode(RoutingMode::Local).await;
        let err = gw.select_backend().await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Unreachable {
                backend: Backend::Local,
                mode: RoutingMode::Local
            }
        ));
        assert_eq!(gw.counters().requests_blocked, 0);
        assert_eq!(gw.counters().cold_starts, 0);
    }

    #[tokio::test]
    async fn test_auxiliary_mode_requires_configuration() {
        let gw = gateway("true");
        gw.set_mode(RoutingMode::Auxiliary).await;
        let err = gw.select_backend().await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::NotConfigured {
                backend: Backend::Auxiliary,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fleet_without_url_is_not_configured() {
        let fleet_config: crate::config::FleetConfig =
            serde_json::from_value(serde_json::json!({ "url": "" })).unwrap();
        let fleet = FleetClient::new(&fleet_config).unwrap();
        let config = Config {
            local_url: "http://127.0.0.1:1".to_string(),
            probe_timeout_ms: 500,
            ..Default::default()
        };
        let gw = Gateway::new(config, None, Some(fleet));

        assert!(!gw.remote_configured());
        let status = gw.status().await;
        assert!(!status.fleet_configured);
        assert_eq!(status.remote.state, "not_configured");
    }

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(Duration::from_millis(3_900)), "3s");
        assert_eq!(format_secs(Duration::from_secs(2 * 3600)), "2h");
        assert_eq!(format_secs(Duration::ZERO), "0s");
    }
}
