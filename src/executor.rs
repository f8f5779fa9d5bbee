//! Worker-control command execution.
//!
//! Every lifecycle action against a worker (`warm`, `stop`, ...) is delegated
//! to a user-provided command, invoked as `<worker_command> <action> [args...]`
//! through `sh -c`, so the configured command may be a path to an executable
//! or a short inline script. The target name is exported as `LLMGATE_TARGET`.
//!
//! Two calling conventions are offered: [`Executor::execute`] returns as soon
//! as the process is launched, [`Executor::execute_sync`] waits for its exit
//! code. Both broadcast every output line and the terminal outcome as
//! [`ExecEvent`]s to any number of subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-subscriber event buffer. A subscriber that falls further behind than
/// this loses the oldest events.
const EVENT_BUFFER: usize = 256;

/// How long to wait for output readers after the process has exited. A
/// backgrounded grandchild can hold the pipes open indefinitely.
const OUTPUT_DRAIN: Duration = Duration::from_secs(5);

/// Errors from running a worker-control command
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("a command is already running for target {0}")]
    AlreadyRunning(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command was killed")]
    Killed,

    #[error("failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),

    #[error("no command running for target {0}")]
    NotRunning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Stdout,
    Stderr,
    Result,
    Error,
}

/// One observable step of a command's execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub target: String,
    pub command: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub data: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Bookkeeping record for the latest command issued against a target.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: String,
    pub command: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Runs worker-control commands and fans their output out to subscribers.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    program: String,
    events: broadcast::Sender<ExecEvent>,
    operations: Mutex<HashMap<String, Operation>>,
    running: Mutex<HashMap<String, RunningCommand>>,
}

struct RunningCommand {
    id: String,
    kill: Option<oneshot::Sender<()>>,
}

/// A launched process, not yet reaped.
struct Launched {
    id: String,
    target: String,
    command: String,
    child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Killed,
    TimedOut(Duration),
}

impl Executor {
    pub fn new(program: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(ExecutorInner {
                program: program.into(),
                events,
                operations: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the event stream. Only events emitted after this call are
    /// received.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecEvent> {
        self.inner.events.subscribe()
    }

    /// Launch a command and return immediately with its operation id.
    ///
    /// Only launch failures are reported here. The eventual exit code lands
    /// on the target's [`Operation`], which stays in place (marked done)
    /// until the next command for that target replaces it.
    pub fn execute(&self, target: &str, command: &str, args: &[&str]) -> Result<String, ExecError> {
        let launched = self.launch(target, command, args)?;
        let id = launched.id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            let id = launched.id.clone();
            let target = launched.target.clone();
            let exit_code = match this.finish(launched, None).await {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!(target = %target, error = %e, "Worker command failed");
                    None
                }
            };
            this.mark_done(&target, &id, exit_code);
        });
        Ok(id)
    }

    /// Run a command to completion and return its exit code.
    ///
    /// The target's [`Operation`] is removed once this returns. The terminal
    /// `result` event has been broadcast by then.
    pub async fn execute_sync(
        &self,
        target: &str,
        command: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<i32, ExecError> {
        let launched = self.launch(target, command, args)?;
        let id = launched.id.clone();
        let result = self.finish(launched, Some(timeout)).await;
        self.remove_operation(target, &id);
        result
    }

    /// Kill the command currently running for `target`.
    pub fn kill(&self, target: &str) -> Result<(), ExecError> {
        let tx = lock(&self.inner.running)
            .get_mut(target)
            .and_then(|running| running.kill.take())
            .ok_or_else(|| ExecError::NotRunning(target.to_string()))?;
        info!(target = %target, "Killing worker command");
        // The receiver only disappears once the process has been reaped
        let _ = tx.send(());
        Ok(())
    }

    pub fn is_running(&self, target: &str) -> bool {
        lock(&self.inner.running).contains_key(target)
    }

    /// Operations that have not completed yet.
    pub fn active_operations(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = lock(&self.inner.operations)
            .values()
            .filter(|op| !op.done)
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.target.cmp(&b.target));
        ops
    }

    fn launch(&self, target: &str, command: &str, args: &[&str]) -> Result<Launched, ExecError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut running = lock(&self.inner.running);
            if running.contains_key(target) {
                return Err(ExecError::AlreadyRunning(target.to_string()));
            }
            running.insert(
                target.to_string(),
                RunningCommand {
                    id: id.clone(),
                    kill: Some(kill_tx),
                },
            );
        }

        lock(&self.inner.operations).insert(
            target.to_string(),
            Operation {
                id: id.clone(),
                command: command.to_string(),
                target: target.to_string(),
                started_at: Utc::now(),
                done: false,
                exit_code: None,
            },
        );
        self.emit(EventKind::Start, target, command, String::new(), None);
        info!(target = %target, command = %command, args = ?args, "Running worker command");

        // Run in its own process group so a kill takes the whole tree with it
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("{} \"$@\"", self.inner.program))
            .arg("sh")
            .arg(command)
            .args(args)
            .env("LLMGATE_TARGET", target)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                lock(&self.inner.running).remove(target);
                self.remove_operation(target, &id);
                self.emit(EventKind::Error, target, command, source.to_string(), None);
                return Err(ExecError::Spawn {
                    command: command.to_string(),
                    source,
                });
            }
        };

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(stdout, EventKind::Stdout, target, command));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(stderr, EventKind::Stderr, target, command));
        }

        Ok(Launched {
            id,
            target: target.to_string(),
            command: command.to_string(),
            child,
            kill_rx,
            readers,
        })
    }

    /// Forward one output pipe line by line until EOF. Invalid UTF-8 is
    /// replaced, never fatal: the pipe must stay drained or the command dies
    /// of SIGPIPE on its next write.
    fn spawn_reader<R>(&self, stream: R, kind: EventKind, target: &str, command: &str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let this = self.clone();
        let (target, command) = (target.to_string(), command.to_string());
        let stream_name = if kind == EventKind::Stderr { "stderr" } else { "stdout" };
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let clean = strip_ansi(line.trim_end_matches(['\n', '\r']));
                        debug!(target: "worker", worker = %target, stream = stream_name, "{}", clean);
                        this.emit(kind, &target, &command, clean, None);
                    }
                    Err(e) => {
                        debug!(worker = %target, stream = stream_name, error = %e, "Output pipe closed");
                        break;
                    }
                }
            }
        })
    }

    /// Wait for a launched process, then emit its terminal event.
    async fn finish(&self, launched: Launched, timeout: Option<Duration>) -> Result<i32, ExecError> {
        let Launched {
            id,
            target,
            command,
            mut child,
            mut kill_rx,
            readers,
        } = launched;

        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let exit = tokio::select! {
            status = child.wait() => Exit::Exited(status),
            Ok(()) = &mut kill_rx => Exit::Killed,
            _ = deadline => Exit::TimedOut(timeout.unwrap_or_default()),
        };

        if !matches!(exit, Exit::Exited(_)) {
            if let Some(pid) = child.id() {
                kill_process_group(pid);
            }
            let _ = child.kill().await;
        }

        for reader in readers {
            if tokio::time::timeout(OUTPUT_DRAIN, reader).await.is_err() {
                debug!(target = %target, "Output reader still open after exit, detaching");
            }
        }
        {
            let mut running = lock(&self.inner.running);
            if running.get(&target).is_some_and(|r| r.id == id) {
                running.remove(&target);
            }
        }

        let result = match exit {
            Exit::Exited(Ok(status)) => Ok(status.code().unwrap_or(-1)),
            Exit::Exited(Err(e)) => Err(ExecError::Wait(e)),
            Exit::Killed => Err(ExecError::Killed),
            Exit::TimedOut(d) => Err(ExecError::Timeout(d)),
        };

        match &result {
            Ok(code) => {
                info!(target = %target, command = %command, exit_code = code, "Worker command completed");
                self.emit(EventKind::Result, &target, &command, String::new(), Some(*code));
            }
            Err(e) => {
                warn!(target = %target, command = %command, error = %e, "Worker command did not complete");
                self.emit(EventKind::Error, &target, &command, e.to_string(), None);
            }
        }
        result
    }

    fn emit(&self, kind: EventKind, target: &str, command: &str, data: String, exit_code: Option<i32>) {
        // No subscribers is not an error
        let _ = self.inner.events.send(ExecEvent {
            kind,
            target: target.to_string(),
            command: command.to_string(),
            data,
            timestamp: Utc::now(),
            exit_code,
        });
    }

    fn mark_done(&self, target: &str, id: &str, exit_code: Option<i32>) {
        if let Some(op) = lock(&self.inner.operations).get_mut(target)
            && op.id == id
        {
            op.done = true;
            op.exit_code = exit_code;
        }
    }

    fn remove_operation(&self, target: &str, id: &str) {
        let mut ops = lock(&self.inner.operations);
        if ops.get(target).is_some_and(|op| op.id == id) {
            ops.remove(target);
        }
    }

    #[cfg(test)]
    fn operation(&self, target: &str) -> Option<Operation> {
        lock(&self.inner.operations).get(target).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Kill an entire process group by sending SIGKILL to -pgid.
fn kill_process_group(pid: u32) {
    // SAFETY: the group was created by us via process_group(0)
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
}

/// Strip ANSI escape sequences from a string.
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip until we hit a letter (end of escape sequence)
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
