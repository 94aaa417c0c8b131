use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use welltrack_protocol::{ProtocolEvent, StreamParser, StreamParserStats};

use crate::error::{SupervisorError, SupervisorResult};
use crate::invocation::{
    CancelHandle, InvocationMessage, InvocationReport, InvocationRequest, InvocationScope,
    RunningInvocation, WorkerCommand,
};
use crate::registry::InflightRegistry;

pub const DEFAULT_EVENT_BUFFER: usize = 256;
const DEFAULT_DIAGNOSTIC_TAIL_LINES: usize = 20;
const READ_CHUNK_BYTES: usize = 8 * 1024;
const DEFAULT_READER_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub event_buffer: usize,
    pub diagnostic_tail_lines: usize,
    /// How long the output readers may keep draining once the worker has
    /// exited or been stopped. A descendant that inherited the pipes can
    /// hold them open indefinitely; past this bound the readers are dropped.
    pub reader_drain_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
            diagnostic_tail_lines: DEFAULT_DIAGNOSTIC_TAIL_LINES,
            reader_drain_grace: DEFAULT_READER_DRAIN_GRACE,
        }
    }
}

/// Spawns worker processes, one per invocation.
///
/// Cloning is cheap and clones share the in-flight registry, so the
/// same-scope rule holds across every handle.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    command: WorkerCommand,
    config: SupervisorConfig,
    registry: Arc<Mutex<InflightRegistry>>,
    next_invocation_id: Arc<AtomicU64>,
}

impl ProcessSupervisor {
    pub fn new(command: WorkerCommand) -> Self {
        Self::with_config(command, SupervisorConfig::default())
    }

    pub fn with_config(command: WorkerCommand, config: SupervisorConfig) -> Self {
        Self {
            command,
            config,
            registry: Arc::new(Mutex::new(InflightRegistry::default())),
            next_invocation_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Starts the worker and returns immediately; events stream in as the
    /// worker prints them. Must be called from within a tokio runtime.
    pub fn launch(&self, request: InvocationRequest) -> SupervisorResult<RunningInvocation> {
        let invocation_id = self.next_invocation_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancelHandle::default();
        let reservation = self.reserve(&request.scope, invocation_id, cancel.clone())?;
        let program = self.command.program.display().to_string();

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.base_args)
            .args(&request.args)
            .envs(
                request
                    .environment
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if request.workdir.is_dir() {
            command.current_dir(&request.workdir);
        }

        let mut child = command.spawn().map_err(|error| {
            tracing::warn!(program = program.as_str(), error = %error, "worker launch failed");
            SupervisorError::LaunchFailure {
                program: program.clone(),
                reason: error.to_string(),
            }
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SupervisorError::LaunchFailure {
            program: program.clone(),
            reason: "worker stdout unavailable".to_owned(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SupervisorError::LaunchFailure {
            program: program.clone(),
            reason: "worker stderr unavailable".to_owned(),
        })?;

        tracing::info!(
            invocation_id,
            scope = %request.scope,
            program = program.as_str(),
            "launched worker"
        );

        let (sender, messages) = mpsc::channel(self.config.event_buffer.max(1));
        let stdout_task = tokio::spawn(relay_primary_output(stdout, sender.clone(), cancel.clone()));
        let stderr_task = tokio::spawn(collect_diagnostics(
            stderr,
            invocation_id,
            self.config.diagnostic_tail_lines,
        ));
        tokio::spawn(supervise(Supervision {
            invocation_id,
            scope: request.scope.clone(),
            child,
            timeout: request.timeout,
            cancel: cancel.clone(),
            sender,
            stdout_task,
            stderr_task,
            reader_drain_grace: self.config.reader_drain_grace,
            reservation,
        }));

        Ok(RunningInvocation {
            invocation_id,
            scope: request.scope,
            messages,
            cancel,
        })
    }

    pub fn cancel(&self, scope: &InvocationScope) -> bool {
        lock_registry(&self.registry).cancel(scope)
    }

    pub fn cancel_all(&self) -> usize {
        lock_registry(&self.registry).cancel_all()
    }

    pub fn is_in_flight(&self, scope: &InvocationScope) -> bool {
        lock_registry(&self.registry).is_active(scope)
    }

    pub fn in_flight(&self) -> Vec<InvocationScope> {
        lock_registry(&self.registry).active_scopes()
    }

    fn reserve(
        &self,
        scope: &InvocationScope,
        invocation_id: u64,
        cancel: CancelHandle,
    ) -> SupervisorResult<Reservation> {
        if !lock_registry(&self.registry).reserve(scope.clone(), invocation_id, cancel) {
            tracing::debug!(scope = %scope, "rejecting invocation, scope already in flight");
            return Err(SupervisorError::InFlight(scope.clone()));
        }
        Ok(Reservation {
            registry: Arc::clone(&self.registry),
            scope: scope.clone(),
            invocation_id,
        })
    }
}

fn lock_registry(registry: &Mutex<InflightRegistry>) -> MutexGuard<'_, InflightRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a scope in the registry until dropped.
#[derive(Debug)]
struct Reservation {
    registry: Arc<Mutex<InflightRegistry>>,
    scope: InvocationScope,
    invocation_id: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        lock_registry(&self.registry).release(&self.scope, self.invocation_id);
    }
}

struct Supervision {
    invocation_id: u64,
    scope: InvocationScope,
    child: Child,
    timeout: Option<Duration>,
    cancel: CancelHandle,
    sender: mpsc::Sender<InvocationMessage>,
    stdout_task: JoinHandle<StreamParserStats>,
    stderr_task: JoinHandle<Vec<String>>,
    reader_drain_grace: Duration,
    reservation: Reservation,
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

async fn supervise(supervision: Supervision) {
    let Supervision {
        invocation_id,
        scope,
        mut child,
        timeout,
        cancel,
        sender,
        stdout_task,
        stderr_task,
        reader_drain_grace,
        reservation,
    } = supervision;

    let stop = tokio::select! {
        status = child.wait() => Stop::Exited(status),
        () = cancel.cancelled() => Stop::Cancelled,
        elapsed = wait_for_deadline(timeout) => Stop::TimedOut(elapsed),
    };

    let (exit_code, outcome) = match stop {
        Stop::Exited(Ok(status)) if status.success() => (status.code(), Ok(())),
        Stop::Exited(Ok(status)) => (
            status.code(),
            Err(SupervisorError::NonZeroExit {
                code: status.code(),
                detail: String::new(),
            }),
        ),
        Stop::Exited(Err(error)) => (None, Err(SupervisorError::Io(error.to_string()))),
        Stop::Cancelled => {
            stop_child(&mut child, invocation_id).await;
            (None, Err(SupervisorError::Cancelled))
        }
        Stop::TimedOut(elapsed) => {
            cancel.cancel();
            stop_child(&mut child, invocation_id).await;
            (None, Err(SupervisorError::Timeout(elapsed)))
        }
    };

    let parser_stats = join_reader(stdout_task, reader_drain_grace, invocation_id).await;
    let diagnostics = join_reader(stderr_task, reader_drain_grace, invocation_id).await;
    let outcome = outcome.map_err(|error| match error {
        SupervisorError::NonZeroExit { code, .. } => SupervisorError::NonZeroExit {
            code,
            detail: summarize_diagnostics(&diagnostics),
        },
        other => other,
    });

    match &outcome {
        Ok(()) => tracing::info!(invocation_id, scope = %scope, "worker finished"),
        Err(error) => tracing::warn!(
            invocation_id,
            scope = %scope,
            error = %error,
            malformed_lines = parser_stats.malformed_lines,
            "worker invocation failed"
        ),
    }

    drop(reservation);
    let _ = sender
        .send(InvocationMessage::Exited(InvocationReport {
            scope,
            exit_code,
            outcome,
            parser_stats,
        }))
        .await;
}

async fn wait_for_deadline(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(timeout) => {
            tokio::time::sleep(timeout).await;
            timeout
        }
        None => std::future::pending().await,
    }
}

async fn stop_child(child: &mut Child, invocation_id: u64) {
    if let Err(error) = child.kill().await {
        tracing::warn!(invocation_id, error = %error, "failed to stop worker process");
    }
}

async fn join_reader<T: Default>(
    mut task: JoinHandle<T>,
    grace: Duration,
    invocation_id: u64,
) -> T {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(result) => result.unwrap_or_default(),
        Err(_) => {
            tracing::warn!(
                invocation_id,
                grace_ms = grace.as_millis() as u64,
                "worker output still open after exit, dropping reader"
            );
            task.abort();
            T::default()
        }
    }
}

fn summarize_diagnostics(lines: &[String]) -> String {
    if lines.is_empty() {
        "the worker wrote no diagnostic output".to_owned()
    } else {
        lines.join("\n")
    }
}

/// Feeds the worker's primary output through the parser.
///
/// Cancellation is checked once per chunk, before the chunk is parsed:
/// every event parsed before the cancel landed is delivered, nothing parsed
/// after it is. Reading continues so the pipe drains and the stats stay
/// complete.
async fn relay_primary_output<R>(
    mut stdout: R,
    sender: mpsc::Sender<InvocationMessage>,
    cancel: CancelHandle,
) -> StreamParserStats
where
    R: AsyncRead + Unpin,
{
    let mut parser = StreamParser::default();
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    let mut delivering = true;
    loop {
        let read = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(error) => {
                tracing::warn!(error = %error, "failed to read worker output");
                break;
            }
        };
        delivering = delivering && !cancel.is_cancelled();
        let events = parser.feed(&chunk[..read]);
        if delivering {
            delivering = deliver(&sender, events).await;
        }
    }
    delivering = delivering && !cancel.is_cancelled();
    let trailing = parser.finish();
    if delivering {
        deliver(&sender, trailing).await;
    }
    parser.stats()
}

async fn deliver(sender: &mpsc::Sender<InvocationMessage>, events: Vec<ProtocolEvent>) -> bool {
    for event in events {
        if sender.send(InvocationMessage::Event(event)).await.is_err() {
            return false;
        }
    }
    true
}

async fn collect_diagnostics(
    stderr: ChildStderr,
    invocation_id: u64,
    tail_lines: usize,
) -> Vec<String> {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(tail_lines);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(invocation_id, error = %error, "failed to read worker diagnostics");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buffer);
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        tracing::debug!(invocation_id, line, "worker diagnostic output");
        if tail_lines == 0 {
            continue;
        }
        if tail.len() == tail_lines {
            tail.pop_front();
        }
        tail.push_back(line.to_owned());
    }
    Vec::from(tail)
}
