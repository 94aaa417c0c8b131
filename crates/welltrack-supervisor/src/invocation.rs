use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use welltrack_protocol::{ItemId, ProtocolEvent, StreamParserStats};

use crate::error::SupervisorResult;

/// What a single worker invocation is allowed to write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvocationScope {
    Batch,
    Item(ItemId),
}

impl fmt::Display for InvocationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch => f.write_str("the full batch"),
            Self::Item(id) => write!(f, "item {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub base_args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    pub fn with_base_args(mut self, base_args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.base_args = base_args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub scope: InvocationScope,
    pub workdir: PathBuf,
    pub args: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl InvocationRequest {
    pub fn new(scope: InvocationScope, workdir: impl Into<PathBuf>) -> Self {
        Self {
            scope,
            workdir: workdir.into(),
            args: Vec::new(),
            environment: Vec::new(),
            timeout: None,
        }
    }
}

/// Final word on one invocation; always the last message on its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    pub scope: InvocationScope,
    pub exit_code: Option<i32>,
    pub outcome: SupervisorResult<()>,
    pub parser_stats: StreamParserStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationMessage {
    Event(ProtocolEvent),
    Exited(InvocationReport),
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable switch that stops one invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if !self.state.cancelled.swap(true, Ordering::SeqCst) {
            self.state.notify.notify_one();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.state.notify.notified().await;
    }
}

/// A launched worker. Events arrive in parse order, followed by exactly one
/// [`InvocationMessage::Exited`].
#[derive(Debug)]
pub struct RunningInvocation {
    pub(crate) invocation_id: u64,
    pub(crate) scope: InvocationScope,
    pub(crate) messages: mpsc::Receiver<InvocationMessage>,
    pub(crate) cancel: CancelHandle,
}

impl RunningInvocation {
    pub fn invocation_id(&self) -> u64 {
        self.invocation_id
    }

    pub fn scope(&self) -> &InvocationScope {
        &self.scope
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next_message(&mut self) -> Option<InvocationMessage> {
        self.messages.recv().await
    }

    /// Drains the invocation, returning every delivered event and the report.
    pub async fn collect(mut self) -> (Vec<ProtocolEvent>, Option<InvocationReport>) {
        let mut events = Vec::new();
        while let Some(message) = self.messages.recv().await {
            match message {
                InvocationMessage::Event(event) => events.push(event),
                InvocationMessage::Exited(report) => return (events, Some(report)),
            }
        }
        (events, None)
    }
}
