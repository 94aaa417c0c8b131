use serde::{Deserialize, Serialize};

use crate::payload::ResultPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub done: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticSource {
    /// An explicit `DEBUG:` line.
    Debug,
    /// A line whose tag is not part of the protocol.
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub source: DiagnosticSource,
    pub message: String,
}

/// A recognized line whose payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedEvent {
    pub tag: String,
    pub raw_payload: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolEvent {
    BatchSize(u64),
    ItemStarted { file: String },
    ItemSummary(ResultPayload),
    Progress(ProgressEvent),
    ItemFullResult(ResultPayload),
    BatchResults(Vec<ResultPayload>),
    BatchFinished { message: String },
    Diagnostic(DiagnosticEvent),
    Malformed(MalformedEvent),
}

impl ProtocolEvent {
    /// Whether the event changes item state when merged.
    pub fn affects_state(&self) -> bool {
        !matches!(
            self,
            Self::ItemStarted { .. } | Self::Diagnostic(_) | Self::Malformed(_)
        )
    }
}
