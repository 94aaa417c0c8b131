use std::sync::OnceLock;

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{
    DiagnosticEvent, DiagnosticSource, MalformedEvent, ProgressEvent, ProtocolEvent,
};
use crate::payload::ResultPayload;
use crate::wire::WireTag;

const ENV_LOG_RAW_LINES: &str = "WELLTRACK_LOG_RAW_LINES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamParserStats {
    pub lines: u64,
    pub malformed_lines: u64,
    pub unrecognized_lines: u64,
}

/// Incremental parser for the worker's primary output stream.
///
/// Bytes may be split anywhere, including inside a multi-byte character.
/// Only complete lines produce events; the incomplete tail is held until a
/// later [`feed`](Self::feed) completes it or [`finish`](Self::finish)
/// flushes it at end of stream.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
    stats: StreamParserStats,
}

impl StreamParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ProtocolEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline_index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.drain(..=newline_index).collect::<Vec<_>>();
            if let Some(event) = self.parse_raw_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes an unterminated final line once the stream has closed.
    pub fn finish(&mut self) -> Vec<ProtocolEvent> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.buffer);
        self.parse_raw_line(&line).into_iter().collect()
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> StreamParserStats {
        self.stats
    }

    fn parse_raw_line(&mut self, raw: &[u8]) -> Option<ProtocolEvent> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            return None;
        }

        self.stats.lines += 1;
        if raw_line_logging_enabled() {
            tracing::debug!(target: "welltrack_worker_lines", line, "raw worker line");
        }

        let event = parse_line(line);
        match &event {
            ProtocolEvent::Malformed(malformed) => {
                self.stats.malformed_lines += 1;
                tracing::warn!(
                    tag = malformed.tag.as_str(),
                    reason = malformed.reason.as_str(),
                    "dropping malformed worker line"
                );
            }
            ProtocolEvent::Diagnostic(DiagnosticEvent {
                source: DiagnosticSource::Unrecognized,
                ..
            }) => {
                self.stats.unrecognized_lines += 1;
            }
            _ => {}
        }
        Some(event)
    }
}

/// Parses one complete line, without its terminator.
pub fn parse_line(line: &str) -> ProtocolEvent {
    let Some((tag, payload)) = WireTag::split_line(line) else {
        return ProtocolEvent::Diagnostic(DiagnosticEvent {
            source: DiagnosticSource::Unrecognized,
            message: line.to_owned(),
        });
    };

    let decoded = match tag {
        WireTag::TotalFiles => parse_count(payload).map(ProtocolEvent::BatchSize),
        WireTag::ProcessingFile => Ok(ProtocolEvent::ItemStarted {
            file: payload.trim().to_owned(),
        }),
        WireTag::WellCompleted => {
            ResultPayload::from_summary_json(payload).map(ProtocolEvent::ItemSummary)
        }
        WireTag::Progress => parse_progress(payload).map(ProtocolEvent::Progress),
        WireTag::UpdatedResult => {
            ResultPayload::from_updated_result_json(payload).map(ProtocolEvent::ItemFullResult)
        }
        WireTag::CompleteResults => {
            ResultPayload::list_from_json(payload).map(ProtocolEvent::BatchResults)
        }
        WireTag::AnalysisComplete => Ok(ProtocolEvent::BatchFinished {
            message: payload.trim().to_owned(),
        }),
        WireTag::Debug => Ok(ProtocolEvent::Diagnostic(DiagnosticEvent {
            source: DiagnosticSource::Debug,
            message: payload.to_owned(),
        })),
    };

    decoded.unwrap_or_else(|error| {
        ProtocolEvent::Malformed(MalformedEvent {
            tag: tag.as_str().to_owned(),
            raw_payload: payload.to_owned(),
            reason: error.to_string(),
        })
    })
}

fn parse_count(payload: &str) -> ProtocolResult<u64> {
    payload
        .trim()
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidNumber(payload.trim().to_owned()))
}

fn parse_progress(payload: &str) -> ProtocolResult<ProgressEvent> {
    let (done, total) = payload.split_once('/').ok_or_else(|| {
        ProtocolError::UnexpectedShape(format!("progress '{payload}' is not <done>/<total>"))
    })?;
    Ok(ProgressEvent {
        done: parse_count(done)?,
        total: parse_count(total)?,
    })
}

fn raw_line_logging_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var(ENV_LOG_RAW_LINES).is_ok_and(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    })
}
