//! Events flowing from agents and sessions to attached clients.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConnectionId, EvaluationOutcome, EvaluationPhase, RequestId, SessionId, SessionState};

/// Point in time attached to every event.
pub type Timestamp = DateTime<Utc>;

/// Opaque identity of the component that emitted an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSource(String);

impl EventSource {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    /// Source used for events the hub emits on behalf of a session.
    #[must_use]
    pub fn session(id: &SessionId) -> Self {
        Self(format!("session:{id}"))
    }

    /// Source used for events emitted by an agent connection.
    #[must_use]
    pub fn agent(id: ConnectionId) -> Self {
        Self(format!("agent:{id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output stream of an [`EventPayload::Output`] chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Severity of an [`EventPayload::Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Closed set of event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Text written by user code.
    Output {
        stream: OutputStream,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
    /// Completion of an evaluation request.
    EvaluationResult {
        request_id: RequestId,
        outcome: EvaluationOutcome,
    },
    /// An in-flight evaluation reached `phase`.
    EvaluationProgress {
        request_id: RequestId,
        phase: EvaluationPhase,
    },
    /// Compiler or runtime diagnostic.
    Diagnostic {
        severity: Severity,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
    /// Session lifecycle transition. `Closed` is the terminal event.
    StateChange {
        state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Liveness marker.
    Heartbeat,
}

impl EventPayload {
    /// Payloads only the hub itself may emit.
    #[must_use]
    pub const fn is_hub_owned(&self) -> bool {
        matches!(self, Self::EvaluationResult { .. } | Self::StateChange { .. })
    }

    /// Whether this payload ends the event stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StateChange {
                state: SessionState::Closed,
                ..
            }
        )
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Output { .. } => "output",
            Self::EvaluationResult { .. } => "evaluation_result",
            Self::EvaluationProgress { .. } => "evaluation_progress",
            Self::Diagnostic { .. } => "diagnostic",
            Self::StateChange { .. } => "state_change",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Immutable, timestamped unit of information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    source: EventSource,
    timestamp: Timestamp,
    payload: EventPayload,
}

impl Event {
    #[must_use]
    pub const fn new(source: EventSource, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            source,
            timestamp,
            payload,
        }
    }

    #[must_use]
    pub const fn source(&self) -> &EventSource {
        &self.source
    }

    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[must_use]
    pub const fn payload(&self) -> &EventPayload {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> EventPayload {
        self.payload
    }
}

/// Stamps events for a single source.
///
/// Stamps are strictly increasing even when the wall clock stalls or steps
/// backwards.
#[derive(Debug, Clone)]
pub struct EventClock {
    source: EventSource,
    last: Option<Timestamp>,
}

impl EventClock {
    #[must_use]
    pub const fn new(source: EventSource) -> Self {
        Self { source, last: None }
    }

    #[must_use]
    pub const fn source(&self) -> &EventSource {
        &self.source
    }

    /// Next timestamp for this source.
    pub fn tick(&mut self) -> Timestamp {
        let now = Utc::now();
        let stamp = match self.last {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }

    /// Build an event from this source with the next timestamp.
    pub fn event(&mut self, payload: EventPayload) -> Event {
        let timestamp = self.tick();
        Event::new(self.source.clone(), timestamp, payload)
    }
}
