//! Wire protocol shared by agents, clients and the hub.

use std::io;

use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use workbook_hub_core::{
    ConnectionId, ErrorCode, EvaluationOutcome, EvaluationRequest, Event, EventPayload,
    EventSource, HubError, RequestId, Role, SessionId, SessionState, Timestamp,
};
use workbook_hub_session::AgentCommand;

/// The only protocol version this hub speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message exchanged in either direction.
///
/// The first message on every connection must be a `Handshake`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Declare the session to join and the role to join it as.
    Handshake {
        session_id: String,
        role: Role,
        protocol_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Hub accepted the handshake.
    HandshakeAccepted {
        session_id: SessionId,
        connection_id: ConnectionId,
        state: SessionState,
    },
    /// Client → hub → agent.
    EvaluationRequest { request_id: RequestId, code: String },
    /// Client → hub → agent: stop an evaluation.
    Abort { request_id: RequestId },
    /// Agent → hub.
    EvaluationComplete {
        request_id: RequestId,
        outcome: EvaluationOutcome,
    },
    /// Agent → hub → clients.
    Event {
        source: EventSource,
        timestamp: Timestamp,
        payload: EventPayload,
    },
    Attach,
    Detach,
    Heartbeat,
    Close { reason: String },
    Error { code: ErrorCode, message: String },
}

impl WireMessage {
    /// Build a handshake for the current protocol version.
    #[must_use]
    pub fn handshake(session_id: impl Into<String>, role: Role, token: Option<String>) -> Self {
        Self::Handshake {
            session_id: session_id.into(),
            role,
            protocol_version: PROTOCOL_VERSION,
            token,
        }
    }

    #[must_use]
    pub fn error(err: &HubError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn event(event: Event) -> Self {
        Self::Event {
            source: event.source().clone(),
            timestamp: event.timestamp(),
            payload: event.into_payload(),
        }
    }

    /// The event carried by an `event` message.
    #[must_use]
    pub fn into_event(self) -> Option<Event> {
        match self {
            Self::Event {
                source,
                timestamp,
                payload,
            } => Some(Event::new(source, timestamp, payload)),
            _ => None,
        }
    }

    #[must_use]
    pub fn evaluation_request(request: EvaluationRequest) -> Self {
        Self::EvaluationRequest {
            request_id: request.request_id,
            code: request.code,
        }
    }

    /// Length of this message once encoded as JSON, without the line break.
    ///
    /// # Errors
    /// Returns error if the message cannot be serialized.
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        let mut counter = ByteCounter(0);
        serde_json::to_writer(&mut counter, self)?;
        Ok(counter.0)
    }

    /// Tag name as it appears on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::HandshakeAccepted { .. } => "handshake_accepted",
            Self::EvaluationRequest { .. } => "evaluation_request",
            Self::Abort { .. } => "abort",
            Self::EvaluationComplete { .. } => "evaluation_complete",
            Self::Event { .. } => "event",
            Self::Attach => "attach",
            Self::Detach => "detach",
            Self::Heartbeat => "heartbeat",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
        }
    }
}

/// Upper bound on the length of the `event` frame relaying `payload` from
/// `source`, whatever timestamp it ends up carrying.
///
/// # Errors
/// Returns error if the payload cannot be serialized.
pub fn event_frame_len(
    source: &EventSource,
    payload: &EventPayload,
) -> Result<usize, serde_json::Error> {
    // Nine fractional digits is the widest stamp chrono writes.
    let now = Utc::now();
    WireMessage::Event {
        source: source.clone(),
        timestamp: now.with_nanosecond(999_999_999).unwrap_or(now),
        payload: payload.clone(),
    }
    .encoded_len()
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl From<AgentCommand> for WireMessage {
    fn from(command: AgentCommand) -> Self {
        match command {
            AgentCommand::Evaluate(request) => Self::evaluation_request(request),
            AgentCommand::Abort { request_id } => Self::Abort { request_id },
            AgentCommand::Close { reason } => Self::Close { reason },
        }
    }
}

impl From<Event> for WireMessage {
    fn from(event: Event) -> Self {
        Self::event(event)
    }
}

/// A validated handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub session_id: SessionId,
    pub role: Role,
    pub protocol_version: u32,
    pub token: Option<String>,
}

impl Handshake {
    /// Validate the first message of a connection.
    ///
    /// # Errors
    /// - [`HubError::ProtocolViolation`] if the message is not a handshake
    /// - [`HubError::UnsupportedProtocol`] on a version mismatch
    /// - [`HubError::InvalidSession`] if the session id is malformed
    pub fn validate(message: WireMessage) -> Result<Self, HubError> {
        let (session_id, role, protocol_version, token) = match message {
            WireMessage::Handshake {
                session_id,
                role,
                protocol_version,
                token,
            } => (session_id, role, protocol_version, token),
            other => {
                return Err(HubError::ProtocolViolation(format!(
                    "expected handshake, got {}",
                    other.kind()
                )));
            }
        };

        if protocol_version != PROTOCOL_VERSION {
            return Err(HubError::UnsupportedProtocol {
                requested: protocol_version,
                supported: PROTOCOL_VERSION,
            });
        }

        Ok(Self {
            session_id: SessionId::parse(&session_id)?,
            role,
            protocol_version,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use workbook_hub_core::{EventClock, OutputStream};

    use super::*;

    #[test]
    fn test_handshake_wire_shape() {
        let msg = WireMessage::handshake("wb-1", Role::Agent, None);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "handshake");
        assert_eq!(json["role"], "agent");
        assert_eq!(json["protocol_version"], PROTOCOL_VERSION);
        assert!(json.get("token").is_none());
    }

    #[test]
    fn test_validate_accepts_current_version() {
        let hs = Handshake::validate(WireMessage::handshake("wb-1", Role::Client, Some("t".into())))
            .unwrap();
        assert_eq!(hs.session_id.as_str(), "wb-1");
        assert_eq!(hs.role, Role::Client);
        assert_eq!(hs.token.as_deref(), Some("t"));
    }

    #[test]
    fn test_validate_rejects_other_versions() {
        let msg = WireMessage::Handshake {
            session_id: "wb".into(),
            role: Role::Agent,
            protocol_version: 2,
            token: None,
        };
        let err = Handshake::validate(msg).unwrap_err();
        assert!(matches!(
            err,
            HubError::UnsupportedProtocol {
                requested: 2,
                supported: PROTOCOL_VERSION
            }
        ));
    }

    #[test]
    fn test_validate_rejects_non_handshake_and_bad_ids() {
        assert!(matches!(
            Handshake::validate(WireMessage::Heartbeat),
            Err(HubError::ProtocolViolation(_))
        ));
        assert!(matches!(
            Handshake::validate(WireMessage::handshake("no spaces", Role::Agent, None)),
            Err(HubError::InvalidSession(_))
        ));
    }

    #[test]
    fn test_event_message_preserves_event() {
        let event = EventClock::new(EventSource::new("agent:1")).event(EventPayload::Output {
            stream: OutputStream::Stderr,
            text: "warning".into(),
            request_id: None,
        });
        let json = serde_json::to_string(&WireMessage::event(event.clone())).unwrap();
        assert!(json.contains(r#""type":"event""#));
        assert!(json.contains(r#""kind":"output""#));

        let parsed: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.into_event(), Some(event));
    }

    #[test]
    fn test_agent_commands_map_to_wire() {
        let request = EvaluationRequest::new("1 + 1");
        let id = request.request_id;
        assert_eq!(
            WireMessage::from(AgentCommand::Evaluate(request)),
            WireMessage::EvaluationRequest {
                request_id: id,
                code: "1 + 1".into()
            }
        );
        assert_eq!(
            WireMessage::from(AgentCommand::Close { reason: "bye".into() }).kind(),
            "close"
        );
        assert_eq!(
            WireMessage::from(AgentCommand::Abort { request_id: id }),
            WireMessage::Abort { request_id: id }
        );
    }

    #[test]
    fn test_event_frame_len_bounds_the_relayed_frame() {
        let payload = EventPayload::EvaluationResult {
            request_id: RequestId::new(),
            outcome: EvaluationOutcome::success("z".repeat(500)),
        };
        let source = EventSource::new("session:wb-1");
        let bound = event_frame_len(&source, &payload).unwrap();

        let mut clock = EventClock::new(source);
        for _ in 0..100 {
            let relayed = WireMessage::event(clock.event(payload.clone()));
            assert!(relayed.encoded_len().unwrap() <= bound);
        }
    }

    #[test]
    fn test_abort_wire_shape() {
        let id = RequestId::new();
        let json = serde_json::to_string(&WireMessage::Abort { request_id: id }).unwrap();
        assert_eq!(json, format!(r#"{{"type":"abort","request_id":"{id}"}}"#));
        assert_eq!(WireMessage::Abort { request_id: id }.encoded_len().unwrap(), json.len());
    }
}
