//! Error taxonomy shared by the session hub and its transports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{RequestId, SessionId};

/// Hub error.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid session identifier: {0:?}")]
    InvalidSession(String),
    #[error("Session {0} already has a live agent")]
    SessionConflict(SessionId),
    #[error("Unsupported protocol version {requested} (supported: {supported})")]
    UnsupportedProtocol { requested: u32, supported: u32 },
    #[error("Session closed: {0}")]
    SessionClosed(SessionId),
    #[error("Agent rejected by reattach policy for session {0}")]
    AgentRejected(SessionId),
    #[error("Request {0} is already pending")]
    DuplicateRequest(RequestId),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Wire code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidSession(_) => ErrorCode::InvalidSession,
            Self::SessionConflict(_) => ErrorCode::SessionConflict,
            Self::UnsupportedProtocol { .. } => ErrorCode::UnsupportedProtocol,
            Self::SessionClosed(_) => ErrorCode::SessionClosed,
            Self::AgentRejected(_) => ErrorCode::AgentRejected,
            Self::DuplicateRequest(_) => ErrorCode::DuplicateRequest,
            Self::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            Self::Io(_) => ErrorCode::Internal,
        }
    }

    /// Whether repeating the same operation unchanged could succeed.
    ///
    /// Transport failures are absorbed as disconnects and never surface here,
    /// so only raw I/O errors are worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Error codes carried in `error` wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidSession,
    SessionConflict,
    UnsupportedProtocol,
    SessionClosed,
    AgentRejected,
    DuplicateRequest,
    ProtocolViolation,
    Internal,
}
