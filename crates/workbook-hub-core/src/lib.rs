//! Core types for the interactive workbook session hub.
//!
//! This crate provides the vocabulary shared by sessions and transports:
//! - `SessionId`, `ConnectionId`, `RequestId` - identifiers
//! - `Event` / `EventPayload` - the closed event model, with `EventClock`
//! - `EvaluationRequest` / `EvaluationOutcome`
//! - `HubError` - error taxonomy
//! - `HubConfig` - configuration
//! - `HostServices` and `ReattachPolicy` capability traits

pub mod config;
pub mod error;
pub mod evaluation;
pub mod event;
pub mod host;
pub mod ids;
pub mod state;
pub mod traits;

pub use config::{ConfigError, HubConfig, SessionConfig, TransportConfig};
pub use error::{ErrorCode, HubError};
pub use evaluation::{EvaluationOutcome, EvaluationPhase, EvaluationRequest};
pub use event::{Event, EventClock, EventPayload, EventSource, OutputStream, Severity, Timestamp};
pub use host::{LocalHostServices, NoopHostServices};
pub use ids::{ConnectionId, RequestId, SessionId};
pub use state::{Role, SessionState};
pub use traits::{AllowAnyAgent, HostServices, QuarantineInfo, ReattachPolicy, RequireMatchingToken};
