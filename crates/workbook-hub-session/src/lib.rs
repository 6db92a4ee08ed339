//! Interactive sessions and the session hub registry.
//!
//! Provides:
//! - `InteractiveSession` - per-session state machine and evaluation queue
//! - `SessionHubManager` - routes agent and client connections to sessions
//! - `Link` / `Inbox` - bounded outbound channels to connections

pub mod link;
pub mod manager;
pub mod session;

pub use link::{AgentCommand, AgentLink, ClientLink, EventStream, Inbox, Link};
pub use manager::{Binding, SessionHubManager, SweepReport};
pub use session::{Completion, InteractiveSession, SessionSnapshot};
