//! Session lifecycle states and connection roles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an interactive session.
///
/// ```text
/// AwaitingAgent --agent attaches--> Active
/// Active --agent lost--> AgentDisconnected --agent reattaches--> Active
/// AgentDisconnected --grace period elapses--> Closed
/// any --close--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no agent has attached yet.
    AwaitingAgent,
    /// Agent bound; requests are forwarded as they arrive.
    Active,
    /// Agent link lost; clients retained, requests queue.
    AgentDisconnected,
    /// Terminal.
    Closed,
}

impl SessionState {
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingAgent => "awaiting_agent",
            Self::Active => "active",
            Self::AgentDisconnected => "agent_disconnected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role declared by a connection during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Agent => "agent",
            Self::Client => "client",
        })
    }
}
