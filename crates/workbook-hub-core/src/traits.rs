//! Capability traits injected into the hub.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{SessionId, event::Timestamp};

/// Quarantine metadata attached to a downloaded file.
///
/// Presence alone means the file is quarantined; the remaining fields help
/// a user decide whether to trust it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineInfo {
    /// The quarantined file.
    pub path: PathBuf,
    /// When the file was quarantined.
    pub timestamp: Option<Timestamp>,
    /// Application that quarantined the file.
    pub agent_name: Option<String>,
    /// Where the file was downloaded from.
    pub origin_url: Option<String>,
}

/// Host file-system services needed when preparing an agent.
///
/// Quarantine operations are best-effort: platforms without the concept
/// report nothing and strip nothing.
#[async_trait]
pub trait HostServices: Send + Sync {
    /// Return (creating if absent) a temp directory nested under the given
    /// subdirectories. Idempotent.
    async fn temp_directory(&self, subdirectories: &[&str]) -> std::io::Result<PathBuf>;

    /// Read quarantine metadata for `path`, if any.
    async fn quarantine_info(&self, path: &Path) -> std::io::Result<Option<QuarantineInfo>>;

    /// Remove quarantine metadata from `path`.
    async fn strip_quarantine_info(&self, path: &Path) -> std::io::Result<()>;
}

/// Decides whether an agent may (re)bind to a session.
///
/// `bound` is the credential presented by the first agent that bound the
/// session, `presented` the one offered now.
pub trait ReattachPolicy: Send + Sync {
    fn permits(&self, session: &SessionId, bound: Option<&str>, presented: Option<&str>) -> bool;
}

/// Any agent naming the session may reattach.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAnyAgent;

impl ReattachPolicy for AllowAnyAgent {
    fn permits(&self, _session: &SessionId, _bound: Option<&str>, _presented: Option<&str>) -> bool {
        true
    }
}

/// A reattaching agent must present the token the original agent bound with.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequireMatchingToken;

impl ReattachPolicy for RequireMatchingToken {
    fn permits(&self, session: &SessionId, bound: Option<&str>, presented: Option<&str>) -> bool {
        let permitted = bound.is_none_or(|expected| presented == Some(expected));
        if !permitted {
            tracing::warn!(session_id = %session, "Agent token mismatch on reattach");
        }
        permitted
    }
}
