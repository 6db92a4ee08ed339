//! Session hub manager: the registry routing connections to sessions.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use tokio::{sync::RwLock, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use workbook_hub_core::{
    AllowAnyAgent, HostServices, HubError, LocalHostServices, ReattachPolicy, Role, SessionConfig,
    SessionId,
};

use crate::{
    link::{AgentLink, ClientLink},
    session::InteractiveSession,
};

/// A connection asking to join a session.
#[derive(Debug)]
pub enum Binding {
    Agent {
        link: AgentLink,
        token: Option<String>,
    },
    Client(ClientLink),
}

impl Binding {
    #[must_use]
    pub const fn role(&self) -> Role {
        match self {
            Self::Agent { .. } => Role::Agent,
            Self::Client(_) => Role::Client,
        }
    }
}

/// A session removed by [`SessionHubManager::sweep_idle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub session_id: SessionId,
    pub reason: String,
}

/// Process-wide directory of interactive sessions.
///
/// Registry mutations are serialized by a single lock; everything else is
/// delegated to the sessions themselves. The lock is always taken before a
/// session's own lock, never the other way around.
pub struct SessionHubManager {
    config: SessionConfig,
    policy: Arc<dyn ReattachPolicy>,
    host: Arc<dyn HostServices>,
    sessions: RwLock<HashMap<SessionId, Arc<InteractiveSession>>>,
    shutdown: CancellationToken,
}

impl SessionHubManager {
    /// Create a manager with the default reattach policy and host services.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            policy: Arc::new(AllowAnyAgent),
            host: Arc::new(LocalHostServices::default()),
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the policy applied to reattaching agents.
    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn ReattachPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the host services used to prepare agent directories.
    #[must_use]
    pub fn with_host_services(mut self, host: Arc<dyn HostServices>) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Cancelled once [`SessionHubManager::shutdown`] starts.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind a connection to the named session, creating it if absent.
    ///
    /// # Errors
    /// - [`HubError::InvalidSession`] if `session_id` is malformed
    /// - [`HubError::SessionConflict`] if an agent binds while another is alive
    /// - [`HubError::AgentRejected`] if the reattach policy refuses the agent
    /// - [`HubError::SessionClosed`] if the hub is shutting down
    pub async fn create_or_attach(
        &self,
        session_id: &str,
        binding: Binding,
    ) -> Result<Arc<InteractiveSession>, HubError> {
        let id = SessionId::parse(session_id)?;
        if self.shutdown.is_cancelled() {
            return Err(HubError::SessionClosed(id));
        }

        let mut sessions = self.sessions.write().await;

        let mut existing = sessions.get(&id).cloned();
        if let Some(session) = &existing {
            if session.state().await.is_closed() {
                existing = None;
            }
        }
        let session = if let Some(session) = existing {
            session
        } else {
            tracing::info!(session_id = %id, role = %binding.role(), "Creating session");
            let session = Arc::new(InteractiveSession::new(
                id.clone(),
                self.config.clone(),
                Arc::clone(&self.policy),
            ));
            sessions.insert(id, Arc::clone(&session));
            session
        };

        match binding {
            Binding::Agent { link, token } => session.attach_agent(link, token).await?,
            Binding::Client(link) => {
                session.attach_client(link).await?;
            }
        }
        Ok(session)
    }

    /// Look up a live session.
    pub async fn get(&self, session_id: &SessionId) -> Option<Arc<InteractiveSession>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close and remove a session. Idempotent: returns `false` if there was
    /// nothing to close.
    pub async fn close(&self, session_id: &SessionId, reason: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(session) => session.close(reason).await,
            None => false,
        }
    }

    /// Close and remove every session that outlived its grace period.
    pub async fn sweep_idle(&self) -> Vec<SweepReport> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;

        let mut expired = Vec::new();
        for (id, session) in sessions.iter() {
            if let Some(reason) = session.sweep(now).await {
                expired.push(SweepReport {
                    session_id: id.clone(),
                    reason,
                });
            }
        }

        for report in &expired {
            sessions.remove(&report.session_id);
            tracing::info!(
                session_id = %report.session_id,
                reason = %report.reason,
                "Swept session"
            );
        }
        expired
    }

    /// Run [`SessionHubManager::sweep_idle`] every `sweep_interval` until
    /// shutdown.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_idle().await;
                    }
                }
            }
            tracing::debug!("Session sweeper stopped");
        })
    }

    /// Close every session and refuse new ones. Returns how many were closed.
    pub async fn shutdown(&self, reason: &str) -> usize {
        self.shutdown.cancel();
        let drained: Vec<_> = self.sessions.write().await.drain().collect();

        let mut closed = 0;
        for (_, session) in drained {
            if session.close(reason).await {
                closed += 1;
            }
        }
        tracing::info!(closed, reason, "Session hub shut down");
        closed
    }

    /// Create the working directory an agent for `session_id` runs in,
    /// stripping any quarantine metadata from it.
    ///
    /// # Errors
    /// Returns [`HubError::Io`] if the directory cannot be prepared.
    pub async fn prepare_agent_directory(&self, session_id: &SessionId) -> Result<PathBuf, HubError> {
        let dir = self
            .host
            .temp_directory(&["sessions", session_id.as_str()])
            .await?;

        if let Some(info) = self.host.quarantine_info(&dir).await? {
            tracing::info!(
                session_id = %session_id,
                path = %dir.display(),
                agent = ?info.agent_name,
                "Stripping quarantine from agent directory"
            );
            self.host.strip_quarantine_info(&dir).await?;
        }
        Ok(dir)
    }
}

impl std::fmt::Debug for SessionHubManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHubManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
