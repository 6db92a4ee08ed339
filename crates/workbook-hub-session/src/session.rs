//! Interactive session state machine.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{Mutex, oneshot},
    time::Instant,
};
use workbook_hub_core::{
    ConnectionId, EvaluationOutcome, EvaluationRequest, Event, EventClock, EventPayload,
    EventSource, HubError, ReattachPolicy, RequestId, SessionConfig, SessionId, SessionState,
    Timestamp,
};

use crate::link::{AgentCommand, AgentLink, ClientLink, Delivery};

/// Resolves when the agent completes a submitted request.
///
/// Dropping it does not cancel the request: completions are broadcast to
/// every attached client regardless.
#[derive(Debug)]
pub struct Completion {
    session_id: SessionId,
    request_id: RequestId,
    rx: oneshot::Receiver<EvaluationOutcome>,
}

impl Completion {
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the outcome.
    ///
    /// # Errors
    /// Returns [`HubError::SessionClosed`] if the session closes first.
    pub async fn wait(self) -> Result<EvaluationOutcome, HubError> {
        self.rx
            .await
            .map_err(|_| HubError::SessionClosed(self.session_id))
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    pub pending_requests: usize,
    pub clients: usize,
    pub agent: Option<ConnectionId>,
}

struct PendingRequest {
    request: EvaluationRequest,
    submitted_by: Option<ConnectionId>,
    /// Handed to the agent currently bound.
    forwarded: bool,
    completion: oneshot::Sender<EvaluationOutcome>,
}

struct Inner {
    state: SessionState,
    pending: VecDeque<PendingRequest>,
    clients: HashMap<ConnectionId, ClientLink>,
    agent: Option<AgentLink>,
    /// Credential of the first agent that bound this session.
    agent_token: Option<String>,
    /// Timestamp of the last event published by the bound agent.
    agent_stamp: Option<Timestamp>,
    clock: EventClock,
    disconnected_since: Option<Instant>,
    idle_since: Option<Instant>,
}

/// Binds one agent connection to any number of client connections.
///
/// All mutation goes through a per-session lock, which also fixes the
/// order in which events reach every client.
pub struct InteractiveSession {
    id: SessionId,
    config: SessionConfig,
    policy: Arc<dyn ReattachPolicy>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for InteractiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveSession")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl InteractiveSession {
    /// Create a session awaiting its agent.
    #[must_use]
    pub fn new(id: SessionId, config: SessionConfig, policy: Arc<dyn ReattachPolicy>) -> Self {
        let clock = EventClock::new(EventSource::session(&id));
        Self {
            id,
            config,
            policy,
            inner: Mutex::new(Inner {
                state: SessionState::AwaitingAgent,
                pending: VecDeque::new(),
                clients: HashMap::new(),
                agent: None,
                agent_token: None,
                agent_stamp: None,
                clock,
                disconnected_since: None,
                idle_since: Some(Instant::now()),
            }),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            id: self.id.clone(),
            state: inner.state,
            pending_requests: inner.pending.len(),
            clients: inner.clients.len(),
            agent: inner.agent.as_ref().map(AgentLink::id),
        }
    }

    /// Ids of requests still awaiting completion, in submission order.
    pub async fn pending_request_ids(&self) -> Vec<RequestId> {
        self.inner
            .lock()
            .await
            .pending
            .iter()
            .map(|p| p.request.request_id)
            .collect()
    }

    /// Attach a client. Its first event is a snapshot of the current state.
    ///
    /// # Errors
    /// Returns [`HubError::SessionClosed`] if the session is closed.
    pub async fn attach_client(&self, link: ClientLink) -> Result<SessionState, HubError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let state = inner.state;
        let snapshot = inner.clock.event(EventPayload::StateChange {
            state,
            reason: None,
        });
        let client_id = link.id();
        if link.deliver(snapshot) == Delivery::Delivered {
            inner.clients.insert(client_id, link);
        } else {
            tracing::warn!(session_id = %self.id, connection_id = %client_id, "Client unreachable on attach");
        }
        inner.refresh_idle();

        tracing::info!(
            session_id = %self.id,
            connection_id = %client_id,
            clients = inner.clients.len(),
            "Client attached"
        );
        Ok(inner.state)
    }

    /// Detach a client. Outstanding requests it submitted are unaffected.
    pub async fn detach_client(&self, client_id: ConnectionId) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.clients.remove(&client_id).is_some();
        inner.refresh_idle();
        if removed {
            tracing::info!(session_id = %self.id, connection_id = %client_id, "Client detached");
        }
        removed
    }

    /// Bind an agent, replaying every pending request in submission order.
    ///
    /// At most `agent_buffer` requests are in flight at once; the rest
    /// follow as the agent completes earlier ones.
    ///
    /// # Errors
    /// - [`HubError::SessionClosed`] if the session is closed
    /// - [`HubError::SessionConflict`] if a live agent is already bound
    /// - [`HubError::AgentRejected`] if the reattach policy refuses the agent
    pub async fn attach_agent(&self, link: AgentLink, token: Option<String>) -> Result<(), HubError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        if let Some(existing) = &inner.agent {
            if existing.is_alive() {
                return Err(HubError::SessionConflict(self.id.clone()));
            }
            let stale = existing.id();
            self.lose_agent(&mut inner, stale, "agent connection went away");
        }

        if !self
            .policy
            .permits(&self.id, inner.agent_token.as_deref(), token.as_deref())
        {
            return Err(HubError::AgentRejected(self.id.clone()));
        }

        if inner.agent_token.is_none() {
            inner.agent_token = token;
        }

        let agent_id = link.id();
        let previous = inner.state;
        inner.agent = Some(link);
        inner.agent_stamp = None;
        inner.state = SessionState::Active;
        inner.disconnected_since = None;
        inner.refresh_idle();

        tracing::info!(
            session_id = %self.id,
            connection_id = %agent_id,
            from = %previous,
            replay = inner.pending.len(),
            "Agent attached"
        );

        let event = inner.clock.event(EventPayload::StateChange {
            state: SessionState::Active,
            reason: None,
        });
        inner.broadcast(&self.id, event);
        self.pump(&mut inner);
        Ok(())
    }

    /// Record that the agent's transport closed.
    ///
    /// Ignored unless `agent_id` is the agent currently bound.
    pub async fn agent_lost(&self, agent_id: ConnectionId, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        self.lose_agent(&mut inner, agent_id, reason)
    }

    /// Queue a request, forwarding it at once if an agent is bound and has
    /// room for it.
    ///
    /// # Errors
    /// - [`HubError::SessionClosed`] if the session is closed
    /// - [`HubError::DuplicateRequest`] if the id is already pending
    pub async fn submit(
        &self,
        client: Option<ConnectionId>,
        request: EvaluationRequest,
    ) -> Result<Completion, HubError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let request_id = request.request_id;
        if inner.position(request_id).is_some() {
            return Err(HubError::DuplicateRequest(request_id));
        }

        let (tx, rx) = oneshot::channel();
        inner.pending.push_back(PendingRequest {
            request,
            submitted_by: client,
            forwarded: false,
            completion: tx,
        });

        tracing::debug!(
            session_id = %self.id,
            request_id = %request_id,
            state = %inner.state,
            queued = inner.pending.len(),
            "Request submitted"
        );

        self.pump(&mut inner);

        Ok(Completion {
            session_id: self.id.clone(),
            request_id,
            rx,
        })
    }

    /// Complete a pending request and broadcast its result.
    ///
    /// Only the agent currently bound may complete requests. Unknown ids are
    /// stale or duplicate acknowledgments: logged and otherwise ignored.
    pub async fn complete(
        &self,
        agent_id: ConnectionId,
        request_id: RequestId,
        outcome: EvaluationOutcome,
    ) -> bool {
        let mut inner = self.inner.lock().await;

        if !inner.is_bound(agent_id) {
            tracing::warn!(
                session_id = %self.id,
                connection_id = %agent_id,
                request_id = %request_id,
                "Ignoring completion from an unbound agent"
            );
            return false;
        }
        let Some(index) = inner.position(request_id) else {
            tracing::warn!(
                session_id = %self.id,
                request_id = %request_id,
                "Ignoring completion for unknown request"
            );
            return false;
        };

        self.settle(&mut inner, index, outcome);
        true
    }

    /// Abort a pending request.
    ///
    /// A request the agent already holds is aborted by the agent, which
    /// answers with its own completion. One that never reached an agent is
    /// settled here as [`EvaluationOutcome::Interrupted`]. Returns `false`
    /// for unknown ids.
    ///
    /// # Errors
    /// Returns [`HubError::SessionClosed`] if the session is closed.
    pub async fn abort(&self, request_id: RequestId) -> Result<bool, HubError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let Some(index) = inner.position(request_id) else {
            tracing::debug!(
                session_id = %self.id,
                request_id = %request_id,
                "Abort for unknown request"
            );
            return Ok(false);
        };

        if inner.pending[index].forwarded {
            if let Some(agent) = &inner.agent {
                let agent_id = agent.id();
                match agent.deliver(AgentCommand::Abort { request_id }) {
                    Delivery::Delivered => {
                        tracing::info!(
                            session_id = %self.id,
                            connection_id = %agent_id,
                            request_id = %request_id,
                            "Abort forwarded to agent"
                        );
                        return Ok(true);
                    }
                    Delivery::Overflow => {
                        self.lose_agent(&mut inner, agent_id, "agent too slow");
                    }
                    Delivery::Gone => {
                        self.lose_agent(&mut inner, agent_id, "agent connection went away");
                    }
                }
            }
        }

        tracing::info!(
            session_id = %self.id,
            request_id = %request_id,
            "Request interrupted before evaluation"
        );
        self.settle(&mut inner, index, EvaluationOutcome::Interrupted);
        Ok(true)
    }

    /// Fan an event from the bound agent out to every attached client.
    ///
    /// Events must carry the agent's own source and must not go back in
    /// time. Events from an agent that is no longer bound, and progress
    /// reports for requests that are no longer pending, are dropped.
    ///
    /// # Errors
    /// - [`HubError::SessionClosed`] if the session is closed
    /// - [`HubError::ProtocolViolation`] for payloads only the hub may emit,
    ///   a foreign source or a timestamp regression
    pub async fn publish(&self, agent_id: ConnectionId, event: Event) -> Result<(), HubError> {
        if event.payload().is_hub_owned() {
            return Err(HubError::ProtocolViolation(format!(
                "{} events are emitted by the hub",
                event.payload().kind()
            )));
        }
        let source = EventSource::agent(agent_id);
        if *event.source() != source {
            return Err(HubError::ProtocolViolation(format!(
                "events from this connection must carry source {source}, not {}",
                event.source()
            )));
        }

        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        if !inner.is_bound(agent_id) {
            tracing::debug!(
                session_id = %self.id,
                connection_id = %agent_id,
                "Dropping event from an unbound agent"
            );
            return Ok(());
        }
        if let Some(last) = inner.agent_stamp {
            if event.timestamp() < last {
                return Err(HubError::ProtocolViolation(format!(
                    "event timestamp {} precedes {last}",
                    event.timestamp()
                )));
            }
        }
        if let EventPayload::EvaluationProgress { request_id, .. } = event.payload() {
            if inner.position(*request_id).is_none() {
                tracing::debug!(
                    session_id = %self.id,
                    request_id = %request_id,
                    "Dropping progress for settled request"
                );
                return Ok(());
            }
        }

        inner.agent_stamp = Some(event.timestamp());
        inner.broadcast(&self.id, event);
        Ok(())
    }

    /// Close the session, sending every client a terminal event.
    ///
    /// Returns `false` if it was already closed.
    pub async fn close(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock().await;
        self.close_locked(&mut inner, reason)
    }

    /// Close the session if it has outlived its grace period.
    ///
    /// Returns the reason when the session is (now) closed.
    pub async fn sweep(&self, now: Instant) -> Option<String> {
        let grace = self.config.grace_period();
        let mut inner = self.inner.lock().await;

        let reason = match inner.state {
            SessionState::Closed => return Some("closed".to_string()),
            SessionState::AgentDisconnected
                if elapsed(inner.disconnected_since, now) >= Some(grace) =>
            {
                "agent did not reconnect within the grace period"
            }
            _ if elapsed(inner.idle_since, now) >= Some(grace) => "idle",
            _ => return None,
        };

        self.close_locked(&mut inner, reason);
        Some(reason.to_string())
    }

    fn ensure_open(&self, inner: &Inner) -> Result<(), HubError> {
        if inner.state.is_closed() {
            Err(HubError::SessionClosed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Hand queued requests to the bound agent, oldest first, keeping at
    /// most `agent_buffer` of them in flight.
    ///
    /// A full link is not an error here: the remaining requests stay queued
    /// until the next completion or submission makes room.
    fn pump(&self, inner: &mut Inner) {
        let Some(agent) = &inner.agent else {
            return;
        };
        let agent_id = agent.id();
        let window = self.config.agent_buffer.max(1);
        let mut in_flight = inner.pending.iter().filter(|p| p.forwarded).count();
        let mut gone = false;

        for pending in inner.pending.iter_mut().filter(|p| !p.forwarded) {
            if in_flight >= window {
                break;
            }
            match agent.deliver(AgentCommand::Evaluate(pending.request.clone())) {
                Delivery::Delivered => {
                    pending.forwarded = true;
                    in_flight += 1;
                }
                Delivery::Overflow => break,
                Delivery::Gone => {
                    gone = true;
                    break;
                }
            }
        }

        if gone {
            self.lose_agent(inner, agent_id, "agent connection went away");
        }
    }

    /// Remove the request at `index`, resolve it and broadcast the result.
    fn settle(&self, inner: &mut Inner, index: usize, outcome: EvaluationOutcome) {
        let Some(pending) = inner.pending.remove(index) else {
            return;
        };
        let request_id = pending.request.request_id;
        tracing::debug!(
            session_id = %self.id,
            request_id = %request_id,
            submitted_by = ?pending.submitted_by,
            success = outcome.is_success(),
            "Request completed"
        );

        let _ = pending.completion.send(outcome.clone());
        let event = inner
            .clock
            .event(EventPayload::EvaluationResult { request_id, outcome });
        inner.broadcast(&self.id, event);
        self.pump(inner);
    }

    fn lose_agent(&self, inner: &mut Inner, agent_id: ConnectionId, reason: &str) -> bool {
        if !inner.is_bound(agent_id) {
            return false;
        }
        if let Some(agent) = inner.agent.take() {
            agent.disconnect();
        }
        // The next agent gets the whole queue again.
        for pending in &mut inner.pending {
            pending.forwarded = false;
        }
        if inner.state.is_closed() {
            return true;
        }

        inner.state = SessionState::AgentDisconnected;
        inner.disconnected_since = Some(Instant::now());
        inner.refresh_idle();

        tracing::warn!(
            session_id = %self.id,
            connection_id = %agent_id,
            reason,
            pending = inner.pending.len(),
            "Agent disconnected"
        );

        let event = inner.clock.event(EventPayload::StateChange {
            state: SessionState::AgentDisconnected,
            reason: Some(reason.to_string()),
        });
        inner.broadcast(&self.id, event);
        true
    }

    fn close_locked(&self, inner: &mut Inner, reason: &str) -> bool {
        if inner.state.is_closed() {
            return false;
        }
        inner.state = SessionState::Closed;

        let event = inner.clock.event(EventPayload::StateChange {
            state: SessionState::Closed,
            reason: Some(reason.to_string()),
        });
        inner.broadcast(&self.id, event);

        // Dropping the links lets each client drain the terminal event.
        inner.clients.clear();
        if let Some(agent) = inner.agent.take() {
            let _ = agent.deliver(AgentCommand::Close {
                reason: reason.to_string(),
            });
        }
        let abandoned = inner.pending.len();
        inner.pending.clear();
        inner.disconnected_since = None;
        inner.idle_since = None;

        tracing::info!(session_id = %self.id, reason, abandoned, "Session closed");
        true
    }
}

impl Inner {
    fn is_bound(&self, agent_id: ConnectionId) -> bool {
        self.agent.as_ref().map(AgentLink::id) == Some(agent_id)
    }

    fn position(&self, request_id: RequestId) -> Option<usize> {
        self.pending
            .iter()
            .position(|p| p.request.request_id == request_id)
    }

    /// Deliver to every client without waiting on any of them.
    fn broadcast(&mut self, session_id: &SessionId, event: Event) {
        let mut dropped = Vec::new();
        for (id, client) in &self.clients {
            match client.deliver(event.clone()) {
                Delivery::Delivered => {}
                Delivery::Overflow => {
                    tracing::warn!(
                        session_id = %session_id,
                        connection_id = %id,
                        "Client buffer full, disconnecting client"
                    );
                    client.disconnect();
                    dropped.push(*id);
                }
                Delivery::Gone => dropped.push(*id),
            }
        }
        for id in dropped {
            self.clients.remove(&id);
        }
        self.refresh_idle();
    }

    fn refresh_idle(&mut self) {
        let unattended = self.agent.is_none() && self.clients.is_empty();
        match (unattended, self.idle_since) {
            (true, None) if !self.state.is_closed() => self.idle_since = Some(Instant::now()),
            (false, Some(_)) => self.idle_since = None,
            _ => {}
        }
    }
}

fn elapsed(since: Option<Instant>, now: Instant) -> Option<Duration> {
    since.map(|t| now.saturating_duration_since(t))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use workbook_hub_core::{AllowAnyAgent, EvaluationPhase, OutputStream, RequireMatchingToken};

    use super::*;
    use crate::link::{EventStream, Inbox};

    fn config() -> SessionConfig {
        SessionConfig {
            grace_period_ms: 1_000,
            client_buffer: 16,
            agent_buffer: 16,
            ..SessionConfig::default()
        }
    }

    fn session() -> InteractiveSession {
        session_with(config())
    }

    fn session_with(config: SessionConfig) -> InteractiveSession {
        InteractiveSession::new(SessionId::parse("test").unwrap(), config, Arc::new(AllowAnyAgent))
    }

    async fn client(session: &InteractiveSession) -> (ConnectionId, EventStream) {
        let id = ConnectionId::new();
        let (link, inbox) = ClientLink::channel(id, 16);
        session.attach_client(link).await.unwrap();
        (id, inbox)
    }

    async fn agent(session: &InteractiveSession) -> (ConnectionId, Inbox<AgentCommand>) {
        let id = ConnectionId::new();
        let (link, inbox) = AgentLink::channel(id, 16);
        session.attach_agent(link, None).await.unwrap();
        (id, inbox)
    }

    fn output(clock: &mut EventClock, text: &str) -> Event {
        clock.event(EventPayload::Output {
            stream: OutputStream::Stdout,
            text: text.to_string(),
            request_id: None,
        })
    }

    fn drain(inbox: &mut EventStream) -> Vec<EventPayload> {
        std::iter::from_fn(|| inbox.try_recv().map(Event::into_payload)).collect()
    }

    fn state_change(state: SessionState) -> impl Fn(&EventPayload) -> bool {
        move |p| matches!(p, EventPayload::StateChange { state: s, .. } if *s == state)
    }

    fn evaluations(inbox: &mut Inbox<AgentCommand>) -> Vec<RequestId> {
        std::iter::from_fn(|| inbox.try_recv())
            .filter_map(|cmd| match cmd {
                AgentCommand::Evaluate(req) => Some(req.request_id),
                _ => None,
            })
            .collect()
    }

    fn result_for(payloads: &[EventPayload], id: RequestId) -> Option<&EvaluationOutcome> {
        payloads.iter().find_map(|p| match p {
            EventPayload::EvaluationResult { request_id, outcome } if *request_id == id => {
                Some(outcome)
            }
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_request_waits_for_agent_then_completes() {
        let session = session();
        let (_, mut events) = client(&session).await;

        let request = EvaluationRequest::new("6 * 7");
        let request_id = request.request_id;
        let completion = session.submit(None, request).await.unwrap();
        assert_eq!(session.state().await, SessionState::AwaitingAgent);
        assert_eq!(session.pending_request_ids().await, vec![request_id]);

        let (agent_id, mut agent_inbox) = agent(&session).await;
        assert_eq!(session.state().await, SessionState::Active);
        assert_eq!(evaluations(&mut agent_inbox), vec![request_id]);

        assert!(
            session
                .complete(agent_id, request_id, EvaluationOutcome::success("42"))
                .await
        );
        assert_eq!(completion.wait().await.unwrap(), EvaluationOutcome::success("42"));

        let payloads = drain(&mut events);
        assert_eq!(
            result_for(&payloads, request_id),
            Some(&EvaluationOutcome::success("42"))
        );
        assert!(session.pending_request_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_attach_snapshot_reports_current_state() {
        let session = session();
        let (_, _agent_inbox) = agent(&session).await;

        let (link, mut inbox) = ClientLink::channel(ConnectionId::new(), 4);
        assert_eq!(session.attach_client(link).await.unwrap(), SessionState::Active);
        assert_eq!(drain(&mut inbox), vec![EventPayload::StateChange {
            state: SessionState::Active,
            reason: None,
        }]);
    }

    #[tokio::test]
    async fn test_completions_match_by_id_when_agent_reorders() {
        let session = session();
        let (agent_id, _agent_inbox) = agent(&session).await;

        let requests: Vec<_> = (0..3).map(|i| EvaluationRequest::new(format!("{i}"))).collect();
        let mut completions = Vec::new();
        for request in &requests {
            completions.push(session.submit(None, request.clone()).await.unwrap());
        }

        for i in [2, 0, 1] {
            let id = requests[i].request_id;
            let outcome = EvaluationOutcome::success(format!("r{i}"));
            assert!(session.complete(agent_id, id, outcome).await);
        }

        for (i, completion) in completions.into_iter().enumerate() {
            assert_eq!(completion.request_id(), requests[i].request_id);
            assert_eq!(
                completion.wait().await.unwrap(),
                EvaluationOutcome::success(format!("r{i}"))
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_completion_is_ignored() {
        let session = session();
        let (_, mut events) = client(&session).await;
        let (agent_id, _agent_inbox) = agent(&session).await;
        let _ = drain(&mut events);

        let outcome = EvaluationOutcome::success("x");
        assert!(!session.complete(agent_id, RequestId::new(), outcome).await);
        assert!(drain(&mut events).is_empty());
        assert_eq!(session.state().await, SessionState::Active);
    }

    #[tokio::test]
    async fn test_superseded_agent_cannot_complete() {
        let session = session();
        let (first, _first_inbox) = agent(&session).await;
        let request = EvaluationRequest::new("slow()");
        let id = request.request_id;
        let completion = session.submit(None, request).await.unwrap();

        session.agent_lost(first, "transport closed").await;
        let (second, mut second_inbox) = agent(&session).await;
        assert_eq!(evaluations(&mut second_inbox), vec![id]);

        assert!(!session.complete(first, id, EvaluationOutcome::success("stale")).await);
        assert_eq!(session.pending_request_ids().await, vec![id]);

        assert!(session.complete(second, id, EvaluationOutcome::success("fresh")).await);
        assert_eq!(completion.wait().await.unwrap(), EvaluationOutcome::success("fresh"));
    }

    #[tokio::test]
    async fn test_duplicate_request_is_rejected() {
        let session = session();
        let request = EvaluationRequest::new("1");
        session.submit(None, request.clone()).await.unwrap();
        let err = session.submit(None, request).await.unwrap_err();
        assert!(matches!(err, HubError::DuplicateRequest(_)));
    }

    #[tokio::test]
    async fn test_clients_observe_identical_order() {
        let session = session();
        let (_, mut fast) = client(&session).await;
        let (_, mut slow) = client(&session).await;
        let (agent_id, _agent_inbox) = agent(&session).await;
        let mut clock = EventClock::new(EventSource::agent(agent_id));

        for text in ["e1", "e2", "e3"] {
            session.publish(agent_id, output(&mut clock, text)).await.unwrap();
        }

        let fast_events = drain(&mut fast);
        let slow_events = drain(&mut slow);
        assert_eq!(fast_events, slow_events);

        let texts: Vec<_> = fast_events
            .iter()
            .filter_map(|p| match p {
                EventPayload::Output { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn test_slow_client_is_disconnected_without_blocking_others() {
        let session = session();
        let (agent_id, _agent_inbox) = agent(&session).await;
        let mut clock = EventClock::new(EventSource::agent(agent_id));
        let (_, mut healthy) = client(&session).await;

        let slow_id = ConnectionId::new();
        let (slow_link, slow_inbox) = ClientLink::channel(slow_id, 2);
        session.attach_client(slow_link).await.unwrap();

        for i in 0..8 {
            let event = output(&mut clock, &i.to_string());
            session.publish(agent_id, event).await.unwrap();
            // keep the healthy client's buffer from filling
            let _ = drain(&mut healthy);
        }

        assert!(slow_inbox.is_disconnected());
        assert_eq!(session.snapshot().await.clients, 1);
        assert!(!session.detach_client(slow_id).await);
    }

    #[tokio::test]
    async fn test_reattach_replays_only_pending_in_order() {
        let session = session();
        let (agent_id, mut first) = agent(&session).await;

        let r1 = EvaluationRequest::new("1");
        let r2 = EvaluationRequest::new("2");
        let r3 = EvaluationRequest::new("3");
        for r in [&r1, &r2, &r3] {
            session.submit(None, r.clone()).await.unwrap();
        }
        assert_eq!(evaluations(&mut first).len(), 3);
        let done = EvaluationOutcome::success("2");
        assert!(session.complete(agent_id, r2.request_id, done).await);

        assert!(session.agent_lost(agent_id, "transport closed").await);
        assert_eq!(session.state().await, SessionState::AgentDisconnected);

        let r4 = EvaluationRequest::new("4");
        session.submit(None, r4.clone()).await.unwrap();

        let (_, mut second) = agent(&session).await;
        assert_eq!(
            evaluations(&mut second),
            vec![r1.request_id, r3.request_id, r4.request_id]
        );
    }

    #[tokio::test]
    async fn test_backlog_larger_than_agent_buffer_still_reattaches() {
        let session = session_with(SessionConfig {
            agent_buffer: 2,
            ..config()
        });
        let mut ids = Vec::new();
        for i in 0..3 {
            let request = EvaluationRequest::new(format!("{i}"));
            ids.push(request.request_id);
            session.submit(None, request).await.unwrap();
        }

        let agent_id = ConnectionId::new();
        let (link, mut inbox) = AgentLink::channel(agent_id, 2);
        session.attach_agent(link, None).await.unwrap();

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.agent, Some(agent_id));
        assert_eq!(evaluations(&mut inbox), ids[..2].to_vec());

        let done = EvaluationOutcome::success("0");
        assert!(session.complete(agent_id, ids[0], done).await);
        assert_eq!(evaluations(&mut inbox), ids[2..].to_vec());
        assert_eq!(session.state().await, SessionState::Active);
    }

    #[tokio::test]
    async fn test_full_agent_link_holds_requests_back() {
        let session = session();
        let agent_id = ConnectionId::new();
        let (link, mut inbox) = AgentLink::channel(agent_id, 1);
        session.attach_agent(link, None).await.unwrap();

        let a = EvaluationRequest::new("a");
        let b = EvaluationRequest::new("b");
        session.submit(None, a.clone()).await.unwrap();
        session.submit(None, b.clone()).await.unwrap();

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.state, SessionState::Active);
        assert_eq!(snapshot.pending_requests, 2);
        assert_eq!(snapshot.agent, Some(agent_id));
        assert_eq!(evaluations(&mut inbox), vec![a.request_id]);

        // Draining the link makes room; the next submission carries `b` along.
        let c = EvaluationRequest::new("c");
        session.submit(None, c).await.unwrap();
        assert_eq!(evaluations(&mut inbox), vec![b.request_id]);
    }

    #[tokio::test]
    async fn test_second_live_agent_conflicts() {
        let session = session();
        let (_agent_id, _inbox) = agent(&session).await;

        let (link, _other) = AgentLink::channel(ConnectionId::new(), 4);
        let err = session.attach_agent(link, None).await.unwrap_err();
        assert!(matches!(err, HubError::SessionConflict(_)));
    }

    #[tokio::test]
    async fn test_dead_agent_is_superseded() {
        let session = session();
        let (_, inbox) = agent(&session).await;
        drop(inbox);

        let (link, _inbox) = AgentLink::channel(ConnectionId::new(), 4);
        session.attach_agent(link, None).await.unwrap();
        assert_eq!(session.state().await, SessionState::Active);
    }

    #[tokio::test]
    async fn test_reattach_policy_is_consulted() {
        let session = InteractiveSession::new(
            SessionId::parse("guarded").unwrap(),
            config(),
            Arc::new(RequireMatchingToken),
        );
        let first_id = ConnectionId::new();
        let (link, _inbox) = AgentLink::channel(first_id, 4);
        session.attach_agent(link, Some("secret".into())).await.unwrap();
        session.agent_lost(first_id, "dropped").await;

        let (impostor, _i) = AgentLink::channel(ConnectionId::new(), 4);
        let err = session.attach_agent(impostor, Some("guess".into())).await.unwrap_err();
        assert!(matches!(err, HubError::AgentRejected(_)));
        assert_eq!(session.state().await, SessionState::AgentDisconnected);

        let (genuine, _g) = AgentLink::channel(ConnectionId::new(), 4);
        session.attach_agent(genuine, Some("secret".into())).await.unwrap();
        assert_eq!(session.state().await, SessionState::Active);
    }

    #[tokio::test]
    async fn test_hub_owned_payloads_cannot_be_published() {
        let session = session();
        let (agent_id, _inbox) = agent(&session).await;
        let forged = EventClock::new(EventSource::agent(agent_id)).event(EventPayload::StateChange {
            state: SessionState::Closed,
            reason: None,
        });
        let err = session.publish(agent_id, forged).await.unwrap_err();
        assert!(matches!(err, HubError::ProtocolViolation(_)));
        assert_eq!(session.state().await, SessionState::Active);
    }

    #[tokio::test]
    async fn test_events_must_carry_the_agents_source() {
        let session = session();
        let (_, mut events) = client(&session).await;
        let (agent_id, _inbox) = agent(&session).await;
        let _ = drain(&mut events);

        let mut spoofed = EventClock::new(EventSource::session(session.id()));
        let err = session
            .publish(agent_id, output(&mut spoofed, "from the hub, honest"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ProtocolViolation(_)));
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_event_timestamps_may_not_regress() {
        let session = session();
        let (_, mut events) = client(&session).await;
        let (agent_id, _inbox) = agent(&session).await;
        let _ = drain(&mut events);

        let source = EventSource::agent(agent_id);
        let later = output(&mut EventClock::new(source.clone()), "later");
        let earlier = Event::new(
            source,
            later.timestamp() - TimeDelta::seconds(1),
            later.payload().clone(),
        );

        session.publish(agent_id, later.clone()).await.unwrap();
        session.publish(agent_id, later).await.unwrap();
        let err = session.publish(agent_id, earlier).await.unwrap_err();
        assert!(matches!(err, HubError::ProtocolViolation(_)));
        assert_eq!(drain(&mut events).len(), 2);
    }

    #[tokio::test]
    async fn test_events_from_unbound_agent_are_dropped() {
        let session = session();
        let (_, mut events) = client(&session).await;
        let (first, _first_inbox) = agent(&session).await;
        session.agent_lost(first, "transport closed").await;
        let _ = drain(&mut events);

        let mut clock = EventClock::new(EventSource::agent(first));
        session.publish(first, output(&mut clock, "late")).await.unwrap();
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_progress_reaches_clients_while_request_is_pending() {
        let session = session();
        let (_, mut events) = client(&session).await;
        let (agent_id, _inbox) = agent(&session).await;
        let mut clock = EventClock::new(EventSource::agent(agent_id));
        let request = EvaluationRequest::new("Thread.Sleep(1000)");
        let id = request.request_id;
        session.submit(None, request).await.unwrap();
        let _ = drain(&mut events);

        let progress = |phase| EventPayload::EvaluationProgress {
            request_id: id,
            phase,
        };
        let compiled = clock.event(progress(EvaluationPhase::Compiled));
        session.publish(agent_id, compiled).await.unwrap();
        session
            .complete(agent_id, id, EvaluationOutcome::success("()"))
            .await;
        let stale = clock.event(progress(EvaluationPhase::Represented));
        session.publish(agent_id, stale).await.unwrap();

        let payloads = drain(&mut events);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], progress(EvaluationPhase::Compiled));
        assert_eq!(payloads[1].kind(), "evaluation_result");
    }

    #[tokio::test]
    async fn test_abort_is_forwarded_for_requests_the_agent_holds() {
        let session = session();
        let (agent_id, mut agent_inbox) = agent(&session).await;
        let request = EvaluationRequest::new("while (true) {}");
        let id = request.request_id;
        let completion = session.submit(None, request).await.unwrap();
        assert_eq!(evaluations(&mut agent_inbox), vec![id]);

        assert!(session.abort(id).await.unwrap());
        assert_eq!(
            agent_inbox.try_recv(),
            Some(AgentCommand::Abort { request_id: id })
        );
        assert_eq!(session.pending_request_ids().await, vec![id]);

        session
            .complete(agent_id, id, EvaluationOutcome::Interrupted)
            .await;
        assert_eq!(completion.wait().await.unwrap(), EvaluationOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_abort_settles_requests_no_agent_has_seen() {
        let session = session();
        let (_, mut events) = client(&session).await;
        let request = EvaluationRequest::new("queued()");
        let id = request.request_id;
        let completion = session.submit(None, request).await.unwrap();

        assert!(session.abort(id).await.unwrap());
        assert_eq!(completion.wait().await.unwrap(), EvaluationOutcome::Interrupted);
        assert_eq!(
            result_for(&drain(&mut events), id),
            Some(&EvaluationOutcome::Interrupted)
        );

        // A later agent never sees it.
        let (_, mut agent_inbox) = agent(&session).await;
        assert!(evaluations(&mut agent_inbox).is_empty());
        assert!(!session.abort(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_abort_on_closed_session_fails() {
        let session = session();
        session.close("done").await;
        assert!(matches!(
            session.abort(RequestId::new()).await,
            Err(HubError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let session = session();
        let (_, mut events) = client(&session).await;
        let (_, mut agent_inbox) = agent(&session).await;
        let completion = session.submit(None, EvaluationRequest::new("x")).await.unwrap();

        assert!(session.close("user request").await);
        assert!(!session.close("again").await);

        let payloads = drain(&mut events);
        assert_eq!(payloads.iter().filter(|p| p.is_terminal()).count(), 1);
        assert!(payloads.last().unwrap().is_terminal());
        assert!(events.recv().await.is_none());

        let commands: Vec<_> = std::iter::from_fn(|| agent_inbox.try_recv()).collect();
        assert!(matches!(commands.last(), Some(AgentCommand::Close { .. })));

        assert!(matches!(completion.wait().await, Err(HubError::SessionClosed(_))));
        let err = session.submit(None, EvaluationRequest::new("y")).await.unwrap_err();
        assert!(matches!(err, HubError::SessionClosed(_)));
        let (link, _inbox) = ClientLink::channel(ConnectionId::new(), 4);
        assert!(matches!(
            session.attach_client(link).await,
            Err(HubError::SessionClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_disconnect_grace_period() {
        let session = session();
        let (_, mut events) = client(&session).await;
        let (agent_id, _inbox) = agent(&session).await;

        session.agent_lost(agent_id, "transport closed").await;
        assert!(session.submit(None, EvaluationRequest::new("queued")).await.is_ok());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(session.sweep(Instant::now()).await.is_none());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(session.sweep(Instant::now()).await.is_some());
        assert_eq!(session.state().await, SessionState::Closed);

        let payloads = drain(&mut events);
        assert!(payloads.iter().any(state_change(SessionState::AgentDisconnected)));
        assert!(payloads.last().unwrap().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unattended_session_goes_idle() {
        let session = session();
        let (client_id, _events) = client(&session).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(session.sweep(Instant::now()).await.is_none());

        session.detach_client(client_id).await;
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(session.sweep(Instant::now()).await.is_none());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(session.sweep(Instant::now()).await.as_deref(), Some("idle"));
    }

    #[tokio::test]
    async fn test_detach_keeps_requests_alive() {
        let session = session();
        let (client_id, _events) = client(&session).await;
        let (agent_id, _agent_inbox) = agent(&session).await;

        let request = EvaluationRequest::new("long");
        let id = request.request_id;
        let completion = session.submit(Some(client_id), request).await.unwrap();
        session.detach_client(client_id).await;

        let (_, mut rejoined) = client(&session).await;
        let outcome = EvaluationOutcome::failure("boom");
        assert!(session.complete(agent_id, id, outcome.clone()).await);
        assert_eq!(completion.wait().await.unwrap(), outcome);
        assert_eq!(result_for(&drain(&mut rejoined), id), Some(&outcome));
    }
}
