//! Per-connection driver: handshake, binding and the read/write loops.
//!
//! Every transport (TCP, Unix socket, WebSocket) is reduced to a
//! `Stream + Sink` of [`WireMessage`]s and handed to [`serve_connection`].

use std::{fmt, sync::Arc};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, timeout},
};
use workbook_hub_core::{
    ConnectionId, ErrorCode, EvaluationOutcome, EvaluationRequest, Event, EventPayload,
    EventSource, HubError, Role, TransportConfig,
};
use workbook_hub_session::{
    AgentLink, Binding, ClientLink, Inbox, InteractiveSession, SessionHubManager,
};

use crate::{
    codec::CodecError,
    protocol::{Handshake, WireMessage, event_frame_len},
};

const CONTROL_BUFFER: usize = 8;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Peer closed the transport.
    Eof,
    HandshakeTimeout,
    /// Handshake or binding refused.
    Rejected(ErrorCode),
    HeartbeatTimeout,
    /// Client sent `detach`, or agent sent `detach`.
    Detached,
    /// The session closed and the outbound queue was drained.
    SessionEnded,
    /// The session dropped this connection, e.g. because its buffer overflowed.
    Evicted,
    WriteTimeout,
    ProtocolViolation(String),
    Transport(String),
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("connection closed by peer"),
            Self::HandshakeTimeout => f.write_str("handshake timed out"),
            Self::Rejected(code) => write!(f, "rejected ({code:?})"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timed out"),
            Self::Detached => f.write_str("detached"),
            Self::SessionEnded => f.write_str("session ended"),
            Self::Evicted => f.write_str("evicted by session"),
            Self::WriteTimeout => f.write_str("write timed out"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

/// What the reader does after handling one message.
enum Flow {
    Continue,
    Stop(Disconnect),
}

/// Drive one connection until it ends.
///
/// The first message must be a valid handshake, received within the
/// configured handshake timeout. The connection is then bound to its
/// session and serviced until either side ends it.
pub async fn serve_connection<T>(
    transport: T,
    hub: Arc<SessionHubManager>,
    config: TransportConfig,
) -> Disconnect
where
    T: Stream<Item = Result<WireMessage, CodecError>>
        + Sink<WireMessage, Error = CodecError>
        + Send
        + 'static,
{
    let (mut sink, mut stream) = transport.split();

    let first = match timeout(config.handshake_timeout(), stream.next()).await {
        Err(_) => {
            let err = HubError::ProtocolViolation("handshake timed out".into());
            reject(&mut sink, &err, &config).await;
            return Disconnect::HandshakeTimeout;
        }
        Ok(None) => return Disconnect::Eof,
        Ok(Some(Err(e))) if e.is_protocol_violation() => {
            let err = HubError::ProtocolViolation(e.to_string());
            reject(&mut sink, &err, &config).await;
            return Disconnect::ProtocolViolation(e.to_string());
        }
        Ok(Some(Err(e))) => return Disconnect::Transport(e.to_string()),
        Ok(Some(Ok(message))) => message,
    };

    let handshake = match Handshake::validate(first) {
        Ok(handshake) => handshake,
        Err(err) => {
            tracing::warn!(error = %err, "Rejecting handshake");
            reject(&mut sink, &err, &config).await;
            return Disconnect::Rejected(err.code());
        }
    };

    let id = ConnectionId::new();
    match handshake.role {
        Role::Client => {
            let (link, inbox) = ClientLink::channel(id, hub.config().client_buffer);
            let bound = hub
                .create_or_attach(handshake.session_id.as_str(), Binding::Client(link))
                .await;
            run(bound, inbox, sink, stream, hub, config, id, &handshake).await
        }
        Role::Agent => {
            // Evaluate commands never exceed `agent_buffer`; the rest is room
            // for aborts and the close notice.
            let capacity = hub.config().agent_buffer.saturating_mul(2);
            let (link, inbox) = AgentLink::channel(id, capacity);
            let binding = Binding::Agent {
                link,
                token: handshake.token.clone(),
            };
            let bound = hub
                .create_or_attach(handshake.session_id.as_str(), binding)
                .await;
            run(bound, inbox, sink, stream, hub, config, id, &handshake).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run<M, W, R>(
    bound: Result<Arc<InteractiveSession>, HubError>,
    inbox: Inbox<M>,
    mut sink: W,
    stream: R,
    hub: Arc<SessionHubManager>,
    config: TransportConfig,
    id: ConnectionId,
    handshake: &Handshake,
) -> Disconnect
where
    M: Send + 'static,
    WireMessage: From<M>,
    W: Sink<WireMessage, Error = CodecError> + Send + Unpin + 'static,
    R: Stream<Item = Result<WireMessage, CodecError>> + Unpin,
{
    let session = match bound {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(
                session_id = %handshake.session_id,
                role = %handshake.role,
                error = %err,
                "Binding refused"
            );
            reject(&mut sink, &err, &config).await;
            return Disconnect::Rejected(err.code());
        }
    };

    let accepted = WireMessage::HandshakeAccepted {
        session_id: session.id().clone(),
        connection_id: id,
        state: session.state().await,
    };
    if let Err(reason) = write(&mut sink, accepted, &config).await {
        let mut connection = Connection::new(id, handshake, session, hub, &config, None);
        connection.finish(&reason).await;
        return reason;
    }

    tracing::info!(
        session_id = %session.id(),
        connection_id = %id,
        role = %handshake.role,
        protocol_version = handshake.protocol_version,
        "Connection bound"
    );

    let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
    let mut writer = tokio::spawn(write_loop(sink, inbox, control_rx, config.clone()));
    let mut connection = Connection::new(id, handshake, session, hub, &config, Some(control_tx));

    let reason = connection.read_loop(stream, &mut writer, &config).await;
    connection.finish(&reason).await;

    // Let the writer flush a pending error or the drained queue, but not forever.
    if !writer.is_finished() && timeout(config.write_timeout(), &mut writer).await.is_err() {
        writer.abort();
    }
    reason
}

/// Reader-side state of a bound connection.
struct Connection {
    id: ConnectionId,
    role: Role,
    session: Arc<InteractiveSession>,
    hub: Arc<SessionHubManager>,
    control: Option<mpsc::Sender<WireMessage>>,
    max_frame_bytes: usize,
    last_seen: Instant,
}

impl Connection {
    fn new(
        id: ConnectionId,
        handshake: &Handshake,
        session: Arc<InteractiveSession>,
        hub: Arc<SessionHubManager>,
        config: &TransportConfig,
        control: Option<mpsc::Sender<WireMessage>>,
    ) -> Self {
        Self {
            id,
            role: handshake.role,
            session,
            hub,
            control,
            max_frame_bytes: config.max_frame_bytes,
            last_seen: Instant::now(),
        }
    }

    async fn read_loop<R>(
        &mut self,
        mut stream: R,
        writer: &mut JoinHandle<Disconnect>,
        config: &TransportConfig,
    ) -> Disconnect
    where
        R: Stream<Item = Result<WireMessage, CodecError>> + Unpin,
    {
        loop {
            let next = tokio::select! {
                exit = &mut *writer => {
                    return exit.unwrap_or_else(|e| Disconnect::Transport(e.to_string()));
                }
                next = timeout(config.heartbeat_timeout(), stream.next()) => next,
            };

            let message = match next {
                Err(_) => {
                    tracing::warn!(
                        connection_id = %self.id,
                        idle = ?self.last_seen.elapsed(),
                        "Heartbeat timeout"
                    );
                    return Disconnect::HeartbeatTimeout;
                }
                Ok(None) => return Disconnect::Eof,
                Ok(Some(Err(e))) if e.is_protocol_violation() => {
                    return self.violation(e.to_string());
                }
                Ok(Some(Err(e))) => return Disconnect::Transport(e.to_string()),
                Ok(Some(Ok(message))) => message,
            };
            self.last_seen = Instant::now();

            let flow = match self.role {
                Role::Client => self.on_client_message(message).await,
                Role::Agent => self.on_agent_message(message).await,
            };
            if let Flow::Stop(reason) = flow {
                return reason;
            }
        }
    }

    async fn on_client_message(&self, message: WireMessage) -> Flow {
        match message {
            WireMessage::EvaluationRequest { request_id, code } => {
                let request = EvaluationRequest { request_id, code };
                match self.session.submit(Some(self.id), request).await {
                    // Results reach clients as broadcast events.
                    Ok(_completion) => Flow::Continue,
                    Err(err @ HubError::DuplicateRequest(_)) => {
                        self.send_error(&err);
                        Flow::Continue
                    }
                    Err(err) => {
                        self.send_error(&err);
                        Flow::Stop(Disconnect::SessionEnded)
                    }
                }
            }
            WireMessage::Abort { request_id } => match self.session.abort(request_id).await {
                Ok(_) => Flow::Continue,
                Err(err) => {
                    self.send_error(&err);
                    Flow::Stop(Disconnect::SessionEnded)
                }
            },
            WireMessage::Heartbeat | WireMessage::Attach => Flow::Continue,
            WireMessage::Detach => Flow::Stop(Disconnect::Detached),
            WireMessage::Close { reason } => self.close_session(&reason).await,
            WireMessage::Error { code, message } => {
                tracing::warn!(connection_id = %self.id, ?code, %message, "Client reported error");
                Flow::Continue
            }
            other => Flow::Stop(self.violation(format!("clients may not send {}", other.kind()))),
        }
    }

    async fn on_agent_message(&self, message: WireMessage) -> Flow {
        match message {
            WireMessage::EvaluationComplete {
                request_id,
                outcome,
            } => {
                let result = EventPayload::EvaluationResult {
                    request_id,
                    outcome: outcome.clone(),
                };
                // An unrelayable result is replaced by a failure naming the limit.
                let hub_source = EventSource::session(self.session.id());
                let outcome = match self.relayable(&hub_source, &result) {
                    Ok(()) => outcome,
                    Err(message) => {
                        self.send_error(&HubError::ProtocolViolation(message.clone()));
                        EvaluationOutcome::failure(message)
                    }
                };
                self.session.complete(self.id, request_id, outcome).await;
                Flow::Continue
            }
            WireMessage::Event {
                source,
                timestamp,
                payload,
            } => {
                if let Err(message) = self.relayable(&source, &payload) {
                    self.send_error(&HubError::ProtocolViolation(message));
                    return Flow::Continue;
                }
                match self
                    .session
                    .publish(self.id, Event::new(source, timestamp, payload))
                    .await
                {
                    Ok(()) => Flow::Continue,
                    Err(HubError::ProtocolViolation(msg)) => Flow::Stop(self.violation(msg)),
                    Err(_) => Flow::Stop(Disconnect::SessionEnded),
                }
            }
            WireMessage::Heartbeat => Flow::Continue,
            WireMessage::Detach => Flow::Stop(Disconnect::Detached),
            WireMessage::Close { reason } => self.close_session(&reason).await,
            WireMessage::Error { code, message } => {
                tracing::warn!(connection_id = %self.id, ?code, %message, "Agent reported error");
                Flow::Continue
            }
            other => Flow::Stop(self.violation(format!("agents may not send {}", other.kind()))),
        }
    }

    /// Close the session; the writer ends once the terminal message is out.
    async fn close_session(&self, reason: &str) -> Flow {
        tracing::info!(
            session_id = %self.session.id(),
            connection_id = %self.id,
            role = %self.role,
            reason,
            "Close requested"
        );
        self.hub.close(self.session.id(), reason).await;
        Flow::Continue
    }

    /// Whether `payload` still fits a frame once the hub wraps it in an
    /// `event` message; the error names the limit it breaks.
    fn relayable(&self, source: &EventSource, payload: &EventPayload) -> Result<(), String> {
        match event_frame_len(source, payload) {
            Ok(len) if len <= self.max_frame_bytes => Ok(()),
            Ok(len) => Err(format!(
                "{} event of {len} bytes exceeds the {}-byte frame limit",
                payload.kind(),
                self.max_frame_bytes
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    fn violation(&self, message: String) -> Disconnect {
        tracing::warn!(connection_id = %self.id, %message, "Protocol violation");
        self.send_error(&HubError::ProtocolViolation(message.clone()));
        Disconnect::ProtocolViolation(message)
    }

    fn send_error(&self, err: &HubError) {
        if let Some(control) = &self.control {
            if control.try_send(WireMessage::error(err)).is_err() {
                tracing::debug!(connection_id = %self.id, "Dropping error frame");
            }
        }
    }

    /// Unbind from the session and release the writer.
    async fn finish(&mut self, reason: &Disconnect) {
        match self.role {
            Role::Client => {
                self.session.detach_client(self.id).await;
            }
            Role::Agent => {
                self.session.agent_lost(self.id, &reason.to_string()).await;
            }
        }
        self.control = None;

        tracing::info!(
            session_id = %self.session.id(),
            connection_id = %self.id,
            role = %self.role,
            %reason,
            "Connection closed"
        );
    }
}

/// Drain control frames, session output and heartbeats into the sink.
async fn write_loop<M, W>(
    mut sink: W,
    mut inbox: Inbox<M>,
    mut control: mpsc::Receiver<WireMessage>,
    config: TransportConfig,
) -> Disconnect
where
    M: Send + 'static,
    WireMessage: From<M>,
    W: Sink<WireMessage, Error = CodecError> + Unpin,
{
    let period = config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let evicted = inbox.cancellation();

    let reason = loop {
        let (message, from_control) = tokio::select! {
            biased;
            msg = control.recv() => match msg {
                Some(msg) => (msg, true),
                None => break Disconnect::Detached,
            },
            msg = inbox.recv() => match msg {
                Some(msg) => (WireMessage::from(msg), false),
                None if evicted.is_cancelled() => break Disconnect::Evicted,
                None => break Disconnect::SessionEnded,
            },
            _ = heartbeat.tick() => (WireMessage::Heartbeat, false),
        };

        // Control frames are written even after an eviction.
        let sent = if from_control {
            write(&mut sink, message, &config).await
        } else {
            tokio::select! {
                biased;
                () = evicted.cancelled() => break Disconnect::Evicted,
                sent = write(&mut sink, message, &config) => sent,
            }
        };
        if let Err(reason) = sent {
            break reason;
        }
    };

    let _ = timeout(config.write_timeout(), sink.close()).await;
    reason
}

async fn write<W>(sink: &mut W, message: WireMessage, config: &TransportConfig) -> Result<(), Disconnect>
where
    W: Sink<WireMessage, Error = CodecError> + Unpin,
{
    let message = within_frame_limit(message, config.max_frame_bytes);
    match timeout(config.write_timeout(), sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Disconnect::Transport(e.to_string())),
        Err(_) => Err(Disconnect::WriteTimeout),
    }
}

/// Swap a frame the peer would refuse for an `error` frame saying so.
fn within_frame_limit(message: WireMessage, max_frame_bytes: usize) -> WireMessage {
    let kind = message.kind();
    let problem = match message.encoded_len() {
        Ok(len) if len <= max_frame_bytes => return message,
        Ok(len) => {
            format!("{kind} frame of {len} bytes exceeds the {max_frame_bytes}-byte frame limit")
        }
        Err(e) => format!("{kind} frame could not be encoded: {e}"),
    };
    tracing::error!(kind, %problem, "Replacing outbound frame");
    WireMessage::Error {
        code: ErrorCode::Internal,
        message: problem,
    }
}

/// Send a final error and close the sink.
async fn reject<W>(sink: &mut W, err: &HubError, config: &TransportConfig)
where
    W: Sink<WireMessage, Error = CodecError> + Unpin,
{
    if write(sink, WireMessage::error(err), config).await.is_ok() {
        let _ = timeout(config.write_timeout(), sink.close()).await;
    }
}
