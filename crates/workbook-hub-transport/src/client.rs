//! Peer-side helper for speaking the wire protocol.
//!
//! Used by agents and clients embedding the hub protocol, and by tests.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use workbook_hub_core::{
    ConnectionId, ErrorCode, EvaluationOutcome, EventClock, EventPayload, EventSource, RequestId,
    Role, SessionId, SessionState,
};

use crate::{codec::CodecError, protocol::WireMessage};

/// Client-side error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Hub rejected the connection ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("Connection closed")]
    Closed,
    #[error("Unexpected {0} message")]
    Unexpected(&'static str),
}

/// A connection that completed its handshake.
#[derive(Debug)]
pub struct WireClient<T> {
    transport: T,
    session_id: SessionId,
    connection_id: ConnectionId,
    state: SessionState,
    clock: EventClock,
}

impl<T> WireClient<T>
where
    T: Stream<Item = Result<WireMessage, CodecError>>
        + Sink<WireMessage, Error = CodecError>
        + Unpin,
{
    /// Perform the handshake for `role` on `session_id`.
    ///
    /// # Errors
    /// - [`ClientError::Rejected`] if the hub answers with an error
    /// - [`ClientError::Closed`] if the hub hangs up first
    pub async fn connect(
        mut transport: T,
        session_id: &str,
        role: Role,
        token: Option<String>,
    ) -> Result<Self, ClientError> {
        transport
            .send(WireMessage::handshake(session_id, role, token))
            .await?;

        match transport.next().await {
            Some(Ok(WireMessage::HandshakeAccepted {
                session_id,
                connection_id,
                state,
            })) => Ok(Self {
                transport,
                session_id,
                connection_id,
                state,
                clock: EventClock::new(EventSource::agent(connection_id)),
            }),
            Some(Ok(WireMessage::Error { code, message })) => {
                Err(ClientError::Rejected { code, message })
            }
            Some(Ok(other)) => Err(ClientError::Unexpected(other.kind())),
            Some(Err(e)) => Err(e.into()),
            None => Err(ClientError::Closed),
        }
    }

    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Session state reported in the handshake.
    #[must_use]
    pub const fn initial_state(&self) -> SessionState {
        self.state
    }

    /// Send a raw message.
    ///
    /// # Errors
    /// Returns error if the transport fails.
    pub async fn send(&mut self, message: WireMessage) -> Result<(), ClientError> {
        self.transport.send(message).await?;
        Ok(())
    }

    /// Next message, heartbeats included; `None` once the hub hangs up.
    ///
    /// # Errors
    /// Returns error if the transport fails or a frame is malformed.
    pub async fn recv_raw(&mut self) -> Result<Option<WireMessage>, ClientError> {
        Ok(self.transport.next().await.transpose()?)
    }

    /// Next non-heartbeat message; `None` once the hub hangs up.
    ///
    /// # Errors
    /// Returns error if the transport fails or a frame is malformed.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>, ClientError> {
        loop {
            match self.recv_raw().await? {
                Some(WireMessage::Heartbeat) => {}
                other => return Ok(other),
            }
        }
    }

    /// Like [`WireClient::recv`], but sends a heartbeat every `interval`
    /// while waiting so the hub keeps a quiet connection open.
    ///
    /// # Errors
    /// Returns error if the transport fails or a frame is malformed.
    pub async fn recv_keepalive(
        &mut self,
        interval: Duration,
    ) -> Result<Option<WireMessage>, ClientError> {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = self.transport.next() => match message.transpose()? {
                    Some(WireMessage::Heartbeat) => {}
                    other => return Ok(other),
                },
                _ = ticker.tick() => self.heartbeat().await?,
            }
        }
    }

    /// Tell the hub this connection is still alive.
    ///
    /// # Errors
    /// Returns error if the transport fails.
    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        self.send(WireMessage::Heartbeat).await
    }

    /// Submit code for evaluation.
    ///
    /// # Errors
    /// Returns error if the transport fails.
    pub async fn submit(&mut self, code: impl Into<String>) -> Result<RequestId, ClientError> {
        let request_id = RequestId::new();
        self.send(WireMessage::EvaluationRequest {
            request_id,
            code: code.into(),
        })
        .await?;
        Ok(request_id)
    }

    /// Ask the agent to stop an evaluation submitted earlier (client side).
    ///
    /// # Errors
    /// Returns error if the transport fails.
    pub async fn abort(&mut self, request_id: RequestId) -> Result<(), ClientError> {
        self.send(WireMessage::Abort { request_id }).await
    }

    /// Report the outcome of an evaluation (agent side).
    ///
    /// # Errors
    /// Returns error if the transport fails.
    pub async fn complete(
        &mut self,
        request_id: RequestId,
        outcome: EvaluationOutcome,
    ) -> Result<(), ClientError> {
        self.send(WireMessage::EvaluationComplete {
            request_id,
            outcome,
        })
        .await
    }

    /// Publish an event stamped by this connection's clock (agent side).
    ///
    /// # Errors
    /// Returns error if the transport fails.
    pub async fn publish(&mut self, payload: EventPayload) -> Result<(), ClientError> {
        let event = self.clock.event(payload);
        self.send(WireMessage::event(event)).await
    }

    /// Hang up without closing the session.
    ///
    /// # Errors
    /// Returns error if the transport fails.
    pub async fn detach(mut self) -> Result<(), ClientError> {
        self.transport.send(WireMessage::Detach).await?;
        self.transport.close().await?;
        Ok(())
    }

    /// Give back the underlying transport.
    pub fn into_inner(self) -> T {
        self.transport
    }
}
