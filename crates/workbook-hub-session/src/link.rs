//! Bounded outbound links from a session to its connections.

use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use workbook_hub_core::{ConnectionId, EvaluationRequest, Event, RequestId};

/// Work the session hands to its agent connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    /// Evaluate a request. Sent in submission order, and again on reattach.
    Evaluate(EvaluationRequest),
    /// Stop a request previously sent with `Evaluate`.
    Abort { request_id: RequestId },
    /// The session closed; the agent should stop.
    Close { reason: String },
}

/// Session-side handle to a connection.
///
/// Holds the only sender into the connection's bounded buffer; dropping
/// the link lets the connection drain what is queued and then finish.
/// [`Link::disconnect`] instead aborts the connection immediately.
#[derive(Debug, Clone)]
pub struct Link<T> {
    id: ConnectionId,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
}

/// Receiving side of a [`Link`], owned by the connection.
#[derive(Debug)]
pub struct Inbox<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

/// Link to a client connection.
pub type ClientLink = Link<Event>;
/// Link to an agent connection.
pub type AgentLink = Link<AgentCommand>;
/// Events delivered to one client.
pub type EventStream = Inbox<Event>;

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// Buffer full: the consumer is too slow.
    Overflow,
    /// The connection already went away.
    Gone,
}

impl<T> Link<T> {
    /// Create a link and inbox pair with a buffer of `capacity` messages.
    #[must_use]
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, Inbox<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        (
            Self {
                id,
                tx,
                cancel: cancel.clone(),
            },
            Inbox { rx, cancel },
        )
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the connection behind this link is still reachable.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }

    /// Force the connection closed without draining its buffer.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn deliver(&self, msg: T) -> Delivery {
        if self.cancel.is_cancelled() {
            return Delivery::Gone;
        }
        match self.tx.try_send(msg) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Overflow,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }
}

impl<T: Send + 'static> Inbox<T> {
    /// Next message; `None` once the link is dropped and drained, or
    /// immediately after a forced disconnect.
    pub async fn recv(&mut self) -> Option<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// Non-blocking variant of [`Inbox::recv`].
    pub fn try_recv(&mut self) -> Option<T> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Whether the session forcibly disconnected this inbox.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled on forced disconnect.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Adapt into a stream that ends on drain or forced disconnect.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        ReceiverStream::new(self.rx).take_until(self.cancel.cancelled_owned())
    }
}
