//! WebSocket transport: one JSON wire message per text frame.

use std::{io, sync::Arc};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, future};
use workbook_hub_core::TransportConfig;
use workbook_hub_session::SessionHubManager;

use crate::{
    codec::{CodecError, decode_message},
    connection::serve_connection,
    protocol::WireMessage,
};

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<SessionHubManager>,
    pub config: TransportConfig,
}

impl WsState {
    #[must_use]
    pub const fn new(hub: Arc<SessionHubManager>, config: TransportConfig) -> Self {
        Self { hub, config }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let max = state.config.max_frame_bytes;
    let transport = socket
        .sink_map_err(|e| CodecError::Io(io::Error::other(e)))
        .with(move |message: WireMessage| future::ready(encode_frame(&message, max)))
        .filter_map(move |frame| future::ready(decode_frame(frame, max)));

    let reason = serve_connection(transport, state.hub, state.config).await;
    tracing::debug!(%reason, "WebSocket connection finished");
}

/// Encode one message per text frame, under the same limit as the line codec.
fn encode_frame(message: &WireMessage, max_frame_bytes: usize) -> Result<Message, CodecError> {
    let json = serde_json::to_string(message)?;
    if json.len() > max_frame_bytes {
        return Err(CodecError::FrameTooLong(max_frame_bytes));
    }
    Ok(Message::Text(json.into()))
}

/// Map a WebSocket frame to a wire message; control frames yield nothing.
fn decode_frame(
    frame: Result<Message, axum::Error>,
    max_frame_bytes: usize,
) -> Option<Result<WireMessage, CodecError>> {
    match frame {
        Ok(Message::Text(text)) => Some(decode_message(text.as_str().as_bytes(), max_frame_bytes)),
        Ok(Message::Binary(data)) => Some(decode_message(&data, max_frame_bytes)),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
        Err(e) => Some(Err(CodecError::Io(io::Error::other(e)))),
    }
}

/// Create WebSocket router serving `/ws`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(hub, config.transport.clone()));
/// ```
#[must_use]
pub fn create_ws_router(hub: Arc<SessionHubManager>, config: TransportConfig) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(WsState::new(hub, config))
}
