//! Transport layer for the workbook session hub.
//!
//! Provides:
//! - Wire protocol (newline-delimited JSON)
//! - Connection driver shared by every transport
//! - TCP and Unix socket listeners
//! - WebSocket transport (feature: websocket)
//! - Peer-side client for agents, clients and tests

pub mod client;
pub mod codec;
pub mod connection;
pub mod listener;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use client::{ClientError, WireClient};
pub use codec::{CodecError, WireCodec, decode_message, framed};
pub use connection::{Disconnect, serve_connection};
#[cfg(unix)]
pub use listener::serve_unix;
pub use listener::serve_tcp;
pub use protocol::{Handshake, PROTOCOL_VERSION, WireMessage};
#[cfg(feature = "websocket")]
pub use websocket::{WsState, create_ws_router};
