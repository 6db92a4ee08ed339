//! Stream listeners feeding [`serve_connection`].

use std::{io, sync::Arc};

use tokio::net::TcpListener;
use workbook_hub_core::TransportConfig;
use workbook_hub_session::SessionHubManager;

use crate::{codec::framed, connection::serve_connection};

/// Accept newline-delimited JSON connections over TCP until the hub shuts down.
///
/// # Errors
/// Returns error if the listener's local address cannot be read.
pub async fn serve_tcp(
    listener: TcpListener,
    hub: Arc<SessionHubManager>,
    config: TransportConfig,
) -> io::Result<()> {
    let shutdown = hub.shutdown_token();
    tracing::info!(addr = %listener.local_addr()?, "TCP listener started");

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                let hub = Arc::clone(&hub);
                let config = config.clone();
                tokio::spawn(async move {
                    let max = config.max_frame_bytes;
                    let reason = serve_connection(framed(stream, max), hub, config).await;
                    tracing::debug!(%peer, %reason, "TCP connection finished");
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
            }
        }
    }

    tracing::info!("TCP listener stopped");
    Ok(())
}

/// Accept connections on a Unix domain socket until the hub shuts down.
///
/// A stale socket file at `path` is replaced, and the file is removed again
/// on exit.
///
/// # Errors
/// Returns error if the socket cannot be bound.
#[cfg(unix)]
pub async fn serve_unix(
    path: impl AsRef<std::path::Path>,
    hub: Arc<SessionHubManager>,
    config: TransportConfig,
) -> io::Result<()> {
    use tokio::net::UnixListener;

    let path = path.as_ref();
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    let shutdown = hub.shutdown_token();
    tracing::info!(socket = %path.display(), "Unix socket listener started");

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _)) => {
                let hub = Arc::clone(&hub);
                let config = config.clone();
                tokio::spawn(async move {
                    let max = config.max_frame_bytes;
                    let reason = serve_connection(framed(stream, max), hub, config).await;
                    tracing::debug!(%reason, "Unix connection finished");
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to accept connection");
            }
        }
    }

    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
    }
    tracing::info!("Unix socket listener stopped");
    Ok(())
}
