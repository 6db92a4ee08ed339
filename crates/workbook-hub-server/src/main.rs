//! workbook-hub: routes evaluation requests and events between workbook
//! clients and their agents.
//!
//! ## Usage
//!
//! ```bash
//! # TCP only, default settings
//! workbook-hub
//!
//! # TCP, WebSocket and a Unix socket, with a config file
//! workbook-hub --config hub.toml --ws-listen 127.0.0.1:7434 --unix-socket /tmp/workbook-hub.sock
//! ```

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tokio::{net::TcpListener, task::JoinSet};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workbook_hub_core::HubConfig;
use workbook_hub_session::SessionHubManager;
use workbook_hub_transport::{create_ws_router, serve_tcp};

#[derive(Parser)]
#[command(name = "workbook-hub")]
#[command(about = "Session hub for interactive workbooks")]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "WORKBOOK_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Address for newline-delimited JSON over TCP
    #[arg(long, default_value = "127.0.0.1:7433")]
    listen: SocketAddr,

    /// Address for the WebSocket endpoint (`/ws`)
    #[arg(long)]
    ws_listen: Option<SocketAddr>,

    /// Unix socket path for local agents
    #[arg(long)]
    unix_socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => HubConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => HubConfig::default(),
    };

    let hub = Arc::new(SessionHubManager::new(config.session.clone()));
    let sweeper = Arc::clone(&hub).spawn_sweeper();
    let mut listeners = JoinSet::new();

    let tcp = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    listeners.spawn(serve_tcp(tcp, Arc::clone(&hub), config.transport.clone()));

    if let Some(addr) = args.ws_listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let app = create_ws_router(Arc::clone(&hub), config.transport.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());
        let shutdown = hub.shutdown_token();
        tracing::info!("WebSocket endpoint on ws://{addr}/ws");
        listeners.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        });
    }

    if let Some(path) = args.unix_socket {
        #[cfg(unix)]
        listeners.spawn(workbook_hub_transport::serve_unix(
            path,
            Arc::clone(&hub),
            config.transport.clone(),
        ));
        #[cfg(not(unix))]
        tracing::warn!(socket = %path.display(), "Unix sockets are not supported on this platform");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            tracing::info!("Received Ctrl-C");
        }
        Some(result) = listeners.join_next() => {
            match result {
                Ok(Ok(())) => tracing::warn!("Listener exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "Listener failed"),
                Err(e) => tracing::error!(error = %e, "Listener panicked"),
            }
        }
    }

    hub.shutdown("hub shutting down").await;
    while let Some(result) = listeners.join_next().await {
        if let Ok(Err(e)) = result {
            tracing::warn!(error = %e, "Listener failed during shutdown");
        }
    }
    sweeper.await.context("joining sweeper")?;
    Ok(())
}
