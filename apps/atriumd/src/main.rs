use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use atrium_bus::ScriptedBackend;
use atrium_mirror::{Channel, Peer};
use atrium_protocol::SystemEvent;
use atrium_runtime::{Runtime, RuntimeBuilder};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use clap::Parser;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

mod ws;

use crate::ws::WsChannel;

#[derive(Debug, Parser)]
#[command(name = "atriumd")]
#[command(about = "Atrium runtime daemon")]
struct Cli {
    #[arg(long, default_value = ".atrium")]
    root: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8890")]
    listen: SocketAddr,
}

#[derive(Clone)]
struct AppState {
    runtime: Arc<Runtime>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    // The scripted backend stands in until a real model adapter is wired
    // through RuntimeBuilder::with_backend.
    let runtime = Arc::new(
        RuntimeBuilder::new(&cli.root)
            .with_backend(Arc::new(ScriptedBackend::new()))
            .build(),
    );

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(mirror_ws))
        .with_state(AppState { runtime })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, root = %cli.root.display(), "atriumd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "atriumd"
    }))
}

async fn mirror_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_mirror(state.runtime, socket))
}

/// Wrap one WebSocket in a channel and serve it with a peer until the
/// socket closes.
async fn serve_mirror(runtime: Arc<Runtime>, socket: WebSocket) {
    let (sink, mut frames) = socket.split();
    let (inbound_tx, _) = broadcast::channel(256);
    let channel = Arc::new(WsChannel::new(sink, inbound_tx.clone()));

    let peer = match Peer::serve(runtime, Arc::clone(&channel) as Arc<dyn Channel>).await {
        Ok(peer) => peer,
        Err(error) => {
            warn!(%error, "failed to serve mirror connection");
            return;
        }
    };
    info!("mirror connected");

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SystemEvent>(&text) {
                Ok(event) => {
                    let _ = inbound_tx.send(event);
                }
                Err(error) => warn!(%error, "malformed event frame dropped"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(%error, "websocket read failed");
                break;
            }
        }
    }

    drop(peer);
    if let Err(error) = channel.close().await {
        debug!(%error, "channel already closed");
    }
    info!("mirror disconnected");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
