//! Extension socket channel
//!
//! Websocket endpoint for design-editor extensions, bound on the first free
//! port from an ordered loopback candidate list. Each connection gets an
//! outbound queue registered with the [`ExtensionRegistry`]; inbound text
//! frames are parsed and dispatched to it.

use super::registry::ExtensionRegistry;
use crate::error::RelayError;
use crate::protocol::{encode_hub_message, parse_extension_message};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct SocketState {
    registry: Arc<ExtensionRegistry>,
    max_message_bytes: usize,
    shutdown: CancellationToken,
}

/// Bind the first candidate port that is free on 127.0.0.1.
///
/// A port already in use moves on to the next candidate; any other bind
/// failure is fatal.
pub async fn bind_first_available(candidates: &[u16]) -> Result<(TcpListener, u16), RelayError> {
    for &port in candidates {
        match TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                log::info!("Port {} is in use, trying next candidate", port);
            }
            Err(source) => return Err(RelayError::SocketBind { port, source }),
        }
    }
    Err(RelayError::PortsExhausted(candidates.to_vec()))
}

/// A running socket channel.
pub struct SocketChannel {
    port: u16,
    task: JoinHandle<()>,
}

impl SocketChannel {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::warn!("Socket channel task ended abnormally: {}", e);
        }
    }
}

/// Serve extension connections on `listener` until `shutdown` fires.
pub fn start_socket_channel(
    listener: TcpListener,
    port: u16,
    registry: Arc<ExtensionRegistry>,
    max_message_bytes: usize,
    shutdown: CancellationToken,
) -> SocketChannel {
    let state = SocketState {
        registry,
        max_message_bytes,
        shutdown: shutdown.clone(),
    };
    let app = Router::new().route("/", get(upgrade_handler)).with_state(state);

    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            log::error!("Socket channel error: {}", e);
        }
    });

    log::info!("Extension socket listening on ws://127.0.0.1:{}", port);
    SocketChannel { port, task }
}

async fn upgrade_handler(ws: WebSocketUpgrade, State(state): State<SocketState>) -> impl IntoResponse {
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_peer(socket, state))
}

async fn handle_peer(socket: WebSocket, state: SocketState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let peer_id = state.registry.connect(tx);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outbound = rx.recv() => {
                let Some(message) = outbound else {
                    // Registry dropped our queue
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match encode_hub_message(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("{}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    log::warn!("Send to extension {} failed: {}", peer_id, e);
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match parse_extension_message(text.as_str()) {
                        Ok(message) => state.registry.on_message(&peer_id, message),
                        Err(e) => log::warn!("Extension {}: {}", peer_id, e),
                    },
                    Some(Ok(Message::Binary(_))) => {
                        log::warn!("Extension {} sent a binary frame, ignoring", peer_id);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::warn!("Extension {} receive error: {}", peer_id, e);
                        break;
                    }
                }
            }
        }
    }

    state.registry.disconnect(&peer_id);
}
