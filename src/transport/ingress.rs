//! WebSocket ingress for the bridge: accepts client connections, validates
//! inbound frames, and streams chunk frames back.
//!
//! The trust model is asymmetric: server output is parsed leniently on the
//! client side, but client input here is strict. Any text frame that is not
//! valid JSON of a known shape is a protocol violation and closes the
//! connection with a policy code, never the normal 1000.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::TransportError;
use crate::api::Chunk;
use crate::core::message::Message;

/// Produces the chunk script for one chat turn. The bridge internals behind
/// this are somebody else's problem; the ingress only owns framing and
/// validation.
pub type ChatHandler = Arc<dyn Fn(Vec<Message>) -> Vec<Chunk> + Send + Sync>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Chat { messages: Vec<Message> },
    Ping { timestamp: u64 },
}

pub struct IngressServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl IngressServer {
    /// Bind and start accepting connections. Pass port 0 to let the OS pick.
    pub async fn bind(addr: &str, handler: ChatHandler) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let shutdown = CancellationToken::new();

        let accept_token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = accept_token.cancelled() => return,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Ingress connection accepted");
                        let handler = handler.clone();
                        tokio::spawn(serve_connection(stream, handler));
                    }
                    Err(err) => {
                        debug!(error = %err, "Ingress accept failed");
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for IngressServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_connection(stream: TcpStream, handler: ChatHandler) {
    let mut socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(err) => {
            debug!(error = %err, "WebSocket handshake failed");
            return;
        }
    };

    while let Some(incoming) = socket.next().await {
        match incoming {
            Ok(WsMessage::Text(text)) => {
                match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(ClientFrame::Ping { timestamp }) => {
                        let pong = serde_json::json!({
                            "type": "pong",
                            "timestamp": timestamp,
                        })
                        .to_string();
                        if socket.send(WsMessage::Text(pong.into())).await.is_err() {
                            return;
                        }
                    }
                    Ok(ClientFrame::Chat { messages }) => {
                        if stream_chunks(&mut socket, handler(messages)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "Closing connection on malformed client frame");
                        let _ = socket
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: CloseCode::Policy,
                                reason: "invalid frame".into(),
                            })))
                            .await;
                        return;
                    }
                }
            }
            Ok(WsMessage::Ping(payload)) => {
                let _ = socket.send(WsMessage::Pong(payload)).await;
            }
            Ok(WsMessage::Close(_)) => return,
            Ok(_) => {
                // Binary frames are not part of the protocol either.
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: "unexpected frame type".into(),
                    })))
                    .await;
                return;
            }
            Err(err) => {
                debug!(error = %err, "Ingress receive error");
                return;
            }
        }
    }
}

/// Send a turn's chunks as `data: ` frames. An approval request ends the
/// turn without `[DONE]`: the stream stays open across the approval round
/// trip and the client synthesizes its own turn boundary.
async fn stream_chunks(
    socket: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    chunks: Vec<Chunk>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    for chunk in chunks {
        let line = match serde_json::to_string(&chunk) {
            Ok(line) => line,
            Err(err) => {
                debug!(error = %err, "Skipping unserializable chunk");
                continue;
            }
        };
        socket
            .send(WsMessage::Text(format!("data: {line}").into()))
            .await?;
        if matches!(chunk, Chunk::ToolApprovalRequest { .. }) {
            return Ok(());
        }
    }
    socket.send(WsMessage::Text("data: [DONE]".into())).await
}
