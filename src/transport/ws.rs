//! WebSocket bridge adapter.
//!
//! One socket is cached across turns: the bridge keeps a single logical
//! stream open across an approval round trip, so turn boundaries come from
//! the receiver (`[DONE]` or the synthesized approval boundary), not from
//! the connection closing. Turns are serialized by holding the connection
//! lock for the duration of a turn.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::sse::PcmHandler;
use super::{ChannelSink, ChunkStream, Transport, TransportError, TransportKind};
use crate::api::BridgeRequest;
use crate::core::message::Message;
use crate::core::receiver::{ChunkSink, EventReceiver};
use crate::core::tools::ToolSchemaRegistry;

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsBridgeTransport {
    url: String,
    headers: Vec<(String, String)>,
    schemas: Arc<ToolSchemaRegistry>,
    on_pcm: Option<PcmHandler>,
    conn: Arc<Mutex<Option<WsSocket>>>,
}

impl WsBridgeTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            schemas: Arc::new(ToolSchemaRegistry::new()),
            on_pcm: None,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Extra handshake headers (auth tokens and the like).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_schemas(mut self, schemas: Arc<ToolSchemaRegistry>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_pcm_handler(mut self, handler: PcmHandler) -> Self {
        self.on_pcm = Some(handler);
        self
    }

    /// Drop the cached connection so the next turn handshakes afresh, e.g.
    /// after an error left the old socket in an unknown state.
    pub async fn reset_connection(&self) {
        self.conn.lock().await.take();
    }

    fn client_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    fn build_receiver(&self, pongs: Arc<StdMutex<Vec<u64>>>) -> EventReceiver {
        let mut receiver = EventReceiver::with_schemas(self.schemas.clone());
        receiver.on_ping(move |timestamp| pongs.lock().unwrap().push(timestamp));
        if let Some(handler) = self.on_pcm.clone() {
            receiver.on_pcm(move |bytes| handler(bytes));
        }
        receiver
    }
}

#[async_trait]
impl Transport for WsBridgeTransport {
    async fn send_messages(&self, messages: &[Message]) -> Result<ChunkStream, TransportError> {
        let request = self.client_request()?;
        let frame = serde_json::to_string(&BridgeRequest {
            messages: messages.to_vec(),
        })
        .map_err(|err| TransportError::Stream(err.to_string()))?;

        let (tx, stream) = ChunkStream::channel();
        let conn = self.conn.clone();
        let pongs = Arc::new(StdMutex::new(Vec::new()));
        let mut receiver = self.build_receiver(pongs.clone());

        tokio::spawn(async move {
            let mut sink = ChannelSink::new(tx);
            // Holding the lock for the whole turn serializes turns on the
            // shared socket; the follow-up of an auto-send round only starts
            // after this turn's end was observed anyway.
            let mut guard = conn.lock().await;
            let mut socket = match guard.take() {
                Some(socket) => socket,
                None => match connect_async(request).await {
                    Ok((socket, _)) => socket,
                    Err(err) => {
                        sink.error(format!("connection failed: {err}"));
                        sink.close();
                        return;
                    }
                },
            };

            if let Err(err) = socket.send(WsMessage::Text(frame.into())).await {
                sink.error(err.to_string());
                sink.close();
                return;
            }

            while let Some(incoming) = socket.next().await {
                match incoming {
                    Ok(WsMessage::Text(text)) => {
                        receiver.handle_message(text.as_str(), &mut sink);
                        let pending: Vec<u64> = std::mem::take(&mut *pongs.lock().unwrap());
                        for timestamp in pending {
                            let pong = serde_json::json!({
                                "type": "pong",
                                "timestamp": timestamp,
                            })
                            .to_string();
                            if socket.send(WsMessage::Text(pong.into())).await.is_err() {
                                debug!("Failed to send pong reply");
                            }
                        }
                        if receiver.done_received() {
                            // Turn over; the socket stays cached for the next
                            // send (often the approval follow-up).
                            *guard = Some(socket);
                            return;
                        }
                    }
                    Ok(WsMessage::Ping(payload)) => {
                        let _ = socket.send(WsMessage::Pong(payload)).await;
                    }
                    Ok(WsMessage::Close(_)) => {
                        sink.close();
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        sink.error(err.to_string());
                        sink.close();
                        return;
                    }
                }
            }

            // Peer vanished without a close frame.
            sink.close();
        });

        Ok(stream)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WsBridge
    }
}
