//! Interchangeable "send the message list, get a chunk stream back"
//! adapters. All three wire formats (direct provider streaming, the SSE
//! bridge, the WebSocket bridge) normalize into the same [`Chunk`] shape
//! before the reconciler sees anything, which is what keeps the reconciler
//! and the auto-send predicate transport-agnostic.

pub mod direct;
pub mod ingress;
pub mod sse;
pub mod ws;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::Chunk;
use crate::core::message::Message;
use crate::core::receiver::{ChunkSink, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    SseBridge,
    WsBridge,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Direct => "direct",
            TransportKind::SseBridge => "sse",
            TransportKind::WsBridge => "ws",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum TransportError {
    /// Non-2xx response from the endpoint.
    Http { status: u16, body: String },
    Network(String),
    Connect(String),
    Stream(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Http { status, body } => {
                write!(f, "request failed with status {status}: {body}")
            }
            TransportError::Network(msg) => write!(f, "network error: {msg}"),
            TransportError::Connect(msg) => write!(f, "connection failed: {msg}"),
            TransportError::Stream(msg) => write!(f, "stream error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One event on an adapter's chunk stream. `End` is delivered exactly once,
/// after which the stream yields nothing.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Chunk(Chunk),
    Error(String),
    End,
}

/// Receiver half of an adapter's per-turn stream.
pub struct ChunkStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl ChunkStream {
    pub fn channel() -> (mpsc::UnboundedSender<TransportEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Build a pre-scripted stream, mainly for tests and replay.
    pub fn from_events(events: Vec<TransportEvent>) -> Self {
        let (tx, stream) = Self::channel();
        for event in events {
            let _ = tx.send(event);
        }
        stream
    }
}

/// Sink that forwards receiver output onto a stream channel. Closing is
/// sticky: once the turn ended, trailing enqueues report `Closed` so the
/// receiver can swallow the benign race.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: bool,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { tx, closed: false }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ChunkSink for ChannelSink {
    fn enqueue(&mut self, chunk: Chunk) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.tx
            .send(TransportEvent::Chunk(chunk))
            .map_err(|_| SinkError::Closed)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.tx.send(TransportEvent::End);
        }
    }

    fn error(&mut self, message: String) {
        let _ = self.tx.send(TransportEvent::Error(message));
    }
}

/// Hook for shaping outbound HTTP requests (auth headers, custom envelopes).
pub type RequestShaper =
    Arc<dyn Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the current message list and stream back normalized chunks. The
    /// returned stream terminates exactly once.
    async fn send_messages(&self, messages: &[Message]) -> Result<ChunkStream, TransportError>;

    fn kind(&self) -> TransportKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_close_is_sticky() {
        let (tx, _stream) = ChunkStream::channel();
        let mut sink = ChannelSink::new(tx);

        sink.enqueue(Chunk::Finish { usage: None }).unwrap();
        sink.close();
        sink.close();
        let err = sink.enqueue(Chunk::Finish { usage: None }).unwrap_err();
        assert_eq!(err, SinkError::Closed);
    }

    #[tokio::test]
    async fn scripted_stream_terminates_once() {
        let mut stream = ChunkStream::from_events(vec![
            TransportEvent::Chunk(Chunk::TextDelta {
                message_id: None,
                delta: "hi".into(),
            }),
            TransportEvent::End,
        ]);
        assert!(matches!(
            stream.recv().await,
            Some(TransportEvent::Chunk(_))
        ));
        assert!(matches!(stream.recv().await, Some(TransportEvent::End)));
        assert!(stream.recv().await.is_none());
    }
}
