//! SSE bridge adapter and the line framing shared with the direct adapter.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;

use super::{
    ChannelSink, ChunkStream, RequestShaper, Transport, TransportError, TransportKind,
};
use crate::api::BridgeRequest;
use crate::core::message::Message;
use crate::core::receiver::{ChunkSink, EventReceiver};
use crate::core::tools::ToolSchemaRegistry;

/// Callback receiving decoded PCM frames from the audio side channel.
pub type PcmHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Accumulates network reads and yields complete, trimmed lines. Partial
/// lines stay buffered until the next read or an explicit flush.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line_bytes = &self.buffer[search_index..line_end];
            if let Ok(text) = std::str::from_utf8(line_bytes) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

/// Drive an HTTP streaming response through the receiver on a background
/// task. The returned stream terminates exactly once, whether through
/// `[DONE]`, an approval turn boundary, a transport error, or the server
/// simply closing the connection.
pub(crate) fn spawn_sse_stream(
    response: reqwest::Response,
    mut receiver: EventReceiver,
) -> ChunkStream {
    let (tx, stream) = ChunkStream::channel();
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        let mut buffer = SseLineBuffer::default();
        let mut bytes = response.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for line in buffer.push(&chunk) {
                        receiver.handle_message(&line, &mut sink);
                        if receiver.done_received() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    sink.error(err.to_string());
                    sink.close();
                    return;
                }
            }
        }

        for line in buffer.finish() {
            receiver.handle_message(&line, &mut sink);
            if receiver.done_received() {
                return;
            }
        }
        // Connection ended without [DONE]; close so the caller still
        // observes exactly one termination.
        sink.close();
    });
    stream
}

/// Streams turns through an SSE bridge endpoint. The bridge owns provider
/// selection; the adapter just posts the message list and normalizes the
/// resulting event stream.
pub struct SseBridgeTransport {
    client: reqwest::Client,
    url: String,
    shaper: Option<RequestShaper>,
    schemas: Arc<ToolSchemaRegistry>,
    on_pcm: Option<PcmHandler>,
}

impl SseBridgeTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            shaper: None,
            schemas: Arc::new(ToolSchemaRegistry::new()),
            on_pcm: None,
        }
    }

    pub fn with_shaper(mut self, shaper: RequestShaper) -> Self {
        self.shaper = Some(shaper);
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

    fn build_receiver(&self) -> EventReceiver {
        let mut receiver = EventReceiver::with_schemas(self.schemas.clone());
        if let Some(handler) = self.on_pcm.clone() {
            receiver.on_pcm(move |bytes| handler(bytes));
        }
        receiver
    }
}

#[async_trait]
impl Transport for SseBridgeTransport {
    async fn send_messages(&self, messages: &[Message]) -> Result<ChunkStream, TransportError> {
        let request = BridgeRequest {
            messages: messages.to_vec(),
        };
        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        if let Some(shaper) = &self.shaper {
            builder = shaper(builder);
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(TransportError::Http { status, body });
        }

        Ok(spawn_sse_stream(response, self.build_receiver()))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::SseBridge
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_buffer_handles_partial_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: one").is_empty());
        assert_eq!(buffer.push(b"\n\n"), vec!["data: one"]);
        assert!(buffer.finish().is_empty());
    }

    #[test]
    fn sse_buffer_strips_carriage_returns() {
        let mut buffer = SseLineBuffer::default();
        assert_eq!(
            buffer.push(b"data: a\r\ndata: b\r\n"),
            vec!["data: a", "data: b"]
        );
    }

    #[test]
    fn sse_buffer_flushes_trailing_line() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: tail").is_empty());
        assert_eq!(buffer.finish(), vec!["data: tail"]);
        assert!(buffer.finish().is_empty());
    }
}
