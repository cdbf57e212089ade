//! Turns raw transport frames into typed chunks.
//!
//! Every adapter feeds its frames through one [`EventReceiver`], which owns
//! the per-stream session state (`done_received`, the PCM side buffer) and
//! pushes parsed chunks into a [`ChunkSink`]. The receiver never blocks on
//! its consumer and never lets malformed server output take the stream down.

use std::sync::Arc;

use base64::Engine;
use serde_json::Value;
use tracing::debug;

use crate::api::Chunk;
use crate::core::tools::{ToolInputCheck, ToolSchemaRegistry};

/// Error surfaced by a sink when a chunk cannot be accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The underlying stream is already closed. This is the benign race
    /// between `[DONE]` processing and a trailing frame; the receiver
    /// swallows it.
    Closed,
    Other(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Closed => write!(f, "chunk sink already closed"),
            SinkError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Push-based chunk consumer. The parser calls into it and never waits for
/// a response.
pub trait ChunkSink {
    fn enqueue(&mut self, chunk: Chunk) -> Result<(), SinkError>;
    fn close(&mut self);
    fn error(&mut self, message: String);
}

type PingHandler = Box<dyn FnMut(u64) + Send>;
type PcmHandler = Box<dyn FnMut(Vec<u8>) + Send>;

/// Parses raw frames (SSE-style `data: ` lines or raw JSON control frames)
/// into chunks and routes them. One instance owns one stream's state and can
/// be reused across turns via [`EventReceiver::reset`].
#[derive(Default)]
pub struct EventReceiver {
    done_received: bool,
    pcm_buffer: Vec<Vec<u8>>,
    schemas: Arc<ToolSchemaRegistry>,
    on_ping: Option<PingHandler>,
    on_pcm: Option<PcmHandler>,
}

impl EventReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schemas(schemas: Arc<ToolSchemaRegistry>) -> Self {
        Self {
            schemas,
            ..Self::default()
        }
    }

    /// Register a side-effect callback for `ping` control frames (e.g. reply
    /// `pong` with the echoed timestamp). Runs without touching the sink.
    pub fn on_ping<F>(&mut self, handler: F)
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.on_ping = Some(Box::new(handler));
    }

    /// Attach a consumer for decoded PCM frames. When set, frames are handed
    /// over immediately instead of accumulating in the session buffer.
    pub fn on_pcm<F>(&mut self, handler: F)
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        self.on_pcm = Some(Box::new(handler));
    }

    pub fn done_received(&self) -> bool {
        self.done_received
    }

    /// PCM frames accumulated since the last reset, in arrival order.
    pub fn pcm_frames(&self) -> &[Vec<u8>] {
        &self.pcm_buffer
    }

    pub fn take_pcm(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.pcm_buffer)
    }

    /// Clear `done_received` and the PCM buffer so the receiver can serve the
    /// next turn without being reconstructed.
    pub fn reset(&mut self) {
        self.done_received = false;
        self.pcm_buffer.clear();
    }

    /// Process one raw frame. Frames that match neither the `data: ` shape
    /// nor a recognized control frame are keep-alive noise and are ignored.
    pub fn handle_message(&mut self, raw_frame: &str, sink: &mut dyn ChunkSink) {
        let frame = raw_frame.trim();
        if frame.is_empty() {
            return;
        }

        if let Some(payload) = frame.strip_prefix("data:").map(str::trim_start) {
            if payload == "[DONE]" {
                self.mark_done(sink);
                return;
            }
            match serde_json::from_str::<Chunk>(payload) {
                Ok(chunk) => self.dispatch(chunk, sink),
                Err(err) => {
                    // Possibly a frame split across reads; never fatal.
                    debug!(error = %err, "Skipping unparsable chunk payload");
                }
            }
            return;
        }

        // Raw JSON control frame (out-of-band signal).
        if let Ok(value) = serde_json::from_str::<Value>(frame) {
            if value.get("type").and_then(Value::as_str) == Some("ping") {
                let timestamp = value
                    .get("timestamp")
                    .and_then(Value::as_u64)
                    .unwrap_or_default();
                if let Some(handler) = self.on_ping.as_mut() {
                    handler(timestamp);
                }
            }
        }
    }

    fn dispatch(&mut self, chunk: Chunk, sink: &mut dyn ChunkSink) {
        match chunk {
            Chunk::DataPcm { data } => self.divert_pcm(&data),
            Chunk::Ping { timestamp } => {
                if let Some(handler) = self.on_ping.as_mut() {
                    handler(timestamp);
                }
            }
            Chunk::Pong { .. } => {}
            Chunk::ToolApprovalRequest {
                ref tool_call_id,
                ref approval_id,
                ..
            } => {
                if approval_id == tool_call_id {
                    // The approval handshake must be identified independently
                    // of the call it gates.
                    debug!(
                        tool_call_id = %tool_call_id,
                        "Dropping approval request whose id collides with its tool call"
                    );
                    return;
                }
                // An approval ends the response turn here and now: the client
                // must render the approval control and run the auto-send
                // decision, and not every backend can emit [DONE] itself at
                // this point.
                self.forward(chunk, sink);
                self.forward(Chunk::Finish { usage: None }, sink);
                self.mark_done(sink);
            }
            Chunk::ToolInputAvailable {
                ref tool_call_id,
                ref tool_name,
                ref input,
            } => {
                if let ToolInputCheck::Invalid(err) = self.schemas.check(tool_name, input) {
                    debug!(
                        tool_call_id = %tool_call_id,
                        tool_name = %tool_name,
                        error = %err,
                        "Dropping tool input that fails its schema"
                    );
                    return;
                }
                self.forward(chunk, sink);
            }
            other => self.forward(other, sink),
        }
    }

    fn forward(&mut self, chunk: Chunk, sink: &mut dyn ChunkSink) {
        match sink.enqueue(chunk) {
            Ok(()) => {}
            // Trailing frame raced [DONE]; the consumer is gone on purpose.
            Err(SinkError::Closed) => {}
            Err(SinkError::Other(message)) => sink.error(message),
        }
    }

    fn mark_done(&mut self, sink: &mut dyn ChunkSink) {
        if self.done_received {
            return;
        }
        self.done_received = true;
        sink.close();
    }

    fn divert_pcm(&mut self, data: &str) {
        let bytes = match base64::prelude::BASE64_STANDARD.decode(data) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(error = %err, "Dropping garbled PCM frame");
                return;
            }
        };
        if bytes.len() % 2 != 0 {
            debug!(len = bytes.len(), "Dropping PCM frame with odd byte count");
            return;
        }
        match self.on_pcm.as_mut() {
            Some(handler) => handler(bytes),
            None => self.pcm_buffer.push(bytes),
        }
    }
}
