//! Palaver is the transport-agnostic core of a streaming chat client.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the message-list data model, the chunk receiver, the
//!   reconciler with its auto-send decision, and the turn session that
//!   drives approval round trips.
//! - [`transport`] provides the interchangeable adapters (direct provider,
//!   SSE bridge, WebSocket bridge) plus the WebSocket ingress, all
//!   normalizing to one chunk shape.
//! - [`audio`] runs ring-buffered PCM playback and microphone capture on a
//!   dedicated real-time thread, fed by typed commands.
//! - [`chunklog`] records chunk traffic as JSON Lines for deterministic
//!   replay.
//! - [`api`] defines the wire-level chunk union and request envelopes.
//!
//! The runtime entrypoint lives in the binary crate (`src/main.rs`), which
//! wires configuration and a transport into [`core::session::TurnSession`].

pub mod api;
pub mod audio;
pub mod chunklog;
pub mod core;
pub mod transport;
pub mod utils;
