//! Real-time audio: ring-buffered playback of synthesized speech and PCM
//! capture from the microphone.
//!
//! The render and capture callbacks run on a dedicated audio thread with
//! hard latency constraints. Everything crossing that boundary is a typed
//! message over a channel; the audio thread never blocks on, or shares
//! references with, the main thread.

pub mod capture;
pub mod pcm;
pub mod playback;
pub mod ring;

/// Playback output rate in Hz.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Microphone capture rate in Hz (mono).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Commands posted across the audio-thread boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioCommand {
    /// PCM16 samples to append to the playback ring.
    Data(Vec<i16>),
    /// Zero cursors and played/silence state for a new conversational turn.
    Reset,
    /// Fast-forward the read cursor to the write cursor (flush).
    EndOfAudio,
}

/// Notifications flowing back from the render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A second of silence followed played audio; the turn's speech is done.
    Finished,
}
