//! Output-device side of the playback pipeline.
//!
//! The render callback owns the ring outright; the main thread only ever
//! posts [`AudioCommand`]s into a channel the callback drains without
//! blocking.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::warn;

use crate::audio::pcm::bytes_to_samples;
use crate::audio::ring::PlaybackRing;
use crate::audio::{AudioCommand, PlaybackEvent, PLAYBACK_SAMPLE_RATE};
use crate::transport::sse::PcmHandler;

/// Apply one command to the ring. Factored out of the render callback so the
/// command semantics are testable without an audio device.
pub fn apply_command(ring: &mut PlaybackRing, command: AudioCommand) {
    match command {
        AudioCommand::Data(samples) => ring.write_pcm16(&samples),
        AudioCommand::Reset => ring.reset(),
        AudioCommand::EndOfAudio => ring.end_of_audio(),
    }
}

pub struct PlaybackHandle {
    commands: Sender<AudioCommand>,
    events: Receiver<PlaybackEvent>,
    _stream: cpal::Stream,
}

impl PlaybackHandle {
    pub fn send(&self, command: AudioCommand) {
        let _ = self.commands.send(command);
    }

    pub fn events(&self) -> &Receiver<PlaybackEvent> {
        &self.events
    }

    /// Adapter for the receiver's PCM side channel: raw frame bytes in,
    /// playback data commands out. Garbled frames are dropped per frame.
    pub fn pcm_handler(&self) -> PcmHandler {
        let commands = self.commands.clone();
        std::sync::Arc::new(move |bytes: Vec<u8>| match bytes_to_samples(&bytes) {
            Ok(samples) => {
                let _ = commands.send(AudioCommand::Data(samples));
            }
            Err(err) => warn!(error = %err, "Dropping garbled PCM frame"),
        })
    }
}

/// Open the default output device at 24 kHz mono and start rendering. The
/// stream stops when the handle is dropped.
pub fn start_playback() -> Result<PlaybackHandle, String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no output device available".to_string())?;
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(PLAYBACK_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let (command_tx, command_rx) = unbounded::<AudioCommand>();
    let (event_tx, event_rx) = unbounded::<PlaybackEvent>();
    let mut ring = PlaybackRing::with_default_capacity();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                while let Ok(command) = command_rx.try_recv() {
                    apply_command(&mut ring, command);
                }
                ring.read(data);
                if ring.playback_finished() {
                    let _ = event_tx.send(PlaybackEvent::Finished);
                }
            },
            |err| warn!(error = %err, "Playback stream error"),
            None,
        )
        .map_err(|err| err.to_string())?;
    stream.play().map_err(|err| err.to_string())?;

    Ok(PlaybackHandle {
        commands: command_tx,
        events: event_rx,
        _stream: stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_drive_the_ring() {
        let mut ring = PlaybackRing::new(16);
        apply_command(&mut ring, AudioCommand::Data(vec![16384, -16384]));
        assert_eq!(ring.available(), 2);

        apply_command(&mut ring, AudioCommand::EndOfAudio);
        assert_eq!(ring.available(), 0);

        apply_command(&mut ring, AudioCommand::Data(vec![1, 2, 3]));
        apply_command(&mut ring, AudioCommand::Reset);
        assert_eq!(ring.available(), 0);
        let mut out = [0.0f32; 1];
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn data_commands_convert_to_float_samples() {
        let mut ring = PlaybackRing::new(8);
        apply_command(&mut ring, AudioCommand::Data(vec![32767, -32767, 0]));
        let mut out = [0.0f32; 3];
        ring.read(&mut out);
        assert!((out[0] - 1.0).abs() < 1e-6);
        assert!((out[1] + 1.0).abs() < 1e-6);
        assert_eq!(out[2], 0.0);
    }
}
