//! Microphone capture: 16 kHz mono, hard-clamped float-to-PCM16 conversion,
//! fixed-size chunk delivery, and strictly ordered teardown.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use tracing::warn;

use crate::audio::pcm::f32_to_pcm16;
use crate::audio::CAPTURE_SAMPLE_RATE;

/// Samples per delivered chunk (100 ms at 16 kHz).
pub const CAPTURE_CHUNK_SAMPLES: usize = 1600;

/// The device-facing half of a capture session, split out so the teardown
/// ordering is testable without hardware. Teardown must run as: disconnect
/// the processing graph, stop the hardware input tracks (this is what
/// releases the microphone indicator), then close the device context.
pub trait CaptureBackend {
    fn disconnect_graph(&mut self) -> Result<(), String>;
    fn stop_tracks(&mut self) -> Result<(), String>;
    fn close_context(&mut self) -> Result<(), String>;
}

pub struct CaptureSession<B: CaptureBackend> {
    backend: B,
}

impl<B: CaptureBackend> CaptureSession<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Run the full ordered teardown. A failing step aborts the sequence so
    /// the partial-teardown failure mode is observable rather than papered
    /// over.
    pub fn teardown(mut self) -> Result<(), String> {
        self.backend.disconnect_graph()?;
        self.backend.stop_tracks()?;
        self.backend.close_context()
    }
}

pub struct CpalCaptureBackend {
    stream: Option<cpal::Stream>,
}

impl CaptureBackend for CpalCaptureBackend {
    fn disconnect_graph(&mut self) -> Result<(), String> {
        if let Some(stream) = &self.stream {
            stream.pause().map_err(|err| err.to_string())?;
        }
        Ok(())
    }

    fn stop_tracks(&mut self) -> Result<(), String> {
        // Dropping the stream releases the hardware input.
        self.stream.take();
        Ok(())
    }

    fn close_context(&mut self) -> Result<(), String> {
        Ok(())
    }
}

/// Open the default input device and deliver clamped PCM16 chunks of
/// `CAPTURE_CHUNK_SAMPLES` samples each until the session is torn down.
pub fn start_capture(
    sink: Sender<Vec<i16>>,
) -> Result<CaptureSession<CpalCaptureBackend>, String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| "no input device available".to_string())?;
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(CAPTURE_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: Vec<i16> = Vec::with_capacity(CAPTURE_CHUNK_SAMPLES * 2);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(f32_to_pcm16(sample));
                }
                while pending.len() >= CAPTURE_CHUNK_SAMPLES {
                    let chunk: Vec<i16> = pending.drain(..CAPTURE_CHUNK_SAMPLES).collect();
                    if sink.try_send(chunk).is_err() {
                        // Consumer gone or lagging; drop this chunk and keep
                        // capturing. The audio thread must not block.
                        break;
                    }
                }
            },
            |err| warn!(error = %err, "Capture stream error"),
            None,
        )
        .map_err(|err| err.to_string())?;
    stream.play().map_err(|err| err.to_string())?;

    Ok(CaptureSession::new(CpalCaptureBackend {
        stream: Some(stream),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct StepLog(Arc<Mutex<Vec<&'static str>>>);

    struct FakeBackend {
        log: StepLog,
        fail_on: Option<&'static str>,
    }

    impl FakeBackend {
        fn step(&mut self, name: &'static str) -> Result<(), String> {
            if self.fail_on == Some(name) {
                return Err(format!("{name} failed"));
            }
            self.log.0.lock().unwrap().push(name);
            Ok(())
        }
    }

    impl CaptureBackend for FakeBackend {
        fn disconnect_graph(&mut self) -> Result<(), String> {
            self.step("disconnect_graph")
        }

        fn stop_tracks(&mut self) -> Result<(), String> {
            self.step("stop_tracks")
        }

        fn close_context(&mut self) -> Result<(), String> {
            self.step("close_context")
        }
    }

    #[test]
    fn teardown_runs_all_steps_in_order() {
        let log = StepLog::default();
        let session = CaptureSession::new(FakeBackend {
            log: log.clone(),
            fail_on: None,
        });
        session.teardown().unwrap();
        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["disconnect_graph", "stop_tracks", "close_context"]
        );
    }

    #[test]
    fn failing_step_halts_the_sequence() {
        let log = StepLog::default();
        let session = CaptureSession::new(FakeBackend {
            log: log.clone(),
            fail_on: Some("stop_tracks"),
        });
        let err = session.teardown().unwrap_err();
        assert!(err.contains("stop_tracks"));
        // The device context was never closed behind the failure.
        assert_eq!(*log.0.lock().unwrap(), vec!["disconnect_graph"]);
    }
}
