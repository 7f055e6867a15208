//! Audio output module for syncplay
//!
//! This module owns the pull side of audio playback: the device (or a
//! stand-in) asks for samples through an [`AudioSink`] callback and the
//! [`AudioRenderer`] answers from the decoded sample queue, correcting the
//! sample count when audio follows another clock and anchoring the audio
//! clock to what the device is about to play. It also holds the clocks and
//! synchronization math shared with the video path.

pub mod clock;
#[cfg(feature = "cpal-output")]
pub mod cpal_output;
pub mod renderer;
pub mod resample;
pub mod sync;

pub use clock::Clock;
#[cfg(feature = "cpal-output")]
pub use cpal_output::CpalAudioSink;
pub use renderer::AudioRenderer;
pub use resample::Resampler;
pub use sync::{AudioSyncState, FrameDropPolicy, SyncType};

use crate::utils::error::{PlayerError, Result};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Bytes per interleaved f32 sample
pub const BYTES_PER_SAMPLE: usize = std::mem::size_of::<f32>();

/// Sample format delivered to sinks: interleaved 32-bit float
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Number of interleaved channels
    pub channels: u16,
}

impl AudioParams {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    /// Bytes in one sample frame (all channels)
    pub fn frame_size(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    pub fn bytes_per_sec(&self) -> usize {
        self.sample_rate as usize * self.frame_size()
    }
}

impl Default for AudioParams {
    fn default() -> Self {
        Self::new(48_000, 2)
    }
}

/// Format plus device buffer length, requested and obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub params: AudioParams,

    /// Device buffer length in sample frames
    pub buffer_samples: usize,
}

impl AudioSpec {
    /// Device buffer size in bytes
    pub fn hw_buf_size(&self) -> usize {
        self.buffer_samples * self.params.frame_size()
    }
}

/// Invoked from the sink's thread to fill an interleaved buffer
pub type AudioCallback = Box<dyn FnMut(&mut [f32]) + Send>;

/// Pull-based audio device
pub trait AudioSink: Send {
    /// Negotiate a format
    ///
    /// # Arguments
    ///
    /// * `wanted` - Format and buffer length the source would like
    ///
    /// # Returns
    ///
    /// The format the device actually runs at
    fn open(&mut self, wanted: AudioSpec) -> Result<AudioSpec>;

    /// Start pulling; `callback` runs on the device thread until `stop`
    fn start(&mut self, callback: AudioCallback) -> Result<()>;

    /// Stop pulling and release the callback
    fn stop(&mut self);
}

/// Sink that discards audio while pulling at real-time pace
///
/// Stands in for a device in headless runs and tests; the audio clock
/// behaves as with real hardware.
pub struct NullAudioSink {
    spec: Option<AudioSpec>,
    running: Arc<AtomicBool>,
    samples_played: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl NullAudioSink {
    pub fn new() -> Self {
        Self {
            spec: None,
            running: Arc::new(AtomicBool::new(false)),
            samples_played: Arc::new(AtomicU64::new(0)),
            thread: None,
        }
    }

    /// Sample frames handed out so far
    pub fn samples_played(&self) -> u64 {
        self.samples_played.load(Ordering::Relaxed)
    }

    /// Shared counter, readable after the sink moved into a player
    pub fn samples_played_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.samples_played)
    }
}

impl Default for NullAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullAudioSink {
    fn open(&mut self, wanted: AudioSpec) -> Result<AudioSpec> {
        if wanted.params.sample_rate == 0 || wanted.params.channels == 0 {
            return Err(PlayerError::Audio(format!("invalid audio format {:?}", wanted.params)));
        }
        self.spec = Some(wanted);
        Ok(wanted)
    }

    fn start(&mut self, mut callback: AudioCallback) -> Result<()> {
        let spec = self
            .spec
            .ok_or_else(|| PlayerError::Audio("null sink started before open".to_string()))?;
        self.stop();

        let period = Duration::from_secs_f64(spec.buffer_samples as f64 / spec.params.sample_rate as f64);
        let running = Arc::clone(&self.running);
        let played = Arc::clone(&self.samples_played);
        running.store(true, Ordering::Release);

        let thread = thread::Builder::new()
            .name("audio-null".to_string())
            .spawn(move || {
                let mut buffer = vec![0.0f32; spec.buffer_samples * spec.params.channels as usize];
                let started = Instant::now();
                let mut periods = 0u32;
                while running.load(Ordering::Acquire) {
                    callback(&mut buffer);
                    played.fetch_add(spec.buffer_samples as u64, Ordering::Relaxed);
                    periods += 1;
                    let deadline = started + period * periods;
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    }
                }
            })
            .map_err(|e| PlayerError::Audio(format!("failed to spawn audio thread: {}", e)))?;

        self.thread = Some(thread);
        debug!("null audio sink started ({:?})", spec);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("audio callback thread panicked");
            }
        }
    }
}

impl Drop for NullAudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_params() {
        let params = AudioParams::new(48_000, 2);
        assert_eq!(params.frame_size(), 8);
        assert_eq!(params.bytes_per_sec(), 384_000);

        let spec = AudioSpec {
            params,
            buffer_samples: 1024,
        };
        assert_eq!(spec.hw_buf_size(), 8192);
    }

    #[test]
    fn test_null_sink_pulls_in_real_time() {
        let mut sink = NullAudioSink::new();
        let spec = sink
            .open(AudioSpec {
                params: AudioParams::new(48_000, 2),
                buffer_samples: 480,
            })
            .unwrap();
        assert_eq!(spec.buffer_samples, 480);

        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        sink.start(Box::new(move |buffer| {
            assert_eq!(buffer.len(), 960);
            counter.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();

        thread::sleep(Duration::from_millis(105));
        sink.stop();

        // 10ms periods
        let calls = calls.load(Ordering::Relaxed);
        assert!((5..=20).contains(&calls), "unexpected call count {}", calls);
        assert_eq!(sink.samples_played(), calls * 480);
    }

    #[test]
    fn test_null_sink_requires_open() {
        let mut sink = NullAudioSink::new();
        assert!(sink.start(Box::new(|_| {})).is_err());
    }
}
