//! Audio pull path
//!
//! The sink calls back whenever the device wants more samples. Each call
//! drains converted samples from the current frame, decodes the next one
//! from the sample queue when it runs out, and finally re-anchors the
//! audio clock at the time the device will actually play what it was given.

use crate::audio::{AudioParams, AudioSink, AudioSpec, AudioSyncState, Resampler, SyncType};
use crate::media::StreamDescriptor;
use crate::player::state::PlaybackContext;
use crate::utils::error::Result;
use crate::utils::now_seconds;
use log::{debug, info, trace};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Silence handed out when nothing could be decoded, in bytes
const SILENCE_BYTES: usize = 512;
/// Gain below which output is treated as muted
const MIN_AUDIBLE_VOLUME: f32 = 1e-7;

/// Owns the audio sink across playback sessions
pub struct AudioRenderer {
    sink: Box<dyn AudioSink>,
    spec: Option<AudioSpec>,
    running: bool,
}

impl AudioRenderer {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            sink,
            spec: None,
            running: false,
        }
    }

    /// Negotiate the device format for `stream`
    pub fn open(&mut self, stream: &StreamDescriptor, buffer_samples: usize) -> Result<AudioSpec> {
        self.stop();
        let wanted = AudioSpec {
            params: AudioParams::new(stream.sample_rate, stream.channels),
            buffer_samples,
        };
        let spec = self.sink.open(wanted)?;
        info!(
            "audio output: {} Hz, {} channels, {} sample buffer",
            spec.params.sample_rate, spec.params.channels, spec.buffer_samples
        );
        self.spec = Some(spec);
        Ok(spec)
    }

    /// Start pulling from `ctx`; a no-op while already running
    pub fn start(&mut self, ctx: Arc<PlaybackContext>) -> Result<()> {
        if self.running {
            return Ok(());
        }
        let Some(spec) = self.spec else {
            return Ok(());
        };
        let mut fill = AudioFill::new(ctx, spec);
        self.sink.start(Box::new(move |out| fill.fill(out)))?;
        self.running = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.running {
            self.sink.stop();
            self.running = false;
            debug!("audio output stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// State owned by the device callback
pub(crate) struct AudioFill {
    ctx: Arc<PlaybackContext>,
    target: AudioParams,
    hw_buf_size: usize,
    sync: AudioSyncState,
    resampler: Resampler,
    buf: Vec<f32>,
    buf_index: usize,
    audio_clock: f64,
    audio_clock_serial: i32,
    callback_time: f64,
}

impl AudioFill {
    pub(crate) fn new(ctx: Arc<PlaybackContext>, spec: AudioSpec) -> Self {
        let hw_buf_size = spec.hw_buf_size();
        let threshold = hw_buf_size as f64 / spec.params.bytes_per_sec() as f64;
        Self {
            ctx,
            target: spec.params,
            hw_buf_size,
            sync: AudioSyncState::new(threshold),
            resampler: Resampler::new(),
            buf: Vec::new(),
            buf_index: 0,
            audio_clock: f64::NAN,
            audio_clock_serial: -1,
            callback_time: 0.0,
        }
    }

    /// Fill `out` with interleaved samples
    pub(crate) fn fill(&mut self, out: &mut [f32]) {
        self.callback_time = now_seconds();
        let settings = *self.ctx.settings.lock();
        let audible = !settings.muted && settings.volume > MIN_AUDIBLE_VOLUME;

        let mut written = 0;
        while written < out.len() {
            if self.buf_index >= self.buf.len() {
                if self.decode_frame(settings.volume).is_none() {
                    // output silence while starved or paused
                    let frames = SILENCE_BYTES / self.target.frame_size();
                    self.buf.clear();
                    self.buf.resize(frames.max(1) * self.target.channels as usize, 0.0);
                }
                self.buf_index = 0;
            }

            let len = (out.len() - written).min(self.buf.len() - self.buf_index);
            let dst = &mut out[written..written + len];
            if audible {
                dst.copy_from_slice(&self.buf[self.buf_index..self.buf_index + len]);
            } else {
                dst.fill(0.0);
            }
            written += len;
            self.buf_index += len;
        }

        let write_buf_size = (self.buf.len() - self.buf_index) * std::mem::size_of::<f32>();
        if !self.audio_clock.is_nan() {
            let latency = (2 * self.hw_buf_size + write_buf_size) as f64 / self.target.bytes_per_sec() as f64;
            self.ctx
                .audclk
                .set_at(self.audio_clock - latency, self.audio_clock_serial, self.callback_time);
            self.ctx.sync_external_clock();
        }
    }

    /// Convert the next current-serial frame into `buf`; `None` when paused
    /// or when nothing arrives within half a device buffer
    fn decode_frame(&mut self, volume: f32) -> Option<()> {
        let ctx = Arc::clone(&self.ctx);
        if ctx.is_paused() {
            return None;
        }

        let starve_limit = self.hw_buf_size as f64 / self.target.bytes_per_sec() as f64 / 2.0;
        loop {
            while ctx.sampq.remaining() == 0 {
                if now_seconds() - self.callback_time > starve_limit || ctx.audioq.is_aborted() {
                    return None;
                }
                thread::sleep(Duration::from_millis(1));
            }

            let frame = ctx.sampq.peek_readable()?;
            if frame.serial != ctx.audioq.serial() {
                drop(frame);
                ctx.sampq.next();
                continue;
            }

            let Some(samples) = frame.payload.as_audio() else {
                drop(frame);
                ctx.sampq.next();
                continue;
            };

            let wanted = self.synchronize(samples.nb_samples, samples.sample_rate);
            self.resampler
                .convert(samples, wanted, self.target, volume, &mut self.buf);

            self.audio_clock = if frame.pts.is_nan() {
                f64::NAN
            } else {
                frame.pts + samples.nb_samples as f64 / samples.sample_rate as f64
            };
            self.audio_clock_serial = frame.serial;
            drop(frame);
            ctx.sampq.next();

            if self.buf.is_empty() {
                continue;
            }
            return Some(());
        }
    }

    /// Sample count to produce when audio follows another clock
    fn synchronize(&mut self, nb_samples: usize, sample_rate: u32) -> usize {
        if self.ctx.master_sync_type() == SyncType::Audio {
            return nb_samples;
        }
        let diff = self.ctx.audclk.get() - self.ctx.master_clock();
        let wanted = self.sync.wanted_samples(nb_samples, diff, sample_rate);
        trace!("audio: nb={} wanted={} diff={:.4}", nb_samples, wanted, diff);
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::frame::{AudioSamples, FramePayload};
    use crate::player::state::tests::context_with;

    fn push_samples(ctx: &PlaybackContext, pts: f64, value: f32) {
        let mut slot = ctx.sampq.peek_writable().unwrap();
        slot.pts = pts;
        slot.serial = ctx.audioq.serial();
        slot.duration = 256.0 / 48_000.0;
        slot.payload = FramePayload::Audio(AudioSamples {
            sample_rate: 48_000,
            channels: 2,
            nb_samples: 256,
            data: vec![value; 512],
        });
        drop(slot);
        ctx.sampq.push();
    }

    fn spec() -> AudioSpec {
        AudioSpec {
            params: AudioParams::new(48_000, 2),
            buffer_samples: 256,
        }
    }

    #[test]
    fn test_fill_copies_samples_and_sets_clock() {
        let (ctx, _rx) = context_with(true, false, 1);
        ctx.audioq.start();
        push_samples(&ctx, 1.0, 0.25);

        let mut fill = AudioFill::new(Arc::clone(&ctx), spec());
        let mut out = vec![0.0f32; 512];
        fill.fill(&mut out);

        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        // frame end minus two device buffers of latency
        let expected = 1.0 + 256.0 / 48_000.0 - 2.0 * 256.0 / 48_000.0;
        assert!((ctx.audclk.pts() - expected).abs() < 1e-9);
        assert_eq!(ctx.audclk.serial(), ctx.audioq.serial());
    }

    #[test]
    fn test_fill_outputs_silence_when_muted() {
        let (ctx, _rx) = context_with(true, false, 1);
        ctx.audioq.start();
        ctx.settings.lock().muted = true;
        push_samples(&ctx, 0.0, 0.5);

        let mut fill = AudioFill::new(Arc::clone(&ctx), spec());
        let mut out = vec![1.0f32; 512];
        fill.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        // the clock still advances
        assert!(!ctx.audclk.pts().is_nan());
    }

    #[test]
    fn test_fill_skips_stale_frames() {
        let (ctx, _rx) = context_with(true, false, 1);
        ctx.audioq.start();
        push_samples(&ctx, 5.0, 0.9);
        ctx.audioq.flush();
        push_samples(&ctx, 0.0, 0.1);

        let mut fill = AudioFill::new(Arc::clone(&ctx), spec());
        let mut out = vec![0.0f32; 512];
        fill.fill(&mut out);
        assert!(out.iter().all(|&s| (s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_starved_fill_is_silent() {
        let (ctx, _rx) = context_with(true, false, 1);
        ctx.audioq.start();

        let mut fill = AudioFill::new(Arc::clone(&ctx), spec());
        let mut out = vec![1.0f32; 256];
        fill.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(ctx.audclk.pts().is_nan());
    }
}
