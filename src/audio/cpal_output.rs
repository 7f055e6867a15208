//! CPAL audio output for syncplay
//!
//! Implements [`AudioSink`] on the default output device. The cpal stream
//! is not `Send` on every platform, so it is built, played and dropped on
//! a dedicated thread that parks until `stop` is requested.

use crate::audio::{AudioCallback, AudioParams, AudioSink, AudioSpec};
use crate::utils::error::{IntoPlayerError, PlayerError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use log::{error, info, warn};
use std::thread::{self, JoinHandle};

/// Audio sink on the system's default output device
pub struct CpalAudioSink {
    spec: Option<AudioSpec>,
    sample_format: SampleFormat,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalAudioSink {
    pub fn new() -> Self {
        Self {
            spec: None,
            sample_format: SampleFormat::F32,
            stop_tx: None,
            thread: None,
        }
    }
}

impl Default for CpalAudioSink {
    fn default() -> Self {
        Self::new()
    }
}

fn default_device() -> Result<cpal::Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| PlayerError::Audio("No default output device found".to_string()))
}

impl AudioSink for CpalAudioSink {
    fn open(&mut self, wanted: AudioSpec) -> Result<AudioSpec> {
        let device = default_device()?;
        let supported = device
            .default_output_config()
            .audio_err("Failed to query output config")?;

        let spec = AudioSpec {
            params: AudioParams::new(supported.sample_rate().0, supported.channels()),
            buffer_samples: wanted.buffer_samples,
        };
        self.sample_format = supported.sample_format();
        if spec.params != wanted.params {
            info!(
                "device runs at {} Hz/{} ch, converting from {} Hz/{} ch",
                spec.params.sample_rate, spec.params.channels, wanted.params.sample_rate, wanted.params.channels
            );
        }
        self.spec = Some(spec);
        Ok(spec)
    }

    fn start(&mut self, mut callback: AudioCallback) -> Result<()> {
        let spec = self
            .spec
            .ok_or_else(|| PlayerError::Audio("audio sink started before open".to_string()))?;
        self.stop();

        let sample_format = self.sample_format;
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

        let thread = thread::Builder::new()
            .name("audio-cpal".to_string())
            .spawn(move || {
                let config = StreamConfig {
                    channels: spec.params.channels,
                    sample_rate: cpal::SampleRate(spec.params.sample_rate),
                    buffer_size: cpal::BufferSize::Fixed(spec.buffer_samples as u32),
                };
                let on_error = |err: cpal::StreamError| error!("Audio stream error: {}", err);

                let built = default_device().and_then(|device| match sample_format {
                    SampleFormat::F32 => device
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| callback(data),
                            on_error,
                            None,
                        )
                        .audio_err("Failed to create audio stream"),
                    SampleFormat::I16 => {
                        let mut scratch = Vec::new();
                        device
                            .build_output_stream(
                                &config,
                                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                                    scratch.resize(data.len(), 0.0f32);
                                    callback(&mut scratch);
                                    for (dst, src) in data.iter_mut().zip(&scratch) {
                                        *dst = i16::from_sample(*src);
                                    }
                                },
                                on_error,
                                None,
                            )
                            .audio_err("Failed to create audio stream")
                    }
                    other => Err(PlayerError::Audio(format!("unsupported sample format {:?}", other))),
                });

                let stream = match built.and_then(|stream| {
                    stream.play().audio_err("Failed to start audio stream")?;
                    Ok(stream)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| PlayerError::Audio(format!("failed to spawn audio thread: {}", e)))?;

        let ready = ready_rx
            .recv()
            .map_err(|_| PlayerError::Audio("audio thread exited during startup".to_string()))?;
        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("cpal audio thread panicked");
            }
        }
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        self.stop();
    }
}
