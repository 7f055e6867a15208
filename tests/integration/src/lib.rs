//! Integration test utilities for syncplay
//!
//! This module provides common utilities for integration testing:
//! - A player fixture wired to the synthetic source and counting sinks
//! - An event recorder with blocking waits

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use syncplay::audio::NullAudioSink;
use syncplay::media::{SyntheticBackend, SyntheticConfig};
use syncplay::renderer::NullUploadSink;
use syncplay::{MediaPlayer, MediaPlayerBuilder, PlayerConfig, PlayerEvent, PlayerEventHandler, PlayerState};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(10);

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Records every event the player raises
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<PlayerEvent>>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<PlayerEvent> {
        self.events.lock().clone()
    }

    /// States entered, in order
    pub fn states(&self) -> Vec<PlayerState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PlayerEvent::StateChanged { new, .. } => Some(*new),
                _ => None,
            })
            .collect()
    }

    pub fn open_failures(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, PlayerEvent::OpenFailed { .. }))
            .count()
    }
}

struct EventLogHandler(EventLog);

impl PlayerEventHandler for EventLogHandler {
    fn handle_event(&mut self, event: PlayerEvent) {
        self.0.events.lock().push(event);
    }
}

/// Player over a synthetic source with observable sinks
pub struct PlayerFixture {
    pub player: MediaPlayer,
    pub events: EventLog,
    frames_uploaded: Arc<AtomicU64>,
    subtitles_shown: Arc<AtomicU64>,
    samples_played: Arc<AtomicU64>,
}

impl PlayerFixture {
    /// Build a player with the default player configuration
    pub fn new(source: SyntheticConfig) -> Result<Self> {
        Self::with_config(source, PlayerConfig::default())
    }

    pub fn with_config(source: SyntheticConfig, config: PlayerConfig) -> Result<Self> {
        let audio_sink = NullAudioSink::new();
        let upload_sink = NullUploadSink::new();
        let events = EventLog::default();

        let samples_played = audio_sink.samples_played_handle();
        let frames_uploaded = upload_sink.frames_uploaded();
        let subtitles_shown = upload_sink.subtitles_shown();

        let player = MediaPlayerBuilder::new()
            .with_config(config)
            .with_backend(Arc::new(SyntheticBackend::new(source)))
            .with_audio_sink(Box::new(audio_sink))
            .with_upload_sink(Box::new(upload_sink))
            .with_event_handler(Box::new(EventLogHandler(events.clone())))
            .build()?;

        Ok(Self {
            player,
            events,
            frames_uploaded,
            subtitles_shown,
            samples_played,
        })
    }

    /// Open and wait until the source is ready to play
    pub fn open(&self) -> Result<()> {
        self.player.open("synthetic")?;
        anyhow::ensure!(
            self.player.wait_for_state(PlayerState::Stoped, WAIT),
            "source did not open, state {}",
            self.player.state()
        );
        Ok(())
    }

    /// Open, start playback and wait for it to be reported
    pub fn open_and_play(&self) -> Result<()> {
        self.open()?;
        self.player.play()?;
        anyhow::ensure!(
            self.player.wait_for_state(PlayerState::Playing, WAIT),
            "playback did not start"
        );
        Ok(())
    }

    /// Wait until the master clock has passed `seconds`
    pub fn wait_for_position(&self, seconds: f64) -> bool {
        wait_until(WAIT, || self.player.position().is_some_and(|p| p >= seconds))
    }

    pub fn frames_uploaded(&self) -> u64 {
        self.frames_uploaded.load(Ordering::Relaxed)
    }

    pub fn subtitles_shown(&self) -> u64 {
        self.subtitles_shown.load(Ordering::Relaxed)
    }

    pub fn samples_played(&self) -> u64 {
        self.samples_played.load(Ordering::Relaxed)
    }
}
