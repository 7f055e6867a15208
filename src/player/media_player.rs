//! High-level media player API for syncplay
//!
//! This module wraps the [`PlayerController`] event loop in a handle that
//! can be called from any thread. Commands are queued to the loop; state,
//! position and statistics are read from what the loop publishes, and
//! events are fanned out to subscribers.

use crate::audio::{AudioSink, FrameDropPolicy};
use crate::media::MediaBackend;
use crate::player::controller::{PlayerCommand, PlayerController, SharedState};
use crate::player::state::PlaybackSettings;
use crate::player::{PlaybackStats, PlayerConfig, PlayerEvent, PlayerEventHandler, PlayerState};
use crate::renderer::{NullUploadSink, UploadSink};
use crate::utils::error::{PlayerError, Result};
use crossbeam_channel::Sender;
use log::{error, info};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Media player builder for customized configuration
pub struct MediaPlayerBuilder {
    config: PlayerConfig,
    backend: Option<Arc<dyn MediaBackend>>,
    audio_sink: Option<Box<dyn AudioSink>>,
    upload_sink: Option<Box<dyn UploadSink>>,
    event_handlers: Vec<Box<dyn PlayerEventHandler>>,
}

impl MediaPlayerBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            config: PlayerConfig::default(),
            backend: None,
            audio_sink: None,
            upload_sink: None,
            event_handlers: Vec::new(),
        }
    }

    /// Set player configuration
    pub fn with_config(mut self, config: PlayerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the container/codec backend
    pub fn with_backend(mut self, backend: Arc<dyn MediaBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the audio device
    pub fn with_audio_sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.audio_sink = Some(sink);
        self
    }

    /// Set the picture presentation target
    pub fn with_upload_sink(mut self, sink: Box<dyn UploadSink>) -> Self {
        self.upload_sink = Some(sink);
        self
    }

    /// Add an event handler
    pub fn with_event_handler(mut self, handler: Box<dyn PlayerEventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    /// Build the media player
    pub fn build(self) -> Result<MediaPlayer> {
        MediaPlayer::new_with_builder(self)
    }
}

impl Default for MediaPlayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "ffmpeg")]
fn default_backend(config: &PlayerConfig) -> Result<Arc<dyn MediaBackend>> {
    Ok(Arc::new(
        crate::media::ffmpeg::FfmpegBackend::new()?.with_threads(config.decoder_threads),
    ))
}

#[cfg(not(feature = "ffmpeg"))]
fn default_backend(_config: &PlayerConfig) -> Result<Arc<dyn MediaBackend>> {
    Err(PlayerError::InvalidInput(
        "no media backend: build with the `ffmpeg` feature or supply one with `with_backend`".to_string(),
    ))
}

#[cfg(feature = "cpal-output")]
fn default_audio_sink() -> Box<dyn AudioSink> {
    Box::new(crate::audio::CpalAudioSink::new())
}

#[cfg(not(feature = "cpal-output"))]
fn default_audio_sink() -> Box<dyn AudioSink> {
    Box::new(crate::audio::NullAudioSink::new())
}

/// High-level media player
pub struct MediaPlayer {
    /// Command channel into the event loop
    commands: Sender<PlayerCommand>,

    /// State published by the event loop
    shared: Arc<SharedState>,

    /// Knobs read by the audio callback and the refresh tick
    settings: Arc<Mutex<PlaybackSettings>>,

    /// Event dispatcher
    event_dispatcher: Arc<EventDispatcher>,

    /// Event loop thread handle
    player_thread: Option<JoinHandle<()>>,
}

impl MediaPlayer {
    /// Create a new media player with default settings
    pub fn new() -> Result<Self> {
        MediaPlayerBuilder::new().build()
    }

    fn new_with_builder(builder: MediaPlayerBuilder) -> Result<Self> {
        info!("Initializing syncplay media player");

        let backend = match builder.backend {
            Some(backend) => backend,
            None => default_backend(&builder.config)?,
        };
        let audio_sink = builder.audio_sink.unwrap_or_else(default_audio_sink);
        let upload_sink = builder
            .upload_sink
            .unwrap_or_else(|| Box::new(NullUploadSink::new()));

        let mut controller = PlayerController::new(builder.config, backend, audio_sink, upload_sink);
        for handler in builder.event_handlers {
            controller.add_event_handler(handler);
        }

        let event_dispatcher = Arc::new(EventDispatcher::new());
        controller.add_event_handler(Box::new(EventDispatcherHandler {
            dispatcher: Arc::clone(&event_dispatcher),
        }));

        let commands = controller.sender();
        let shared = controller.shared();
        let settings = controller.settings();

        let player_thread = thread::Builder::new()
            .name("player-events".to_string())
            .spawn(move || controller.run())
            .map_err(|e| crate::internal_error!("failed to spawn player thread: {}", e))?;

        Ok(Self {
            commands,
            shared,
            settings,
            event_dispatcher,
            player_thread: Some(player_thread),
        })
    }

    fn send(&self, command: PlayerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| crate::internal_error!("player event loop has stopped"))
    }

    /// Open a source; the state becomes `Stoped` once it is ready
    pub fn open(&self, source: &str) -> Result<()> {
        self.send(PlayerCommand::Open(source.to_string()))
    }

    /// Start or resume playback
    pub fn play(&self) -> Result<()> {
        self.send(PlayerCommand::Play)
    }

    /// Pause playback
    pub fn pause(&self) -> Result<()> {
        self.send(PlayerCommand::Pause)
    }

    /// Pause and rewind to the start
    pub fn stop(&self) -> Result<()> {
        self.send(PlayerCommand::Stop)
    }

    /// Release the source and every playback thread
    pub fn close(&self) -> Result<()> {
        self.send(PlayerCommand::Close)
    }

    /// Seek to an absolute position in seconds
    pub fn seek(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() {
            return Err(PlayerError::InvalidInput(format!("invalid seek target {}", seconds)));
        }
        self.send(PlayerCommand::Seek(seconds))
    }

    /// Set the external clock speed
    pub fn set_speed(&self, speed: f64) -> Result<()> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(PlayerError::InvalidInput(format!("invalid playback speed {}", speed)));
        }
        self.send(PlayerCommand::SetSpeed(speed))
    }

    /// Get current playback state
    pub fn state(&self) -> PlayerState {
        self.shared.state()
    }

    /// Master clock in seconds, `None` while closed or before the first
    /// picture or sample is presented
    pub fn position(&self) -> Option<f64> {
        let ctx = self.shared.context.read().clone()?;
        let position = ctx.master_clock();
        (!position.is_nan()).then_some(position)
    }

    /// Pictures dropped so far, early and late
    pub fn frame_drop_count(&self) -> u64 {
        self.shared
            .context
            .read()
            .as_ref()
            .map_or(0, |ctx| ctx.frame_drop_count())
    }

    /// Statistics snapshot of the open source
    pub fn stats(&self) -> Option<PlaybackStats> {
        self.shared.context.read().as_ref().map(|ctx| ctx.stats())
    }

    /// Set volume (0.0 to 1.0)
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(PlayerError::InvalidInput(format!("volume {} out of range", volume)));
        }
        self.settings.lock().volume = volume;
        Ok(())
    }

    /// Get current volume
    pub fn volume(&self) -> f32 {
        self.settings.lock().volume
    }

    pub fn set_muted(&self, muted: bool) {
        self.settings.lock().muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.settings.lock().muted
    }

    pub fn set_frame_drop(&self, policy: FrameDropPolicy) {
        self.settings.lock().frame_drop = policy;
    }

    /// Block until the player reaches `state` or `timeout` elapses
    pub fn wait_for_state(&self, state: PlayerState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() == state {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Subscribe to events
    ///
    /// The callback runs on the event-loop thread; the subscription ends
    /// when the returned handle is dropped.
    pub fn subscribe_events<F>(&self, callback: F) -> EventSubscription
    where
        F: Fn(PlayerEvent) + Send + Sync + 'static,
    {
        self.event_dispatcher.subscribe(callback)
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        let _ = self.commands.send(PlayerCommand::Shutdown);
        if let Some(thread) = self.player_thread.take() {
            if thread.join().is_err() {
                error!("player event loop panicked");
            }
        }
    }
}

type Subscriber = Box<dyn Fn(PlayerEvent) + Send + Sync>;
type SubscriberList = Arc<RwLock<Vec<(u64, Subscriber)>>>;

/// Event dispatcher
struct EventDispatcher {
    subscribers: SubscriberList,
    next_id: AtomicU64,
}

impl EventDispatcher {
    fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    fn subscribe<F>(&self, callback: F) -> EventSubscription
    where
        F: Fn(PlayerEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, Box::new(callback)));

        EventSubscription {
            id,
            dispatcher: Arc::clone(&self.subscribers),
        }
    }

    fn dispatch(&self, event: PlayerEvent) {
        let subs = self.subscribers.read();
        for (_, callback) in subs.iter() {
            callback(event.clone());
        }
    }
}

/// Event dispatcher handler for PlayerController
struct EventDispatcherHandler {
    dispatcher: Arc<EventDispatcher>,
}

impl PlayerEventHandler for EventDispatcherHandler {
    fn handle_event(&mut self, event: PlayerEvent) {
        self.dispatcher.dispatch(event);
    }
}

/// Event subscription handle
pub struct EventSubscription {
    id: u64,
    dispatcher: SubscriberList,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.dispatcher.write().retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullAudioSink;
    use crate::media::{SyntheticBackend, SyntheticConfig};

    fn player() -> MediaPlayer {
        MediaPlayerBuilder::new()
            .with_backend(Arc::new(SyntheticBackend::new(SyntheticConfig::default())))
            .with_audio_sink(Box::new(NullAudioSink::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_dispatcher_unsubscribes_on_drop() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let subscription = dispatcher.subscribe(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let event = PlayerEvent::StateChanged {
            old: PlayerState::Closed,
            new: PlayerState::Stoped,
        };
        dispatcher.dispatch(event.clone());
        drop(subscription);
        dispatcher.dispatch(event);

        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_settings_validation() {
        let player = player();
        assert!(player.set_volume(1.5).is_err());
        player.set_volume(0.25).unwrap();
        assert_eq!(player.volume(), 0.25);

        player.set_muted(true);
        assert!(player.is_muted());

        assert!(player.seek(f64::NAN).is_err());
        assert!(player.set_speed(0.0).is_err());
    }

    #[test]
    fn test_closed_player_reports_nothing() {
        let player = player();
        assert_eq!(player.state(), PlayerState::Closed);
        assert_eq!(player.position(), None);
        assert_eq!(player.frame_drop_count(), 0);
        assert!(player.stats().is_none());
    }

    #[cfg(not(feature = "ffmpeg"))]
    #[test]
    fn test_build_requires_backend() {
        assert!(matches!(MediaPlayer::new(), Err(PlayerError::InvalidInput(_))));
    }

    #[test]
    fn test_open_reaches_stopped() {
        let player = player();
        player.open("clip").unwrap();
        assert!(player.wait_for_state(PlayerState::Stoped, Duration::from_secs(2)));
        player.close().unwrap();
        assert!(player.wait_for_state(PlayerState::Closed, Duration::from_secs(2)));
    }
}
