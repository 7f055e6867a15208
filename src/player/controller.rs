//! Player event loop for syncplay
//!
//! The [`PlayerController`] runs on its own thread and is the only place
//! the player state changes. Public commands and the internal events
//! posted by the demuxer and the refresh tick arrive on one channel and
//! are handled strictly in order.

use crate::audio::{AudioRenderer, AudioSink};
use crate::decoder::{self, CodecSession, DecoderCore, DecoderHandle};
use crate::media::{InterruptCallback, MediaBackend, MediaSource, StreamDescriptor, TIME_BASE_US};
use crate::player::demuxer;
use crate::player::state::{ContextParams, PlaybackContext, PlaybackSettings};
use crate::player::{PlayerConfig, PlayerEvent, PlayerEventHandler, PlayerState};
use crate::renderer::{UploadSink, VideoRefresher};
use crate::utils::error::Result;
use crate::utils::{format_position, now_seconds};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Idle wait of the event loop between commands
const EVENT_WAIT: Duration = Duration::from_millis(10);
/// Seconds between status lines
const STATUS_INTERVAL: f64 = 1.0;

/// Commands handled by the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Open(String),
    Play,
    Pause,
    Stop,
    /// Absolute position in seconds
    Seek(f64),
    /// External clock speed
    SetSpeed(f64),
    Close,
    /// Posted by the demuxer once everything has been presented
    Ended,
    /// Posted by the demuxer after a seek while paused
    Step,
    /// Posted by the refresh tick once the stepped picture is shown
    StepDone,
    /// Close and leave the event loop
    Shutdown,
}

/// State the event loop publishes for readers on other threads
pub(crate) struct SharedState {
    pub(crate) state: RwLock<PlayerState>,
    pub(crate) context: RwLock<Option<Arc<PlaybackContext>>>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            state: RwLock::new(PlayerState::Closed),
            context: RwLock::new(None),
        }
    }

    pub(crate) fn state(&self) -> PlayerState {
        *self.state.read()
    }
}

/// Threads and context of one opened source
struct Session {
    source: String,
    ctx: Arc<PlaybackContext>,
    interrupted: Arc<AtomicBool>,
    video: Option<DecoderHandle>,
    audio: Option<DecoderHandle>,
    subtitle: Option<DecoderHandle>,
    demuxer: Option<JoinHandle<()>>,
}

/// Owns the state machine and every playback resource
pub struct PlayerController {
    config: PlayerConfig,
    backend: Arc<dyn MediaBackend>,
    audio: AudioRenderer,
    video: VideoRefresher,
    handlers: Vec<Box<dyn PlayerEventHandler>>,
    shared: Arc<SharedState>,
    settings: Arc<Mutex<PlaybackSettings>>,
    sender: Sender<PlayerCommand>,
    receiver: Receiver<PlayerCommand>,
    session: Option<Session>,
    state: PlayerState,
    last_status: f64,
}

impl PlayerController {
    pub fn new(
        config: PlayerConfig,
        backend: Arc<dyn MediaBackend>,
        audio_sink: Box<dyn AudioSink>,
        upload_sink: Box<dyn UploadSink>,
    ) -> Self {
        let (sender, receiver) = unbounded();
        let settings = PlaybackSettings {
            volume: config.volume,
            muted: config.muted,
            frame_drop: config.frame_drop,
        };
        Self {
            config,
            backend,
            audio: AudioRenderer::new(audio_sink),
            video: VideoRefresher::new(upload_sink),
            handlers: Vec::new(),
            shared: Arc::new(SharedState::new()),
            settings: Arc::new(Mutex::new(settings)),
            sender,
            receiver,
            session: None,
            state: PlayerState::Closed,
            last_status: 0.0,
        }
    }

    pub fn add_event_handler(&mut self, handler: Box<dyn PlayerEventHandler>) {
        self.handlers.push(handler);
    }

    /// Channel into the event loop
    pub fn sender(&self) -> Sender<PlayerCommand> {
        self.sender.clone()
    }

    pub fn settings(&self) -> Arc<Mutex<PlaybackSettings>> {
        Arc::clone(&self.settings)
    }

    pub(crate) fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    /// Handle commands until `Shutdown`
    pub fn run(mut self) {
        info!("player event loop started");
        loop {
            match self.receiver.recv_timeout(EVENT_WAIT) {
                Ok(PlayerCommand::Shutdown) => break,
                Ok(command) => self.handle_command(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.show_status();
        }
        self.close();
        info!("player event loop stopped");
    }

    fn handle_command(&mut self, command: PlayerCommand) {
        debug!("command {:?} in state {}", command, self.state);
        match command {
            PlayerCommand::Open(source) => self.open(source),
            PlayerCommand::Play => self.play(),
            PlayerCommand::Pause => {
                if self.state == PlayerState::Playing {
                    self.set_paused(true, true);
                }
            }
            PlayerCommand::Stop => self.stop(),
            PlayerCommand::Seek(seconds) => {
                if let Some(ctx) = self.context() {
                    let target = (seconds.max(0.0) * TIME_BASE_US as f64) as i64;
                    if !ctx.request_seek(target) {
                        debug!("seek to {:.3}s ignored, another seek is pending", seconds);
                    }
                }
            }
            PlayerCommand::SetSpeed(speed) => {
                if let Some(ctx) = self.context() {
                    ctx.extclk.set_speed(speed);
                }
            }
            PlayerCommand::Close => self.close(),
            PlayerCommand::Ended => {
                if self.state != PlayerState::Closed {
                    self.set_state(PlayerState::Ended);
                }
            }
            PlayerCommand::Step => {
                if let Some(ctx) = self.context() {
                    // a Play queued ahead of the step already resumed playback
                    if ctx.is_paused() && ctx.has_video() && self.video.is_running() {
                        ctx.step_to_next_frame();
                    }
                }
            }
            PlayerCommand::StepDone => {
                if let Some(ctx) = self.context() {
                    if ctx.is_stepping() && !ctx.is_paused() {
                        ctx.stream_toggle_pause();
                    }
                    ctx.set_step(false);
                }
            }
            PlayerCommand::Shutdown => {}
        }
    }

    fn context(&self) -> Option<Arc<PlaybackContext>> {
        self.session.as_ref().map(|session| Arc::clone(&session.ctx))
    }

    fn set_state(&mut self, new: PlayerState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        *self.shared.state.write() = new;
        info!("state {} -> {}", old, new);
        self.dispatch(PlayerEvent::StateChanged { old, new });
    }

    fn dispatch(&mut self, event: PlayerEvent) {
        for handler in &mut self.handlers {
            handler.handle_event(event.clone());
        }
    }

    fn open(&mut self, source: String) {
        if self.state != PlayerState::Closed {
            self.close();
        }

        info!("opening {}", source);
        match self.stream_open(&source) {
            Ok(session) => {
                *self.shared.context.write() = Some(Arc::clone(&session.ctx));
                self.session = Some(session);
                self.last_status = now_seconds();
                self.set_state(PlayerState::Stoped);
            }
            Err(e) => {
                error!("failed to open {}: {}", source, e);
                self.dispatch(PlayerEvent::OpenFailed {
                    source,
                    message: e.to_string(),
                });
            }
        }
    }

    fn stream_open(&mut self, name: &str) -> Result<Session> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        let interrupt: InterruptCallback = Arc::new(move || flag.load(Ordering::Acquire));

        let source = self.backend.open(name, interrupt)?;
        let streams = demuxer::select_streams(source.as_ref(), self.config.audio_disabled, self.config.subtitles_disabled)?;

        let ctx = Arc::new(PlaybackContext::new(ContextParams {
            streams,
            sync_type: self.config.sync,
            loop_count: self.config.loop_count,
            autoexit: self.config.autoexit,
            realtime: source.is_realtime(),
            discontinuous_timestamps: source.has_timestamp_discontinuities(),
            settings: Arc::clone(&self.settings),
            events: self.sender.clone(),
        }));
        debug!("master clock: {:?}", ctx.master_sync_type());

        let mut session = Session {
            source: name.to_string(),
            ctx,
            interrupted,
            video: None,
            audio: None,
            subtitle: None,
            demuxer: None,
        };

        if let Err(e) = self.start_components(&mut session, source) {
            self.stream_close(session);
            return Err(e);
        }
        Ok(session)
    }

    fn start_components(&mut self, session: &mut Session, source: Box<dyn MediaSource>) -> Result<()> {
        let ctx = Arc::clone(&session.ctx);

        if let Some(stream) = ctx.streams.audio.clone() {
            self.audio.open(&stream, self.config.audio_buffer_samples)?;
            let mut core = self.decoder_core(source.as_ref(), &stream, &ctx, "audio")?;
            if source.lacks_generic_seek() {
                core.set_start_pts(stream.start_time, stream.time_base);
            }
            let thread_ctx = Arc::clone(&ctx);
            session.audio = Some(DecoderHandle::spawn("audio-decoder", Arc::clone(&ctx.audioq), move || {
                decoder::audio::run(thread_ctx, core)
            })?);
        }

        if let Some(stream) = ctx.streams.video.clone() {
            let core = self.decoder_core(source.as_ref(), &stream, &ctx, "video")?;
            let thread_ctx = Arc::clone(&ctx);
            session.video = Some(DecoderHandle::spawn("video-decoder", Arc::clone(&ctx.videoq), move || {
                decoder::video::run(thread_ctx, core, stream)
            })?);
        }

        if let Some(stream) = ctx.streams.subtitle.clone() {
            let core = self.decoder_core(source.as_ref(), &stream, &ctx, "subtitle")?;
            let thread_ctx = Arc::clone(&ctx);
            session.subtitle = Some(DecoderHandle::spawn("subtitle-decoder", Arc::clone(&ctx.subtitleq), move || {
                decoder::subtitle::run(thread_ctx, core, stream)
            })?);
        }

        session.demuxer = Some(demuxer::spawn(ctx, source)?);
        Ok(())
    }

    fn decoder_core(
        &self,
        source: &dyn MediaSource,
        stream: &StreamDescriptor,
        ctx: &PlaybackContext,
        label: &str,
    ) -> Result<DecoderCore> {
        let factory = source.codec_factory(stream.index)?;
        let codec = CodecSession::open(factory, self.config.hardware_acceleration, label)?;
        let (queue, finished) = match label {
            "audio" => (&ctx.audioq, &ctx.auddec_finished),
            "video" => (&ctx.videoq, &ctx.viddec_finished),
            _ => (&ctx.subtitleq, &ctx.subdec_finished),
        };
        Ok(DecoderCore::new(
            codec,
            stream,
            Arc::clone(queue),
            Arc::clone(&ctx.continue_read),
            Arc::clone(finished),
            self.config.reorder_pts,
        ))
    }

    /// Stop presentation, join every thread and free the queues
    fn stream_close(&mut self, mut session: Session) {
        self.audio.stop();
        self.video.stop();

        let ctx = Arc::clone(&session.ctx);
        ctx.abort();
        session.interrupted.store(true, Ordering::Release);

        if let Some(thread) = session.demuxer.take() {
            if thread.join().is_err() {
                error!("demuxer thread panicked");
            }
        }
        if let Some(mut handle) = session.audio.take() {
            handle.abort(&ctx.sampq);
        }
        if let Some(mut handle) = session.video.take() {
            handle.abort(&ctx.pictq);
        }
        if let Some(mut handle) = session.subtitle.take() {
            handle.abort(&ctx.subpq);
        }

        ctx.destroy_queues();
        debug!("closed {}", session.source);
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            *self.shared.context.write() = None;
            self.stream_close(session);
        }
        self.set_state(PlayerState::Closed);
    }

    /// Pause or resume, cancelling any pending step; with `raise` the
    /// state follows
    fn set_paused(&mut self, paused: bool, raise: bool) {
        let Some(ctx) = self.context() else {
            return;
        };
        if ctx.is_paused() != paused {
            ctx.stream_toggle_pause();
        }
        ctx.set_step(false);
        if raise {
            self.set_state(if ctx.is_paused() {
                PlayerState::Paused
            } else {
                PlayerState::Playing
            });
        }
    }

    fn play(&mut self) {
        match self.state {
            PlayerState::Paused => self.set_paused(false, true),
            PlayerState::Stoped => {
                let Some(ctx) = self.context() else {
                    return;
                };
                self.set_paused(false, false);
                if ctx.has_audio() {
                    if let Err(e) = self.audio.start(Arc::clone(&ctx)) {
                        error!("audio output failed to start: {}", e);
                    }
                }
                if ctx.has_video() {
                    if let Err(e) = self.video.start(Arc::clone(&ctx)) {
                        error!("video refresh failed to start: {}", e);
                    }
                }
                self.set_state(PlayerState::Playing);
            }
            _ => {}
        }
    }

    fn stop(&mut self) {
        if matches!(self.state, PlayerState::Closed | PlayerState::Stoped) {
            return;
        }
        let Some(ctx) = self.context() else {
            return;
        };
        // pause first so the demuxer steps to the rewound picture
        self.set_paused(true, false);
        ctx.request_seek(0);
        self.set_state(PlayerState::Stoped);
    }

    fn show_status(&mut self) {
        if !self.config.show_status || !matches!(self.state, PlayerState::Playing | PlayerState::Paused) {
            return;
        }
        let now = now_seconds();
        if now - self.last_status < STATUS_INTERVAL {
            return;
        }
        self.last_status = now;

        let Some(ctx) = self.context() else {
            return;
        };
        let stats = ctx.stats();
        info!(
            "{} A-V:{:+.3} fd={} aq={}KB vq={}KB sq={}B",
            format_position(stats.position),
            stats.av_diff,
            stats.frame_drops(),
            stats.audio_queue.size / 1024,
            stats.video_queue.size / 1024,
            stats.subtitle_queue.size
        );
    }
}

impl Drop for PlayerController {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("player dropped while open, closing {}", session.source);
            self.stream_close(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullAudioSink;
    use crate::media::{SyntheticBackend, SyntheticConfig};
    use crate::renderer::NullUploadSink;

    struct Recorder(Arc<Mutex<Vec<PlayerEvent>>>);

    impl PlayerEventHandler for Recorder {
        fn handle_event(&mut self, event: PlayerEvent) {
            self.0.lock().push(event);
        }
    }

    fn controller(config: SyntheticConfig) -> (PlayerController, Arc<Mutex<Vec<PlayerEvent>>>) {
        let mut controller = PlayerController::new(
            PlayerConfig::default(),
            Arc::new(SyntheticBackend::new(config)),
            Box::new(NullAudioSink::new()),
            Box::new(NullUploadSink::new()),
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        controller.add_event_handler(Box::new(Recorder(Arc::clone(&events))));
        (controller, events)
    }

    fn transitions(events: &Mutex<Vec<PlayerEvent>>) -> Vec<(PlayerState, PlayerState)> {
        events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PlayerEvent::StateChanged { old, new } => Some((*old, *new)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_open_play_pause_close() {
        let (mut controller, events) = controller(SyntheticConfig::default());

        controller.handle_command(PlayerCommand::Open("clip".to_string()));
        assert_eq!(controller.state, PlayerState::Stoped);
        assert_eq!(controller.shared().state(), PlayerState::Stoped);

        // pause is only honored while playing
        controller.handle_command(PlayerCommand::Pause);
        assert_eq!(controller.state, PlayerState::Stoped);

        controller.handle_command(PlayerCommand::Play);
        assert_eq!(controller.state, PlayerState::Playing);
        assert!(controller.video.is_running());
        assert!(controller.audio.is_running());

        controller.handle_command(PlayerCommand::Pause);
        assert_eq!(controller.state, PlayerState::Paused);
        assert!(controller.context().unwrap().is_paused());

        controller.handle_command(PlayerCommand::Play);
        assert_eq!(controller.state, PlayerState::Playing);

        controller.handle_command(PlayerCommand::Close);
        assert_eq!(controller.state, PlayerState::Closed);
        assert!(controller.shared.context.read().is_none());
        assert!(!controller.video.is_running());

        assert_eq!(
            transitions(&events),
            vec![
                (PlayerState::Closed, PlayerState::Stoped),
                (PlayerState::Stoped, PlayerState::Playing),
                (PlayerState::Playing, PlayerState::Paused),
                (PlayerState::Paused, PlayerState::Playing),
                (PlayerState::Playing, PlayerState::Closed),
            ]
        );
    }

    #[test]
    fn test_stop_pauses_and_rewinds() {
        let (mut controller, _events) = controller(SyntheticConfig::default());
        controller.handle_command(PlayerCommand::Open("clip".to_string()));

        // ignored while already stopped
        controller.handle_command(PlayerCommand::Stop);
        assert!(!controller.context().unwrap().is_paused());

        controller.handle_command(PlayerCommand::Play);
        controller.handle_command(PlayerCommand::Stop);
        assert_eq!(controller.state, PlayerState::Stoped);
        assert!(controller.context().unwrap().is_paused());

        controller.handle_command(PlayerCommand::Play);
        assert_eq!(controller.state, PlayerState::Playing);
        assert!(!controller.context().unwrap().is_paused());
        controller.handle_command(PlayerCommand::Close);
    }

    #[test]
    fn test_open_failure_stays_closed() {
        let (mut controller, events) = controller(SyntheticConfig {
            fail_open: true,
            ..Default::default()
        });
        controller.handle_command(PlayerCommand::Open("broken".to_string()));

        assert_eq!(controller.state, PlayerState::Closed);
        assert!(controller.session.is_none());
        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PlayerEvent::OpenFailed { source, .. } if source == "broken"));
    }

    #[test]
    fn test_step_done_repauses() {
        let (mut controller, _events) = controller(SyntheticConfig::default());
        controller.handle_command(PlayerCommand::Open("clip".to_string()));
        controller.handle_command(PlayerCommand::Play);
        controller.handle_command(PlayerCommand::Pause);

        let ctx = controller.context().unwrap();
        controller.handle_command(PlayerCommand::Step);
        assert!(ctx.is_stepping());
        assert!(!ctx.is_paused());

        controller.handle_command(PlayerCommand::StepDone);
        assert!(!ctx.is_stepping());
        assert!(ctx.is_paused());
        assert_eq!(controller.state, PlayerState::Paused);
        controller.handle_command(PlayerCommand::Close);
    }

    #[test]
    fn test_play_during_step_keeps_running() {
        let (mut controller, _events) = controller(SyntheticConfig::default());
        controller.handle_command(PlayerCommand::Open("clip".to_string()));
        controller.handle_command(PlayerCommand::Play);
        controller.handle_command(PlayerCommand::Pause);

        let ctx = controller.context().unwrap();
        controller.handle_command(PlayerCommand::Step);
        controller.handle_command(PlayerCommand::Play);
        assert_eq!(controller.state, PlayerState::Playing);
        assert!(!ctx.is_stepping());

        // the refresh tick may still report the stepped picture
        controller.handle_command(PlayerCommand::StepDone);
        assert!(!ctx.is_paused());
        assert_eq!(controller.state, PlayerState::Playing);
        controller.handle_command(PlayerCommand::Close);
    }

    #[test]
    fn test_step_after_resume_is_ignored() {
        let (mut controller, _events) = controller(SyntheticConfig::default());
        controller.handle_command(PlayerCommand::Open("clip".to_string()));
        controller.handle_command(PlayerCommand::Play);
        controller.handle_command(PlayerCommand::Stop);
        // the rewind posts a step that lands behind the user's Play
        controller.handle_command(PlayerCommand::Play);
        controller.handle_command(PlayerCommand::Step);

        let ctx = controller.context().unwrap();
        assert!(!ctx.is_stepping());

        controller.handle_command(PlayerCommand::StepDone);
        assert_eq!(controller.state, PlayerState::Playing);
        assert!(!ctx.is_paused());
        controller.handle_command(PlayerCommand::Close);
    }

    #[test]
    fn test_ended_ignored_when_closed() {
        let (mut controller, events) = controller(SyntheticConfig::default());
        controller.handle_command(PlayerCommand::Ended);
        assert_eq!(controller.state, PlayerState::Closed);
        assert!(events.lock().is_empty());
    }
}
