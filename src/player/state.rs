//! Shared playback state for syncplay
//!
//! One [`PlaybackContext`] exists per opened source. The event loop, the
//! demuxer, the decoders and both presentation paths hold it through an
//! `Arc`. Queues and clocks carry their own locks; the remaining fields
//! are atomics with a single writer each. Only the event loop writes
//! `paused` and `step`.

use crate::audio::{Clock, FrameDropPolicy, SyncType};
use crate::decoder::{
    ContinueRead, FrameQueue, PacketQueue, PacketQueueStats, SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE,
    VIDEO_PICTURE_QUEUE_SIZE,
};
use crate::media::StreamDescriptor;
use crate::player::controller::PlayerCommand;
use crate::player::PlaybackStats;
use crate::utils::now_seconds;
use crossbeam_channel::Sender;
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

/// Total queued bytes above which the demuxer stops reading
pub const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;
/// Packets a stream needs before it counts as buffered
pub const MIN_FRAMES: usize = 25;

/// User-adjustable knobs read on the hot paths
#[derive(Debug, Clone, Copy)]
pub struct PlaybackSettings {
    /// Linear gain, 0.0 to 1.0
    pub volume: f32,
    pub muted: bool,
    pub frame_drop: FrameDropPolicy,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            volume: 1.0,
            muted: false,
            frame_drop: FrameDropPolicy::Auto,
        }
    }
}

/// Streams chosen when the source was opened
#[derive(Debug, Clone, Default)]
pub struct SelectedStreams {
    pub video: Option<StreamDescriptor>,
    pub audio: Option<StreamDescriptor>,
    pub subtitle: Option<StreamDescriptor>,
}

impl SelectedStreams {
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// Everything the playback threads share for one opened source
pub struct PlaybackContext {
    pub streams: SelectedStreams,

    pub videoq: Arc<PacketQueue>,
    pub audioq: Arc<PacketQueue>,
    pub subtitleq: Arc<PacketQueue>,

    pub pictq: FrameQueue,
    pub sampq: FrameQueue,
    pub subpq: FrameQueue,

    pub vidclk: Clock,
    pub audclk: Clock,
    pub extclk: Clock,

    /// Serial each decoder last drained completely
    pub viddec_finished: Arc<AtomicI32>,
    pub auddec_finished: Arc<AtomicI32>,
    pub subdec_finished: Arc<AtomicI32>,

    pub continue_read: Arc<ContinueRead>,

    paused: AtomicBool,
    step: AtomicBool,

    /// Wall time the last shown picture became due
    pub frame_timer: Mutex<f64>,
    /// Redraw the last picture on the next refresh tick
    pub force_refresh: AtomicBool,

    pub frame_drops_early: AtomicU64,
    pub frame_drops_late: AtomicU64,

    /// Longest pts gap trusted as a frame duration
    pub max_frame_duration: f64,
    pub realtime: bool,
    pub autoexit: bool,

    sync_type: SyncType,
    loop_count: AtomicI32,
    seek_request: Mutex<Option<i64>>,
    abort_request: AtomicBool,

    pub settings: Arc<Mutex<PlaybackSettings>>,
    events: Sender<PlayerCommand>,
}

/// Construction parameters for [`PlaybackContext`]
pub struct ContextParams {
    pub streams: SelectedStreams,
    pub sync_type: SyncType,
    pub loop_count: i32,
    pub autoexit: bool,
    pub realtime: bool,
    pub discontinuous_timestamps: bool,
    pub settings: Arc<Mutex<PlaybackSettings>>,
    pub events: Sender<PlayerCommand>,
}

impl PlaybackContext {
    pub fn new(params: ContextParams) -> Self {
        let videoq = Arc::new(PacketQueue::new());
        let audioq = Arc::new(PacketQueue::new());
        let subtitleq = Arc::new(PacketQueue::new());

        let has_audio = params.streams.audio.is_some();
        let has_video = params.streams.video.is_some();

        Self {
            pictq: FrameQueue::new(Arc::clone(&videoq), VIDEO_PICTURE_QUEUE_SIZE, true),
            sampq: FrameQueue::new(Arc::clone(&audioq), SAMPLE_QUEUE_SIZE, true),
            subpq: FrameQueue::new(Arc::clone(&subtitleq), SUBPICTURE_QUEUE_SIZE, false),
            vidclk: Clock::new(Some(videoq.serial_handle())),
            audclk: Clock::new(Some(audioq.serial_handle())),
            extclk: Clock::new(None),
            videoq,
            audioq,
            subtitleq,
            streams: params.streams,
            viddec_finished: Arc::new(AtomicI32::new(0)),
            auddec_finished: Arc::new(AtomicI32::new(0)),
            subdec_finished: Arc::new(AtomicI32::new(0)),
            continue_read: Arc::new(ContinueRead::new()),
            paused: AtomicBool::new(false),
            step: AtomicBool::new(false),
            frame_timer: Mutex::new(0.0),
            force_refresh: AtomicBool::new(false),
            frame_drops_early: AtomicU64::new(0),
            frame_drops_late: AtomicU64::new(0),
            max_frame_duration: if params.discontinuous_timestamps { 10.0 } else { 3600.0 },
            realtime: params.realtime,
            autoexit: params.autoexit,
            sync_type: SyncType::for_streams(params.sync_type, has_audio, has_video),
            loop_count: AtomicI32::new(params.loop_count),
            seek_request: Mutex::new(None),
            abort_request: AtomicBool::new(false),
            settings: params.settings,
            events: params.events,
        }
    }

    pub fn has_video(&self) -> bool {
        self.streams.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.streams.audio.is_some()
    }

    pub fn has_subtitle(&self) -> bool {
        self.streams.subtitle.is_some()
    }

    /// Sync type requested at open
    pub fn sync_type(&self) -> SyncType {
        self.sync_type
    }

    /// Clock the other streams actually follow
    pub fn master_sync_type(&self) -> SyncType {
        self.sync_type.resolve(self.has_audio(), self.has_video())
    }

    pub fn master_clock(&self) -> f64 {
        match self.master_sync_type() {
            SyncType::Video => self.vidclk.get(),
            SyncType::Audio => self.audclk.get(),
            SyncType::External => self.extclk.get(),
        }
    }

    /// Keep the external clock near whichever stream clock is running
    pub fn sync_external_clock(&self) {
        if self.master_sync_type() != SyncType::External {
            return;
        }
        if self.has_audio() {
            self.extclk.sync_to_slave(&self.audclk);
        } else if self.has_video() {
            self.extclk.sync_to_slave(&self.vidclk);
        }
    }

    pub fn frame_drop_policy(&self) -> FrameDropPolicy {
        self.settings.lock().frame_drop
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_stepping(&self) -> bool {
        self.step.load(Ordering::Acquire)
    }

    /// Event loop only
    pub(crate) fn set_step(&self, step: bool) {
        self.step.store(step, Ordering::Release);
    }

    /// Flip pause on every clock. Pausing freezes each clock at its current
    /// estimate; resuming re-anchors the video clock and pushes the frame
    /// timer forward by the time spent paused. Event loop only.
    pub(crate) fn stream_toggle_pause(&self) {
        if self.is_paused() {
            let now = now_seconds();
            *self.frame_timer.lock() += now - self.vidclk.last_updated();
            self.vidclk.set(self.vidclk.get(), self.vidclk.serial());
        } else {
            self.vidclk.set(self.vidclk.get(), self.vidclk.serial());
            self.audclk.set(self.audclk.get(), self.audclk.serial());
        }
        self.extclk.set(self.extclk.get(), self.extclk.serial());

        let paused = !self.is_paused();
        self.paused.store(paused, Ordering::Release);
        self.audclk.set_paused(paused);
        self.vidclk.set_paused(paused);
        self.extclk.set_paused(paused);
        debug!("playback {}", if paused { "paused" } else { "resumed" });
    }

    /// Unpause if needed and show exactly one more picture. Event loop only.
    pub(crate) fn step_to_next_frame(&self) {
        if self.is_paused() {
            self.stream_toggle_pause();
        }
        self.set_step(true);
    }

    /// Ask the demuxer to seek to `target_us`; ignored while a seek is pending
    pub fn request_seek(&self, target_us: i64) -> bool {
        let mut request = self.seek_request.lock();
        if request.is_some() {
            return false;
        }
        *request = Some(target_us);
        drop(request);
        self.continue_read.notify();
        true
    }

    pub(crate) fn take_seek_request(&self) -> Option<i64> {
        self.seek_request.lock().take()
    }

    /// `true` when playback should restart from the beginning
    pub(crate) fn consume_loop(&self) -> bool {
        let count = self.loop_count.load(Ordering::Acquire);
        match count {
            1 => false,
            0 => true,
            n => {
                let remaining = n - 1;
                self.loop_count.store(remaining, Ordering::Release);
                remaining != 0
            }
        }
    }

    pub fn abort(&self) {
        self.abort_request.store(true, Ordering::Release);
        self.continue_read.notify();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_request.load(Ordering::Acquire)
    }

    /// Post an internal command to the event loop
    pub(crate) fn post(&self, command: PlayerCommand) {
        trace!("posting {:?}", command);
        if self.events.send(command).is_err() {
            debug!("event loop gone, command dropped");
        }
    }

    pub fn frame_drop_count(&self) -> u64 {
        self.frame_drops_early.load(Ordering::Relaxed) + self.frame_drops_late.load(Ordering::Relaxed)
    }

    /// Seconds between the clock of the stream being paced and the master
    pub fn av_diff(&self) -> f64 {
        match (self.has_audio(), self.has_video()) {
            (true, true) => self.audclk.get() - self.vidclk.get(),
            (_, true) => self.master_clock() - self.vidclk.get(),
            (true, _) => self.master_clock() - self.audclk.get(),
            _ => 0.0,
        }
    }

    pub fn stats(&self) -> PlaybackStats {
        let av_diff = self.av_diff();
        PlaybackStats {
            position: self.master_clock(),
            av_diff: if av_diff.is_nan() { 0.0 } else { av_diff },
            frame_drops_early: self.frame_drops_early.load(Ordering::Relaxed),
            frame_drops_late: self.frame_drops_late.load(Ordering::Relaxed),
            video_queue: self.videoq.stats(),
            audio_queue: self.audioq.stats(),
            subtitle_queue: self.subtitleq.stats(),
            pictures_queued: self.pictq.remaining(),
            samples_queued: self.sampq.remaining(),
        }
    }

    /// Flush every packet queue, opening a new serial epoch on each
    pub(crate) fn flush_queues(&self) {
        self.audioq.flush();
        self.subtitleq.flush();
        self.videoq.flush();
        debug!(
            "queues flushed, serials v={} a={} s={}",
            self.videoq.serial(),
            self.audioq.serial(),
            self.subtitleq.serial()
        );
    }

    /// Queue counters for the streams that are open
    pub fn queue_stats(&self) -> [Option<PacketQueueStats>; 3] {
        [
            self.has_video().then(|| self.videoq.stats()),
            self.has_audio().then(|| self.audioq.stats()),
            self.has_subtitle().then(|| self.subtitleq.stats()),
        ]
    }

    /// Free every frame slot once all threads are joined
    pub(crate) fn destroy_queues(&self) {
        self.videoq.destroy();
        self.audioq.destroy();
        self.subtitleq.destroy();
        self.pictq.destroy();
        self.sampq.destroy();
        self.subpq.destroy();
    }
}
