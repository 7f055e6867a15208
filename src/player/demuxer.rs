//! Demuxer thread
//!
//! Reads packets from the opened source and routes them to the packet
//! queue of their stream. Seeks requested through the playback context
//! are applied here, before anything else in an iteration, so a seek
//! issued while paused still flushes the queues and shows the new
//! position. Reading backs off while enough is buffered and posts `Ended`
//! to the event loop once every decoder has drained.

use crate::decoder::PacketQueue;
use crate::media::{MediaSource, MediaType, Packet, ReadStatus, StreamDescriptor, TIME_BASE_US};
use crate::player::controller::PlayerCommand;
use crate::player::state::{PlaybackContext, SelectedStreams, MAX_QUEUE_SIZE, MIN_FRAMES};
use crate::utils::error::{PlayerError, Result};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Back-off while buffers are full or the source has nothing to give
const READ_WAIT: Duration = Duration::from_millis(10);

/// Choose the streams to play
///
/// Video is the best video stream, audio the best audio stream related to
/// it, and subtitles only accompany video. Fails when the source has
/// neither audio nor video.
pub fn select_streams(source: &dyn MediaSource, audio_disabled: bool, subtitles_disabled: bool) -> Result<SelectedStreams> {
    let descriptor = |index: Option<usize>| index.and_then(|i| source.streams().iter().find(|s| s.index == i).cloned());

    let video_index = source.find_best_stream(MediaType::Video, None);
    let audio_index = if audio_disabled {
        None
    } else {
        source.find_best_stream(MediaType::Audio, video_index)
    };
    let subtitle_index = if subtitles_disabled || video_index.is_none() {
        None
    } else {
        source.find_best_stream(MediaType::Subtitle, audio_index.or(video_index))
    };

    let streams = SelectedStreams {
        video: descriptor(video_index),
        audio: descriptor(audio_index),
        subtitle: descriptor(subtitle_index),
    };
    if streams.is_empty() {
        return Err(PlayerError::Open("no audio or video stream to play".to_string()));
    }

    info!(
        "selected streams: video={:?} audio={:?} subtitle={:?}",
        video_index, audio_index, subtitle_index
    );
    Ok(streams)
}

/// Whether a stream has enough queued to stop reading for it
///
/// Streams that are not selected, aborted or carry only cover art always
/// have enough.
pub fn stream_has_enough_packets(queue: &PacketQueue, selected: bool, attached_picture: bool, time_base: f64) -> bool {
    if !selected || attached_picture {
        return true;
    }
    let stats = queue.stats();
    stats.aborted
        || (stats.nb_packets > MIN_FRAMES && (stats.duration == 0 || stats.duration as f64 * time_base > 1.0))
}

/// Start the demuxer on its own thread
pub fn spawn(ctx: Arc<PlaybackContext>, source: Box<dyn MediaSource>) -> Result<JoinHandle<()>> {
    let demuxer = Demuxer::new(ctx, source);
    thread::Builder::new()
        .name("demuxer".to_string())
        .spawn(move || demuxer.run())
        .map_err(|e| PlayerError::Internal(format!("failed to spawn demuxer: {}", e)))
}

struct Demuxer {
    ctx: Arc<PlaybackContext>,
    source: Box<dyn MediaSource>,
    last_paused: bool,
    eof: bool,
    read_failed: bool,
    ended_posted: bool,
    queue_attachments: bool,
}

impl Demuxer {
    fn new(ctx: Arc<PlaybackContext>, source: Box<dyn MediaSource>) -> Self {
        Self {
            ctx,
            source,
            last_paused: false,
            eof: false,
            read_failed: false,
            ended_posted: false,
            queue_attachments: true,
        }
    }

    fn run(mut self) {
        debug!("demuxer started");
        loop {
            if self.ctx.is_aborted() {
                break;
            }

            if let Some(target) = self.ctx.take_seek_request() {
                self.seek(target);
            }

            let paused = self.ctx.is_paused();
            if paused != self.last_paused {
                self.last_paused = paused;
                if paused {
                    self.source.read_pause();
                } else {
                    self.source.read_play();
                }
            }
            if paused {
                thread::sleep(READ_WAIT);
                continue;
            }

            if self.queue_attachments {
                self.queue_attached_picture();
                self.queue_attachments = false;
            }

            if !self.ctx.realtime && self.buffers_full() {
                self.ctx.continue_read.wait(READ_WAIT);
                continue;
            }

            if self.playback_drained() {
                if self.ctx.consume_loop() {
                    debug!("looping to start");
                    self.seek(0);
                    continue;
                }
                if !self.ended_posted {
                    self.ended_posted = true;
                    info!("playback ended");
                    self.ctx.post(PlayerCommand::Ended);
                    if self.ctx.autoexit {
                        break;
                    }
                }
            }

            if self.read_failed {
                thread::sleep(READ_WAIT);
                continue;
            }

            match self.source.read_packet() {
                ReadStatus::Packet(packet) => {
                    self.eof = false;
                    self.route(packet);
                }
                ReadStatus::Eof => {
                    if !self.eof {
                        debug!("end of source, draining decoders");
                        self.queue_end_markers();
                        self.eof = true;
                    }
                    self.ctx.continue_read.wait(READ_WAIT);
                }
                ReadStatus::Again => {
                    trace!("source not ready");
                    thread::sleep(READ_WAIT);
                }
                ReadStatus::Failed(msg) => {
                    if self.ctx.is_aborted() {
                        break;
                    }
                    error!("read error, stopping input: {}", msg);
                    if !self.eof {
                        self.queue_end_markers();
                        self.eof = true;
                    }
                    self.read_failed = true;
                }
            }
        }
        debug!("demuxer exiting");
    }

    fn seek(&mut self, target_us: i64) {
        if let Err(e) = self.source.seek(target_us) {
            warn!("error while seeking to {}us: {}", target_us, e);
            return;
        }

        self.ctx.flush_queues();
        self.ctx.extclk.set(target_us as f64 / TIME_BASE_US as f64, 0);
        self.queue_attachments = true;
        self.eof = false;
        self.read_failed = false;
        self.ended_posted = false;
        debug!("seeked to {:.3}s", target_us as f64 / TIME_BASE_US as f64);

        if self.ctx.is_paused() {
            self.ctx.post(PlayerCommand::Step);
        }
    }

    fn queue_attached_picture(&self) {
        let Some(stream) = &self.ctx.streams.video else {
            return;
        };
        let Some(picture) = &stream.attached_picture else {
            return;
        };
        if self.ctx.videoq.put(picture.clone()).is_err() {
            trace!("video queue aborted, attached picture dropped");
            return;
        }
        put_end_marker(&self.ctx.videoq, stream.index);
    }

    fn buffers_full(&self) -> bool {
        let ctx = &self.ctx;
        let total = ctx.videoq.size() + ctx.audioq.size() + ctx.subtitleq.size();
        if total > MAX_QUEUE_SIZE {
            return true;
        }

        let enough = |queue: &PacketQueue, stream: Option<&StreamDescriptor>| {
            stream_has_enough_packets(
                queue,
                stream.is_some(),
                stream.is_some_and(|s| s.is_attached_picture()),
                stream.map_or(0.0, |s| s.time_base.to_f64()),
            )
        };
        enough(&ctx.videoq, ctx.streams.video.as_ref())
            && enough(&ctx.audioq, ctx.streams.audio.as_ref())
            && enough(&ctx.subtitleq, ctx.streams.subtitle.as_ref())
    }

    /// Every decoder finished the current serial and nothing is left to show
    fn playback_drained(&self) -> bool {
        let ctx = &self.ctx;
        let audio_done = !ctx.has_audio()
            || (ctx.auddec_finished.load(Ordering::Acquire) == ctx.audioq.serial() && ctx.sampq.remaining() == 0);
        let video_done = !ctx.has_video()
            || (ctx.viddec_finished.load(Ordering::Acquire) == ctx.videoq.serial() && ctx.pictq.remaining() == 0);
        audio_done && video_done
    }

    fn queue_end_markers(&self) {
        let ctx = &self.ctx;
        if let Some(stream) = &ctx.streams.video {
            put_end_marker(&ctx.videoq, stream.index);
        }
        if let Some(stream) = &ctx.streams.audio {
            put_end_marker(&ctx.audioq, stream.index);
        }
        if let Some(stream) = &ctx.streams.subtitle {
            put_end_marker(&ctx.subtitleq, stream.index);
        }
    }

    fn route(&self, packet: Packet) {
        let ctx = &self.ctx;
        let index = packet.stream_index;
        let queue = if ctx.streams.audio.as_ref().is_some_and(|s| s.index == index) {
            &ctx.audioq
        } else if ctx
            .streams
            .video
            .as_ref()
            .is_some_and(|s| s.index == index && !s.is_attached_picture())
        {
            &ctx.videoq
        } else if ctx.streams.subtitle.as_ref().is_some_and(|s| s.index == index) {
            &ctx.subtitleq
        } else {
            return;
        };

        if queue.put(packet).is_err() {
            trace!("queue for stream {} aborted, packet dropped", index);
        }
    }
}

/// Queue the null packet that drains a decoder
fn put_end_marker(queue: &PacketQueue, stream_index: usize) {
    if let Err(e) = queue.put_flush_marker(stream_index) {
        trace!("end marker for stream {} rejected: {}", stream_index, e);
    }
}
