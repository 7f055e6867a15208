//! Video presentation for syncplay
//!
//! The [`VideoRefresher`] runs the presentation tick on its own thread.
//! Every tick it decides whether the next queued picture is due against
//! the master clock, drops pictures that are already late, retires expired
//! subtitles and hands the current picture to an [`UploadSink`]. Pixel
//! conversion and GPU upload belong to the sink.

use crate::audio::sync::{compute_target_delay, vp_duration, AV_SYNC_THRESHOLD_MAX, REFRESH_RATE};
use crate::audio::SyncType;
use crate::decoder::frame::Frame;
use crate::player::controller::PlayerCommand;
use crate::player::state::PlaybackContext;
use crate::utils::error::{IntoPlayerError, Result};
use crate::utils::now_seconds;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Presentation target for decoded pictures and subtitles
pub trait UploadSink: Send {
    /// Present a decoded picture
    ///
    /// # Arguments
    ///
    /// * `frame` - Picture slot, payload is [`FramePayload::Video`](crate::decoder::FramePayload::Video)
    fn upload(&mut self, frame: &Frame) -> Result<()>;

    /// Show a subtitle over the picture, or clear it with `None`
    fn upload_subtitle(&mut self, subtitle: Option<&Frame>) -> Result<()> {
        let _ = subtitle;
        Ok(())
    }
}

/// Sink that only counts what it is given
#[derive(Debug, Default)]
pub struct NullUploadSink {
    frames: Arc<AtomicU64>,
    subtitles: Arc<AtomicU64>,
}

impl NullUploadSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter of uploaded pictures
    pub fn frames_uploaded(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames)
    }

    /// Shared counter of subtitles shown
    pub fn subtitles_shown(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.subtitles)
    }
}

impl UploadSink for NullUploadSink {
    fn upload(&mut self, _frame: &Frame) -> Result<()> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn upload_subtitle(&mut self, subtitle: Option<&Frame>) -> Result<()> {
        if subtitle.is_some() {
            self.subtitles.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

type SharedSink = Arc<Mutex<Box<dyn UploadSink>>>;

/// Drives the presentation tick for one playback session at a time
pub struct VideoRefresher {
    sink: SharedSink,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl VideoRefresher {
    pub fn new(sink: Box<dyn UploadSink>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Start ticking against `ctx`; a no-op while already running
    pub fn start(&mut self, ctx: Arc<PlaybackContext>) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let sink = Arc::clone(&self.sink);
        let thread = thread::Builder::new()
            .name("video-refresh".to_string())
            .spawn(move || refresh_loop(ctx, sink, running))
            .renderer_err("failed to spawn refresh thread")?;
        self.thread = Some(thread);
        debug!("video refresh started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("video refresh thread panicked");
            }
            debug!("video refresh stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for VideoRefresher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn refresh_loop(ctx: Arc<PlaybackContext>, sink: SharedSink, running: Arc<AtomicBool>) {
    let mut remaining_time = 0.0;
    let mut step_posted = false;
    while running.load(Ordering::Acquire) {
        if remaining_time > 0.0 {
            thread::sleep(Duration::from_secs_f64(remaining_time));
        }
        remaining_time = REFRESH_RATE;
        if !ctx.is_paused() || ctx.force_refresh.load(Ordering::Acquire) {
            video_refresh(&ctx, &sink, &mut remaining_time, &mut step_posted);
        }
        if !ctx.is_stepping() {
            step_posted = false;
        }
    }
}

/// One presentation tick; lowers `remaining_time` when a picture is due
/// sooner than the default refresh period
pub(crate) fn video_refresh(
    ctx: &PlaybackContext,
    sink: &SharedSink,
    remaining_time: &mut f64,
    step_posted: &mut bool,
) {
    if !ctx.has_video() {
        ctx.sync_external_clock();
        return;
    }

    let master = ctx.master_sync_type();
    loop {
        if ctx.pictq.remaining() == 0 {
            break;
        }

        let lastvp = ctx.pictq.peek_last_timing();
        let vp = ctx.pictq.peek_timing();

        if vp.serial != ctx.videoq.serial() {
            ctx.pictq.next();
            continue;
        }

        if lastvp.serial != vp.serial {
            *ctx.frame_timer.lock() = now_seconds();
        }

        if ctx.is_paused() {
            break;
        }

        let last_duration = vp_duration(&lastvp, &vp, ctx.max_frame_duration);
        let video_is_master = master == SyncType::Video;
        let diff = if video_is_master {
            0.0
        } else {
            ctx.vidclk.get() - ctx.master_clock()
        };
        let delay = compute_target_delay(last_duration, video_is_master, diff, ctx.max_frame_duration);

        let time = now_seconds();
        let frame_timer = {
            let mut frame_timer = ctx.frame_timer.lock();
            if time < *frame_timer + delay {
                *remaining_time = (*frame_timer + delay - time).min(*remaining_time);
                break;
            }
            *frame_timer += delay;
            if delay > 0.0 && time - *frame_timer > AV_SYNC_THRESHOLD_MAX {
                *frame_timer = time;
            }
            *frame_timer
        };

        if !vp.pts.is_nan() {
            ctx.vidclk.set(vp.pts, vp.serial);
            ctx.extclk.sync_to_slave(&ctx.vidclk);
        }

        if ctx.pictq.remaining() > 1 {
            let nextvp = ctx.pictq.peek_next_timing();
            let duration = vp_duration(&vp, &nextvp, ctx.max_frame_duration);
            if !ctx.is_stepping() && ctx.frame_drop_policy().allows_drop(master) && time > frame_timer + duration {
                ctx.frame_drops_late.fetch_add(1, Ordering::Relaxed);
                trace!("late drop pts={:.3}", vp.pts);
                ctx.pictq.next();
                continue;
            }
        }

        if ctx.has_subtitle() {
            retire_subtitles(ctx, sink);
        }

        ctx.pictq.next();
        ctx.force_refresh.store(true, Ordering::Release);

        if ctx.is_stepping() && !ctx.is_paused() && !*step_posted {
            *step_posted = true;
            ctx.post(PlayerCommand::StepDone);
        }
        break;
    }

    if ctx.force_refresh.load(Ordering::Acquire) && ctx.pictq.rindex_shown() {
        video_display(ctx, sink);
    }
    ctx.force_refresh.store(false, Ordering::Release);
}

/// Display window of a subtitle slot, in seconds relative to its pts
fn subtitle_window(frame: &Frame) -> (f64, f64) {
    frame
        .payload
        .as_subtitle()
        .map(|sub| (sub.start_display_ms as f64 / 1000.0, sub.end_display_ms as f64 / 1000.0))
        .unwrap_or((0.0, frame.duration))
}

fn retire_subtitles(ctx: &PlaybackContext, sink: &SharedSink) {
    while ctx.subpq.remaining() > 0 {
        let video_pts = ctx.vidclk.pts();
        let next_start = if ctx.subpq.remaining() > 1 {
            let next = ctx.subpq.peek_next();
            Some(next.pts + subtitle_window(&next).0)
        } else {
            None
        };

        let sp = ctx.subpq.peek();
        let (_, end) = subtitle_window(&sp);
        let expired = sp.serial != ctx.subtitleq.serial()
            || video_pts > sp.pts + end
            || next_start.is_some_and(|start| video_pts > start);
        if !expired {
            break;
        }

        let shown = sp.uploaded;
        drop(sp);
        if shown {
            if let Err(e) = sink.lock().upload_subtitle(None) {
                warn!("failed to clear subtitle: {}", e);
            }
        }
        ctx.subpq.next();
    }
}

fn video_display(ctx: &PlaybackContext, sink: &SharedSink) {
    let mut vp = ctx.pictq.peek_last();
    if !vp.uploaded {
        match sink.lock().upload(&vp) {
            Ok(()) => vp.uploaded = true,
            Err(e) => warn!("picture upload failed: {}", e),
        }
    }

    if ctx.has_subtitle() && ctx.subpq.remaining() > 0 {
        let mut sp = ctx.subpq.peek();
        let (start, _) = subtitle_window(&sp);
        if !sp.uploaded && vp.pts >= sp.pts + start {
            match sink.lock().upload_subtitle(Some(&sp)) {
                Ok(()) => sp.uploaded = true,
                Err(e) => warn!("subtitle upload failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::frame::{FramePayload, VideoPicture};
    use crate::player::state::tests::context_with;

    fn push_picture(ctx: &PlaybackContext, pts: f64) {
        let mut slot = ctx.pictq.peek_writable().unwrap();
        slot.pts = pts;
        slot.duration = 0.04;
        slot.serial = ctx.videoq.serial();
        slot.uploaded = false;
        slot.payload = FramePayload::Video(VideoPicture::default());
        drop(slot);
        ctx.pictq.push();
    }

    fn counting_sink() -> (SharedSink, Arc<AtomicU64>) {
        let sink = NullUploadSink::new();
        let counter = sink.frames_uploaded();
        (Arc::new(Mutex::new(Box::new(sink) as Box<dyn UploadSink>)), counter)
    }

    #[test]
    fn test_first_picture_is_shown_immediately() {
        let (ctx, _rx) = context_with(false, true, 1);
        ctx.videoq.start();
        push_picture(&ctx, 0.0);
        push_picture(&ctx, 0.04);
        let (sink, uploaded) = counting_sink();

        let mut remaining = REFRESH_RATE;
        let mut step_posted = false;
        video_refresh(&ctx, &sink, &mut remaining, &mut step_posted);

        assert_eq!(uploaded.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.vidclk.pts(), 0.0);
        assert_eq!(ctx.pictq.remaining(), 1);

        // the second picture is not due yet
        video_refresh(&ctx, &sink, &mut remaining, &mut step_posted);
        assert_eq!(uploaded.load(Ordering::Relaxed), 1);
        assert!(remaining <= REFRESH_RATE);
    }

    #[test]
    fn test_stale_pictures_are_skipped() {
        let (ctx, _rx) = context_with(false, true, 1);
        ctx.videoq.start();
        push_picture(&ctx, 7.0);
        ctx.videoq.flush();
        push_picture(&ctx, 0.0);
        let (sink, uploaded) = counting_sink();

        let mut remaining = REFRESH_RATE;
        let mut step_posted = false;
        video_refresh(&ctx, &sink, &mut remaining, &mut step_posted);

        assert_eq!(uploaded.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.pictq.peek_last().pts, 0.0);
    }

    #[test]
    fn test_late_pictures_are_dropped_when_audio_leads() {
        let (ctx, _rx) = context_with(true, true, 1);
        ctx.videoq.start();
        ctx.audioq.start();
        for i in 0..3 {
            push_picture(&ctx, i as f64 * 0.04);
        }
        // audio is far ahead, every picture is overdue
        ctx.audclk.set(5.0, ctx.audioq.serial());
        *ctx.frame_timer.lock() = now_seconds() - 1.0;
        ctx.vidclk.set(0.0, ctx.videoq.serial());
        let (sink, _) = counting_sink();

        let mut remaining = REFRESH_RATE;
        let mut step_posted = false;
        // consume the first picture so frame timing has a reference
        ctx.pictq.next();
        video_refresh(&ctx, &sink, &mut remaining, &mut step_posted);

        assert!(ctx.frame_drops_late.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_step_posts_step_done_once() {
        let (ctx, rx) = context_with(false, true, 1);
        ctx.videoq.start();
        push_picture(&ctx, 0.0);
        push_picture(&ctx, 0.04);
        ctx.set_step(true);
        let (sink, _) = counting_sink();

        let mut remaining = REFRESH_RATE;
        let mut step_posted = false;
        video_refresh(&ctx, &sink, &mut remaining, &mut step_posted);
        video_refresh(&ctx, &sink, &mut remaining, &mut step_posted);

        assert!(matches!(rx.try_recv(), Ok(PlayerCommand::StepDone)));
        assert!(rx.try_recv().is_err());
    }
}
