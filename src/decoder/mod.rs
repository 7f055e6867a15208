//! Decoding pipeline for syncplay
//!
//! Each selected stream gets a decoder thread that pulls packets from its
//! [`PacketQueue`], feeds them through a [`CodecSession`] and pushes
//! normalized frames into a [`FrameQueue`]. The loop shared by all three
//! stream kinds lives in [`DecoderCore`]; `video`, `audio` and `subtitle`
//! add the per-kind post-processing.

pub mod audio;
pub mod frame;
pub mod frame_queue;
pub mod hw_accel;
pub mod packet_queue;
pub mod subtitle;
pub mod video;

pub use frame::{AudioSamples, Frame, FramePayload, FrameTiming, PixelFormat, SubtitleImage, SubtitleRect, VideoPicture};
pub use frame_queue::{FrameQueue, QueueStats, SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE};
pub use hw_accel::CodecSession;
pub use packet_queue::{PacketGet, PacketQueue, PacketQueueStats};

use crate::media::{rescale, DecodedFrame, MediaType, Packet, Rational, ReceiveStatus, SendStatus, StreamDescriptor};
use crate::utils::error::{PlayerError, Result};
use log::{debug, error, trace, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Packet wait granularity; bounds cancellation latency only
const PACKET_WAIT: Duration = Duration::from_millis(10);

/// Which timestamp a decoded picture is presented at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReorderPts {
    /// Codec best-effort timestamp
    #[default]
    Auto,
    /// Frame pts as reordered by the codec
    Pts,
    /// Packet dts
    Dts,
}

impl std::str::FromStr for ReorderPts {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ReorderPts::Auto),
            "pts" => Ok(ReorderPts::Pts),
            "dts" => Ok(ReorderPts::Dts),
            other => Err(format!("unknown reorder mode '{}'", other)),
        }
    }
}

/// Wake-up for the demuxer when a decoder runs dry
#[derive(Default)]
pub struct ContinueRead {
    lock: Mutex<()>,
    cond: Condvar,
}

impl ContinueRead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_one();
    }

    /// Sleep until notified or `timeout` elapses
    pub fn wait(&self, timeout: Duration) {
        let mut guard = self.lock.lock();
        self.cond.wait_for(&mut guard, timeout);
    }
}

/// Result of one [`DecoderCore::decode_frame`] call
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A frame with timestamps normalized for its stream kind
    Frame(DecodedFrame),
    /// The codec drained after a null packet; `finished` now holds the serial
    Finished,
    /// The packet queue was aborted
    Aborted,
    /// The codec cannot continue
    Fatal(String),
}

/// State shared by every decoder kind
pub struct DecoderCore {
    session: CodecSession,
    queue: Arc<PacketQueue>,
    continue_read: Arc<ContinueRead>,
    finished: Arc<AtomicI32>,
    media_type: MediaType,
    time_base: Rational,
    reorder_pts: ReorderPts,
    pending: Option<Packet>,
    pkt_serial: i32,
    next_pts: Option<i64>,
    next_pts_tb: Rational,
    start_pts: Option<i64>,
    start_pts_tb: Rational,
}

impl DecoderCore {
    pub fn new(
        session: CodecSession,
        stream: &StreamDescriptor,
        queue: Arc<PacketQueue>,
        continue_read: Arc<ContinueRead>,
        finished: Arc<AtomicI32>,
        reorder_pts: ReorderPts,
    ) -> Self {
        Self {
            session,
            queue,
            continue_read,
            finished,
            media_type: stream.media_type,
            time_base: stream.time_base,
            reorder_pts,
            pending: None,
            pkt_serial: -1,
            next_pts: None,
            next_pts_tb: stream.time_base,
            start_pts: None,
            start_pts_tb: stream.time_base,
        }
    }

    /// Restart the audio pts predictor from `pts` after every discontinuity
    pub fn set_start_pts(&mut self, pts: Option<i64>, time_base: Rational) {
        self.start_pts = pts;
        self.start_pts_tb = time_base;
    }

    /// Serial of the packet the last frame was decoded from
    pub fn pkt_serial(&self) -> i32 {
        self.pkt_serial
    }

    pub fn queue(&self) -> &Arc<PacketQueue> {
        &self.queue
    }

    /// Whether the last decoded frame still belongs to the queue's serial
    pub fn is_current(&self) -> bool {
        self.queue.serial() == self.pkt_serial
    }

    /// Decode until one frame is available, the codec drains, or the queue
    /// is aborted
    pub fn decode_frame(&mut self) -> DecodeOutcome {
        loop {
            if self.queue.serial() == self.pkt_serial {
                loop {
                    if self.queue.is_aborted() {
                        return DecodeOutcome::Aborted;
                    }
                    match self.session.receive_frame() {
                        ReceiveStatus::Frame(mut frame) => {
                            self.normalize(&mut frame);
                            return DecodeOutcome::Frame(frame);
                        }
                        ReceiveStatus::Eof => {
                            self.finished.store(self.pkt_serial, Ordering::Release);
                            self.session.flush();
                            debug!("{:?} decoder finished serial {}", self.media_type, self.pkt_serial);
                            return DecodeOutcome::Finished;
                        }
                        ReceiveStatus::Again => break,
                        ReceiveStatus::Failed(msg) => {
                            warn!("{:?} decode error: {}", self.media_type, msg);
                            break;
                        }
                    }
                }
            }

            let packet = loop {
                if self.queue.nb_packets() == 0 {
                    self.continue_read.notify();
                }
                let packet = match self.pending.take() {
                    Some(packet) => packet,
                    None => {
                        let (packet, serial) = match self.next_packet() {
                            Some(entry) => entry,
                            None => return DecodeOutcome::Aborted,
                        };
                        if serial != self.pkt_serial {
                            self.discontinuity(serial);
                        }
                        packet
                    }
                };
                if self.queue.serial() == self.pkt_serial {
                    break packet;
                }
            };

            match self.session.send_packet(&packet) {
                Ok(SendStatus::Accepted) | Ok(SendStatus::Eof) => {}
                Ok(SendStatus::Again) => {
                    error!("{:?}: receive_frame and send_packet both returned EAGAIN", self.media_type);
                    self.pending = Some(packet);
                }
                Ok(SendStatus::Failed(msg)) => {
                    warn!("{:?}: packet rejected: {}", self.media_type, msg);
                }
                Ok(SendStatus::HardwareRejected) => {
                    warn!("{:?}: unexpected hardware rejection", self.media_type);
                }
                Err(e) => return DecodeOutcome::Fatal(e.to_string()),
            }
        }
    }

    fn next_packet(&self) -> Option<(Packet, i32)> {
        loop {
            match self.queue.get_timeout(PACKET_WAIT) {
                PacketGet::Packet(packet, serial) => return Some((packet, serial)),
                PacketGet::Empty => continue,
                PacketGet::Aborted => return None,
            }
        }
    }

    fn discontinuity(&mut self, serial: i32) {
        debug!(
            "{:?} decoder: serial {} -> {}, flushing codec",
            self.media_type, self.pkt_serial, serial
        );
        self.session.flush();
        self.finished.store(0, Ordering::Release);
        self.next_pts = self.start_pts;
        self.next_pts_tb = self.start_pts_tb;
        self.pkt_serial = serial;
    }

    fn normalize(&mut self, frame: &mut DecodedFrame) {
        match self.media_type {
            MediaType::Video => {
                frame.pts = match self.reorder_pts {
                    ReorderPts::Auto => frame.best_effort_timestamp,
                    ReorderPts::Pts => frame.pts,
                    ReorderPts::Dts => frame.pkt_dts,
                };
            }
            MediaType::Audio => {
                let (sample_rate, nb_samples) = match frame.payload.as_audio() {
                    Some(samples) if samples.sample_rate > 0 => (samples.sample_rate, samples.nb_samples),
                    _ => return,
                };
                let tb = Rational::new(1, sample_rate as i32);
                frame.pts = match (frame.pts, self.next_pts) {
                    (Some(pts), _) => Some(rescale(pts, self.time_base, tb)),
                    (None, Some(next)) => Some(rescale(next, self.next_pts_tb, tb)),
                    (None, None) => None,
                };
                if let Some(pts) = frame.pts {
                    self.next_pts = Some(pts + nb_samples as i64);
                    self.next_pts_tb = tb;
                }
            }
            MediaType::Subtitle | MediaType::Data => {}
        }
    }
}

/// Wait for a free slot in `frames`, fill it and publish it. A frame whose
/// packet queue was flushed during the wait is dropped unpublished.
/// Returns `false` once the queue is aborted.
pub fn queue_frame<F>(core: &DecoderCore, frames: &FrameQueue, fill: F) -> bool
where
    F: FnOnce(&mut Frame),
{
    let Some(mut slot) = frames.peek_writable() else {
        return false;
    };
    if !core.is_current() {
        trace!(
            "{:?} frame from serial {} outlived a flush, dropped",
            core.media_type,
            core.pkt_serial
        );
        return true;
    }
    fill(&mut slot);
    slot.serial = core.pkt_serial;
    drop(slot);
    frames.push();
    true
}

/// Running decoder thread
pub struct DecoderHandle {
    name: String,
    queue: Arc<PacketQueue>,
    thread: Option<JoinHandle<()>>,
}

impl DecoderHandle {
    /// Start the packet queue and spawn `body` on a named thread
    pub fn spawn<F>(name: &str, queue: Arc<PacketQueue>, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        queue.start();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| {
                queue.abort();
                PlayerError::Decoder(format!("failed to spawn {}: {}", name, e))
            })?;

        Ok(Self {
            name: name.to_string(),
            queue,
            thread: Some(thread),
        })
    }

    /// Abort the queue, wake the thread, join it and drop leftover packets
    pub fn abort(&mut self, frames: &FrameQueue) {
        self.queue.abort();
        frames.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{} thread panicked", self.name);
            }
        }
        self.queue.flush();
        debug!("{} stopped", self.name);
    }
}
