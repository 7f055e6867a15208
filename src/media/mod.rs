//! Media library boundary
//!
//! The engine never touches container or codec internals directly. A
//! [`MediaBackend`] opens sources, a [`MediaSource`] yields compressed
//! packets and seeks, and a [`CodecContext`] turns packets into frames.
//! Every call may block; long-running calls poll the [`InterruptCallback`]
//! handed to `open` so that closing the player can cut them short.

pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use synthetic::{SyntheticBackend, SyntheticConfig};

use crate::decoder::frame::FramePayload;
use crate::utils::error::Result;
use std::sync::Arc;

/// Microseconds per second, the unit of seek targets
pub const TIME_BASE_US: i64 = 1_000_000;

/// Polled during blocking I/O; returning `true` asks the call to give up
pub type InterruptCallback = Arc<dyn Fn() -> bool + Send + Sync>;

/// Elementary stream kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
    Data,
}

/// Exact fraction, used for stream time bases and frame rates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Value as floating point, 0 when the denominator is zero
    pub fn to_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    pub fn is_valid(self) -> bool {
        self.num != 0 && self.den != 0
    }

    pub fn invert(self) -> Self {
        Self::new(self.den, self.num)
    }
}

/// Rescale `value` from time base `from` to time base `to`, rounding to the
/// nearest integer with halves away from zero
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return 0;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let half = den / 2;
    let rounded = if num >= 0 { (num + half) / den } else { (num - half) / den };
    rounded as i64
}

/// Compressed packet as read from the source
///
/// A packet with no payload is a null packet: it marks the end of a stream
/// and asks the codec to drain its buffered frames.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub stream_index: usize,
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Duration in stream time base units
    pub duration: i64,
    /// Byte offset in the source, -1 if unknown
    pub pos: i64,
}

impl Packet {
    /// End-of-stream marker for `stream_index`
    pub fn null(stream_index: usize) -> Self {
        Self {
            stream_index,
            pos: -1,
            ..Default::default()
        }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Description of one elementary stream in an opened source
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub index: usize,
    pub media_type: MediaType,
    pub codec_name: String,
    pub time_base: Rational,
    /// First timestamp of the stream in its time base
    pub start_time: Option<i64>,
    /// Guessed frame rate for video streams
    pub frame_rate: Option<Rational>,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Cover art carried by the stream instead of regular packets
    pub attached_picture: Option<Packet>,
}

impl StreamDescriptor {
    pub fn new(index: usize, media_type: MediaType, time_base: Rational) -> Self {
        Self {
            index,
            media_type,
            codec_name: String::new(),
            time_base,
            start_time: None,
            frame_rate: None,
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            attached_picture: None,
        }
    }

    pub fn is_attached_picture(&self) -> bool {
        self.attached_picture.is_some()
    }
}

/// Result of one `read_packet` call
#[derive(Debug)]
pub enum ReadStatus {
    Packet(Packet),
    /// End of the source reached
    Eof,
    /// Nothing available right now; try again shortly
    Again,
    /// Unrecoverable I/O error; reading stops
    Failed(String),
}

/// Decode mode requested from a codec factory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Hardware,
    Software,
}

/// Result of feeding one packet to a codec
#[derive(Debug)]
pub enum SendStatus {
    Accepted,
    /// The codec must be drained with `receive_frame` before it takes more
    Again,
    /// Hardware format negotiation failed; reopen in software mode
    HardwareRejected,
    /// Codec already drained for this stream
    Eof,
    Failed(String),
}

/// Frame as produced by a codec, timestamps still in stream units
#[derive(Debug, Clone, Default)]
pub struct DecodedFrame {
    pub pts: Option<i64>,
    pub best_effort_timestamp: Option<i64>,
    pub pkt_dts: Option<i64>,
    pub pos: i64,
    pub payload: FramePayload,
}

/// Result of pulling a frame from a codec
#[derive(Debug)]
pub enum ReceiveStatus {
    Frame(DecodedFrame),
    /// Needs more input
    Again,
    /// Fully drained after a null packet
    Eof,
    Failed(String),
}

/// Opened codec instance for one stream
pub trait CodecContext: Send {
    /// Feed a packet; a null packet starts draining
    fn send_packet(&mut self, packet: &Packet) -> SendStatus;

    /// Pull the next decoded frame
    fn receive_frame(&mut self) -> ReceiveStatus;

    /// Drop all buffered state so decoding can restart after a seek
    fn flush(&mut self);

    /// Mode this context actually decodes in
    fn mode(&self) -> DecodeMode;
}

/// Opens codec contexts for one stream
pub trait CodecFactory: Send {
    fn open(&mut self, mode: DecodeMode) -> Result<Box<dyn CodecContext>>;

    /// Whether a hardware context can be attempted at all
    fn supports_hardware(&self) -> bool {
        false
    }
}

/// An opened container
pub trait MediaSource: Send {
    /// All streams in the container
    fn streams(&self) -> &[StreamDescriptor];

    /// Pick the best stream of `media_type`, preferring one related to
    /// `related` when given
    fn find_best_stream(&self, media_type: MediaType, related: Option<usize>) -> Option<usize> {
        let _ = related;
        self.streams()
            .iter()
            .find(|s| s.media_type == media_type)
            .map(|s| s.index)
    }

    /// Read the next packet in container order
    fn read_packet(&mut self) -> ReadStatus;

    /// Seek so the next packets start at or before `target_us`
    fn seek(&mut self, target_us: i64) -> Result<()>;

    /// Live network sources are never throttled by the reader
    fn is_realtime(&self) -> bool {
        false
    }

    /// Container timestamps may jump; caps trusted frame durations at 10s
    fn has_timestamp_discontinuities(&self) -> bool {
        false
    }

    /// Containers that cannot seek by byte or generic index restart audio
    /// timestamps from the stream start after a flush
    fn lacks_generic_seek(&self) -> bool {
        false
    }

    /// Reading paused, for network sources that can hold the stream
    fn read_pause(&mut self) {}

    /// Reading resumed
    fn read_play(&mut self) {}

    /// Total duration in microseconds if known
    fn duration_us(&self) -> Option<i64> {
        None
    }

    /// Codec factory for stream `index`
    fn codec_factory(&self, index: usize) -> Result<Box<dyn CodecFactory>>;
}

/// Opens sources by name
pub trait MediaBackend: Send + Sync {
    fn open(&self, source: &str, interrupt: InterruptCallback) -> Result<Box<dyn MediaSource>>;
}
