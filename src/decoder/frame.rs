//! Decoded frame slots
//!
//! A [`Frame`] is one slot of a frame queue. Slots are allocated once when
//! the queue is created and reused; `reset` clears the payload while
//! keeping its buffers allocated.

/// Pixel layout of a decoded picture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Yuv420p,
    Nv12,
    Rgba,
    Gray8,
}

/// Decoded picture planes
#[derive(Debug, Clone, Default)]
pub struct VideoPicture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Vec<u8>>,
    pub strides: Vec<usize>,
}

/// Decoded audio, interleaved 32-bit float
#[derive(Debug, Clone, Default)]
pub struct AudioSamples {
    pub sample_rate: u32,
    pub channels: u16,
    pub nb_samples: usize,
    pub data: Vec<f32>,
}

/// One positioned bitmap or text region of a subtitle
#[derive(Debug, Clone, Default)]
pub struct SubtitleRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// RGBA pixels for bitmap subtitles, empty for text
    pub pixels: Vec<u8>,
    pub text: Option<String>,
}

/// Decoded subtitle event
#[derive(Debug, Clone, Default)]
pub struct SubtitleImage {
    /// Display window relative to the frame pts, in milliseconds
    pub start_display_ms: u32,
    pub end_display_ms: u32,
    pub rects: Vec<SubtitleRect>,
    /// Dimensions of the video the subtitle was authored for
    pub width: u32,
    pub height: u32,
}

/// Payload of a frame slot
#[derive(Debug, Clone, Default)]
pub enum FramePayload {
    #[default]
    Empty,
    Video(VideoPicture),
    Audio(AudioSamples),
    Subtitle(SubtitleImage),
}

impl FramePayload {
    pub fn as_video(&self) -> Option<&VideoPicture> {
        match self {
            FramePayload::Video(picture) => Some(picture),
            _ => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioSamples> {
        match self {
            FramePayload::Audio(samples) => Some(samples),
            _ => None,
        }
    }

    pub fn as_subtitle(&self) -> Option<&SubtitleImage> {
        match self {
            FramePayload::Subtitle(subtitle) => Some(subtitle),
            _ => None,
        }
    }

    /// Copy `source` into this payload, reusing buffers when the kinds match
    pub fn copy_from(&mut self, source: &FramePayload) {
        match (self, source) {
            (FramePayload::Video(dst), FramePayload::Video(src)) => {
                dst.width = src.width;
                dst.height = src.height;
                dst.format = src.format;
                dst.planes.clone_from(&src.planes);
                dst.strides.clone_from(&src.strides);
            }
            (FramePayload::Audio(dst), FramePayload::Audio(src)) => {
                dst.sample_rate = src.sample_rate;
                dst.channels = src.channels;
                dst.nb_samples = src.nb_samples;
                dst.data.clone_from(&src.data);
            }
            (FramePayload::Subtitle(dst), FramePayload::Subtitle(src)) => {
                dst.start_display_ms = src.start_display_ms;
                dst.end_display_ms = src.end_display_ms;
                dst.width = src.width;
                dst.height = src.height;
                dst.rects.clone_from(&src.rects);
            }
            (dst, src) => *dst = src.clone(),
        }
    }

    /// Clear contents, keeping allocations
    fn clear(&mut self) {
        match self {
            FramePayload::Empty => {}
            FramePayload::Video(picture) => {
                for plane in &mut picture.planes {
                    plane.clear();
                }
                picture.strides.clear();
                picture.width = 0;
                picture.height = 0;
            }
            FramePayload::Audio(samples) => {
                samples.data.clear();
                samples.nb_samples = 0;
            }
            FramePayload::Subtitle(subtitle) => {
                subtitle.rects.clear();
                subtitle.start_display_ms = 0;
                subtitle.end_display_ms = 0;
            }
        }
    }
}

/// A frame queue slot
#[derive(Debug, Clone)]
pub struct Frame {
    /// Packet queue serial the frame was decoded under
    pub serial: i32,
    /// Presentation time in seconds, NaN if unknown
    pub pts: f64,
    /// Estimated duration in seconds
    pub duration: f64,
    /// Byte offset of the source packet, -1 if unknown
    pub pos: i64,
    /// Already handed to the presentation sink
    pub uploaded: bool,
    pub payload: FramePayload,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            serial: -1,
            pts: f64::NAN,
            duration: 0.0,
            pos: -1,
            uploaded: false,
            payload: FramePayload::Empty,
        }
    }
}

impl Frame {
    /// Return the slot to its unused state
    pub fn reset(&mut self) {
        self.serial = -1;
        self.pts = f64::NAN;
        self.duration = 0.0;
        self.pos = -1;
        self.uploaded = false;
        self.payload.clear();
    }

    /// Timing fields without the payload
    pub fn timing(&self) -> FrameTiming {
        FrameTiming {
            serial: self.serial,
            pts: self.pts,
            duration: self.duration,
            pos: self.pos,
        }
    }
}

/// Copyable view of a frame's timing, used by the sync decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTiming {
    pub serial: i32,
    pub pts: f64,
    pub duration: f64,
    pub pos: i64,
}
