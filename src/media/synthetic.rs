//! Built-in synthetic media source
//!
//! Generates a deterministic container in memory: a gray-ramp video
//! stream, a sine-tone audio stream and optionally a text subtitle every
//! second. Packets come out interleaved by presentation time like a real
//! demuxer would produce them. Knobs on [`SyntheticConfig`] simulate the
//! awkward cases a real source exhibits: hardware decode rejection,
//! transient read errors, live sources and cover art.

use crate::decoder::frame::{AudioSamples, FramePayload, PixelFormat, SubtitleImage, SubtitleRect, VideoPicture};
use crate::media::{
    CodecContext, CodecFactory, DecodeMode, DecodedFrame, InterruptCallback, MediaBackend, MediaSource, MediaType,
    Packet, Rational, ReadStatus, ReceiveStatus, SendStatus, StreamDescriptor, TIME_BASE_US,
};
use crate::utils::error::{PlayerError, Result};
use log::{debug, info};
use std::collections::VecDeque;
use std::f64::consts::PI;

/// Samples carried by one audio packet
pub const AUDIO_PACKET_SAMPLES: usize = 1024;
const TONE_HZ: f64 = 440.0;
const TONE_GAIN: f64 = 0.2;
const SUBTITLE_TB: Rational = Rational::new(1, 1000);

/// Shape of the generated source
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Length of every stream in seconds
    pub duration_secs: f64,
    /// Video frame rate; `None` for no video stream
    pub video_fps: Option<u32>,
    /// Audio sample rate; `None` for no audio stream
    pub audio_rate: Option<u32>,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
    /// Add a text subtitle stream, one event per second
    pub subtitles: bool,
    /// Replace the video stream with a single attached picture
    pub attached_picture: bool,
    /// Report the source as live
    pub realtime: bool,
    /// Report discontinuous timestamps
    pub discontinuous: bool,
    /// Hardware contexts fail format negotiation on the first packet
    pub reject_hardware: bool,
    /// Number of initial reads answered with `Again`
    pub transient_errors: u32,
    /// `open` fails as if the source were unreadable
    pub fail_open: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            duration_secs: 2.0,
            video_fps: Some(25),
            audio_rate: Some(48_000),
            channels: 2,
            width: 64,
            height: 36,
            subtitles: false,
            attached_picture: false,
            realtime: false,
            discontinuous: false,
            reject_hardware: false,
            transient_errors: 0,
            fail_open: false,
        }
    }
}

impl SyntheticConfig {
    fn video_packets(&self) -> usize {
        match self.video_fps {
            Some(fps) if !self.attached_picture => (self.duration_secs * fps as f64).ceil() as usize,
            _ => 0,
        }
    }

    fn audio_packets(&self) -> usize {
        match self.audio_rate {
            Some(rate) => (self.duration_secs * rate as f64 / AUDIO_PACKET_SAMPLES as f64).ceil() as usize,
            None => 0,
        }
    }

    fn subtitle_packets(&self) -> usize {
        if self.subtitles {
            self.duration_secs.ceil() as usize
        } else {
            0
        }
    }
}

/// Backend that opens synthetic sources regardless of the name given
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    config: SyntheticConfig,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }
}

impl MediaBackend for SyntheticBackend {
    fn open(&self, source: &str, interrupt: InterruptCallback) -> Result<Box<dyn MediaSource>> {
        if interrupt() {
            return Err(PlayerError::Aborted(format!("opening {}", source)));
        }
        if self.config.fail_open {
            return Err(PlayerError::Open(format!("{}: cannot read synthetic source", source)));
        }
        info!("opening synthetic source '{}' ({:.1}s)", source, self.config.duration_secs);
        Ok(Box::new(SyntheticSource::new(self.config.clone(), interrupt)))
    }
}

#[derive(Debug, Clone, Copy)]
struct Track {
    index: usize,
    next: usize,
    count: usize,
}

impl Track {
    fn remaining(&self) -> bool {
        self.next < self.count
    }
}

/// Opened synthetic container
pub struct SyntheticSource {
    config: SyntheticConfig,
    streams: Vec<StreamDescriptor>,
    video: Option<Track>,
    audio: Option<Track>,
    subtitle: Option<Track>,
    transient_errors: u32,
    interrupt: InterruptCallback,
    pos: i64,
}

impl SyntheticSource {
    fn new(config: SyntheticConfig, interrupt: InterruptCallback) -> Self {
        let mut streams = Vec::new();
        let mut video = None;
        let mut audio = None;
        let mut subtitle = None;

        if let Some(fps) = config.video_fps {
            let index = streams.len();
            let mut stream = StreamDescriptor::new(index, MediaType::Video, Rational::new(1, fps as i32));
            stream.codec_name = "synthetic-video".to_string();
            stream.frame_rate = Some(Rational::new(fps as i32, 1));
            stream.width = config.width;
            stream.height = config.height;
            stream.start_time = Some(0);
            if config.attached_picture {
                stream.attached_picture = Some(video_packet(index, 0, 0));
            }
            streams.push(stream);
            video = Some(Track {
                index,
                next: 0,
                count: config.video_packets(),
            });
        }

        if let Some(rate) = config.audio_rate {
            let index = streams.len();
            let mut stream = StreamDescriptor::new(index, MediaType::Audio, Rational::new(1, rate as i32));
            stream.codec_name = "synthetic-audio".to_string();
            stream.sample_rate = rate;
            stream.channels = config.channels;
            stream.start_time = Some(0);
            streams.push(stream);
            audio = Some(Track {
                index,
                next: 0,
                count: config.audio_packets(),
            });
        }

        if config.subtitles {
            let index = streams.len();
            let mut stream = StreamDescriptor::new(index, MediaType::Subtitle, SUBTITLE_TB);
            stream.codec_name = "synthetic-text".to_string();
            stream.start_time = Some(0);
            streams.push(stream);
            subtitle = Some(Track {
                index,
                next: 0,
                count: config.subtitle_packets(),
            });
        }

        Self {
            transient_errors: config.transient_errors,
            config,
            streams,
            video,
            audio,
            subtitle,
            interrupt,
            pos: 0,
        }
    }

    /// Presentation time in seconds of a track's next packet
    fn next_time(&self, media_type: MediaType) -> Option<f64> {
        match media_type {
            MediaType::Video => {
                let track = self.video.filter(Track::remaining)?;
                let fps = self.config.video_fps? as f64;
                Some(track.next as f64 / fps)
            }
            MediaType::Audio => {
                let track = self.audio.filter(Track::remaining)?;
                let rate = self.config.audio_rate? as f64;
                Some((track.next * AUDIO_PACKET_SAMPLES) as f64 / rate)
            }
            MediaType::Subtitle => {
                let track = self.subtitle.filter(Track::remaining)?;
                Some(track.next as f64)
            }
            MediaType::Data => None,
        }
    }

    fn take_packet(&mut self, media_type: MediaType) -> Option<Packet> {
        let mut packet = match media_type {
            MediaType::Video => {
                let track = self.video.as_mut()?;
                let packet = video_packet(track.index, track.next as i64, self.pos);
                track.next += 1;
                packet
            }
            MediaType::Audio => {
                let track = self.audio.as_mut()?;
                let pts = (track.next * AUDIO_PACKET_SAMPLES) as i64;
                let packet = Packet {
                    stream_index: track.index,
                    data: pts.to_le_bytes().to_vec(),
                    pts: Some(pts),
                    dts: Some(pts),
                    duration: AUDIO_PACKET_SAMPLES as i64,
                    pos: self.pos,
                };
                track.next += 1;
                packet
            }
            MediaType::Subtitle => {
                let track = self.subtitle.as_mut()?;
                let pts = track.next as i64 * 1000;
                let packet = Packet {
                    stream_index: track.index,
                    data: format!("subtitle {}", track.next + 1).into_bytes(),
                    pts: Some(pts),
                    dts: Some(pts),
                    duration: 500,
                    pos: self.pos,
                };
                track.next += 1;
                packet
            }
            MediaType::Data => return None,
        };
        packet.pos = self.pos;
        self.pos += packet.size() as i64;
        Some(packet)
    }
}

fn video_packet(stream_index: usize, index: i64, pos: i64) -> Packet {
    Packet {
        stream_index,
        data: index.to_le_bytes().to_vec(),
        pts: Some(index),
        dts: Some(index),
        duration: 1,
        pos,
    }
}

impl MediaSource for SyntheticSource {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn read_packet(&mut self) -> ReadStatus {
        if (self.interrupt)() {
            return ReadStatus::Failed("interrupted".to_string());
        }
        if self.transient_errors > 0 {
            self.transient_errors -= 1;
            return ReadStatus::Again;
        }

        let next = [MediaType::Video, MediaType::Audio, MediaType::Subtitle]
            .into_iter()
            .filter_map(|media_type| self.next_time(media_type).map(|time| (media_type, time)))
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match next.and_then(|(media_type, _)| self.take_packet(media_type)) {
            Some(packet) => ReadStatus::Packet(packet),
            None => ReadStatus::Eof,
        }
    }

    fn seek(&mut self, target_us: i64) -> Result<()> {
        let target = (target_us.max(0) as f64 / TIME_BASE_US as f64).min(self.config.duration_secs);
        if let (Some(track), Some(fps)) = (self.video.as_mut(), self.config.video_fps) {
            track.next = ((target * fps as f64).floor() as usize).min(track.count);
        }
        if let (Some(track), Some(rate)) = (self.audio.as_mut(), self.config.audio_rate) {
            track.next = ((target * rate as f64 / AUDIO_PACKET_SAMPLES as f64).floor() as usize).min(track.count);
        }
        if let Some(track) = self.subtitle.as_mut() {
            track.next = (target.floor() as usize).min(track.count);
        }
        debug!("synthetic source seeked to {:.3}s", target);
        Ok(())
    }

    fn is_realtime(&self) -> bool {
        self.config.realtime
    }

    fn has_timestamp_discontinuities(&self) -> bool {
        self.config.discontinuous
    }

    fn duration_us(&self) -> Option<i64> {
        Some((self.config.duration_secs * TIME_BASE_US as f64) as i64)
    }

    fn codec_factory(&self, index: usize) -> Result<Box<dyn CodecFactory>> {
        let stream = self
            .streams
            .get(index)
            .ok_or_else(|| PlayerError::NotFound(format!("stream {}", index)))?;
        Ok(Box::new(SyntheticCodecFactory::new(stream.media_type, self.config.clone())))
    }
}

/// Opens [`SyntheticCodec`]s for one stream
pub struct SyntheticCodecFactory {
    media_type: MediaType,
    config: SyntheticConfig,
}

impl SyntheticCodecFactory {
    pub fn new(media_type: MediaType, config: SyntheticConfig) -> Self {
        Self { media_type, config }
    }
}

impl CodecFactory for SyntheticCodecFactory {
    fn open(&mut self, mode: DecodeMode) -> Result<Box<dyn CodecContext>> {
        Ok(Box::new(SyntheticCodec {
            media_type: self.media_type,
            config: self.config.clone(),
            mode,
            pending: VecDeque::new(),
            draining: false,
        }))
    }

    fn supports_hardware(&self) -> bool {
        self.media_type == MediaType::Video
    }
}

/// One frame out per packet in, no reordering
pub struct SyntheticCodec {
    media_type: MediaType,
    config: SyntheticConfig,
    mode: DecodeMode,
    pending: VecDeque<DecodedFrame>,
    draining: bool,
}

impl SyntheticCodec {
    fn decode(&self, packet: &Packet) -> std::result::Result<DecodedFrame, String> {
        let payload = match self.media_type {
            MediaType::Video => FramePayload::Video(self.picture(packet_index(packet)?)),
            MediaType::Audio => FramePayload::Audio(self.samples(packet_index(packet)?)),
            MediaType::Subtitle => {
                let text = String::from_utf8(packet.data.clone()).map_err(|e| e.to_string())?;
                FramePayload::Subtitle(SubtitleImage {
                    start_display_ms: 0,
                    end_display_ms: packet.duration.max(0) as u32,
                    rects: vec![SubtitleRect {
                        text: Some(text),
                        ..Default::default()
                    }],
                    width: self.config.width,
                    height: self.config.height,
                })
            }
            MediaType::Data => return Err("data streams carry no frames".to_string()),
        };

        Ok(DecodedFrame {
            pts: packet.pts,
            best_effort_timestamp: packet.pts,
            pkt_dts: packet.dts,
            pos: packet.pos,
            payload,
        })
    }

    fn picture(&self, index: i64) -> VideoPicture {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let chroma = (width / 2) * (height / 2);
        VideoPicture {
            width: self.config.width,
            height: self.config.height,
            format: PixelFormat::Yuv420p,
            planes: vec![vec![(index % 256) as u8; width * height], vec![128; chroma], vec![128; chroma]],
            strides: vec![width, width / 2, width / 2],
        }
    }

    fn samples(&self, first_sample: i64) -> AudioSamples {
        let rate = self.config.audio_rate.unwrap_or(48_000);
        let channels = self.config.channels.max(1);
        let mut data = Vec::with_capacity(AUDIO_PACKET_SAMPLES * channels as usize);
        for i in 0..AUDIO_PACKET_SAMPLES as i64 {
            let t = (first_sample + i) as f64 / rate as f64;
            let value = ((2.0 * PI * TONE_HZ * t).sin() * TONE_GAIN) as f32;
            data.extend(std::iter::repeat(value).take(channels as usize));
        }
        AudioSamples {
            sample_rate: rate,
            channels,
            nb_samples: AUDIO_PACKET_SAMPLES,
            data,
        }
    }
}

fn packet_index(packet: &Packet) -> std::result::Result<i64, String> {
    let bytes: [u8; 8] = packet
        .data
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| format!("corrupt packet of {} bytes", packet.size()))?;
    Ok(i64::from_le_bytes(bytes))
}

impl CodecContext for SyntheticCodec {
    fn send_packet(&mut self, packet: &Packet) -> SendStatus {
        if self.mode == DecodeMode::Hardware && self.config.reject_hardware {
            return SendStatus::HardwareRejected;
        }
        if self.draining {
            return SendStatus::Eof;
        }
        if packet.is_null() {
            self.draining = true;
            return SendStatus::Accepted;
        }
        match self.decode(packet) {
            Ok(frame) => {
                self.pending.push_back(frame);
                SendStatus::Accepted
            }
            Err(msg) => SendStatus::Failed(msg),
        }
    }

    fn receive_frame(&mut self) -> ReceiveStatus {
        match self.pending.pop_front() {
            Some(frame) => ReceiveStatus::Frame(frame),
            None if self.draining => ReceiveStatus::Eof,
            None => ReceiveStatus::Again,
        }
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
    }

    fn mode(&self) -> DecodeMode {
        self.mode
    }
}
