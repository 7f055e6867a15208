//! FFmpeg-backed media sources
//!
//! Opens containers through ffmpeg-next. Video can decode on a hardware
//! device; pictures are downloaded from the device and come out as YUV
//! 4:2:0, audio as interleaved f32. Rate and channel conversion is left to
//! the audio renderer.

use crate::decoder::frame::{AudioSamples, FramePayload, PixelFormat, SubtitleImage, SubtitleRect, VideoPicture};
use crate::media::{
    CodecContext, CodecFactory, DecodeMode, DecodedFrame, InterruptCallback, MediaBackend, MediaSource, MediaType,
    Packet, Rational, ReadStatus, ReceiveStatus, SendStatus, StreamDescriptor,
};
use crate::utils::error::{IntoPlayerError, PlayerError, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::{codec, format, media, software};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Formats that deliver packets at wall-clock pace
const REALTIME_FORMATS: [&str; 3] = ["rtp", "rtsp", "sdp"];

/// AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX
const HW_CONFIG_METHOD_DEVICE_CTX: i32 = 0x01;

/// Device types tried for hardware decoding, in order of preference
#[cfg(target_os = "linux")]
const DEVICE_TYPES: &[ffi::AVHWDeviceType] = &[
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
];
#[cfg(target_os = "macos")]
const DEVICE_TYPES: &[ffi::AVHWDeviceType] = &[ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX];
#[cfg(target_os = "windows")]
const DEVICE_TYPES: &[ffi::AVHWDeviceType] = &[
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
];
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const DEVICE_TYPES: &[ffi::AVHWDeviceType] = &[];

fn rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn timestamp(value: i64) -> Option<i64> {
    (value != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(value)
}

fn media_type(medium: media::Type) -> MediaType {
    match medium {
        media::Type::Video => MediaType::Video,
        media::Type::Audio => MediaType::Audio,
        media::Type::Subtitle => MediaType::Subtitle,
        _ => MediaType::Data,
    }
}

/// Backend that opens files and URLs through libavformat
pub struct FfmpegBackend {
    threads: usize,
}

impl FfmpegBackend {
    pub fn new() -> Result<Self> {
        ffmpeg::init().map_err(|e| PlayerError::Internal(format!("FFmpeg init failed: {}", e)))?;
        ffmpeg::log::set_level(ffmpeg::log::Level::Warning);
        Ok(Self { threads: 0 })
    }

    /// Codec worker threads, 0 lets libavcodec decide
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}

impl MediaBackend for FfmpegBackend {
    fn open(&self, source: &str, interrupt: InterruptCallback) -> Result<Box<dyn MediaSource>> {
        let input = format::input_with_interrupt(&source, move || interrupt())
            .open_err(source)?;

        let streams = input.streams().map(|stream| describe(&stream)).collect::<Vec<_>>();
        let name = input.format().name().to_string();
        let realtime = REALTIME_FORMATS.contains(&name.as_str())
            || source.starts_with("rtp:")
            || source.starts_with("udp:");

        info!("opened '{}' as {} with {} streams", source, name, streams.len());

        Ok(Box::new(FfmpegSource {
            input,
            streams,
            realtime,
            threads: self.threads,
        }))
    }
}

fn describe(stream: &format::stream::Stream) -> StreamDescriptor {
    let parameters = stream.parameters();
    let mut descriptor = StreamDescriptor::new(
        stream.index(),
        media_type(parameters.medium()),
        rational(stream.time_base()),
    );
    descriptor.codec_name = parameters.id().name().to_string();
    descriptor.start_time = timestamp(stream.start_time());

    let frame_rate = stream.avg_frame_rate();
    if frame_rate.numerator() > 0 && frame_rate.denominator() > 0 {
        descriptor.frame_rate = Some(rational(frame_rate));
    }

    // SAFETY: both pointers come from a live stream of the open input and
    // are only read here.
    unsafe {
        let par = &*parameters.as_ptr();
        descriptor.width = par.width.max(0) as u32;
        descriptor.height = par.height.max(0) as u32;
        descriptor.sample_rate = par.sample_rate.max(0) as u32;
        descriptor.channels = par.ch_layout.nb_channels.max(0) as u16;

        if stream.disposition().contains(format::stream::Disposition::ATTACHED_PIC) {
            let pic = &(*stream.as_ptr()).attached_pic;
            if !pic.data.is_null() && pic.size > 0 {
                let mut packet = Packet::null(stream.index());
                packet.data = std::slice::from_raw_parts(pic.data, pic.size as usize).to_vec();
                packet.pts = timestamp(pic.pts);
                packet.dts = timestamp(pic.dts);
                descriptor.attached_picture = Some(packet);
            }
        }
    }

    descriptor
}

/// Opened container
pub struct FfmpegSource {
    input: format::context::Input,
    streams: Vec<StreamDescriptor>,
    realtime: bool,
    threads: usize,
}

impl MediaSource for FfmpegSource {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn find_best_stream(&self, media_type: MediaType, related: Option<usize>) -> Option<usize> {
        let medium = match media_type {
            MediaType::Video => media::Type::Video,
            MediaType::Audio => media::Type::Audio,
            MediaType::Subtitle => media::Type::Subtitle,
            MediaType::Data => return None,
        };
        // libavformat ranks streams on its own; program affinity is not exposed
        let _ = related;
        self.input.streams().best(medium).map(|s| s.index())
    }

    fn read_packet(&mut self) -> ReadStatus {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => ReadStatus::Packet(Packet {
                stream_index: packet.stream(),
                data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                pts: packet.pts(),
                dts: packet.dts(),
                duration: packet.duration(),
                pos: packet.position() as i64,
            }),
            Err(ffmpeg::Error::Eof) => ReadStatus::Eof,
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => ReadStatus::Again,
            Err(e) => ReadStatus::Failed(e.to_string()),
        }
    }

    fn seek(&mut self, target_us: i64) -> Result<()> {
        self.input
            .seek(target_us, ..)
            .decoder_err(&format!("seek to {}us failed", target_us))
    }

    fn is_realtime(&self) -> bool {
        self.realtime
    }

    fn has_timestamp_discontinuities(&self) -> bool {
        self.input.format().flags().contains(format::Flags::TS_DISCONT)
    }

    fn lacks_generic_seek(&self) -> bool {
        let flags = self.input.format().flags();
        flags.contains(format::Flags::NO_BINSEARCH)
            && flags.contains(format::Flags::NO_GENSEARCH)
            && flags.contains(format::Flags::NO_BYTE_SEEK)
    }

    fn read_pause(&mut self) {
        if let Err(e) = self.input.pause() {
            debug!("read pause unsupported: {}", e);
        }
    }

    fn read_play(&mut self) {
        if let Err(e) = self.input.play() {
            debug!("read play unsupported: {}", e);
        }
    }

    fn duration_us(&self) -> Option<i64> {
        let duration = self.input.duration();
        (duration > 0).then_some(duration)
    }

    fn codec_factory(&self, index: usize) -> Result<Box<dyn CodecFactory>> {
        let stream = self
            .input
            .stream(index)
            .ok_or_else(|| PlayerError::NotFound(format!("stream {}", index)))?;
        Ok(Box::new(FfmpegCodecFactory {
            media_type: media_type(stream.parameters().medium()),
            parameters: stream.parameters(),
            threads: self.threads,
        }))
    }
}

/// Hardware configs of `codec` that can be set up through a device context
/// on this platform
fn hardware_configs(codec: &codec::Codec) -> Vec<(ffi::AVHWDeviceType, ffi::AVPixelFormat)> {
    let mut configs = Vec::new();
    // SAFETY: avcodec_get_hw_config returns static descriptors of a
    // registered codec, or null past the last one.
    unsafe {
        let mut index = 0;
        loop {
            let config = ffi::avcodec_get_hw_config(codec.as_ptr(), index);
            if config.is_null() {
                break;
            }
            let config = &*config;
            if config.methods & HW_CONFIG_METHOD_DEVICE_CTX != 0 && DEVICE_TYPES.contains(&config.device_type) {
                configs.push((config.device_type, config.pix_fmt));
            }
            index += 1;
        }
    }
    configs.sort_by_key(|(device_type, _)| DEVICE_TYPES.iter().position(|t| t == device_type));
    configs
}

/// Pixel format the device decodes into, read by the `get_format` callback
struct HwNegotiation {
    pix_fmt: ffi::AVPixelFormat,
    rejected: AtomicBool,
}

/// `get_format` callback: accept the device format or flag the rejection
unsafe extern "C" fn negotiate_hw_format(
    ctx: *mut ffi::AVCodecContext,
    formats: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let negotiation = &*((*ctx).opaque as *const HwNegotiation);
    let mut format = formats;
    while *format != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        if *format == negotiation.pix_fmt {
            return *format;
        }
        format = format.add(1);
    }
    negotiation.rejected.store(true, Ordering::Release);
    ffi::AVPixelFormat::AV_PIX_FMT_NONE
}

/// Opens decoders from stream parameters
pub struct FfmpegCodecFactory {
    media_type: MediaType,
    parameters: codec::Parameters,
    threads: usize,
}

impl FfmpegCodecFactory {
    /// Attach the first device that can be created for this codec
    fn attach_device(&self, context: &mut codec::context::Context) -> Result<Box<HwNegotiation>> {
        let codec = ffmpeg::decoder::find(self.parameters.id())
            .ok_or_else(|| PlayerError::Decoder(format!("no decoder for {:?}", self.parameters.id())))?;

        for (device_type, pix_fmt) in hardware_configs(&codec) {
            let mut device: *mut ffi::AVBufferRef = ptr::null_mut();
            // SAFETY: on success `device` holds a new reference that the
            // codec context takes over and releases when it is freed.
            let ret = unsafe { ffi::av_hwdevice_ctx_create(&mut device, device_type, ptr::null(), ptr::null_mut(), 0) };
            if ret < 0 {
                debug!("{:?} device unavailable: {}", device_type, ffmpeg::Error::from(ret));
                continue;
            }

            let negotiation = Box::new(HwNegotiation {
                pix_fmt,
                rejected: AtomicBool::new(false),
            });
            // SAFETY: the negotiation box is owned by the codec and outlives
            // the context it is registered with.
            unsafe {
                let raw = context.as_mut_ptr();
                (*raw).hw_device_ctx = device;
                (*raw).opaque = &*negotiation as *const HwNegotiation as *mut c_void;
                (*raw).get_format = Some(negotiate_hw_format);
            }
            info!("decoding {:?} on {:?}", self.parameters.id(), device_type);
            return Ok(negotiation);
        }

        Err(PlayerError::Decoder(format!(
            "no hardware device for {:?}",
            self.parameters.id()
        )))
    }
}

impl CodecFactory for FfmpegCodecFactory {
    fn supports_hardware(&self) -> bool {
        self.media_type == MediaType::Video
            && ffmpeg::decoder::find(self.parameters.id()).is_some_and(|codec| !hardware_configs(&codec).is_empty())
    }

    fn open(&mut self, mode: DecodeMode) -> Result<Box<dyn CodecContext>> {
        let mut context = codec::context::Context::from_parameters(self.parameters.clone())?;
        let hw = if mode == DecodeMode::Hardware {
            if self.media_type != MediaType::Video {
                return Err(PlayerError::Decoder("hardware decoding is video only".to_string()));
            }
            // get_format must run on the decoding thread
            Some(self.attach_device(&mut context)?)
        } else {
            context.set_threading(codec::threading::Config {
                kind: codec::threading::Type::Frame,
                count: self.threads,
            });
            None
        };
        let decoder = context.decoder();

        let kind = match self.media_type {
            MediaType::Video => CodecKind::Video(decoder.video()?),
            MediaType::Audio => CodecKind::Audio(decoder.audio()?),
            MediaType::Subtitle => CodecKind::Subtitle(decoder.subtitle()?),
            MediaType::Data => return Err(PlayerError::Decoder("data streams carry no frames".to_string())),
        };

        Ok(Box::new(FfmpegCodec {
            kind,
            hw,
            pending: VecDeque::new(),
            draining: false,
        }))
    }
}

enum CodecKind {
    Video(codec::decoder::Video),
    Audio(codec::decoder::Audio),
    Subtitle(codec::decoder::Subtitle),
}

/// Open codec context
pub struct FfmpegCodec {
    kind: CodecKind,
    /// Set in hardware mode; dropped after the context that points at it
    hw: Option<Box<HwNegotiation>>,
    /// Subtitle events decoded on send
    pending: VecDeque<DecodedFrame>,
    draining: bool,
}

fn to_ffmpeg_packet(packet: &Packet) -> ffmpeg::Packet {
    let mut out = ffmpeg::Packet::copy(&packet.data);
    out.set_stream(packet.stream_index);
    out.set_pts(packet.pts);
    out.set_dts(packet.dts);
    out.set_duration(packet.duration);
    out.set_position(packet.pos as isize);
    out
}

fn send_status(result: std::result::Result<(), ffmpeg::Error>) -> SendStatus {
    match result {
        Ok(()) => SendStatus::Accepted,
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => SendStatus::Again,
        Err(ffmpeg::Error::Eof) => SendStatus::Eof,
        Err(e) => SendStatus::Failed(e.to_string()),
    }
}

fn receive_status<F>(result: std::result::Result<(), ffmpeg::Error>, frame: F) -> ReceiveStatus
where
    F: FnOnce() -> std::result::Result<DecodedFrame, String>,
{
    match result {
        Ok(()) => match frame() {
            Ok(decoded) => ReceiveStatus::Frame(decoded),
            Err(msg) => ReceiveStatus::Failed(msg),
        },
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => ReceiveStatus::Again,
        Err(ffmpeg::Error::Eof) => ReceiveStatus::Eof,
        Err(e) => ReceiveStatus::Failed(e.to_string()),
    }
}

impl FfmpegCodec {
    fn hardware_rejected(&self) -> bool {
        self.hw.as_ref().is_some_and(|hw| hw.rejected.load(Ordering::Acquire))
    }
}

impl CodecContext for FfmpegCodec {
    fn send_packet(&mut self, packet: &Packet) -> SendStatus {
        if self.hardware_rejected() {
            return SendStatus::HardwareRejected;
        }
        let status = match &mut self.kind {
            CodecKind::Video(decoder) => {
                if packet.is_null() {
                    send_status(decoder.send_eof())
                } else {
                    send_status(decoder.send_packet(&to_ffmpeg_packet(packet)))
                }
            }
            CodecKind::Audio(decoder) => {
                if packet.is_null() {
                    send_status(decoder.send_eof())
                } else {
                    send_status(decoder.send_packet(&to_ffmpeg_packet(packet)))
                }
            }
            CodecKind::Subtitle(decoder) => {
                if packet.is_null() {
                    self.draining = true;
                    return SendStatus::Accepted;
                }
                let mut subtitle = codec::subtitle::Subtitle::new();
                match decoder.decode(&to_ffmpeg_packet(packet), &mut subtitle) {
                    Ok(true) => {
                        self.pending.push_back(DecodedFrame {
                            pts: packet.pts,
                            best_effort_timestamp: packet.pts,
                            pkt_dts: packet.dts,
                            pos: packet.pos,
                            payload: FramePayload::Subtitle(subtitle_image(&subtitle)),
                        });
                        SendStatus::Accepted
                    }
                    Ok(false) => SendStatus::Accepted,
                    Err(e) => SendStatus::Failed(e.to_string()),
                }
            }
        };
        if self.hardware_rejected() {
            return SendStatus::HardwareRejected;
        }
        status
    }

    fn receive_frame(&mut self) -> ReceiveStatus {
        // the next send reports the rejection and triggers the reopen
        if self.hardware_rejected() {
            return ReceiveStatus::Again;
        }
        match &mut self.kind {
            CodecKind::Video(decoder) => {
                let mut frame = ffmpeg::frame::Video::empty();
                let result = decoder.receive_frame(&mut frame);
                receive_status(result, || video_frame(&frame))
            }
            CodecKind::Audio(decoder) => {
                let mut frame = ffmpeg::frame::Audio::empty();
                let result = decoder.receive_frame(&mut frame);
                receive_status(result, || audio_frame(&frame))
            }
            CodecKind::Subtitle(_) => match self.pending.pop_front() {
                Some(frame) => ReceiveStatus::Frame(frame),
                None if self.draining => ReceiveStatus::Eof,
                None => ReceiveStatus::Again,
            },
        }
    }

    fn flush(&mut self) {
        match &mut self.kind {
            CodecKind::Video(decoder) => decoder.flush(),
            CodecKind::Audio(decoder) => decoder.flush(),
            CodecKind::Subtitle(decoder) => decoder.flush(),
        }
        self.pending.clear();
        self.draining = false;
    }

    fn mode(&self) -> DecodeMode {
        if self.hw.is_some() {
            DecodeMode::Hardware
        } else {
            DecodeMode::Software
        }
    }
}

fn frame_pkt_dts(frame: &ffmpeg::Frame) -> Option<i64> {
    // SAFETY: reads a plain field of a frame owned by the caller.
    timestamp(unsafe { (*frame.as_ptr()).pkt_dts })
}

/// Copy a device frame into system memory; `None` for software frames
fn download(frame: &ffmpeg::frame::Video) -> std::result::Result<Option<ffmpeg::frame::Video>, String> {
    // SAFETY: both frames are owned here; the transfer allocates the
    // destination buffers.
    unsafe {
        if (*frame.as_ptr()).hw_frames_ctx.is_null() {
            return Ok(None);
        }
        let mut sw = ffmpeg::frame::Video::empty();
        let ret = ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), frame.as_ptr(), 0);
        if ret < 0 {
            return Err(format!("hardware frame download failed: {}", ffmpeg::Error::from(ret)));
        }
        Ok(Some(sw))
    }
}

fn video_frame(frame: &ffmpeg::frame::Video) -> std::result::Result<DecodedFrame, String> {
    let downloaded = download(frame)?;
    let picture = picture(downloaded.as_ref().unwrap_or(frame))?;

    Ok(DecodedFrame {
        pts: frame.pts(),
        best_effort_timestamp: frame.timestamp(),
        pkt_dts: frame_pkt_dts(frame),
        pos: -1,
        payload: FramePayload::Video(picture),
    })
}

fn picture(frame: &ffmpeg::frame::Video) -> std::result::Result<VideoPicture, String> {
    let converted;
    let source = if frame.format() == format::Pixel::YUV420P {
        frame
    } else {
        let mut scaler = software::scaling::Context::get(
            frame.format(),
            frame.width(),
            frame.height(),
            format::Pixel::YUV420P,
            frame.width(),
            frame.height(),
            software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| format!("no converter for {:?}: {}", frame.format(), e))?;
        let mut out = ffmpeg::frame::Video::empty();
        scaler.run(frame, &mut out).map_err(|e| e.to_string())?;
        converted = out;
        &converted
    };

    let planes = (0..3).map(|i| source.data(i).to_vec()).collect();
    let strides = (0..3).map(|i| source.stride(i)).collect();

    Ok(VideoPicture {
        width: source.width(),
        height: source.height(),
        format: PixelFormat::Yuv420p,
        planes,
        strides,
    })
}

fn sample_at(bytes: &[u8], kind: format::Sample, index: usize) -> f32 {
    fn read<const N: usize>(bytes: &[u8], index: usize) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(chunk) = bytes.get(index * N..(index + 1) * N) {
            out.copy_from_slice(chunk);
        }
        out
    }

    match kind {
        format::Sample::U8(_) => (read::<1>(bytes, index)[0] as f32 - 128.0) / 128.0,
        format::Sample::I16(_) => i16::from_ne_bytes(read(bytes, index)) as f32 / 32_768.0,
        format::Sample::I32(_) => i32::from_ne_bytes(read(bytes, index)) as f32 / 2_147_483_648.0,
        format::Sample::I64(_) => i64::from_ne_bytes(read(bytes, index)) as f32 / 9.223_372e18,
        format::Sample::F32(_) => f32::from_ne_bytes(read(bytes, index)),
        format::Sample::F64(_) => f64::from_ne_bytes(read(bytes, index)) as f32,
        format::Sample::None => 0.0,
    }
}

fn audio_frame(frame: &ffmpeg::frame::Audio) -> std::result::Result<DecodedFrame, String> {
    // SAFETY: reads a plain field of a frame owned by the caller.
    let channels = unsafe { (*frame.as_ptr()).ch_layout.nb_channels }.max(1) as usize;
    let nb_samples = frame.samples();
    let kind = frame.format();
    if kind == format::Sample::None {
        return Err("audio frame without sample format".to_string());
    }

    let mut data = Vec::with_capacity(nb_samples * channels);
    if frame.is_planar() {
        for i in 0..nb_samples {
            for ch in 0..channels {
                data.push(sample_at(frame.data(ch), kind, i));
            }
        }
    } else {
        let bytes = frame.data(0);
        for i in 0..nb_samples * channels {
            data.push(sample_at(bytes, kind, i));
        }
    }

    Ok(DecodedFrame {
        pts: frame.pts(),
        best_effort_timestamp: frame.timestamp(),
        pkt_dts: frame_pkt_dts(frame),
        pos: -1,
        payload: FramePayload::Audio(AudioSamples {
            sample_rate: frame.rate(),
            channels: channels as u16,
            nb_samples,
            data,
        }),
    })
}

fn subtitle_image(subtitle: &codec::subtitle::Subtitle) -> SubtitleImage {
    let rects = subtitle
        .rects()
        .filter_map(|rect| match rect {
            codec::subtitle::Rect::Text(text) => Some(SubtitleRect {
                text: Some(text.get().to_string()),
                ..Default::default()
            }),
            codec::subtitle::Rect::Ass(ass) => Some(SubtitleRect {
                text: Some(ass.get().to_string()),
                ..Default::default()
            }),
            codec::subtitle::Rect::Bitmap(bitmap) => Some(SubtitleRect {
                x: bitmap.x() as i32,
                y: bitmap.y() as i32,
                width: bitmap.width(),
                height: bitmap.height(),
                ..Default::default()
            }),
            codec::subtitle::Rect::None(_) => {
                warn!("skipping empty subtitle rect");
                None
            }
        })
        .collect();

    SubtitleImage {
        start_display_ms: subtitle.start(),
        end_display_ms: subtitle.end(),
        rects,
        width: 0,
        height: 0,
    }
}
