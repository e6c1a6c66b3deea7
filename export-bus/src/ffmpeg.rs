use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use ffmpeg_next::{Dictionary, Rational, format::Pixel, picture};

use crate::{
    avcc,
    backend::{BackendFactory, BackendOutput, EncoderBackend},
    chunk::EncodedChunk,
    config::{BitrateMode, CodecConfig, DEFAULT_QUANTIZER, RateControl},
    error::{ExportError, Result},
    frame::{FrameInput, PixelFormat},
    scaler::Scaler,
};

// libavutil FF_QP2LAMBDA
const QP2LAMBDA: i32 = 118;

/// Maps a codec string ("avc1.640034", "vp09.00.10.08", ...) to an FFmpeg
/// encoder name. Anything unrecognised is taken as an encoder name already.
pub fn encoder_name(codec: &str) -> String {
    let lower = codec.to_ascii_lowercase();
    if lower.starts_with("avc1") || lower.starts_with("avc3") || lower == "h264" {
        "libx264".to_string()
    } else if lower.starts_with("vp09") || lower == "vp9" {
        "libvpx-vp9".to_string()
    } else if lower == "vp8" {
        "libvpx".to_string()
    } else if lower.starts_with("av01") || lower == "av1" {
        "libaom-av1".to_string()
    } else {
        codec.to_string()
    }
}

/// VBV buffer holding one second of `bitrate`, in bits.
fn vbv_buffer_size(bitrate: u64) -> i32 {
    i32::try_from(bitrate).unwrap_or(i32::MAX)
}

fn pixel(format: PixelFormat) -> Pixel {
    match format {
        PixelFormat::Rgba => Pixel::RGBA,
        PixelFormat::Bgra => Pixel::BGRA,
        PixelFormat::Rgb24 => Pixel::RGB24,
        PixelFormat::Yuv420p => Pixel::YUV420P,
    }
}

/// Copies tightly packed planes into an FFmpeg frame, honouring its strides.
fn to_video_frame(input: &FrameInput) -> Result<ffmpeg_next::frame::Video> {
    if input.data.len() != input.expected_size() {
        return Err(ExportError::Encode(format!(
            "frame carries {} bytes, {}x{} {:?} needs {}",
            input.data.len(),
            input.width,
            input.height,
            input.format,
            input.expected_size()
        )));
    }

    let mut frame =
        ffmpeg_next::frame::Video::new(pixel(input.format), input.width, input.height);
    let mut offset = 0;
    for (plane, (row_bytes, rows)) in input
        .format
        .plane_sizes(input.width, input.height)
        .into_iter()
        .enumerate()
    {
        let stride = frame.stride(plane);
        let dst = frame.data_mut(plane);
        for row in 0..rows {
            let src = &input.data[offset + row * row_bytes..offset + (row + 1) * row_bytes];
            dst[row * stride..row * stride + row_bytes].copy_from_slice(src);
        }
        offset += row_bytes * rows;
    }
    frame.set_pts(Some(input.timestamp));
    Ok(frame)
}

/// Encoder backend on top of libavcodec.
pub struct FfmpegBackend {
    config: CodecConfig,
    encoder_name: String,
    is_h264: bool,
    encoder: ffmpeg_next::codec::encoder::Video,
    scaler: Scaler,
    frame_index: u64,
    // source durations by pts, for packets the encoder leaves without one
    durations: HashMap<i64, i64>,
    descriptor_sent: bool,
}

impl FfmpegBackend {
    pub fn open(config: &CodecConfig) -> anyhow::Result<Self> {
        let name = encoder_name(&config.codec);
        let codec = ffmpeg_next::encoder::find_by_name(&name)
            .ok_or(anyhow::anyhow!("codec not found: {}", name))?;
        let is_h264 = codec.id() == ffmpeg_next::codec::Id::H264;

        let context = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = context.encoder().video()?;
        encoder.set_width(config.width);
        encoder.set_height(config.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_frame_rate(Some(Rational::from(config.frame_rate)));
        encoder.set_time_base(ffmpeg_next::util::mathematics::rescale::TIME_BASE);
        encoder.set_gop(config.keyframe_interval);
        // chunks must come out in submission order
        encoder.set_max_b_frames(0);
        // parameter sets go to extradata, which becomes the decoder descriptor
        encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        match config.bitrate_mode {
            BitrateMode::Constant => {
                encoder.set_bit_rate(config.bitrate as usize);
                encoder.set_max_bit_rate(config.bitrate as usize);
                // x264 ignores maxrate without a VBV buffer
                unsafe {
                    (*encoder.as_mut_ptr()).rc_buffer_size = vbv_buffer_size(config.bitrate);
                }
            }
            BitrateMode::Quantizer => {
                encoder.set_flags(
                    ffmpeg_next::codec::Flags::GLOBAL_HEADER | ffmpeg_next::codec::Flags::QSCALE,
                );
                unsafe {
                    (*encoder.as_mut_ptr()).global_quality = DEFAULT_QUANTIZER as i32 * QP2LAMBDA;
                }
                if is_h264 {
                    opts.set("qp", &DEFAULT_QUANTIZER.to_string());
                }
            }
        }
        if is_h264 {
            opts.set("preset", "ultrafast");
            opts.set("tune", "zerolatency");
        }

        let encoder = encoder.open_with(opts)?;
        log::info!(
            "encoder opened: {} {}x{} @ {} fps, {:?}",
            name,
            config.width,
            config.height,
            config.frame_rate,
            config.bitrate_mode
        );

        Ok(Self {
            config: config.clone(),
            encoder_name: name,
            is_h264,
            encoder,
            scaler: Scaler::new(),
            frame_index: 0,
            durations: HashMap::new(),
            descriptor_sent: false,
        })
    }

    pub fn factory() -> BackendFactory {
        Arc::new(|config: &CodecConfig| {
            let backend = FfmpegBackend::open(config)
                .map_err(|e| ExportError::Config(format!("{:#}", e)))?;
            Ok(Box::new(backend) as Box<dyn EncoderBackend>)
        })
    }

    pub fn encoder_name(&self) -> &str {
        &self.encoder_name
    }

    fn extradata(&self) -> Option<&[u8]> {
        unsafe {
            let ctx = self.encoder.0.as_ptr();
            let ptr = (*ctx).extradata;
            let size = (*ctx).extradata_size;
            if ptr.is_null() || size <= 0 {
                return None;
            }
            Some(std::slice::from_raw_parts(ptr, size as usize))
        }
    }

    fn take_descriptor(&mut self) -> Option<Bytes> {
        if self.descriptor_sent {
            return None;
        }
        self.descriptor_sent = true;
        let extradata = self.extradata()?;
        if !self.is_h264 {
            return Some(Bytes::copy_from_slice(extradata));
        }
        match avcc::decoder_descriptor(extradata) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::warn!("{}: unusable extradata: {}", self.encoder_name, e);
                None
            }
        }
    }
}

impl EncoderBackend for FfmpegBackend {
    fn send_frame(&mut self, input: &FrameInput, control: RateControl) -> Result<()> {
        let source = to_video_frame(input)?;
        let mut frame = if source.format() != self.encoder.format()
            || source.width() != self.encoder.width()
            || source.height() != self.encoder.height()
        {
            self.scaler
                .run(
                    &source,
                    self.encoder.format(),
                    self.encoder.width(),
                    self.encoder.height(),
                )
                .map_err(|e| ExportError::Encode(format!("{:#}", e)))?
        } else {
            source
        };

        if self.frame_index % self.config.keyframe_interval as u64 == 0 {
            frame.set_kind(picture::Type::I);
        }
        if let RateControl::Quantizer(qp) = control {
            unsafe {
                (*frame.as_mut_ptr()).quality = qp as i32 * QP2LAMBDA;
            }
        }
        if let Some(duration) = input.duration {
            self.durations.insert(input.timestamp, duration);
        }

        self.encoder.send_frame(&frame)?;
        self.frame_index += 1;
        Ok(())
    }

    fn receive_chunk(&mut self) -> Result<Option<BackendOutput>> {
        let mut packet = ffmpeg_next::Packet::empty();
        match self.encoder.receive_packet(&mut packet) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                return Ok(None);
            }
            Err(ffmpeg_next::Error::Eof) => return Ok(None),
            Err(err) => {
                return Err(ExportError::SessionDead(format!(
                    "{} receive packet: {}",
                    self.encoder_name, err
                )));
            }
        }

        let data = packet.data().unwrap_or_default();
        let data = if self.is_h264 {
            avcc::convert_annexb_to_avcc(data)
        } else {
            Bytes::copy_from_slice(data)
        };
        let timestamp = packet.pts().unwrap_or_default();
        let source_duration = self.durations.remove(&timestamp);
        let duration = match packet.duration() {
            d if d > 0 => d,
            _ => source_duration.unwrap_or_else(|| self.config.frame_duration_us()),
        };
        let chunk = EncodedChunk::new(data, timestamp, duration, packet.is_key());
        log::debug!(
            "encoded chunk: pts: {}, size: {}, key: {}",
            chunk.timestamp,
            chunk.size,
            chunk.is_key
        );

        Ok(Some(BackendOutput {
            chunk,
            descriptor: self.take_descriptor(),
        }))
    }

    fn send_eof(&mut self) -> Result<()> {
        self.encoder.send_eof().map_err(|e| {
            ExportError::SessionDead(format!("{} send eof: {}", self.encoder_name, e))
        })
    }

    /// A drained libavcodec encoder does not take new input; reopen it.
    fn reset(&mut self) -> Result<()> {
        let mut reopened = FfmpegBackend::open(&self.config)
            .map_err(|e| ExportError::SessionDead(format!("reopen encoder: {:#}", e)))?;
        reopened.descriptor_sent = self.descriptor_sent;
        *self = reopened;
        Ok(())
    }
}
