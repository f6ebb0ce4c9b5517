//! video — FFmpeg capture + annotated-output bridge
//!
//! Capture is pull-based: the session asks its [`VideoStream`] for the next
//! decoded frame once per tick, so pacing is owned by the frame clock rather
//! than by the decoder.  The same code path serves recorded clips, network
//! URLs and live camera devices (`v4l2`, `avfoundation`, `dshow`).
//!
//! [`VideoWriter`] encodes the annotated render surface to H.264, opening the
//! encoder lazily once the first frame fixes the output size.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, decoder, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use tracing::{debug, info, warn};

use crate::error::CaptureError;

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaling flags — bilinear is fast and good enough for decode and encode.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
/// Millisecond time base used for the annotated output.
const MS_TIME_BASE: (i32, i32) = (1, 1000);

/// A single video frame in packed RGB24, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation time in milliseconds, when the source provides one.
    pub pts_ms: Option<u64>,
}

impl RgbFrame {
    /// Black frame of the given size.
    pub fn black(width: u32, height: u32) -> Self {
        Self {
            data: vec![0u8; width as usize * height as usize * 3],
            width,
            height,
            pts_ms: None,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }
}

// ── Capture traits ───────────────────────────────────────────────────────────

/// Something that can hand out a live video stream (camera, clip, URL).
pub trait CaptureDevice {
    /// Acquire a stream.  Permission and availability failures are typed so
    /// the session can report them to the user.
    fn open(&mut self) -> Result<Box<dyn VideoStream>, CaptureError>;
}

/// An acquired stream.  Owning one means owning the underlying device.
pub trait VideoStream {
    /// Next decoded frame; `Ok(None)` once the source is exhausted.
    fn read_frame(&mut self) -> Result<Option<RgbFrame>>;

    /// Release every track of the stream.  Must be safe to call twice.
    fn stop(&mut self);
}

// ── FFmpeg capture ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum CaptureSource {
    /// Local file or network URL, demuxer chosen by FFmpeg.
    Path(PathBuf),
    /// Capture device opened through an FFmpeg input device, e.g.
    /// `("v4l2", "/dev/video0")` or `("avfoundation", "0")`.
    Device { format: String, path: String },
}

impl CaptureSource {
    fn display_name(&self) -> String {
        match self {
            Self::Path(p) => p.display().to_string(),
            Self::Device { format, path } => format!("{format}:{path}"),
        }
    }
}

pub struct FfmpegCapture {
    source: CaptureSource,
}

impl FfmpegCapture {
    pub fn new(source: CaptureSource) -> Self {
        Self { source }
    }

    fn open_input(&self) -> Result<format::context::Input, CaptureError> {
        let name = self.source.display_name();
        ffmpeg::init().map_err(|e| CaptureError::from_ffmpeg(&name, e))?;

        match &self.source {
            CaptureSource::Path(path) => {
                let is_url = path.to_string_lossy().contains("://");
                if !is_url && !path.exists() {
                    return Err(CaptureError::NoDevice(name));
                }
                format::input(path).map_err(|e| CaptureError::from_ffmpeg(&name, e))
            }
            CaptureSource::Device {
                format: wanted,
                path,
            } => {
                ffmpeg::device::register_all();
                let input_format = ffmpeg::device::input::video()
                    .find(|f| f.name() == wanted.as_str())
                    .ok_or_else(|| CaptureError::Unavailable {
                        source_name: name.clone(),
                        reason: format!("FFmpeg has no `{wanted}` input device"),
                    })?;
                match format::open_with(path, &input_format, ffmpeg::Dictionary::new()) {
                    Ok(format::context::Context::Input(ictx)) => Ok(ictx),
                    Ok(format::context::Context::Output(_)) => Err(CaptureError::Unavailable {
                        source_name: name,
                        reason: "device opened as an output".to_string(),
                    }),
                    Err(e) => Err(CaptureError::from_ffmpeg(&name, e)),
                }
            }
        }
    }
}

impl CaptureDevice for FfmpegCapture {
    fn open(&mut self) -> Result<Box<dyn VideoStream>, CaptureError> {
        let name = self.source.display_name();
        let ictx = self.open_input()?;
        let decoding = Decoding::new(ictx).map_err(|e| CaptureError::Unavailable {
            source_name: name.clone(),
            reason: format!("{e:#}"),
        })?;
        info!(
            source = %name,
            width = decoding.width,
            height = decoding.height,
            "capture stream opened"
        );
        Ok(Box::new(FfmpegStream {
            name,
            decoding: Some(decoding),
        }))
    }
}

struct Decoding {
    ictx: format::context::Input,
    decoder: decoder::Video,
    to_rgb: scaling::Context,
    video_stream_index: usize,
    time_base: Rational,
    width: u32,
    height: u32,
    decoded: frame::Video,
    rgb: frame::Video,
    frame_count: u64,
    eof: bool,
}

impl Decoding {
    fn new(ictx: format::context::Input) -> Result<Self> {
        let input_video_stream = ictx
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let video_stream_index = input_video_stream.index();
        let time_base = input_video_stream.time_base();

        let decoder_ctx = codec::context::Context::from_parameters(input_video_stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();
        let to_rgb = scaling::Context::get(
            decoder.format(),
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            video_stream_index,
            time_base,
            width,
            height,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            frame_count: 0,
            eof: false,
        })
    }

    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert().map(Some);
            }
            if self.eof {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() == self.video_stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .context("decoder send_packet")?;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().ok();
                    self.eof = true;
                }
                Err(e) => return Err(e).context("failed to read packet"),
            }
        }
    }

    fn convert(&mut self) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let row_len = self.width as usize * 3;
        let mut data = Vec::with_capacity(row_len * self.height as usize);
        for row in 0..self.height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_len]);
        }

        let pts_ms = self
            .decoded
            .pts()
            .or_else(|| self.decoded.timestamp())
            .and_then(|pts| pts_to_ms(pts, self.time_base));

        self.frame_count += 1;
        if self.frame_count % 100 == 0 {
            debug!(frame_count = self.frame_count, "decoded frames");
        }

        Ok(RgbFrame {
            data,
            width: self.width,
            height: self.height,
            pts_ms,
        })
    }
}

fn pts_to_ms(pts: i64, time_base: Rational) -> Option<u64> {
    if pts < 0 || time_base.denominator() <= 0 {
        return None;
    }
    let ms = pts as i128 * time_base.numerator() as i128 * 1000 / time_base.denominator() as i128;
    u64::try_from(ms).ok()
}

struct FfmpegStream {
    name: String,
    decoding: Option<Decoding>,
}

impl VideoStream for FfmpegStream {
    fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
        match self.decoding.as_mut() {
            Some(decoding) => decoding.next_frame(),
            None => Ok(None),
        }
    }

    fn stop(&mut self) {
        if let Some(decoding) = self.decoding.take() {
            info!(
                source = %self.name,
                frames = decoding.frame_count,
                "capture stream released"
            );
        }
    }
}

/// Names and descriptions of the video input devices FFmpeg was built with.
pub fn list_video_devices() -> Result<Vec<(String, String)>> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;
    ffmpeg::device::register_all();
    Ok(ffmpeg::device::input::video()
        .map(|f| (f.name().to_string(), f.description().to_string()))
        .collect())
}

// ── Annotated output ─────────────────────────────────────────────────────────

struct EncoderState {
    video_encoder: encoder::Video,
    to_yuv: scaling::Context,
    out_rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    video_out_index: usize,
    out_width: u32,
    out_height: u32,
    last_pts: Option<i64>,
}

/// H.264 writer for render-surface frames, timestamped in milliseconds.
pub struct VideoWriter {
    octx: format::context::Output,
    output_path: PathBuf,
    fps: u32,
    state: Option<EncoderState>,
    frames: u64,
}

impl VideoWriter {
    pub fn create<P: AsRef<Path>>(output_path: P, fps: u32) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;
        let octx = format::output(&output_path).context("could not create output context")?;
        Ok(Self {
            octx,
            output_path: output_path.as_ref().to_path_buf(),
            fps: fps.max(1),
            state: None,
            frames: 0,
        })
    }

    pub fn write(&mut self, frame: &RgbFrame, timestamp_ms: u64) -> Result<()> {
        if self.state.is_none() {
            self.state = Some(self.open_encoder(frame.width, frame.height)?);
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        anyhow::ensure!(
            frame.width == state.out_width && frame.height == state.out_height,
            "frame size changed from {}x{} to {}x{}",
            state.out_width,
            state.out_height,
            frame.width,
            frame.height
        );

        let out_stride = state.out_rgb_frame.stride(0);
        let row_len = state.out_width as usize * 3;
        let plane_data = state.out_rgb_frame.data_mut(0);
        for row in 0..state.out_height as usize {
            let dst_start = row * out_stride;
            let src_start = row * row_len;
            plane_data[dst_start..dst_start + row_len]
                .copy_from_slice(&frame.data[src_start..src_start + row_len]);
        }

        state
            .to_yuv
            .run(&state.out_rgb_frame, &mut state.yuv_frame)
            .context("to-YUV scaling failed")?;

        // The encoder rejects non-increasing timestamps.
        let mut pts = i64::try_from(timestamp_ms).unwrap_or(i64::MAX);
        if let Some(last) = state.last_pts {
            pts = pts.max(last + 1);
        }
        state.last_pts = Some(pts);
        state.yuv_frame.set_pts(Some(pts));

        state
            .video_encoder
            .send_frame(&state.yuv_frame)
            .context("encoder send_frame")?;
        flush_encoder(&mut state.video_encoder, &mut self.octx, state.video_out_index)?;

        self.frames += 1;
        Ok(())
    }

    fn open_encoder(&mut self, out_w: u32, out_h: u32) -> Result<EncoderState> {
        let global_header = self
            .octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);
        let encoder_codec = encoder::find(codec::Id::H264)
            .context("H.264 encoder not found — is FFmpeg built with libx264?")?;
        let time_base = Rational::new(MS_TIME_BASE.0, MS_TIME_BASE.1);

        let mut video_out_stream = self.octx.add_stream(encoder_codec)?;
        let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
        let mut video_encoder_builder = encoder_ctx.encoder().video()?;

        video_encoder_builder.set_width(out_w);
        video_encoder_builder.set_height(out_h);
        video_encoder_builder.set_format(ENCODE_FORMAT);
        video_encoder_builder.set_time_base(time_base);
        video_encoder_builder.set_frame_rate(Some(Rational::new(self.fps as i32, 1)));
        if global_header {
            video_encoder_builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
        }

        let video_encoder = video_encoder_builder
            .open_as_with(
                encoder_codec,
                ffmpeg::Dictionary::from_iter([("crf", "23"), ("preset", "veryfast")]),
            )
            .context("failed to open H.264 encoder")?;

        video_out_stream.set_parameters(&video_encoder);
        video_out_stream.set_time_base(time_base);
        let video_out_index = video_out_stream.index();

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            out_w,
            out_h,
            ENCODE_FORMAT,
            out_w,
            out_h,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        info!(out_w, out_h, path = %self.output_path.display(), "writing annotated output");
        self.octx
            .write_header()
            .context("failed to write output header")?;

        Ok(EncoderState {
            video_encoder,
            to_yuv,
            out_rgb_frame: frame::Video::new(format::Pixel::RGB24, out_w, out_h),
            yuv_frame: frame::Video::empty(),
            video_out_index,
            out_width: out_w,
            out_height: out_h,
            last_pts: None,
        })
    }

    /// Flush the encoder and write the trailer.
    pub fn finish(mut self) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            warn!(path = %self.output_path.display(), "no frames written; output left empty");
            return Ok(());
        };
        state.video_encoder.send_eof().ok();
        flush_encoder(&mut state.video_encoder, &mut self.octx, state.video_out_index)?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;
        info!(frames = self.frames, "annotated output complete");
        Ok(())
    }
}

/// Drain all pending packets from the encoder and write them to the muxer.
fn flush_encoder(
    encoder: &mut encoder::Video,
    octx: &mut format::context::Output,
    stream_index: usize,
) -> Result<()> {
    let time_base = Rational::new(MS_TIME_BASE.0, MS_TIME_BASE.1);
    let out_time_base = octx
        .stream(stream_index)
        .context("output stream disappeared")?
        .time_base();
    let mut encoded = ffmpeg::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(stream_index);
        encoded.rescale_ts(time_base, out_time_base);
        encoded
            .write_interleaved(octx)
            .context("failed to write encoded packet")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_conversion() {
        assert_eq!(pts_to_ms(90_000, Rational::new(1, 90_000)), Some(1000));
        assert_eq!(pts_to_ms(3, Rational::new(1, 30)), Some(100));
        assert_eq!(pts_to_ms(-1, Rational::new(1, 30)), None);
    }

    #[test]
    fn missing_file_is_no_device() {
        let mut capture = FfmpegCapture::new(CaptureSource::Path(PathBuf::from(
            "/nonexistent/bartrack/clip.mp4",
        )));
        assert!(matches!(capture.open(), Err(CaptureError::NoDevice(_))));
    }

    #[test]
    fn black_frame_pixels() {
        let frame = RgbFrame::black(4, 3);
        assert_eq!(frame.data.len(), 36);
        assert_eq!(frame.pixel(3, 2), Some([0, 0, 0]));
        assert_eq!(frame.pixel(4, 0), None);
    }
}
