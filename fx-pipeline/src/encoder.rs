use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use ffmpeg_next::{Dictionary, Rational, format::Pixel};

use crate::{
    codec::{
        BufferFlags, BufferInfo, CodecCallback, EncoderCodec, EncoderFormat, MediaBackend,
        OutputFormat, StageState,
    },
    error::{TranscodeError, TranscodeResult},
    frame::SurfaceFrame,
    geometry::MediaGeometry,
    hw::encoder_candidates,
    output::SinkWriter,
    packet::EncodedUnit,
    surface::Surface,
    timestamp::TimestampQueue,
};

pub const BITS_PER_PIXEL: f32 = 0.15;
pub const KEY_FRAME_INTERVAL_SECS: u32 = 5;

impl EncoderFormat {
    /// Output format for a source of `geometry`: rotated size, fixed
    /// bits-per-pixel bitrate over the source size, fixed keyframe interval.
    pub fn for_geometry(mime: impl Into<String>, geometry: &MediaGeometry) -> Self {
        let frame_rate = geometry.frame_rate.round().max(1.0) as u32;
        let bit_rate = (BITS_PER_PIXEL
            * geometry.frame_rate
            * geometry.width as f32
            * geometry.height as f32) as u64;
        Self {
            mime: mime.into(),
            width: geometry.rotated_width(),
            height: geometry.rotated_height(),
            bit_rate,
            frame_rate,
            key_frame_interval_secs: KEY_FRAME_INTERVAL_SECS,
        }
    }
}

struct EncoderCore {
    encoder: Option<ffmpeg_next::codec::encoder::Video>,
    callback: Option<CodecCallback>,
    format: Option<EncoderFormat>,
    output_format: Option<OutputFormat>,
    started: bool,
    format_posted: bool,
    eos_signaled: bool,
    eos_posted: bool,
    frame_index: i64,
    outputs: HashMap<usize, Bytes>,
    next_output: usize,
}

// The ffmpeg context is only reached through the mutex.
unsafe impl Send for EncoderCore {}

impl EncoderCore {
    fn post_error(&self, message: String) {
        if let Some(callback) = &self.callback {
            callback.error(message);
        }
    }

    fn post_output(&mut self, payload: Bytes, info: BufferInfo) {
        let index = self.next_output;
        self.next_output += 1;
        self.outputs.insert(index, payload);
        if let Some(callback) = &self.callback {
            callback.output_available(index, info);
        }
    }

    fn encode(&mut self, frame: SurfaceFrame) -> anyhow::Result<()> {
        if !self.started || self.eos_signaled {
            anyhow::bail!("encoder not accepting frames");
        }
        let format = self
            .format
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("encoder not configured"))?;
        if frame.width != format.width || frame.height != format.height {
            anyhow::bail!(
                "surface frame {}x{} does not match encoder {}x{}",
                frame.width,
                frame.height,
                format.width,
                format.height
            );
        }
        let frame_duration_us = 1_000_000 / format.frame_rate.max(1) as i64;
        let mut video = to_video_frame(&frame);
        video.set_pts(Some(self.frame_index * frame_duration_us));
        self.frame_index += 1;
        self.encoder
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("encoder released"))?
            .send_frame(&video)?;
        self.drain()
    }

    fn drain(&mut self) -> anyhow::Result<()> {
        loop {
            let mut packet = ffmpeg_next::Packet::empty();
            let received = self
                .encoder
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("encoder released"))?
                .receive_packet(&mut packet);
            match received {
                Ok(()) => {
                    if !self.format_posted {
                        self.format_posted = true;
                        if let (Some(callback), Some(format)) =
                            (&self.callback, self.output_format.clone())
                        {
                            callback.output_format_changed(format);
                        }
                    }
                    let payload = packet
                        .data()
                        .map(Bytes::copy_from_slice)
                        .unwrap_or_default();
                    let flags = if packet.is_key() {
                        BufferFlags::KEY_FRAME
                    } else {
                        BufferFlags::NONE
                    };
                    let pts = packet.pts().unwrap_or(0);
                    self.post_output(payload.clone(), BufferInfo::new(payload.len(), pts, flags));
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(());
                }
                Err(ffmpeg_next::Error::Eof) => {
                    if self.eos_signaled && !self.eos_posted {
                        self.eos_posted = true;
                        self.post_output(Bytes::new(), BufferInfo::end_of_stream(0));
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn to_video_frame(frame: &SurfaceFrame) -> ffmpeg_next::frame::Video {
    let mut video = ffmpeg_next::frame::Video::new(Pixel::YUV420P, frame.width, frame.height);
    let cw = frame.width.div_ceil(2) as usize;
    let planes = [(frame.y(), frame.width as usize), (frame.u(), cw), (frame.v(), cw)];
    for (i, (src, row_len)) in planes.into_iter().enumerate() {
        let stride = video.stride(i);
        let dst = video.data_mut(i);
        for (row, chunk) in src.chunks_exact(row_len).enumerate() {
            dst[row * stride..row * stride + row_len].copy_from_slice(chunk);
        }
    }
    video
}

/// Surface-fed encoder over ffmpeg. Frames presented on the input surface
/// are encoded immediately; packets come back as output events.
pub struct AvEncoder {
    name: String,
    codec_name: String,
    prefer_hardware: bool,
    preset: Option<String>,
    surface_created: bool,
    core: Arc<Mutex<EncoderCore>>,
}

impl AvEncoder {
    pub fn new(codec_name: impl Into<String>, prefer_hardware: bool, preset: Option<String>) -> Self {
        let codec_name = codec_name.into();
        Self {
            name: codec_name.clone(),
            codec_name,
            prefer_hardware,
            preset,
            surface_created: false,
            core: Arc::new(Mutex::new(EncoderCore {
                encoder: None,
                callback: None,
                format: None,
                output_format: None,
                started: false,
                format_posted: false,
                eos_signaled: false,
                eos_posted: false,
                frame_index: 0,
                outputs: HashMap::new(),
                next_output: 0,
            })),
        }
    }

    fn core(&self) -> anyhow::Result<std::sync::MutexGuard<'_, EncoderCore>> {
        self.core
            .lock()
            .map_err(|_| anyhow::anyhow!("encoder {} state poisoned", self.name))
    }

    fn open(
        codec: ffmpeg_next::Codec,
        format: &EncoderFormat,
        preset: Option<&str>,
    ) -> anyhow::Result<ffmpeg_next::codec::encoder::Video> {
        let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = ctx.encoder().video()?;
        encoder.set_width(format.width);
        encoder.set_height(format.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(ffmpeg_next::util::mathematics::rescale::TIME_BASE);
        encoder.set_frame_rate(Some(Rational::new(format.frame_rate as i32, 1)));
        encoder.set_bit_rate(format.bit_rate as usize);
        encoder.set_gop(format.key_frame_interval_secs * format.frame_rate);
        // Surface order must match output order for FIFO re-stamping.
        encoder.set_max_b_frames(0);
        encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        if codec.name() == "libx264" {
            opts.set("preset", preset.unwrap_or("veryfast"));
        }
        Ok(encoder.open_with(opts)?)
    }

    fn output_format(
        encoder: &ffmpeg_next::codec::encoder::Video,
        format: &EncoderFormat,
    ) -> OutputFormat {
        let csd = unsafe {
            let ctx = encoder.as_ptr();
            if (*ctx).extradata.is_null() || (*ctx).extradata_size <= 0 {
                None
            } else {
                Some(Bytes::copy_from_slice(std::slice::from_raw_parts(
                    (*ctx).extradata,
                    (*ctx).extradata_size as usize,
                )))
            }
        };
        let mut output = OutputFormat::new(
            format.mime.clone(),
            format.width,
            format.height,
            format.frame_rate,
        );
        output.csd = csd;
        output.parameters = Some(ffmpeg_next::codec::Parameters::from(encoder));
        output
    }
}

impl EncoderCodec for AvEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, format: &EncoderFormat, callback: CodecCallback) -> anyhow::Result<()> {
        let candidates = encoder_candidates(&self.codec_name, self.prefer_hardware);
        if candidates.is_empty() {
            anyhow::bail!("codec not found: {}", self.codec_name);
        }
        let mut opened = None;
        for codec in candidates {
            match Self::open(codec, format, self.preset.as_deref()) {
                Ok(encoder) => {
                    log::info!("encoder opened successfully: {}", codec.name());
                    self.name = codec.name().to_string();
                    opened = Some(encoder);
                    break;
                }
                Err(e) => {
                    log::warn!("encoder {} failed: {}, trying next", codec.name(), e);
                }
            }
        }
        let encoder =
            opened.ok_or_else(|| anyhow::anyhow!("no usable encoder for {}", format.mime))?;
        let output_format = Self::output_format(&encoder, format);

        let mut core = self.core()?;
        core.encoder = Some(encoder);
        core.output_format = Some(output_format);
        core.format = Some(format.clone());
        core.callback = Some(callback);
        Ok(())
    }

    fn create_input_surface(&mut self) -> anyhow::Result<Surface> {
        if self.core()?.encoder.is_none() {
            anyhow::bail!("input surface requested before configure");
        }
        if self.surface_created {
            anyhow::bail!("input surface already created");
        }
        self.surface_created = true;
        let core = self.core.clone();
        Ok(Surface::new(move |frame| {
            let mut core = core
                .lock()
                .map_err(|_| anyhow::anyhow!("encoder state poisoned"))?;
            // Reported through the callback like any other codec error.
            if let Err(e) = core.encode(frame) {
                core.post_error(format!("{:#}", e));
            }
            Ok(())
        }))
    }

    fn start(&mut self) -> anyhow::Result<()> {
        let mut core = self.core()?;
        if core.encoder.is_none() {
            anyhow::bail!("encoder {} not configured", self.name);
        }
        core.started = true;
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()> {
        let mut core = self.core()?;
        if core.eos_signaled {
            return Ok(());
        }
        core.eos_signaled = true;
        core.encoder
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("encoder released"))?
            .send_eof()?;
        core.drain()
    }

    fn output_buffer(&mut self, index: usize) -> Option<Bytes> {
        self.core().ok()?.outputs.get(&index).cloned()
    }

    fn release_output_buffer(&mut self, index: usize) -> anyhow::Result<()> {
        self.core()?.outputs.remove(&index);
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        let mut core = self.core()?;
        core.started = false;
        core.outputs.clear();
        Ok(())
    }

    fn release(&mut self) {
        if let Ok(mut core) = self.core.lock() {
            core.encoder = None;
            core.callback = None;
            core.outputs.clear();
        }
    }
}

/// Result of handling one encoder output event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodedOutcome {
    pub presentation_time_us: i64,
    pub end_of_stream: bool,
    pub written: bool,
    pub codec_config: bool,
}

/// Encoder state machine. Re-stamps every data unit from the timestamp
/// queue and forwards it to the sink writer.
pub struct EncoderStage {
    codec: Option<Box<dyn EncoderCodec>>,
    state: StageState,
    geometry: MediaGeometry,
    format: EncoderFormat,
    track: Option<usize>,
    units_out: u64,
}

impl EncoderStage {
    pub fn configure(
        backend: &dyn MediaBackend,
        mime: &str,
        geometry: &MediaGeometry,
        callback: CodecCallback,
    ) -> TranscodeResult<Self> {
        let format = EncoderFormat::for_geometry(mime, geometry);
        let mut codec = backend
            .create_encoder_by_type(mime)
            .map_err(TranscodeError::encode)?;
        if let Err(e) = codec.configure(&format, callback) {
            codec.release();
            return Err(TranscodeError::encode(e));
        }
        log::info!(
            "encoder {} configured: {} {}x{} {}bps {}fps keyframe every {}s",
            codec.name(),
            format.mime,
            format.width,
            format.height,
            format.bit_rate,
            format.frame_rate,
            format.key_frame_interval_secs
        );
        Ok(Self {
            codec: Some(codec),
            state: StageState::Configured,
            geometry: *geometry,
            format,
            track: None,
            units_out: 0,
        })
    }

    pub fn format(&self) -> &EncoderFormat {
        &self.format
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn track(&self) -> Option<usize> {
        self.track
    }

    fn codec_mut(&mut self) -> TranscodeResult<&mut Box<dyn EncoderCodec>> {
        self.codec
            .as_mut()
            .ok_or_else(|| TranscodeError::EncodeFailure("encoder released".into()))
    }

    pub fn create_input_surface(&mut self) -> TranscodeResult<Surface> {
        self.codec_mut()?
            .create_input_surface()
            .map_err(TranscodeError::encode)
    }

    pub fn start(&mut self) -> TranscodeResult<()> {
        if self.state != StageState::Configured {
            return Err(TranscodeError::EncodeFailure(format!(
                "start in state {:?}",
                self.state
            )));
        }
        self.codec_mut()?.start().map_err(TranscodeError::encode)?;
        self.state = StageState::Running;
        Ok(())
    }

    /// Tells the encoder no more frames will reach its surface.
    pub fn signal_end_of_input(&mut self) -> TranscodeResult<()> {
        if self.state != StageState::Running {
            log::debug!("end of input ignored in state {:?}", self.state);
            return Ok(());
        }
        self.codec_mut()?
            .signal_end_of_input_stream()
            .map_err(TranscodeError::encode)?;
        self.state = StageState::Draining;
        log::info!("encoder draining");
        Ok(())
    }

    /// Opens the writer track at rotated output size and starts the writer.
    pub fn on_output_format_changed(
        &mut self,
        mut format: OutputFormat,
        writer: &mut SinkWriter,
    ) -> TranscodeResult<()> {
        format.width = self.geometry.rotated_width();
        format.height = self.geometry.rotated_height();
        let track = writer.add_track(&format)?;
        writer.start()?;
        self.track = Some(track);
        log::info!(
            "encoder output format {} {}x{} -> track {}",
            format.mime,
            format.width,
            format.height,
            track
        );
        Ok(())
    }

    pub fn on_output_available(
        &mut self,
        index: usize,
        mut info: BufferInfo,
        timestamps: &mut TimestampQueue,
        writer: &mut SinkWriter,
    ) -> TranscodeResult<EncodedOutcome> {
        let codec_config = info.flags.is_codec_config();
        let end_of_stream = info.flags.is_end_of_stream();
        // An empty end-of-stream marker carries no frame and owns no timestamp.
        let marker_only = end_of_stream && info.size == 0;
        if !codec_config && !marker_only {
            match timestamps.pop() {
                Some(ts) => info.presentation_time_us = ts,
                None if end_of_stream => {}
                None => {
                    return Err(TranscodeError::Desync(format!(
                        "encoded unit {} arrived with no pending timestamp before end of stream",
                        index
                    )));
                }
            }
        }

        let mut written = false;
        if info.size > 0 {
            let payload = self.codec_mut()?.output_buffer(index).ok_or_else(|| {
                TranscodeError::EncodeFailure(format!("no encoder output buffer {}", index))
            })?;
            let track = self.track.ok_or_else(|| {
                TranscodeError::writer_usage("encoded data before output format was known")
            })?;
            writer.write_unit(track, &EncodedUnit::new(payload, info))?;
            written = !codec_config;
        }
        self.codec_mut()?
            .release_output_buffer(index)
            .map_err(TranscodeError::encode)?;
        if written {
            self.units_out += 1;
        }
        if end_of_stream {
            self.state = StageState::Stopped;
            log::info!("encoder end of stream after {} units", self.units_out);
        }
        Ok(EncodedOutcome {
            presentation_time_us: info.presentation_time_us,
            end_of_stream,
            written,
            codec_config,
        })
    }

    pub fn on_error(&self, message: String) -> TranscodeError {
        TranscodeError::EncodeFailure(message)
    }

    pub fn units_out(&self) -> u64 {
        self.units_out
    }

    pub fn release(&mut self) {
        let Some(mut codec) = self.codec.take() else {
            return;
        };
        if self.state != StageState::Configured {
            if let Err(e) = codec.stop() {
                log::warn!("encoder {} stop error: {}", codec.name(), e);
            }
        }
        codec.release();
        self.state = StageState::Stopped;
        log::debug!("encoder {} released", codec.name());
    }
}

impl Drop for EncoderStage {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
