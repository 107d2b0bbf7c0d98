//! Capability seams between the pipeline and the concrete media backend.
//!
//! Codecs are driven the asynchronous buffer-exchange way: they announce
//! free input slots and finished output slots through a [`CodecCallback`],
//! and the pipeline thread answers each announcement in turn.

use std::path::Path;

use bytes::Bytes;

use crate::{frame::RawFrame, stream::AvStream, surface::Surface};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const KEY_FRAME: BufferFlags = BufferFlags(1);
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(2);
    pub const END_OF_STREAM: BufferFlags = BufferFlags(4);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_key_frame(&self) -> bool {
        self.contains(Self::KEY_FRAME)
    }

    pub fn is_codec_config(&self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.contains(Self::END_OF_STREAM)
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        BufferFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Describes the valid region of a codec buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn new(size: usize, presentation_time_us: i64, flags: BufferFlags) -> Self {
        Self {
            offset: 0,
            size,
            presentation_time_us,
            flags,
        }
    }

    pub fn end_of_stream(presentation_time_us: i64) -> Self {
        Self::new(0, presentation_time_us, BufferFlags::END_OF_STREAM)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecRole {
    Decoder,
    Encoder,
}

impl std::fmt::Display for CodecRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecRole::Decoder => write!(f, "decoder"),
            CodecRole::Encoder => write!(f, "encoder"),
        }
    }
}

#[derive(Debug)]
pub enum CodecEvent {
    InputAvailable(usize),
    OutputAvailable { index: usize, info: BufferInfo },
    OutputFormatChanged(OutputFormat),
    Error(String),
}

/// Everything the pipeline thread reacts to, tagged by origin.
#[derive(Debug)]
pub enum PipelineEvent {
    Decoder(CodecEvent),
    Encoder(CodecEvent),
}

/// Handle a codec uses to post its events onto the owning event loop.
#[derive(Clone, Debug)]
pub struct CodecCallback {
    role: CodecRole,
    tx: std::sync::mpsc::Sender<PipelineEvent>,
}

impl CodecCallback {
    pub fn new(role: CodecRole, tx: std::sync::mpsc::Sender<PipelineEvent>) -> Self {
        Self { role, tx }
    }

    pub fn role(&self) -> CodecRole {
        self.role
    }

    pub fn post(&self, event: CodecEvent) {
        let event = match self.role {
            CodecRole::Decoder => PipelineEvent::Decoder(event),
            CodecRole::Encoder => PipelineEvent::Encoder(event),
        };
        if let Err(e) = self.tx.send(event) {
            log::debug!("{} event dropped, loop gone: {:?}", self.role, e.0);
        }
    }

    pub fn input_available(&self, index: usize) {
        self.post(CodecEvent::InputAvailable(index));
    }

    pub fn output_available(&self, index: usize, info: BufferInfo) {
        self.post(CodecEvent::OutputAvailable { index, info });
    }

    pub fn output_format_changed(&self, format: OutputFormat) {
        self.post(CodecEvent::OutputFormatChanged(format));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.post(CodecEvent::Error(message.into()));
    }
}

/// Container metadata values that may be stored as either integer or real.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FormatValue {
    Int(i64),
    Float(f64),
}

impl FormatValue {
    pub fn as_f32(&self) -> f32 {
        match *self {
            FormatValue::Int(v) => v as f32,
            FormatValue::Float(v) => v as f32,
        }
    }
}

/// Per-track description reported by a [`Demuxer`].
#[derive(Clone, Default)]
pub struct TrackFormat {
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub rotation: Option<i32>,
    pub duration_us: Option<i64>,
    pub frame_rate: Option<FormatValue>,
    /// Backend stream handle, present when the track comes from ffmpeg.
    pub stream: Option<AvStream>,
}

impl TrackFormat {
    pub fn new(mime: impl Into<String>) -> Self {
        Self {
            mime: mime.into(),
            ..Default::default()
        }
    }

    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::new(mime)
        }
    }

    pub fn with_rotation(mut self, rotation: i32) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_duration_us(mut self, duration_us: i64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: FormatValue) -> Self {
        self.frame_rate = Some(frame_rate);
        self
    }

    pub fn with_stream(mut self, stream: AvStream) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn is_video(&self) -> bool {
        self.mime.to_ascii_lowercase().starts_with("video/")
    }
}

impl std::fmt::Debug for TrackFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackFormat")
            .field("mime", &self.mime)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("rotation", &self.rotation)
            .field("duration_us", &self.duration_us)
            .field("frame_rate", &self.frame_rate)
            .field("stream", &self.stream.as_ref().map(|s| s.index()))
            .finish()
    }
}

/// What the encoder is configured with.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub bit_rate: u64,
    pub frame_rate: u32,
    pub key_frame_interval_secs: u32,
}

/// Final format negotiated by the encoder, reported once before any data.
#[derive(Clone)]
pub struct OutputFormat {
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Codec specific data (SPS/PPS for AVC) when the encoder exposes it.
    pub csd: Option<Bytes>,
    pub parameters: Option<ffmpeg_next::codec::Parameters>,
}

impl OutputFormat {
    pub fn new(mime: impl Into<String>, width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            mime: mime.into(),
            width,
            height,
            frame_rate,
            csd: None,
            parameters: None,
        }
    }
}

impl std::fmt::Debug for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputFormat")
            .field("mime", &self.mime)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("frame_rate", &self.frame_rate)
            .field("csd", &self.csd.as_ref().map(|c| c.len()))
            .field("parameters", &self.parameters.is_some())
            .finish()
    }
}

// Parameters wraps a raw AVCodecParameters pointer it owns.
unsafe impl Send for OutputFormat {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Unconfigured,
    Configured,
    Running,
    Draining,
    Stopped,
}

pub trait Demuxer: Send {
    fn track_count(&self) -> usize;
    fn track_format(&self, index: usize) -> anyhow::Result<TrackFormat>;
    fn select_track(&mut self, index: usize) -> anyhow::Result<()>;
    /// Copies the current sample into `buf`; `None` once the track is exhausted.
    fn read_sample(&mut self, buf: &mut Vec<u8>) -> anyhow::Result<Option<usize>>;
    fn sample_time(&self) -> Option<i64>;
    /// Moves to the next sample, returning false when there is none.
    fn advance(&mut self) -> bool;
    fn release(&mut self);
}

pub trait DecoderCodec: Send {
    fn name(&self) -> &str;
    fn configure(&mut self, format: &TrackFormat, callback: CodecCallback) -> anyhow::Result<()>;
    fn start(&mut self) -> anyhow::Result<()>;
    fn input_buffer(&mut self, index: usize) -> Option<&mut Vec<u8>>;
    fn queue_input_buffer(&mut self, index: usize, info: BufferInfo) -> anyhow::Result<()>;
    fn output_frame(&mut self, index: usize) -> anyhow::Result<Option<RawFrame>>;
    fn release_output_buffer(&mut self, index: usize) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
    fn release(&mut self);
}

pub trait EncoderCodec: Send {
    fn name(&self) -> &str;
    fn configure(&mut self, format: &EncoderFormat, callback: CodecCallback)
    -> anyhow::Result<()>;
    /// Must be called between configure and start; yields the only input path.
    fn create_input_surface(&mut self) -> anyhow::Result<Surface>;
    fn start(&mut self) -> anyhow::Result<()>;
    fn signal_end_of_input_stream(&mut self) -> anyhow::Result<()>;
    fn output_buffer(&mut self, index: usize) -> Option<Bytes>;
    fn release_output_buffer(&mut self, index: usize) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
    fn release(&mut self);
}

pub trait ContainerWriter: Send {
    fn add_track(&mut self, format: &OutputFormat) -> anyhow::Result<usize>;
    fn start(&mut self) -> anyhow::Result<()>;
    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo)
    -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
    fn release(&mut self);
}

/// Factory for every media primitive a job needs.
pub trait MediaBackend: Send + Sync {
    fn open_demuxer(&self, uri: &str) -> anyhow::Result<Box<dyn Demuxer>>;
    /// Names of every decoder able to handle `format`, best first.
    fn decoder_names(&self, format: &TrackFormat) -> Vec<String>;
    fn create_decoder_for(&self, format: &TrackFormat) -> anyhow::Result<Box<dyn DecoderCodec>>;
    fn create_encoder_by_type(&self, mime: &str) -> anyhow::Result<Box<dyn EncoderCodec>>;
    fn create_writer(&self, path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>>;
}
