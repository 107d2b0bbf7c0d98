//! Effect transcoding pipeline: demux, decode, render through a frame
//! transform engine, encode from its surface and mux into MP4.

/// Registers FFmpeg components. Call once at startup before opening media.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod backend;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod feed;
pub mod frame;
pub mod geometry;
pub mod hw;
pub mod input;
pub mod metadata;
pub mod output;
pub mod packet;
pub mod pipeline;
pub mod scaler;
pub mod stream;
pub mod surface;
pub mod timestamp;

#[cfg(test)]
pub mod testing;

pub use backend::{BackendSettings, FfmpegBackend};
pub use engine::{Effect, FrameTransformEngine, software::SoftwareEffectEngine};
pub use error::{ErrorKind, TranscodeError, TranscodeResult};
pub use feed::{FeedConfig, FeedReport, FeedTask, FrameFeeder};
pub use geometry::MediaGeometry;
pub use metadata::probe;
pub use pipeline::{JobConfig, JobEvent, JobHandle, JobReport, VideoProcessor};
