use std::path::{Path, PathBuf};

use ffmpeg_next::Rational;

use crate::{
    codec::{BufferInfo, ContainerWriter, MediaBackend, OutputFormat},
    error::{TranscodeError, TranscodeResult},
    packet::EncodedUnit,
    stream::codec_for_mime,
};

const MICROS: Rational = Rational(1, 1_000_000);

/// MP4 muxer over an ffmpeg output context.
pub struct AvOutput {
    inner: Option<ffmpeg_next::format::context::Output>,
    path: PathBuf,
    frame_rate: u32,
    have_written_header: bool,
    have_written_trailer: bool,
}

// Only driven from the pipeline thread.
unsafe impl Send for AvOutput {}

impl AvOutput {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let output = ffmpeg_next::format::output_as(path, "mp4")
            .map_err(|e| anyhow::anyhow!("create {}: {}", path.display(), e))?;
        Ok(Self {
            inner: Some(output),
            path: path.to_path_buf(),
            frame_rate: 0,
            have_written_header: false,
            have_written_trailer: false,
        })
    }

    fn inner(&mut self) -> anyhow::Result<&mut ffmpeg_next::format::context::Output> {
        self.inner
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("output {} released", self.path.display()))
    }
}

impl ContainerWriter for AvOutput {
    fn add_track(&mut self, format: &OutputFormat) -> anyhow::Result<usize> {
        let parameters = format
            .parameters
            .clone()
            .ok_or_else(|| anyhow::anyhow!("output format carries no codec parameters"))?;
        let codec_id = codec_for_mime(&format.mime)
            .ok_or_else(|| anyhow::anyhow!("unsupported output mime {}", format.mime))?;
        self.frame_rate = format.frame_rate;
        let inner = self.inner()?;
        let mut stream = inner.add_stream(ffmpeg_next::encoder::find(codec_id))?;
        stream.set_parameters(parameters);
        stream.set_time_base(MICROS);
        if format.frame_rate > 0 {
            stream.set_avg_frame_rate(Rational::new(format.frame_rate as i32, 1));
        }
        unsafe {
            let par = (*stream.as_mut_ptr()).codecpar;
            (*par).width = format.width as i32;
            (*par).height = format.height as i32;
            // Let the muxer choose the tag for the container.
            (*par).codec_tag = 0;
        }
        Ok(stream.index())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if !self.have_written_header {
            self.inner()?.write_header()?;
            self.have_written_header = true;
        }
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], info: &BufferInfo) -> anyhow::Result<()> {
        if info.flags.is_codec_config() {
            // Already carried by the track's extradata.
            return Ok(());
        }
        let frame_rate = self.frame_rate;
        let inner = self.inner()?;
        let out_time_base = inner
            .stream(track)
            .ok_or_else(|| anyhow::anyhow!("stream {} not found", track))?
            .time_base();
        let mut packet = ffmpeg_next::Packet::copy(data);
        packet.set_stream(track);
        packet.set_pts(Some(info.presentation_time_us));
        packet.set_dts(Some(info.presentation_time_us));
        if frame_rate > 0 {
            packet.set_duration(1_000_000 / frame_rate as i64);
        }
        if info.flags.is_key_frame() {
            packet.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        packet.set_position(-1);
        packet.rescale_ts(MICROS, out_time_base);
        packet.write_interleaved(inner)?;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner()?.write_trailer()?;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.inner = None;
    }
}

/// Usage-checked wrapper over a container writer: one track, added before
/// start, written only after start, finalized exactly once.
pub struct SinkWriter {
    writer: Option<Box<dyn ContainerWriter>>,
    path: PathBuf,
    track: Option<usize>,
    started: bool,
    units_written: u64,
    last_pts: Option<i64>,
}

impl SinkWriter {
    pub fn open(backend: &dyn MediaBackend, path: &Path) -> TranscodeResult<Self> {
        let writer = backend.create_writer(path).map_err(TranscodeError::sink)?;
        log::info!("sink opened: {}", path.display());
        Ok(Self {
            writer: Some(writer),
            path: path.to_path_buf(),
            track: None,
            started: false,
            units_written: 0,
            last_pts: None,
        })
    }

    fn writer_mut(&mut self) -> TranscodeResult<&mut Box<dyn ContainerWriter>> {
        self.writer
            .as_mut()
            .ok_or_else(|| TranscodeError::writer_usage("sink already finalized"))
    }

    pub fn add_track(&mut self, format: &OutputFormat) -> TranscodeResult<usize> {
        if let Some(track) = self.track {
            return Err(TranscodeError::writer_usage(format!(
                "track {} already added",
                track
            )));
        }
        if self.started {
            return Err(TranscodeError::writer_usage("add_track after start"));
        }
        let track = self
            .writer_mut()?
            .add_track(format)
            .map_err(TranscodeError::sink)?;
        self.track = Some(track);
        Ok(track)
    }

    pub fn start(&mut self) -> TranscodeResult<()> {
        if self.started {
            return Err(TranscodeError::writer_usage("writer already started"));
        }
        if self.track.is_none() {
            return Err(TranscodeError::writer_usage("start without a track"));
        }
        self.writer_mut()?.start().map_err(TranscodeError::sink)?;
        self.started = true;
        Ok(())
    }

    pub fn write_unit(&mut self, track: usize, unit: &EncodedUnit) -> TranscodeResult<()> {
        if !self.started {
            return Err(TranscodeError::writer_usage("write before start"));
        }
        if self.track != Some(track) {
            return Err(TranscodeError::writer_usage(format!(
                "unknown track {}",
                track
            )));
        }
        if let Some(last) = self.last_pts {
            if !unit.is_codec_config() && unit.presentation_time_us() < last {
                log::warn!(
                    "non-monotonic pts {} after {}",
                    unit.presentation_time_us(),
                    last
                );
            }
        }
        self.writer_mut()?
            .write_sample(track, unit.data(), &unit.info)
            .map_err(TranscodeError::sink)?;
        if !unit.is_codec_config() {
            self.units_written += 1;
            self.last_pts = Some(unit.presentation_time_us());
        }
        Ok(())
    }

    pub fn units_written(&self) -> u64 {
        self.units_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the container if it was started and releases it. Safe to call
    /// on every path, any number of times.
    pub fn finalize(&mut self) -> TranscodeResult<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        let stopped = if self.started {
            writer.stop().map_err(TranscodeError::sink)
        } else {
            Ok(())
        };
        writer.release();
        log::info!(
            "sink finalized: {} ({} units)",
            self.path.display(),
            self.units_written
        );
        stopped
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            log::warn!("sink finalize on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BufferFlags;
    use crate::error::ErrorKind;
    use crate::testing::{FakeBackend, FakeSource};
    use bytes::Bytes;

    fn unit(pts: i64, flags: BufferFlags) -> EncodedUnit {
        EncodedUnit::new(Bytes::from_static(&[0, 0, 0, 1, 0x65]), BufferInfo::new(5, pts, flags))
    }

    fn format() -> OutputFormat {
        OutputFormat::new("video/avc", 1920, 1080, 30)
    }

    fn open() -> (FakeBackend, SinkWriter) {
        let backend = FakeBackend::new(FakeSource::new(0));
        let sink = SinkWriter::open(&backend, Path::new("out.mp4")).unwrap();
        (backend, sink)
    }

    #[test]
    fn write_before_start_is_usage_error() {
        let (_backend, mut sink) = open();
        let track = sink.add_track(&format()).unwrap();
        let err = sink.write_unit(track, &unit(0, BufferFlags::NONE)).err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::WriterUsage));
    }

    #[test]
    fn second_track_is_usage_error() {
        let (_backend, mut sink) = open();
        sink.add_track(&format()).unwrap();
        let err = sink.add_track(&format()).err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::WriterUsage));
    }

    #[test]
    fn start_needs_a_track_and_happens_once() {
        let (_backend, mut sink) = open();
        assert_eq!(sink.start().err().map(|e| e.kind()), Some(ErrorKind::WriterUsage));
        sink.add_track(&format()).unwrap();
        sink.start().unwrap();
        assert_eq!(sink.start().err().map(|e| e.kind()), Some(ErrorKind::WriterUsage));
    }

    #[test]
    fn codec_config_units_are_not_counted() -> anyhow::Result<()> {
        let (backend, mut sink) = open();
        let track = sink.add_track(&format())?;
        sink.start()?;
        sink.write_unit(track, &unit(0, BufferFlags::CODEC_CONFIG))?;
        sink.write_unit(track, &unit(0, BufferFlags::KEY_FRAME))?;
        sink.write_unit(track, &unit(33_333, BufferFlags::NONE))?;
        assert_eq!(sink.units_written(), 2);
        sink.finalize()?;
        let log = backend.writer_log();
        assert_eq!(log.samples.len(), 3);
        assert_eq!(log.stopped, 1);
        Ok(())
    }

    #[test]
    fn finalize_is_idempotent_and_skips_stop_when_never_started() -> anyhow::Result<()> {
        let (backend, mut sink) = open();
        sink.finalize()?;
        sink.finalize()?;
        drop(sink);
        let log = backend.writer_log();
        assert_eq!(log.stopped, 0);
        assert_eq!(log.released, 1);
        Ok(())
    }
}
