use std::path::Path;

use bytes::Bytes;

use crate::{
    codec::{Demuxer, MediaBackend, TrackFormat},
    error::{TranscodeError, TranscodeResult},
    geometry::MediaGeometry,
    packet::CompressedUnit,
    stream::{AvStream, container_duration_us},
};

/// Demuxer over an ffmpeg input context. Holds one packet of look-ahead for
/// the selected track so `advance` can tell whether another sample exists.
pub struct AvInput {
    inner: ffmpeg_next::format::context::Input,
    streams: Vec<AvStream>,
    /// Used for tracks that carry no duration of their own (typical for
    /// Matroska/WebM).
    container_duration_us: Option<i64>,
    selected: Option<usize>,
    current: Option<(Bytes, i64)>,
    read_error: Option<anyhow::Error>,
}

// The input context is only ever used from the thread that owns the reader.
unsafe impl Send for AvInput {}

impl AvInput {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let input = ffmpeg_next::format::input(Path::new(url))
            .map_err(|e| anyhow::anyhow!("open input {}: {}", url, e))?;
        let streams = input.streams().map(AvStream::from).collect();
        let container_duration_us = container_duration_us(input.duration());
        Ok(Self {
            inner: input,
            streams,
            container_duration_us,
            selected: None,
            current: None,
            read_error: None,
        })
    }

    pub fn streams(&self) -> &[AvStream] {
        &self.streams
    }

    /// Reads packets until one belongs to the selected track.
    fn fetch(&mut self) -> anyhow::Result<Option<(Bytes, i64)>> {
        let Some(selected) = self.selected else {
            return Ok(None);
        };
        loop {
            let mut packet = ffmpeg_next::Packet::empty();
            match packet.read(&mut self.inner) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Eof) => return Ok(None),
                Err(e) => return Err(anyhow::anyhow!("read packet: {}", e)),
            }
            if packet.stream() != selected {
                continue;
            }
            let stream = &self.streams[selected];
            let ts = packet.pts().or(packet.dts()).unwrap_or(stream.start_time());
            let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
            return Ok(Some((data, stream.micros_since_start(ts))));
        }
    }
}

impl Demuxer for AvInput {
    fn track_count(&self) -> usize {
        self.streams.len()
    }

    fn track_format(&self, index: usize) -> anyhow::Result<TrackFormat> {
        let stream = self
            .streams
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("track {} not found", index))?;
        let mut format = stream.track_format();
        format.duration_us = format.duration_us.or(self.container_duration_us);
        Ok(format)
    }

    fn select_track(&mut self, index: usize) -> anyhow::Result<()> {
        if index >= self.streams.len() {
            anyhow::bail!("track {} not found", index);
        }
        self.selected = Some(index);
        self.current = self.fetch()?;
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> anyhow::Result<Option<usize>> {
        if let Some(e) = self.read_error.take() {
            return Err(e);
        }
        let Some((data, _)) = &self.current else {
            return Ok(None);
        };
        buf.clear();
        buf.extend_from_slice(data);
        Ok(Some(data.len()))
    }

    fn sample_time(&self) -> Option<i64> {
        self.current.as_ref().map(|(_, ts)| *ts)
    }

    fn advance(&mut self) -> bool {
        match self.fetch() {
            Ok(next) => {
                self.current = next;
                self.current.is_some()
            }
            Err(e) => {
                // Surfaced by the next read_sample.
                self.current = None;
                self.read_error = Some(e);
                true
            }
        }
    }

    fn release(&mut self) {
        self.current = None;
        self.selected = None;
    }
}

/// Which track a [`SourceReader`] picks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackSelector {
    /// First track with exactly this mime, compared case-insensitively.
    Mime(String),
}

impl TrackSelector {
    pub fn matches(&self, format: &TrackFormat) -> bool {
        match self {
            TrackSelector::Mime(mime) => format.mime.eq_ignore_ascii_case(mime),
        }
    }
}

impl std::fmt::Display for TrackSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackSelector::Mime(mime) => write!(f, "{}", mime),
        }
    }
}

/// Yields the selected video track as a finite, non-restartable sequence of
/// compressed units. The last unit carries end-of-stream.
pub struct SourceReader {
    demuxer: Option<Box<dyn Demuxer>>,
    format: TrackFormat,
    track: usize,
    scratch: Vec<u8>,
    finished: bool,
    units_read: u64,
}

impl SourceReader {
    pub fn open(
        backend: &dyn MediaBackend,
        uri: &str,
        selector: &TrackSelector,
    ) -> TranscodeResult<(Self, MediaGeometry)> {
        let mut demuxer = backend
            .open_demuxer(uri)
            .map_err(TranscodeError::source_unreadable)?;

        let mut found = None;
        for index in 0..demuxer.track_count() {
            let format = demuxer
                .track_format(index)
                .map_err(TranscodeError::source_unreadable)?;
            log::debug!("{} track {}: {:?}", uri, index, format);
            if selector.matches(&format) {
                found = Some((index, format));
                break;
            }
        }
        let Some((track, format)) = found else {
            demuxer.release();
            return Err(TranscodeError::NoVideoTrack(format!(
                "{} has no {} track",
                uri, selector
            )));
        };

        let geometry = match geometry_of(&format) {
            Ok(geometry) => geometry,
            Err(e) => {
                demuxer.release();
                return Err(e);
            }
        };
        if let Err(e) = demuxer.select_track(track) {
            demuxer.release();
            return Err(TranscodeError::source_unreadable(e));
        }
        log::info!(
            "source {} track {} {} {}x{} rotation {} fps {:.3} duration {}us",
            uri,
            track,
            format.mime,
            geometry.width,
            geometry.height,
            geometry.rotation_degrees,
            geometry.frame_rate,
            geometry.duration_us
        );

        Ok((
            Self {
                demuxer: Some(demuxer),
                format,
                track,
                scratch: Vec::new(),
                finished: false,
                units_read: 0,
            },
            geometry,
        ))
    }

    pub fn format(&self) -> &TrackFormat {
        &self.format
    }

    pub fn track(&self) -> usize {
        self.track
    }

    pub fn units_read(&self) -> u64 {
        self.units_read
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn next_unit(&mut self) -> TranscodeResult<Option<CompressedUnit>> {
        if self.finished {
            return Ok(None);
        }
        let demuxer = self
            .demuxer
            .as_mut()
            .ok_or_else(|| TranscodeError::SourceUnreadable("reader released".into()))?;
        let size = demuxer
            .read_sample(&mut self.scratch)
            .map_err(TranscodeError::source_unreadable)?;
        let Some(size) = size else {
            self.finished = true;
            return Ok(None);
        };
        let presentation_time_us = demuxer.sample_time().unwrap_or(0);
        let more = demuxer.advance();
        self.finished = !more;
        self.units_read += 1;
        Ok(Some(CompressedUnit {
            payload: Bytes::copy_from_slice(&self.scratch[..size.min(self.scratch.len())]),
            presentation_time_us,
            end_of_stream: !more,
        }))
    }

    pub fn release(&mut self) {
        if let Some(mut demuxer) = self.demuxer.take() {
            demuxer.release();
            log::debug!("source reader released after {} units", self.units_read);
        }
    }
}

impl Drop for SourceReader {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) fn geometry_of(format: &TrackFormat) -> TranscodeResult<MediaGeometry> {
    let (Some(width), Some(height)) = (format.width, format.height) else {
        return Err(TranscodeError::SourceUnreadable(format!(
            "{} track has no dimensions",
            format.mime
        )));
    };
    let frame_rate = format
        .frame_rate
        .map(|r| r.as_f32())
        .filter(|r| r.is_finite() && *r > 0.0)
        .ok_or_else(|| {
            TranscodeError::SourceUnreadable(format!("{} track has no frame rate", format.mime))
        })?;
    Ok(MediaGeometry::new(
        width,
        height,
        format.rotation.unwrap_or(0),
        frame_rate,
        format.duration_us.unwrap_or(0).max(0),
    ))
}
