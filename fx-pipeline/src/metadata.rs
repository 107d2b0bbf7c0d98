//! Media file metadata, ffprobe style, plus the geometry a transcode would use.

use std::fmt;

use crate::{
    geometry::MediaGeometry,
    input::geometry_of,
    stream::{AvStream, container_duration_us},
};

/// Format-level info.
#[derive(Debug, Clone)]
pub struct FormatInfo {
    /// Format name, e.g. "mov,mp4,m4a,3gp,3g2,mj2"
    pub format_name: String,
    /// Duration in seconds; None if unknown.
    pub duration_sec: Option<f64>,
    /// Total bitrate in bps; 0 if unknown.
    pub bit_rate: i64,
    pub nb_streams: u32,
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    /// "video" | "audio" | "subtitle" etc.
    pub codec_type: String,
    pub codec_name: String,
    pub mime: String,
    /// e.g. "1/90000"
    pub time_base: String,
    /// e.g. "30000/1001"
    pub rate: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub rotation: Option<i32>,
    pub duration_us: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
    /// Geometry of the first video track, when it has everything a
    /// transcode needs.
    pub geometry: Option<MediaGeometry>,
}

impl fmt::Display for MediaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[FORMAT]")?;
        writeln!(f, "format_name={}", self.format.format_name)?;
        if let Some(d) = self.format.duration_sec {
            writeln!(f, "duration_sec={:.3}", d)?;
        } else {
            writeln!(f, "duration_sec=N/A")?;
        }
        writeln!(f, "bit_rate={}", self.format.bit_rate)?;
        writeln!(f, "nb_streams={}", self.format.nb_streams)?;
        writeln!(f, "[/FORMAT]")?;
        for s in &self.streams {
            writeln!(f, "[STREAM]")?;
            writeln!(f, "index={}", s.index)?;
            writeln!(f, "codec_type={}", s.codec_type)?;
            writeln!(f, "codec_name={}", s.codec_name)?;
            writeln!(f, "mime={}", s.mime)?;
            writeln!(f, "time_base={}", s.time_base)?;
            writeln!(f, "rate={}", s.rate)?;
            if let (Some(w), Some(h)) = (s.width, s.height) {
                writeln!(f, "width={}", w)?;
                writeln!(f, "height={}", h)?;
            }
            if let Some(r) = s.rotation {
                writeln!(f, "rotation={}", r)?;
            }
            if let Some(d) = s.duration_us {
                writeln!(f, "duration_us={}", d)?;
            }
            writeln!(f, "[/STREAM]")?;
        }
        if let Some(g) = &self.geometry {
            writeln!(f, "[GEOMETRY]")?;
            writeln!(f, "source={}x{}", g.width, g.height)?;
            writeln!(f, "rotation={}", g.rotation_degrees)?;
            writeln!(f, "output={}x{}", g.rotated_width(), g.rotated_height())?;
            writeln!(f, "frame_rate={:.3}", g.frame_rate)?;
            writeln!(f, "duration_us={}", g.duration_us)?;
            writeln!(f, "[/GEOMETRY]")?;
        }
        Ok(())
    }
}

/// Opens a file and returns its metadata.
///
/// ```ignore
/// let info = fx_pipeline::probe("input.mp4")?;
/// println!("{}", info);
/// ```
pub fn probe(path: &str) -> anyhow::Result<MediaInfo> {
    let input = ffmpeg_next::format::input(path)?;

    let format_name = input.format().name().to_string();
    let nb_streams = input.nb_streams();
    let bit_rate = input.bit_rate();
    let container_us = container_duration_us(input.duration());
    let duration_sec = container_us.map(|d| d as f64 / 1_000_000.0);

    let mut streams = Vec::with_capacity(nb_streams as usize);
    let mut geometry = None;
    for stream in input.streams() {
        let av_stream = AvStream::from(stream);
        let params = av_stream.parameters();
        let track = av_stream.track_format();
        let time_base = av_stream.time_base();
        let rate = av_stream.rate();
        if geometry.is_none() && track.is_video() {
            let mut video = track.clone();
            video.duration_us = video.duration_us.or(container_us);
            geometry = geometry_of(&video).ok();
        }
        streams.push(StreamInfo {
            index: av_stream.index(),
            codec_type: format!("{:?}", params.medium()).to_lowercase(),
            codec_name: format!("{:?}", params.id()).to_lowercase(),
            mime: track.mime.clone(),
            time_base: format!("{}/{}", time_base.numerator(), time_base.denominator()),
            rate: format!("{}/{}", rate.numerator(), rate.denominator()),
            width: track.width,
            height: track.height,
            rotation: track.rotation,
            duration_us: track.duration_us,
        });
    }

    Ok(MediaInfo {
        format: FormatInfo {
            format_name,
            duration_sec,
            bit_rate,
            nb_streams,
        },
        streams,
        geometry,
    })
}
