use ffmpeg_next::{Rational, Rescale, codec::Parameters, format::stream};

use crate::codec::{FormatValue, TrackFormat};

unsafe impl Send for AvStream {}
unsafe impl Sync for AvStream {}

/// Owned snapshot of a demuxed stream: codec parameters plus the timing and
/// orientation metadata a transcode needs.
pub struct AvStream {
    index: usize,
    parameters: Parameters,
    time_base: Rational,
    avg_rate: Rational,
    real_rate: Rational,
    start_time: Option<i64>,
    duration: Option<i64>,
    rotation: Option<i32>,
}

impl AvStream {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn rate(&self) -> Rational {
        if self.avg_rate.numerator() > 0 && self.avg_rate.denominator() > 0 {
            self.avg_rate
        } else {
            self.real_rate
        }
    }

    pub fn codec_id(&self) -> ffmpeg_next::codec::Id {
        self.parameters.id()
    }

    pub fn is_video(&self) -> bool {
        self.parameters.medium() == ffmpeg_next::media::Type::Video
    }

    pub fn width(&self) -> u32 {
        unsafe {
            let ptr = self.parameters.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
            (*ptr).width.max(0) as u32
        }
    }

    pub fn height(&self) -> u32 {
        unsafe {
            let ptr = self.parameters.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
            (*ptr).height.max(0) as u32
        }
    }

    /// Stream start in time base units, used as the zero point for sample times.
    pub fn start_time(&self) -> i64 {
        self.start_time.unwrap_or(0)
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.duration.map(|d| to_micros(d, self.time_base))
    }

    pub fn rotation(&self) -> Option<i32> {
        self.rotation
    }

    /// Frame rate in the representation the container stores it in.
    pub fn frame_rate(&self) -> Option<FormatValue> {
        let rate = self.rate();
        if rate.numerator() <= 0 || rate.denominator() <= 0 {
            return None;
        }
        if rate.denominator() == 1 {
            Some(FormatValue::Int(rate.numerator() as i64))
        } else {
            Some(FormatValue::Float(
                rate.numerator() as f64 / rate.denominator() as f64,
            ))
        }
    }

    /// Converts a timestamp in this stream's time base to microseconds since
    /// stream start.
    pub fn micros_since_start(&self, ts: i64) -> i64 {
        to_micros(ts - self.start_time(), self.time_base)
    }

    pub fn track_format(&self) -> TrackFormat {
        let mut format = TrackFormat::new(mime_for_codec(self.codec_id()));
        if self.is_video() {
            if self.width() > 0 {
                format.width = Some(self.width());
            }
            if self.height() > 0 {
                format.height = Some(self.height());
            }
        }
        format.rotation = self.rotation;
        format.duration_us = self.duration_us();
        format.frame_rate = self.frame_rate();
        format.with_stream(self.clone())
    }
}

impl From<stream::Stream<'_>> for AvStream {
    fn from(stream: stream::Stream<'_>) -> Self {
        let parameters = stream.parameters();
        let rotation = display_rotation(&parameters).or_else(|| {
            stream
                .metadata()
                .get("rotate")
                .and_then(|v| v.trim().parse::<i32>().ok())
        });
        let no_pts = ffmpeg_next::ffi::AV_NOPTS_VALUE as i64;
        let start_time = Some(stream.start_time()).filter(|t| *t != no_pts);
        let duration = Some(stream.duration()).filter(|d| *d != no_pts && *d > 0);
        let real_rate: Rational = unsafe { (*stream.as_ptr()).r_frame_rate.into() };
        Self {
            index: stream.index(),
            // Owned copy so the snapshot does not pin the demuxer context.
            parameters: parameters.clone(),
            time_base: stream.time_base(),
            avg_rate: stream.avg_frame_rate(),
            real_rate,
            start_time,
            duration,
            rotation: rotation.map(crate::geometry::normalize_rotation),
        }
    }
}

impl Clone for AvStream {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            parameters: self.parameters.clone(),
            time_base: self.time_base,
            avg_rate: self.avg_rate,
            real_rate: self.real_rate,
            start_time: self.start_time,
            duration: self.duration,
            rotation: self.rotation,
        }
    }
}

/// Container duration in microseconds. The format context keeps it in
/// AV_TIME_BASE units, which already are microseconds.
pub fn container_duration_us(raw: i64) -> Option<i64> {
    (raw != ffmpeg_next::ffi::AV_NOPTS_VALUE as i64 && raw > 0).then_some(raw)
}

fn to_micros(ts: i64, time_base: Rational) -> i64 {
    ts.rescale(time_base, ffmpeg_next::util::mathematics::rescale::TIME_BASE)
}

/// Clockwise display rotation from the stream's display matrix side data.
fn display_rotation(parameters: &Parameters) -> Option<i32> {
    unsafe {
        let ptr = parameters.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
        let side = ffmpeg_next::ffi::av_packet_side_data_get(
            (*ptr).coded_side_data,
            (*ptr).nb_coded_side_data,
            ffmpeg_next::ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
        );
        if side.is_null() || (*side).size < 36 {
            return None;
        }
        let angle = ffmpeg_next::ffi::av_display_rotation_get((*side).data as *const i32);
        if angle.is_nan() {
            return None;
        }
        // The matrix angle is counter-clockwise.
        Some((-angle).round() as i32)
    }
}

pub fn mime_for_codec(id: ffmpeg_next::codec::Id) -> &'static str {
    use ffmpeg_next::codec::Id;
    match id {
        Id::H264 => "video/avc",
        Id::HEVC => "video/hevc",
        Id::VP8 => "video/x-vnd.on2.vp8",
        Id::VP9 => "video/x-vnd.on2.vp9",
        Id::AV1 => "video/av01",
        Id::MPEG4 => "video/mp4v-es",
        Id::H263 => "video/3gpp",
        Id::MPEG2VIDEO => "video/mpeg2",
        Id::AAC => "audio/mp4a-latm",
        Id::MP3 => "audio/mpeg",
        Id::OPUS => "audio/opus",
        _ => "application/octet-stream",
    }
}

pub fn codec_for_mime(mime: &str) -> Option<ffmpeg_next::codec::Id> {
    use ffmpeg_next::codec::Id;
    let id = match mime.to_ascii_lowercase().as_str() {
        "video/avc" => Id::H264,
        "video/hevc" => Id::HEVC,
        "video/x-vnd.on2.vp8" => Id::VP8,
        "video/x-vnd.on2.vp9" => Id::VP9,
        "video/av01" => Id::AV1,
        "video/mp4v-es" => Id::MPEG4,
        "video/3gpp" => Id::H263,
        "video/mpeg2" => Id::MPEG2VIDEO,
        _ => return None,
    };
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_mimes_map_both_ways() {
        for mime in ["video/avc", "video/hevc", "video/x-vnd.on2.vp9", "video/av01"] {
            let id = codec_for_mime(mime).expect("known mime");
            assert_eq!(mime_for_codec(id), mime);
        }
        assert_eq!(codec_for_mime("VIDEO/AVC"), Some(ffmpeg_next::codec::Id::H264));
        assert!(codec_for_mime("audio/mp4a-latm").is_none());
    }

    #[test]
    fn container_duration_ignores_unset_values() {
        assert_eq!(container_duration_us(2_500_000), Some(2_500_000));
        assert_eq!(container_duration_us(0), None);
        assert_eq!(
            container_duration_us(ffmpeg_next::ffi::AV_NOPTS_VALUE as i64),
            None
        );
    }

    #[test]
    fn micros_rescale_from_stream_time_base() {
        let tb = Rational::new(1, 90_000);
        assert_eq!(to_micros(90_000, tb), 1_000_000);
        assert_eq!(to_micros(3_000, tb), 33_333);
    }
}
