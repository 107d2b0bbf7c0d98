//! Codec discovery.
//!
//! Hardware implementations (CUDA/QSV/VAAPI/V4L2M2M) are listed ahead of the
//! software one so callers can try them in order and fall back.

use ffmpeg_next::codec::Id;

fn hw_decoder_names(codec_id: Id) -> &'static [&'static str] {
    match codec_id {
        Id::H264 => &["h264_cuvid", "h264_qsv", "h264_v4l2m2m"],
        Id::HEVC => &["hevc_cuvid", "hevc_qsv", "hevc_v4l2m2m"],
        Id::VP8 => &["vp8_cuvid", "vp8_qsv", "vp8_v4l2m2m"],
        Id::VP9 => &["vp9_cuvid", "vp9_qsv", "vp9_v4l2m2m"],
        Id::AV1 => &["av1_cuvid", "av1_qsv"],
        Id::MPEG2VIDEO => &["mpeg2_cuvid", "mpeg2_qsv", "mpeg2_v4l2m2m"],
        Id::MPEG4 => &["mpeg4_cuvid", "mpeg4_v4l2m2m"],
        _ => &[],
    }
}

fn hw_encoder_names(codec_name: &str) -> &'static [&'static str] {
    match codec_name {
        "libx264" | "h264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" | "hevc" | "h265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        _ => &[],
    }
}

/// Every decoder available for `codec_id`: hardware ones first when
/// `prefer_hardware` is set, then the default software decoder.
pub fn decoder_candidates(codec_id: Id, prefer_hardware: bool) -> Vec<ffmpeg_next::Codec> {
    let mut found = Vec::new();
    if prefer_hardware {
        for name in hw_decoder_names(codec_id) {
            if let Some(codec) = ffmpeg_next::decoder::find_by_name(name) {
                log::debug!("found hardware decoder: {}", name);
                found.push(codec);
            }
        }
    }
    if let Some(codec) = ffmpeg_next::decoder::find(codec_id) {
        if !found.iter().any(|c| c.name() == codec.name()) {
            found.push(codec);
        }
    }
    found
}

/// Encoders to try for `codec_name`, hardware first when requested. The
/// named software encoder is always last.
pub fn encoder_candidates(codec_name: &str, prefer_hardware: bool) -> Vec<ffmpeg_next::Codec> {
    let mut found = Vec::new();
    if prefer_hardware {
        for name in hw_encoder_names(codec_name) {
            if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
                log::debug!("found hardware encoder: {}", name);
                found.push(codec);
            }
        }
    }
    if let Some(codec) = ffmpeg_next::encoder::find_by_name(codec_name) {
        found.push(codec);
    }
    found
}

/// Default software encoder name for an output mime.
pub fn software_encoder_for(mime: &str) -> Option<&'static str> {
    match mime.to_ascii_lowercase().as_str() {
        "video/avc" => Some("libx264"),
        "video/hevc" => Some("libx265"),
        "video/x-vnd.on2.vp9" => Some("libvpx-vp9"),
        "video/av01" => Some("libsvtav1"),
        _ => None,
    }
}
