use std::path::Path;

use crate::{
    codec::{ContainerWriter, DecoderCodec, Demuxer, EncoderCodec, MediaBackend, TrackFormat},
    decoder::{AvDecoder, DEFAULT_INPUT_SLOTS},
    encoder::AvEncoder,
    hw,
    input::AvInput,
    output::AvOutput,
    stream::codec_for_mime,
};

/// Knobs for the ffmpeg backend. Everything else about the output is fixed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendSettings {
    /// Encoder name; empty picks the default software encoder for the mime.
    pub encoder_codec: String,
    pub hardware_acceleration: bool,
    pub decoder_input_buffers: usize,
    /// x264 preset, `veryfast` when unset.
    pub encoder_preset: Option<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            encoder_codec: "libx264".to_string(),
            hardware_acceleration: false,
            decoder_input_buffers: DEFAULT_INPUT_SLOTS,
            encoder_preset: None,
        }
    }
}

/// [`MediaBackend`] over libavformat/libavcodec.
#[derive(Clone, Debug, Default)]
pub struct FfmpegBackend {
    settings: BackendSettings,
}

impl FfmpegBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    fn decoders(&self, format: &TrackFormat) -> Vec<ffmpeg_next::Codec> {
        let id = match &format.stream {
            Some(stream) => Some(stream.codec_id()),
            None => codec_for_mime(&format.mime),
        };
        id.map(|id| hw::decoder_candidates(id, self.settings.hardware_acceleration))
            .unwrap_or_default()
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_demuxer(&self, uri: &str) -> anyhow::Result<Box<dyn Demuxer>> {
        Ok(Box::new(AvInput::new(uri)?))
    }

    fn decoder_names(&self, format: &TrackFormat) -> Vec<String> {
        self.decoders(format)
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    fn create_decoder_for(&self, format: &TrackFormat) -> anyhow::Result<Box<dyn DecoderCodec>> {
        let candidates = self.decoders(format);
        if candidates.is_empty() {
            anyhow::bail!("no decoder supports {}", format.mime);
        }
        Ok(Box::new(AvDecoder::new(
            candidates,
            self.settings.decoder_input_buffers,
        )))
    }

    fn create_encoder_by_type(&self, mime: &str) -> anyhow::Result<Box<dyn EncoderCodec>> {
        let name = if self.settings.encoder_codec.is_empty() {
            hw::software_encoder_for(mime)
                .ok_or_else(|| anyhow::anyhow!("no encoder known for {}", mime))?
                .to_string()
        } else {
            self.settings.encoder_codec.clone()
        };
        Ok(Box::new(AvEncoder::new(
            name,
            self.settings.hardware_acceleration,
            self.settings.encoder_preset.clone(),
        )))
    }

    fn create_writer(&self, path: &Path) -> anyhow::Result<Box<dyn ContainerWriter>> {
        Ok(Box::new(AvOutput::new(path)?))
    }
}
