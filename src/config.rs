use std::path::Path;

use anyhow::Context as _;
use fx_pipeline::BackendSettings;
use serde::{Deserialize, Serialize};

/// Backend knobs read from the optional JSON settings file. Missing fields
/// keep their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub encoder_codec: String,
    pub hardware_acceleration: bool,
    pub decoder_input_buffers: usize,
    pub encoder_preset: Option<String>,
    pub video_mime: String,
}

impl Default for Settings {
    fn default() -> Self {
        let backend = BackendSettings::default();
        Self {
            encoder_codec: backend.encoder_codec,
            hardware_acceleration: backend.hardware_acceleration,
            decoder_input_buffers: backend.decoder_input_buffers,
            encoder_preset: backend.encoder_preset,
            video_mime: fx_pipeline::pipeline::DEFAULT_VIDEO_MIME.to_string(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read settings '{}'", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("parse settings '{}'", path.display()))?;
        if settings.decoder_input_buffers == 0 {
            anyhow::bail!("decoder_input_buffers must be at least 1");
        }
        Ok(settings)
    }

    pub fn backend(&self) -> BackendSettings {
        BackendSettings {
            encoder_codec: self.encoder_codec.clone(),
            hardware_acceleration: self.hardware_acceleration,
            decoder_input_buffers: self.decoder_input_buffers,
            encoder_preset: self.encoder_preset.clone(),
        }
    }
}
