use ffmpeg_next::{format::Pixel, frame::Video, software::scaling};

/// Converts decoded pictures to planar YUV420P at their own size. The
/// context is rebuilt only when the source format or size changes.
pub struct Scaler {
    context: Option<scaling::Context>,
    source: (Pixel, u32, u32),
}

impl Scaler {
    pub fn new() -> Self {
        Self {
            context: None,
            source: (Pixel::None, 0, 0),
        }
    }

    pub fn needs_conversion(frame: &Video) -> bool {
        frame.format() != Pixel::YUV420P
    }

    pub fn run(&mut self, frame: &Video, dst: &mut Video) -> anyhow::Result<()> {
        let key = (frame.format(), frame.width(), frame.height());
        if self.context.is_none() || self.source != key {
            log::debug!(
                "scaler {:?} {}x{} -> yuv420p",
                key.0,
                key.1,
                key.2
            );
            self.context = Some(scaling::Context::get(
                key.0,
                key.1,
                key.2,
                Pixel::YUV420P,
                key.1,
                key.2,
                scaling::flag::Flags::BILINEAR,
            )?);
            self.source = key;
        }
        let context = self
            .context
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("scaler context missing"))?;
        context.run(frame, dst)?;
        dst.set_pts(frame.pts());
        Ok(())
    }
}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Scaler {}
