use crate::frame::SurfaceFrame;

type Consumer = Box<dyn FnMut(SurfaceFrame) -> anyhow::Result<()> + Send>;

/// Render target shared by the transform engine (writer) and the encoder
/// (reader). Created by the encoder, moved exactly once into the engine.
pub struct Surface {
    consumer: Option<Consumer>,
    presented: u64,
}

impl Surface {
    pub fn new<F>(consumer: F) -> Self
    where
        F: FnMut(SurfaceFrame) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            consumer: Some(Box::new(consumer)),
            presented: 0,
        }
    }

    /// Hands one rendered picture to the encoder's capture path.
    pub fn present(&mut self, frame: SurfaceFrame) -> anyhow::Result<()> {
        let consumer = self
            .consumer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("surface already released"))?;
        consumer(frame)?;
        self.presented += 1;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.consumer.is_some()
    }

    pub fn frames_presented(&self) -> u64 {
        self.presented
    }

    pub fn release(&mut self) {
        if self.consumer.take().is_some() {
            log::debug!("surface released after {} frames", self.presented);
        }
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("valid", &self.is_valid())
            .field("presented", &self.presented)
            .finish()
    }
}
