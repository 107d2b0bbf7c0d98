//! Frame transform engine capability and the adapter the pipeline drives it
//! through.

pub mod software;

use crate::{
    error::{TranscodeError, TranscodeResult},
    frame::RawFrame,
    geometry::MediaGeometry,
    surface::Surface,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// Luma followed by two chroma planes, 4:2:0 subsampled.
    Yuv420888,
}

/// One source picture as the engine receives it.
#[derive(Debug)]
pub struct EngineFrame<'a> {
    /// Y, then V, then U.
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation to apply before rendering.
    pub orientation: i32,
    pub mirror: bool,
    pub format: ImageFormat,
    /// Pixel stride of the chroma planes.
    pub pixel_stride: usize,
}

/// An external renderer that draws an effect over each submitted frame onto
/// a bound surface.
pub trait FrameTransformEngine: Send {
    fn initialize(&mut self) -> anyhow::Result<()>;
    fn switch_effect(&mut self, slot: &str, path: &str) -> anyhow::Result<()>;
    fn set_render_surface(
        &mut self,
        surface: Surface,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()>;
    /// Returns once the engine has consumed `frame`. The rendered result
    /// shows up on the surface, not here.
    fn receive_frame(&mut self, frame: &EngineFrame<'_>) -> anyhow::Result<()>;
    fn release(&mut self);
}

/// Effect selection: an opaque slot name and an asset path the engine resolves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Effect {
    pub slot: String,
    pub path: String,
}

impl Effect {
    pub const MASK_SLOT: &'static str = "mask";

    pub fn new(slot: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            path: path.into(),
        }
    }

    pub fn mask(path: impl Into<String>) -> Self {
        Self::new(Self::MASK_SLOT, path)
    }
}

/// Packs a frame into the engine's input layout: the luma plane, then the V
/// plane, then the U plane, each copied whole.
pub fn pack_yvu(frame: &RawFrame, out: &mut Vec<u8>) {
    let [y, u, v] = &frame.planes;
    out.clear();
    out.reserve(y.data.len() + u.data.len() + v.data.len());
    out.extend_from_slice(&y.data);
    out.extend_from_slice(&v.data);
    out.extend_from_slice(&u.data);
}

/// Owns the engine for one job. Binding happens before either codec starts.
pub struct EngineAdapter {
    engine: Option<Box<dyn FrameTransformEngine>>,
    rotation: i32,
    packed: Vec<u8>,
    submitted: u64,
}

impl EngineAdapter {
    /// Initializes the engine, selects `effect` and hands it the encoder's
    /// surface at rotated output size. On failure the engine is released.
    pub fn bind(
        mut engine: Box<dyn FrameTransformEngine>,
        effect: &Effect,
        surface: Surface,
        geometry: &MediaGeometry,
    ) -> TranscodeResult<Self> {
        let width = geometry.rotated_width();
        let height = geometry.rotated_height();
        let bound = engine
            .initialize()
            .and_then(|_| engine.switch_effect(&effect.slot, &effect.path))
            .and_then(|_| engine.set_render_surface(surface, width, height));
        if let Err(e) = bound {
            engine.release();
            return Err(TranscodeError::engine_init(e));
        }
        log::info!(
            "engine bound: effect {}={} surface {}x{}",
            effect.slot,
            effect.path,
            width,
            height
        );
        Ok(Self {
            engine: Some(engine),
            rotation: geometry.rotation_degrees,
            packed: Vec::new(),
            submitted: 0,
        })
    }

    /// Blocks until the engine took the frame.
    pub fn submit(&mut self, frame: &RawFrame) -> TranscodeResult<()> {
        let mut packed = std::mem::take(&mut self.packed);
        pack_yvu(frame, &mut packed);
        let submitted = self.submit_packed(&packed, frame);
        self.packed = packed;
        submitted
    }

    /// Submits `data`, already packed with [`pack_yvu`] from `frame`.
    pub fn submit_packed(&mut self, data: &[u8], frame: &RawFrame) -> TranscodeResult<()> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| TranscodeError::EngineFailure("engine released".into()))?;
        let input = EngineFrame {
            data,
            width: frame.width,
            height: frame.height,
            orientation: self.rotation,
            mirror: false,
            format: ImageFormat::Yuv420888,
            pixel_stride: frame.u_plane().pixel_stride,
        };
        engine.receive_frame(&input).map_err(TranscodeError::engine)?;
        self.submitted += 1;
        Ok(())
    }

    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn release(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.release();
            log::debug!("engine released after {} frames", self.submitted);
        }
    }
}

impl Drop for EngineAdapter {
    fn drop(&mut self) {
        self.release();
    }
}
