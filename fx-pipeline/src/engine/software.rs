use std::path::Path;

use crate::{
    frame::SurfaceFrame,
    geometry::normalize_rotation,
    surface::Surface,
};

use super::{EngineFrame, FrameTransformEngine, ImageFormat};

/// Effects the software engine can render, chosen by asset file stem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinEffect {
    None,
    Grayscale,
    Invert,
    Sepia,
}

impl BuiltinEffect {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let stem = Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match stem.as_str() {
            "none" | "passthrough" => Ok(Self::None),
            "grayscale" | "greyscale" => Ok(Self::Grayscale),
            "invert" => Ok(Self::Invert),
            "sepia" => Ok(Self::Sepia),
            _ => anyhow::bail!("unknown effect asset: {}", path),
        }
    }

    fn apply(&self, y: &mut [u8], u: &mut [u8], v: &mut [u8]) {
        match self {
            Self::None => {}
            Self::Grayscale => {
                u.fill(128);
                v.fill(128);
            }
            Self::Invert => {
                for b in y.iter_mut().chain(u.iter_mut()).chain(v.iter_mut()) {
                    *b = 255 - *b;
                }
            }
            Self::Sepia => {
                u.fill(108);
                v.fill(148);
            }
        }
    }
}

/// In-process engine that renders a few color effects on the CPU.
///
/// It reads the Y/V/U input layout, applies the effect, turns the picture
/// upright and presents I420 on the bound surface.
#[derive(Default)]
pub struct SoftwareEffectEngine {
    initialized: bool,
    effect: Option<BuiltinEffect>,
    surface: Option<Surface>,
    target: (u32, u32),
    frames: u64,
}

impl SoftwareEffectEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effect(&self) -> Option<BuiltinEffect> {
        self.effect
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames
    }
}

impl FrameTransformEngine for SoftwareEffectEngine {
    fn initialize(&mut self) -> anyhow::Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn switch_effect(&mut self, slot: &str, path: &str) -> anyhow::Result<()> {
        if !self.initialized {
            anyhow::bail!("engine not initialized");
        }
        let effect = BuiltinEffect::from_path(path)?;
        log::info!("software engine slot {} -> {:?}", slot, effect);
        self.effect = Some(effect);
        Ok(())
    }

    fn set_render_surface(
        &mut self,
        surface: Surface,
        width: u32,
        height: u32,
    ) -> anyhow::Result<()> {
        if !surface.is_valid() {
            anyhow::bail!("render surface already released");
        }
        self.surface = Some(surface);
        self.target = (width, height);
        Ok(())
    }

    fn receive_frame(&mut self, frame: &EngineFrame<'_>) -> anyhow::Result<()> {
        let effect = self
            .effect
            .ok_or_else(|| anyhow::anyhow!("no effect selected"))?;
        if frame.format != ImageFormat::Yuv420888 {
            anyhow::bail!("unsupported image format {:?}", frame.format);
        }
        let (mut y, mut u, mut v) = unpack_yvu(frame)?;
        effect.apply(&mut y, &mut u, &mut v);

        let rotation = normalize_rotation(frame.orientation);
        let (w, h) = (frame.width as usize, frame.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let (y, rw, rh) = rotate_plane(&y, w, h, rotation);
        let (u, _, _) = rotate_plane(&u, cw, ch, rotation);
        let (v, _, _) = rotate_plane(&v, cw, ch, rotation);
        if (rw as u32, rh as u32) != self.target {
            anyhow::bail!(
                "frame {}x{} rotated {} does not fit surface {}x{}",
                w,
                h,
                rotation,
                self.target.0,
                self.target.1
            );
        }

        let mut data = y;
        data.extend_from_slice(&u);
        data.extend_from_slice(&v);
        let rendered = SurfaceFrame::new(rw as u32, rh as u32, data)?;
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no render surface bound"))?;
        surface.present(rendered)?;
        self.frames += 1;
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut surface) = self.surface.take() {
            surface.release();
        }
        self.initialized = false;
        self.effect = None;
    }
}

/// Splits the packed input into planar Y, U and V. The two chroma regions
/// are equal halves of what follows the luma plane.
fn unpack_yvu(frame: &EngineFrame<'_>) -> anyhow::Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let luma = w * h;
    let chroma = w.div_ceil(2) * h.div_ceil(2);
    let stride = frame.pixel_stride;
    if !(1..=2).contains(&stride) {
        anyhow::bail!("unsupported chroma pixel stride {}", stride);
    }
    if frame.data.len() < luma {
        anyhow::bail!("frame data too short: {} < {}", frame.data.len(), luma);
    }
    let rest = &frame.data[luma..];
    let half = rest.len() / 2;
    if chroma > 0 && (chroma - 1) * stride >= half {
        anyhow::bail!(
            "chroma data too short for {}x{} at stride {}",
            w,
            h,
            stride
        );
    }
    let (v_region, u_region) = rest.split_at(half);
    let pick = |region: &[u8]| (0..chroma).map(|i| region[i * stride]).collect::<Vec<u8>>();
    Ok((frame.data[..luma].to_vec(), pick(u_region), pick(v_region)))
}

/// Rotates a `w`×`h` plane clockwise by 0, 90, 180 or 270 degrees.
fn rotate_plane(src: &[u8], w: usize, h: usize, degrees: i32) -> (Vec<u8>, usize, usize) {
    let mut out = vec![0u8; w * h];
    match degrees {
        90 => {
            for y in 0..h {
                for x in 0..w {
                    out[x * h + (h - 1 - y)] = src[y * w + x];
                }
            }
            (out, h, w)
        }
        180 => {
            for y in 0..h {
                for x in 0..w {
                    out[(h - 1 - y) * w + (w - 1 - x)] = src[y * w + x];
                }
            }
            (out, w, h)
        }
        270 => {
            for y in 0..h {
                for x in 0..w {
                    out[(w - 1 - x) * h + y] = src[y * w + x];
                }
            }
            (out, h, w)
        }
        _ => {
            out.copy_from_slice(&src[..w * h]);
            (out, w, h)
        }
    }
}
