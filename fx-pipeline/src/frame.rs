use bytes::Bytes;

/// One image plane with its memory layout.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plane {
    pub data: Bytes,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: impl Into<Bytes>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data: data.into(),
            row_stride,
            pixel_stride,
        }
    }

    /// Sample at column `x`, row `y`, honoring both strides.
    pub fn sample(&self, x: usize, y: usize) -> u8 {
        self.data
            .get(y * self.row_stride + x * self.pixel_stride)
            .copied()
            .unwrap_or(0)
    }
}

/// A decoded YUV 4:2:0 picture. Planes are stored Y, U, V.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub planes: [Plane; 3],
    pub width: u32,
    pub height: u32,
    pub presentation_time_us: i64,
}

impl RawFrame {
    pub fn luma(&self) -> &Plane {
        &self.planes[0]
    }

    pub fn u_plane(&self) -> &Plane {
        &self.planes[1]
    }

    pub fn v_plane(&self) -> &Plane {
        &self.planes[2]
    }

    /// Copies a planar YUV420P ffmpeg frame into tightly packed planes.
    pub fn from_yuv420p(
        frame: &ffmpeg_next::frame::Video,
        presentation_time_us: i64,
    ) -> anyhow::Result<Self> {
        if frame.format() != ffmpeg_next::format::Pixel::YUV420P {
            anyhow::bail!("expected yuv420p frame, got {:?}", frame.format());
        }
        let width = frame.width();
        let height = frame.height();
        let cw = width.div_ceil(2) as usize;
        let ch = height.div_ceil(2) as usize;
        let dims = [(width as usize, height as usize), (cw, ch), (cw, ch)];

        let planes: [Plane; 3] = std::array::from_fn(|i| {
            let (w, h) = dims[i];
            let stride = frame.stride(i);
            let src = frame.data(i);
            let mut out = Vec::with_capacity(w * h);
            for row in 0..h {
                let start = row * stride;
                out.extend_from_slice(&src[start..start + w]);
            }
            Plane::new(out, w, 1)
        });

        Ok(Self {
            planes,
            width,
            height,
            presentation_time_us,
        })
    }
}

/// A picture presented on a [`crate::surface::Surface`], tightly packed I420.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SurfaceFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl SurfaceFrame {
    pub fn expected_len(width: u32, height: u32) -> usize {
        let luma = width as usize * height as usize;
        let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
        luma + 2 * chroma
    }

    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> anyhow::Result<Self> {
        let data = data.into();
        let expected = Self::expected_len(width, height);
        if data.len() != expected {
            anyhow::bail!(
                "surface frame {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn chroma_len(&self) -> usize {
        self.width.div_ceil(2) as usize * self.height.div_ceil(2) as usize
    }

    pub fn y(&self) -> &[u8] {
        &self.data[..self.luma_len()]
    }

    pub fn u(&self) -> &[u8] {
        let start = self.luma_len();
        &self.data[start..start + self.chroma_len()]
    }

    pub fn v(&self) -> &[u8] {
        let start = self.luma_len() + self.chroma_len();
        &self.data[start..start + self.chroma_len()]
    }
}
