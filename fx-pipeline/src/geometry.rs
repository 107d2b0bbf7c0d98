/// Source video geometry, derived once when the source is opened.
///
/// The encoder and the transform engine always work in rotated output space,
/// see [`MediaGeometry::rotated_width`] and [`MediaGeometry::rotated_height`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MediaGeometry {
    pub width: u32,
    pub height: u32,
    /// Clockwise rotation needed to display the stored frames upright.
    pub rotation_degrees: i32,
    pub frame_rate: f32,
    pub duration_us: i64,
}

impl MediaGeometry {
    pub fn new(
        width: u32,
        height: u32,
        rotation_degrees: i32,
        frame_rate: f32,
        duration_us: i64,
    ) -> Self {
        Self {
            width,
            height,
            rotation_degrees: normalize_rotation(rotation_degrees),
            frame_rate,
            duration_us,
        }
    }

    /// True when width and height trade places in output space.
    pub fn is_transposed(&self) -> bool {
        matches!(self.rotation_degrees, 90 | 270)
    }

    pub fn rotated_width(&self) -> u32 {
        if self.is_transposed() {
            self.height
        } else {
            self.width
        }
    }

    pub fn rotated_height(&self) -> u32 {
        if self.is_transposed() {
            self.width
        } else {
            self.height
        }
    }

    /// Nominal frame duration in microseconds; zero when the rate is unknown.
    pub fn frame_duration_us(&self) -> i64 {
        if self.frame_rate > 0.0 {
            (1_000_000.0 / self.frame_rate as f64).round() as i64
        } else {
            0
        }
    }
}

/// Maps any angle onto one of 0, 90, 180 or 270.
pub fn normalize_rotation(degrees: i32) -> i32 {
    let snapped = ((degrees as f64 / 90.0).round() as i32) * 90;
    snapped.rem_euclid(360)
}
