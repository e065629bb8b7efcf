//! Feature-level data model handed over by the tracking front-end.
//!
//! The core never touches images: it receives undistorted point and line
//! features, their binary descriptors, the camera intrinsics and the detector
//! scale pyramids, already extracted by external collaborators.

use anyhow::{bail, Result};
use nalgebra::{Matrix3, Vector2, Vector3};

/// Number of bytes in a binary feature descriptor (ORB/LSD layout).
pub const DESCRIPTOR_BYTES: usize = 32;

/// A binary feature descriptor compared under the Hamming distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    /// Hamming distance to another descriptor.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor([0; DESCRIPTOR_BYTES])
    }
}

/// Pinhole intrinsics of a single camera, immutable once constructed.
#[derive(Debug, Clone, Copy)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub inv_fx: f64,
    pub inv_fy: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            inv_fx: 1.0 / fx,
            inv_fy: 1.0 / fy,
        }
    }

    /// The calibration matrix K.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    pub fn inverse_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.inv_fx,
            0.0,
            -self.cx * self.inv_fx,
            0.0,
            self.inv_fy,
            -self.cy * self.inv_fy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Project a camera-frame point to pixel coordinates (z must be > 0).
    pub fn project(&self, p_cam: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / p_cam.z;
        Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        )
    }

    /// Back-project a pixel onto the z = 1 plane in the camera frame.
    pub fn unproject(&self, uv: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (uv.x - self.cx) * self.inv_fx,
            (uv.y - self.cy) * self.inv_fy,
            1.0,
        )
    }
}

/// Per-level scale factors and measurement variances of a feature detector
/// pyramid. Every chi-square gate in the system is scaled by `level_sigma2`.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    pub scale_factor: f64,
    pub scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, n_levels: usize) -> Self {
        let mut scale_factors = Vec::with_capacity(n_levels);
        let mut level_sigma2 = Vec::with_capacity(n_levels);
        let mut s = 1.0;
        for _ in 0..n_levels {
            scale_factors.push(s);
            level_sigma2.push(s * s);
            s *= scale_factor;
        }
        let inv_level_sigma2 = level_sigma2.iter().map(|v| 1.0 / v).collect();
        Self {
            scale_factor,
            scale_factors,
            level_sigma2,
            inv_level_sigma2,
        }
    }

    pub fn n_levels(&self) -> usize {
        self.scale_factors.len()
    }

    /// Measurement variance at an octave, clamped to the top level.
    pub fn sigma2(&self, octave: usize) -> f64 {
        let idx = octave.min(self.level_sigma2.len() - 1);
        self.level_sigma2[idx]
    }

    pub fn scale(&self, octave: usize) -> f64 {
        let idx = octave.min(self.scale_factors.len() - 1);
        self.scale_factors[idx]
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}

/// An undistorted keypoint.
#[derive(Debug, Clone, Copy)]
pub struct PointFeature {
    pub uv: Vector2<f64>,
    pub octave: usize,
}

/// An undistorted line segment with its implicit line equation.
#[derive(Debug, Clone, Copy)]
pub struct LineFeature {
    pub start: Vector2<f64>,
    pub end: Vector2<f64>,
    /// Implicit coefficients (a, b, c) with a² + b² = 1.
    pub line: Vector3<f64>,
    /// Segment orientation in radians.
    pub angle: f64,
    pub octave: usize,
}

impl LineFeature {
    /// Build a line feature from its endpoints, deriving the normalized
    /// implicit equation and the orientation angle.
    pub fn from_endpoints(start: Vector2<f64>, end: Vector2<f64>, octave: usize) -> Self {
        let l = Vector3::new(start.x, start.y, 1.0).cross(&Vector3::new(end.x, end.y, 1.0));
        let norm = (l.x * l.x + l.y * l.y).sqrt();
        let line = if norm > 0.0 { l / norm } else { l };
        let angle = (end.y - start.y).atan2(end.x - start.x);
        Self {
            start,
            end,
            line,
            angle,
            octave,
        }
    }

    pub fn midpoint(&self) -> Vector2<f64> {
        (self.start + self.end) * 0.5
    }

    pub fn length(&self) -> f64 {
        (self.end - self.start).norm()
    }
}

/// The per-frame feature bundle consumed by the initializer and the mapper.
#[derive(Debug, Clone)]
pub struct Frame {
    pub keypoints: Vec<PointFeature>,
    pub descriptors: Vec<Descriptor>,
    pub keylines: Vec<LineFeature>,
    pub line_descriptors: Vec<Descriptor>,
    pub intrinsics: CameraIntrinsics,
    pub pyramid: ScalePyramid,
    pub line_pyramid: ScalePyramid,
}

impl Frame {
    /// Validates that descriptors line up with features and that line
    /// equations are normalized.
    pub fn new(
        keypoints: Vec<PointFeature>,
        descriptors: Vec<Descriptor>,
        keylines: Vec<LineFeature>,
        line_descriptors: Vec<Descriptor>,
        intrinsics: CameraIntrinsics,
        pyramid: ScalePyramid,
        line_pyramid: ScalePyramid,
    ) -> Result<Self> {
        if keypoints.len() != descriptors.len() {
            bail!(
                "keypoint/descriptor count mismatch: {} vs {}",
                keypoints.len(),
                descriptors.len()
            );
        }
        if keylines.len() != line_descriptors.len() {
            bail!(
                "keyline/descriptor count mismatch: {} vs {}",
                keylines.len(),
                line_descriptors.len()
            );
        }
        for (i, kl) in keylines.iter().enumerate() {
            let n = (kl.line.x * kl.line.x + kl.line.y * kl.line.y).sqrt();
            if (n - 1.0).abs() > 1e-6 {
                bail!("keyline {i} has an unnormalized line equation");
            }
        }
        Ok(Self {
            keypoints,
            descriptors,
            keylines,
            line_descriptors,
            intrinsics,
            pyramid,
            line_pyramid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn descriptor_distance_counts_bits() {
        let a = Descriptor([0; DESCRIPTOR_BYTES]);
        let mut raw = [0u8; DESCRIPTOR_BYTES];
        raw[0] = 0b1010_1010;
        raw[31] = 0b0000_0001;
        let b = Descriptor(raw);
        assert_eq!(a.distance(&b), 5);
        assert_eq!(b.distance(&a), 5);
        assert_eq!(b.distance(&b), 0);
    }

    #[test]
    fn intrinsics_project_unproject_round_trip() {
        let k = CameraIntrinsics::new(520.0, 516.0, 318.5, 239.5);
        let uv = Vector2::new(400.0, 100.0);
        let ray = k.unproject(&uv);
        assert_relative_eq!(k.project(&ray), uv, epsilon = 1e-10);
        assert_relative_eq!(
            k.matrix() * k.inverse_matrix(),
            Matrix3::identity(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn pyramid_levels() {
        let pyr = ScalePyramid::new(1.2, 8);
        assert_eq!(pyr.n_levels(), 8);
        assert_relative_eq!(pyr.sigma2(0), 1.0);
        assert_relative_eq!(pyr.sigma2(2), 1.2f64.powi(4), epsilon = 1e-12);
        // Octaves past the top level clamp.
        assert_relative_eq!(pyr.sigma2(100), pyr.sigma2(7));
    }

    #[test]
    fn line_feature_equation_contains_endpoints() {
        let kl = LineFeature::from_endpoints(
            Vector2::new(10.0, 20.0),
            Vector2::new(110.0, 80.0),
            0,
        );
        let eval = |p: &Vector2<f64>| kl.line.x * p.x + kl.line.y * p.y + kl.line.z;
        assert_relative_eq!(eval(&kl.start), 0.0, epsilon = 1e-9);
        assert_relative_eq!(eval(&kl.end), 0.0, epsilon = 1e-9);
        assert_relative_eq!(
            (kl.line.x * kl.line.x + kl.line.y * kl.line.y).sqrt(),
            1.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(kl.length(), (100.0f64 * 100.0 + 60.0 * 60.0).sqrt());
    }

    #[test]
    fn frame_validation_rejects_mismatched_arrays() {
        let k = CameraIntrinsics::new(500.0, 500.0, 320.0, 240.0);
        let result = Frame::new(
            vec![PointFeature {
                uv: Vector2::new(1.0, 2.0),
                octave: 0,
            }],
            vec![],
            vec![],
            vec![],
            k,
            ScalePyramid::default(),
            ScalePyramid::default(),
        );
        assert!(result.is_err());
    }
}
