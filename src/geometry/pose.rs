//! World-to-camera rigid transform.
//!
//! Poses are stored as a raw rotation matrix plus translation because every
//! producer in this crate (essential/homography decomposition) and every
//! consumer (projection-matrix rows, DLT systems) operates on matrix entries.

use nalgebra::{Matrix3, Matrix3x4, Vector3};

/// Rigid transform mapping world coordinates into a camera frame:
/// `p_cam = R * p_world + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pose {
    /// Rotation, world to camera (det = +1).
    pub rotation: Matrix3<f64>,
    /// Translation, world to camera.
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Camera centre in world coordinates: `-Rᵀ t`.
    pub fn camera_center(&self) -> Vector3<f64> {
        -self.rotation.transpose() * self.translation
    }

    /// Transform a world point into this camera's frame.
    pub fn transform(&self, p_world: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p_world + self.translation
    }

    /// The camera-to-world transform.
    pub fn inverse(&self) -> Pose {
        let r_wc = self.rotation.transpose();
        Pose {
            rotation: r_wc,
            translation: -r_wc * self.translation,
        }
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// The 3x4 matrix `[R | t]`.
    pub fn matrix3x4(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Projection matrix `K [R | t]`.
    pub fn projection_matrix(&self, k: &Matrix3<f64>) -> Matrix3x4<f64> {
        k * self.matrix3x4()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn test_pose() -> Pose {
        let r = Rotation3::from_euler_angles(0.1, -0.2, 0.3);
        Pose::new(*r.matrix(), Vector3::new(0.5, -1.0, 2.0))
    }

    #[test]
    fn camera_center_round_trip() {
        let pose = test_pose();
        let c = pose.camera_center();
        // The centre maps to the origin of the camera frame.
        assert_relative_eq!(pose.transform(&c), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn inverse_composes_to_identity() {
        let pose = test_pose();
        let id = pose.compose(&pose.inverse());
        assert_relative_eq!(id.rotation, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn projection_matrix_projects_like_transform() {
        let pose = test_pose();
        let k = Matrix3::new(500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0);
        let p = pose.projection_matrix(&k);

        let x = Vector3::new(0.3, -0.1, 4.0);
        let xh = nalgebra::Vector4::new(x.x, x.y, x.z, 1.0);
        let proj = p * xh;

        let cam = pose.transform(&x);
        let expected = k * cam;
        assert_relative_eq!(proj, expected, epsilon = 1e-12);
    }
}
