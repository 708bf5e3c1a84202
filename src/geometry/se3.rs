//! SE3 rigid body transform.
//!
//! Poses in this crate follow the camera convention used by the map layer:
//! a keyframe pose is T_wc (camera-to-world), so the translation component
//! is the camera center in the world frame.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// A rigid transform in SE(3): rotation followed by translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    /// Rotation component.
    pub rotation: UnitQuaternion<f64>,
    /// Translation component.
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Create a transform from rotation and translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Inverse transform: if self maps a→b, the result maps b→a.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// Composition: `self.compose(other)` applies `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
