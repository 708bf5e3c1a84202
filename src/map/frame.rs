//! Frame snapshot consumed at keyframe creation.
//!
//! Tracking produces a `Frame` per sensor cycle; when it decides to insert
//! a keyframe, the [`KeyFrame`](super::KeyFrame) copies the snapshot and
//! the transient `Frame` is dropped. The keyframe composes this data rather
//! than extending the frame type, since their lifetimes diverge sharply.

use crate::geometry::SE3;

use super::keyframe_db::BowVector;

/// ORB-style binary descriptor row. Opaque to this crate.
pub type Descriptor = [u8; 32];

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy)]
pub struct CameraIntrinsics {
    /// Focal length in x (pixels).
    pub fx: f64,
    /// Focal length in y (pixels).
    pub fy: f64,
    /// Principal point x (pixels).
    pub cx: f64,
    /// Principal point y (pixels).
    pub cy: f64,
}

impl CameraIntrinsics {
    /// The 3x3 calibration matrix K.
    pub fn calibration_matrix(&self) -> nalgebra::Matrix3<f64> {
        nalgebra::Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }
}

/// Undistorted image bounds, in pixels.
#[derive(Debug, Clone, Copy)]
pub struct ImageBounds {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl ImageBounds {
    /// Whether a pixel coordinate falls inside the bounds.
    pub fn contains(&self, u: f32, v: f32) -> bool {
        u >= self.min_x && u < self.max_x && v >= self.min_y && v < self.max_y
    }
}

/// A detected feature keypoint.
#[derive(Debug, Clone, Copy)]
pub struct KeyPoint {
    /// Pixel x coordinate.
    pub u: f32,
    /// Pixel y coordinate.
    pub v: f32,
    /// Scale pyramid level the feature was detected at.
    pub octave: i32,
}

/// Per-cycle sensor snapshot produced by tracking.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Id of the source frame in the tracking sequence.
    pub id: u64,
    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Initial pose estimate, camera-to-world (T_wc).
    pub pose: SE3,
    /// Camera calibration.
    pub camera: CameraIntrinsics,
    /// Undistorted image bounds.
    pub bounds: ImageBounds,
    /// Detected keypoints.
    pub keypoints: Vec<KeyPoint>,
    /// One descriptor row per keypoint.
    pub descriptors: Vec<Descriptor>,
    /// Bag-of-words retrieval descriptor. Opaque sparse histogram.
    pub bow: BowVector,
}
