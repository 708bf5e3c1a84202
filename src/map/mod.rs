//! Core SLAM map data structures.
//!
//! This module contains:
//! - [`KeyFrame`] - retained frames with poses, feature observations and
//!   graph relationships
//! - [`MapPoint`] - 3D landmarks observed by KeyFrames
//! - [`Map`] - id-indexed arena owning all KeyFrames and MapPoints
//! - [`KeyFrameDatabase`] - place-recognition index over BoW vectors
//!
//! # Architecture
//!
//! The map forms a bipartite graph:
//! - KeyFrames observe MapPoints (KF → MP via the per-slot table)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! KeyFrames also maintain two graph structures on top of that:
//! - **Covisibility graph**: edges weighted by shared MapPoint count
//! - **Spanning tree**: minimal connected hierarchy used to propagate
//!   pose corrections during loop closure
//!
//! Every cross-entity reference is an id resolved through the [`Map`]
//! arena, never an owning handle, so erasing a keyframe is a pure graph
//! edit. Each keyframe protects its pose, its observation table and its
//! connection graph with three independent locks; no thread ever holds
//! more than one keyframe's connections lock at a time.

pub mod config;
pub mod frame;
pub mod keyframe;
pub mod keyframe_db;
pub mod map;
pub mod map_point;
pub mod types;

pub use config::GraphConfig;
pub use frame::{CameraIntrinsics, Descriptor, Frame, ImageBounds, KeyPoint};
pub use keyframe::{KeyFrame, PROTECT_LOCAL_WINDOW, PROTECT_LOOP_CANDIDATE};
pub use keyframe_db::{BowVector, Candidate, KeyFrameDatabase};
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
