//! Keyframe map-graph core for visual SLAM.
//!
//! This crate implements the shared graph that tracking, local mapping and
//! loop closing mutate concurrently: keyframes, their covisibility graph,
//! the spanning tree used for pose-correction propagation, loop-closure
//! edges, and the erase/protection lifecycle that gates keyframe removal.
//!
//! Feature extraction, optimization and the worker control loops live
//! outside; they consume this crate through the [`map`] module types.

pub mod geometry;
pub mod map;
