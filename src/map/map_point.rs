//! MapPoint - a 3D landmark observed by KeyFrames.
//!
//! MapPoints own their reverse observation list: for every keyframe that
//! sees the point, the (keyframe id, feature slot) pair is recorded here.
//! The covisibility update and the keyframe erasure cascade both discover
//! neighbor relationships by enumerating this list, which is why it has a
//! fixed contract: [`add_observation`](MapPoint::add_observation),
//! [`erase_observation`](MapPoint::erase_observation) and
//! [`observations`](MapPoint::observations).
//!
//! All state is behind the point's own lock so that worker threads can
//! share points through `Arc` without touching any keyframe lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector3;
use parking_lot::Mutex;

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
pub struct MapPoint {
    /// Unique identifier for this MapPoint.
    pub id: MapPointId,

    /// KeyFrame that first created this point (reference keyframe).
    pub first_kf_id: KeyFrameId,

    /// 3D position in world frame.
    position: Mutex<Vector3<f64>>,

    /// Observing keyframes, mapped to the feature slot in that keyframe.
    observations: Mutex<HashMap<KeyFrameId, usize>>,

    /// Permanent bad flag. Once set it is never cleared.
    bad: AtomicBool,
}

impl MapPoint {
    /// Create a new MapPoint.
    pub fn new(id: MapPointId, position: Vector3<f64>, first_kf_id: KeyFrameId) -> Self {
        Self {
            id,
            first_kf_id,
            position: Mutex::new(position),
            observations: Mutex::new(HashMap::new()),
            bad: AtomicBool::new(false),
        }
    }

    /// Current world position.
    pub fn position(&self) -> Vector3<f64> {
        *self.position.lock()
    }

    /// Replace the world position.
    pub fn set_position(&self, position: Vector3<f64>) {
        *self.position.lock() = position;
    }

    /// Record that `kf_id` observes this point at feature slot `slot`.
    pub fn add_observation(&self, kf_id: KeyFrameId, slot: usize) {
        self.observations.lock().insert(kf_id, slot);
    }

    /// Remove the observation from `kf_id`, if present.
    ///
    /// Returns true if an observation existed and was removed.
    pub fn erase_observation(&self, kf_id: KeyFrameId) -> bool {
        self.observations.lock().remove(&kf_id).is_some()
    }

    /// Snapshot of all (keyframe, slot) observation pairs.
    pub fn observations(&self) -> Vec<(KeyFrameId, usize)> {
        self.observations
            .lock()
            .iter()
            .map(|(&kf, &slot)| (kf, slot))
            .collect()
    }

    /// The feature slot under which `kf_id` observes this point, if any.
    pub fn observation_slot(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.lock().get(&kf_id).copied()
    }

    /// Number of observing keyframes.
    pub fn num_observations(&self) -> usize {
        self.observations.lock().len()
    }

    /// Whether this point is marked bad.
    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }

    /// Mark this point as bad. Irreversible.
    pub fn set_bad(&self) {
        self.bad.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("observations", &self.observations.lock().len())
            .field("is_bad", &self.is_bad())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_mappoint() -> MapPoint {
        MapPoint::new(
            MapPointId::new(1),
            Vector3::new(1.0, 2.0, 3.0),
            KeyFrameId::new(0),
        )
    }

    #[test]
    fn test_add_remove_observation() {
        let mp = create_test_mappoint();

        mp.add_observation(KeyFrameId::new(1), 5);
        mp.add_observation(KeyFrameId::new(2), 10);

        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observation_slot(KeyFrameId::new(1)), Some(5));

        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert_eq!(mp.num_observations(), 1);
        assert!(!mp.erase_observation(KeyFrameId::new(1))); // Already removed
    }

    #[test]
    fn test_bad_flag_is_permanent() {
        let mp = create_test_mappoint();
        assert!(!mp.is_bad());
        mp.set_bad();
        assert!(mp.is_bad());
    }

    #[test]
    fn test_observation_snapshot() {
        let mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(3), 7);

        let obs = mp.observations();
        assert_eq!(obs, vec![(KeyFrameId::new(3), 7)]);
    }
}
