//! Map - the arena owning all KeyFrames and MapPoints.
//!
//! Every cross-entity reference in the graph is an id resolved through
//! this arena. Erasing a keyframe therefore never leaves a dangling
//! pointer: unlinking edges is part of the erase operation, and the
//! `Arc` handles keep an entity alive for callers that still hold one.
//!
//! The arena locks guard only the id tables; per-keyframe state is
//! protected by the keyframes' own fine-grained locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use nalgebra::Vector3;
use parking_lot::RwLock;
use tracing::debug;

use super::config::GraphConfig;
use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// The SLAM map: id-indexed containers for keyframes and landmarks.
pub struct Map {
    keyframes: RwLock<HashMap<KeyFrameId, Arc<KeyFrame>>>,
    map_points: RwLock<HashMap<MapPointId, Arc<MapPoint>>>,

    next_kf_id: AtomicU64,
    next_mp_id: AtomicU64,

    /// First-ever registered keyframe: the implicit spanning-tree root.
    origin: OnceLock<KeyFrameId>,

    config: GraphConfig,
}

impl Map {
    /// Create an empty map.
    pub fn new(config: GraphConfig) -> Arc<Self> {
        Arc::new(Self {
            keyframes: RwLock::new(HashMap::new()),
            map_points: RwLock::new(HashMap::new()),
            next_kf_id: AtomicU64::new(0),
            next_mp_id: AtomicU64::new(0),
            origin: OnceLock::new(),
            config,
        })
    }

    /// Graph configuration.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────
    // KeyFrames
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn next_keyframe_id(&self) -> KeyFrameId {
        KeyFrameId::new(self.next_kf_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a keyframe to the arena. Called by keyframe construction. The
    /// first registered keyframe becomes the spanning-tree root.
    pub(crate) fn register(&self, kf: Arc<KeyFrame>) {
        let _ = self.origin.set(kf.id);
        self.keyframes.write().insert(kf.id, kf);
    }

    /// Remove a keyframe from the arena. Called at the end of the erasure
    /// cascade; callers holding an `Arc` keep their last-valid view.
    pub(crate) fn unregister(&self, kf_id: KeyFrameId) {
        self.keyframes.write().remove(&kf_id);
    }

    /// Resolve a keyframe id.
    pub fn get_keyframe(&self, kf_id: KeyFrameId) -> Option<Arc<KeyFrame>> {
        self.keyframes.read().get(&kf_id).cloned()
    }

    /// All live keyframes.
    pub fn keyframes(&self) -> Vec<Arc<KeyFrame>> {
        self.keyframes.read().values().cloned().collect()
    }

    /// Number of live keyframes.
    pub fn num_keyframes(&self) -> usize {
        self.keyframes.read().len()
    }

    /// Id of the spanning-tree root, once the first keyframe registered.
    pub fn origin_keyframe_id(&self) -> Option<KeyFrameId> {
        self.origin.get().copied()
    }

    /// Whether `kf_id` is the first-ever registered keyframe.
    pub fn is_origin(&self, kf_id: KeyFrameId) -> bool {
        self.origin.get() == Some(&kf_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // MapPoints
    // ─────────────────────────────────────────────────────────────────────

    /// Create a landmark and add it to the arena.
    pub fn create_map_point(
        &self,
        position: Vector3<f64>,
        first_kf_id: KeyFrameId,
    ) -> Arc<MapPoint> {
        let id = MapPointId::new(self.next_mp_id.fetch_add(1, Ordering::Relaxed));
        let mp = Arc::new(MapPoint::new(id, position, first_kf_id));
        self.map_points.write().insert(id, mp.clone());
        mp
    }

    /// Resolve a landmark id.
    pub fn get_map_point(&self, mp_id: MapPointId) -> Option<Arc<MapPoint>> {
        self.map_points.read().get(&mp_id).cloned()
    }

    /// Number of live landmarks.
    pub fn num_map_points(&self) -> usize {
        self.map_points.read().len()
    }

    /// Fully remove a landmark: mark it bad, clear the association slot
    /// in every observing keyframe, and drop it from the arena.
    pub fn erase_map_point(&self, mp_id: MapPointId) {
        let Some(mp) = self.get_map_point(mp_id) else {
            return;
        };
        mp.set_bad();

        for (kf_id, slot) in mp.observations() {
            if let Some(kf) = self.get_keyframe(kf_id) {
                kf.erase_map_point_match(slot);
            }
        }

        self.map_points.write().remove(&mp_id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Culling
    // ─────────────────────────────────────────────────────────────────────

    /// Erase keyframes covisible with `current` whose landmarks are
    /// redundantly covered: at least `redundancy_ratio` of their tracked
    /// points observed by `redundancy_min_observers` other keyframes.
    ///
    /// Skips the current keyframe, the root, protected keyframes and
    /// keyframes anchoring a loop edge. Returns how many were erased.
    pub fn cull_redundant_keyframes(&self, current: KeyFrameId) -> usize {
        let Some(current_kf) = self.get_keyframe(current) else {
            return 0;
        };

        let mut culled = 0;
        for kf_id in current_kf.get_connected_keyframes() {
            if kf_id == current {
                continue;
            }
            let Some(kf) = self.get_keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad() || kf.get_parent().is_none() {
                continue;
            }
            if kf.has_loop_edges() || kf.not_erase_mask() != 0 {
                continue;
            }

            let mut total = 0usize;
            let mut redundant = 0usize;
            for mp_id in kf.get_map_points() {
                let Some(mp) = self.get_map_point(mp_id) else {
                    continue;
                };
                total += 1;
                let other_observers = mp
                    .observations()
                    .iter()
                    .filter(|&&(obs_kf, _)| obs_kf != kf_id)
                    .count();
                if other_observers >= self.config.redundancy_min_observers {
                    redundant += 1;
                }
            }

            if total > 0 && redundant as f64 > self.config.redundancy_ratio * total as f64 {
                debug!(kf = %kf_id, redundant, total, "culling redundant keyframe");
                kf.set_bad_flag();
                culled += 1;
            }
        }

        culled
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.keyframes.write().clear();
        self.map_points.write().clear();
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.num_keyframes())
            .field("num_map_points", &self.num_map_points())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::frame::{CameraIntrinsics, Frame, ImageBounds, KeyPoint};
    use crate::map::keyframe_db::{BowVector, KeyFrameDatabase};

    fn test_world(threshold: usize) -> (Arc<Map>, Arc<KeyFrameDatabase>) {
        let config = GraphConfig {
            min_shared_observations: threshold,
            ..GraphConfig::default()
        };
        (Map::new(config), KeyFrameDatabase::new())
    }

    fn test_frame(num_features: usize) -> Frame {
        Frame {
            id: 0,
            timestamp_ns: 0,
            pose: SE3::identity(),
            camera: CameraIntrinsics {
                fx: 450.0,
                fy: 450.0,
                cx: 320.0,
                cy: 240.0,
            },
            bounds: ImageBounds {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 640.0,
                max_y: 480.0,
            },
            keypoints: vec![KeyPoint { u: 0.0, v: 0.0, octave: 0 }; num_features],
            descriptors: vec![[0u8; 32]; num_features],
            bow: BowVector::new(),
        }
    }

    fn make_kf(map: &Arc<Map>, db: &Arc<KeyFrameDatabase>) -> Arc<KeyFrame> {
        KeyFrame::new(test_frame(64), map, db)
    }

    /// Create `count` landmarks observed by every keyframe in `observers`,
    /// using that keyframe's slots starting at its entry in `next_slot`.
    fn share_points(
        map: &Arc<Map>,
        observers: &[&Arc<KeyFrame>],
        count: usize,
        next_slot: &mut HashMap<KeyFrameId, usize>,
    ) {
        for _ in 0..count {
            let mp = map.create_map_point(Vector3::zeros(), observers[0].id);
            for kf in observers {
                let slot = next_slot.entry(kf.id).or_insert(0);
                kf.add_map_point(&mp, *slot);
                *slot += 1;
            }
        }
    }

    #[test]
    fn test_registration_and_origin() {
        let (map, db) = test_world(3);
        let kf0 = make_kf(&map, &db);
        let kf1 = make_kf(&map, &db);

        assert_eq!(map.num_keyframes(), 2);
        assert_eq!(map.origin_keyframe_id(), Some(kf0.id));
        assert!(map.is_origin(kf0.id));
        assert!(!map.is_origin(kf1.id));
        assert!(map.get_keyframe(kf1.id).is_some());
    }

    #[test]
    fn test_threshold_rule() {
        // Scenario A: KF1 shares 5 points with KF2 and 1 with KF3;
        // threshold 3 keeps only the KF2 edge, no fallback fires.
        let (map, db) = test_world(3);
        let kf1 = make_kf(&map, &db);
        let kf2 = make_kf(&map, &db);
        let kf3 = make_kf(&map, &db);
        let mut slots = HashMap::new();

        share_points(&map, &[&kf1, &kf2], 5, &mut slots);
        share_points(&map, &[&kf1, &kf3], 1, &mut slots);

        kf1.update_connections();

        assert_eq!(kf1.get_weight(kf2.id), 5);
        assert_eq!(kf1.get_weight(kf3.id), 0);
        assert!(!kf1.get_connected_keyframes().contains(&kf3.id));
        // The qualifying neighbor received the mirror edge.
        assert_eq!(kf2.get_weight(kf1.id), 5);
    }

    #[test]
    fn test_fallback_edge_when_nothing_reaches_threshold() {
        // Scenario B: only neighbor is KF4 with a single shared point.
        let (map, db) = test_world(3);
        let kf1 = make_kf(&map, &db);
        let kf4 = make_kf(&map, &db);
        let mut slots = HashMap::new();

        share_points(&map, &[&kf1, &kf4], 1, &mut slots);

        kf1.update_connections();

        let connected = kf1.covisibles_with_weights();
        assert_eq!(connected, vec![(kf4.id, 1)]);
        assert_eq!(kf4.get_weight(kf1.id), 1);
    }

    #[test]
    fn test_symmetry_after_both_updates() {
        let (map, db) = test_world(2);
        let a = make_kf(&map, &db);
        let b = make_kf(&map, &db);
        let c = make_kf(&map, &db);
        let mut slots = HashMap::new();

        share_points(&map, &[&a, &b], 4, &mut slots);
        share_points(&map, &[&a, &c], 2, &mut slots);
        share_points(&map, &[&b, &c], 3, &mut slots);

        a.update_connections();
        b.update_connections();
        c.update_connections();

        for (x, y) in [(&a, &b), (&a, &c), (&b, &c)] {
            assert_eq!(x.get_weight(y.id), y.get_weight(x.id));
            assert!(x.get_weight(y.id) > 0);
        }
    }

    #[test]
    fn test_first_connection_attaches_parent() {
        let (map, db) = test_world(2);
        let root = make_kf(&map, &db);
        let kf = make_kf(&map, &db);
        let mut slots = HashMap::new();

        share_points(&map, &[&root, &kf], 3, &mut slots);

        kf.update_connections();
        assert_eq!(kf.get_parent(), Some(root.id));
        assert!(root.has_child(kf.id));

        // The origin itself never gains a parent.
        root.update_connections();
        assert_eq!(root.get_parent(), None);
    }

    #[test]
    fn test_erasure_cascade_reparents_children() {
        // Scenario C: KF2 is KF4's parent; when KF2 dies, KF4's best
        // surviving ancestor-connected neighbor is KF1.
        let (map, db) = test_world(3);
        let kf1 = make_kf(&map, &db); // origin/root
        let kf2 = make_kf(&map, &db);
        let kf4 = make_kf(&map, &db);
        let mut slots = HashMap::new();

        share_points(&map, &[&kf1, &kf2], 4, &mut slots);
        kf2.update_connections();
        assert_eq!(kf2.get_parent(), Some(kf1.id));

        share_points(&map, &[&kf2, &kf4], 5, &mut slots);
        share_points(&map, &[&kf1, &kf4], 3, &mut slots);
        kf4.update_connections();
        assert_eq!(kf4.get_parent(), Some(kf2.id)); // highest weight wins

        kf2.set_bad_flag();

        assert!(kf2.is_bad());
        assert_eq!(kf4.get_parent(), Some(kf1.id));
        assert!(kf1.has_child(kf4.id));
        assert!(!kf1.has_child(kf2.id));

        // KF2 is gone from every surviving structure.
        assert!(!kf1.get_connected_keyframes().contains(&kf2.id));
        assert!(!kf4.get_connected_keyframes().contains(&kf2.id));
        assert!(map.get_keyframe(kf2.id).is_none());
        for mp_id in kf4.get_map_points() {
            let mp = map.get_map_point(mp_id).unwrap();
            assert_eq!(mp.observation_slot(kf2.id), None);
        }
    }

    #[test]
    fn test_skip_level_fallback_reparenting() {
        // The child shares nothing with the surviving subtree, so it
        // hangs off the erased keyframe's own parent.
        let (map, db) = test_world(2);
        let root = make_kf(&map, &db);
        let mid = make_kf(&map, &db);
        let leaf = make_kf(&map, &db);
        let mut slots = HashMap::new();

        share_points(&map, &[&root, &mid], 3, &mut slots);
        share_points(&map, &[&mid, &leaf], 3, &mut slots);

        mid.update_connections();
        leaf.update_connections();
        assert_eq!(leaf.get_parent(), Some(mid.id));

        mid.set_bad_flag();

        assert_eq!(leaf.get_parent(), Some(root.id));
        assert!(root.has_child(leaf.id));
    }

    #[test]
    fn test_cascade_reparenting_tie_breaks_by_child_id() {
        // Both children tie on their best surviving-subtree weight; the
        // smaller id is reparented first and then serves as the better
        // candidate for the other.
        let (map, db) = test_world(2);
        let root = make_kf(&map, &db);
        let mid = make_kf(&map, &db);
        let c1 = make_kf(&map, &db);
        let c2 = make_kf(&map, &db);

        mid.change_parent(&root);
        c1.change_parent(&mid);
        c2.change_parent(&mid);

        c1.add_connection(root.id, 4);
        root.add_connection(c1.id, 4);
        c2.add_connection(root.id, 4);
        root.add_connection(c2.id, 4);
        c1.add_connection(c2.id, 9);
        c2.add_connection(c1.id, 9);

        mid.set_bad_flag();

        assert_eq!(c1.get_parent(), Some(root.id));
        assert_eq!(c2.get_parent(), Some(c1.id));
        assert!(root.has_child(c1.id));
        assert!(c1.has_child(c2.id));
    }

    #[test]
    fn test_update_on_erased_keyframe_leaves_no_edges() {
        let (map, db) = test_world(2);
        let root = make_kf(&map, &db);
        let kf = make_kf(&map, &db);
        let mut slots = HashMap::new();

        share_points(&map, &[&root, &kf], 3, &mut slots);
        kf.update_connections();
        assert_eq!(root.get_weight(kf.id), 3);

        kf.set_bad_flag();
        kf.update_connections();

        // No mirror edge to a dead id reappears in the neighbor.
        assert_eq!(root.get_weight(kf.id), 0);
        assert!(kf.get_connected_keyframes().is_empty());
    }

    #[test]
    fn test_spanning_tree_stays_a_forest() {
        let (map, db) = test_world(2);
        let kfs: Vec<_> = (0..5).map(|_| make_kf(&map, &db)).collect();
        let mut slots = HashMap::new();

        for pair in kfs.windows(2) {
            share_points(&map, &[&pair[0], &pair[1]], 3, &mut slots);
        }
        for kf in &kfs {
            kf.update_connections();
        }
        kfs[2].set_bad_flag();

        // Following parent links from any live keyframe terminates at the
        // root without revisiting a node.
        for kf in map.keyframes() {
            let mut seen = std::collections::HashSet::new();
            let mut current = kf.id;
            while let Some(parent) = map.get_keyframe(current).and_then(|k| k.get_parent()) {
                assert!(seen.insert(current), "cycle through {}", current);
                current = parent;
            }
            assert_eq!(current, map.origin_keyframe_id().unwrap());
        }
    }

    #[test]
    fn test_cull_redundant_keyframes() {
        let (map, db) = test_world(2);
        let a = make_kf(&map, &db);
        let b = make_kf(&map, &db);
        let c = make_kf(&map, &db);
        let d = make_kf(&map, &db);
        let mut slots = HashMap::new();

        // Every point is observed by all four keyframes: each of b and c
        // sees only redundantly-covered points.
        share_points(&map, &[&a, &b, &c, &d], 6, &mut slots);
        for kf in [&a, &b, &c, &d] {
            kf.update_connections();
        }

        let culled = map.cull_redundant_keyframes(d.id);

        // Erasing the first redundant keyframe drops the others below the
        // three-observer bar, so exactly one goes.
        assert_eq!(culled, 1);
        assert_eq!(map.num_keyframes(), 3);
        assert!(map.get_keyframe(a.id).is_some()); // root survives
        assert!(map.get_keyframe(d.id).is_some()); // current survives
    }

    #[test]
    fn test_cull_skips_loop_anchors_and_protected() {
        let (map, db) = test_world(2);
        let a = make_kf(&map, &db);
        let b = make_kf(&map, &db);
        let c = make_kf(&map, &db);
        let d = make_kf(&map, &db);
        let far = make_kf(&map, &db);
        let mut slots = HashMap::new();

        share_points(&map, &[&a, &b, &c, &d], 6, &mut slots);
        for kf in [&a, &b, &c, &d] {
            kf.update_connections();
        }
        b.add_loop_edge(&far);
        c.set_not_erase(crate::map::PROTECT_LOCAL_WINDOW);

        assert_eq!(map.cull_redundant_keyframes(d.id), 0);
        assert_eq!(map.num_keyframes(), 5);

        c.set_erase(crate::map::PROTECT_LOCAL_WINDOW);
        assert_eq!(map.cull_redundant_keyframes(d.id), 1);
        assert!(map.get_keyframe(b.id).is_some()); // loop anchor kept
        assert!(map.get_keyframe(c.id).is_none());
    }

    #[test]
    fn test_erase_map_point_clears_observers() {
        let (map, db) = test_world(3);
        let kf = make_kf(&map, &db);
        let mp = map.create_map_point(Vector3::new(1.0, 0.0, 5.0), kf.id);
        kf.add_map_point(&mp, 4);

        map.erase_map_point(mp.id);

        assert!(mp.is_bad());
        assert_eq!(kf.get_map_point(4), None);
        assert_eq!(map.num_map_points(), 0);
    }
}
