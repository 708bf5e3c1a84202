//! KeyFrame - a retained frame with map structure relationships.
//!
//! KeyFrames are the nodes of the SLAM graph. Each one holds:
//! - a copied sensor snapshot (features, calibration, BoW vector)
//! - a pose estimate (SE3, camera-to-world)
//! - graph relationships: covisibility edges, spanning tree, loop edges
//! - the erase/protection lifecycle gating its removal
//!
//! The covisibility graph connects keyframes that share MapPoint
//! observations; the spanning tree provides a minimal connected structure
//! for propagating pose corrections during loop closure.
//!
//! # Locking
//!
//! Three independent locks per keyframe: pose, observation table, and the
//! connection graph (which also covers the spanning tree, loop edges and
//! lifecycle flags). They are accessed at different rates by different
//! worker threads and no operation needs more than one of them at a time.
//! Cross-keyframe edits never hold two connection locks at once: every
//! operation snapshots its own state, releases, then touches other
//! keyframes one lock at a time. Neighbor relationships are discovered by
//! reading landmark observation lists, not by reaching into other
//! keyframes' edge maps.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use parking_lot::Mutex;
use tracing::debug;

use crate::geometry::SE3;

use super::frame::{CameraIntrinsics, Descriptor, Frame, ImageBounds, KeyPoint};
use super::keyframe_db::{BowVector, KeyFrameDatabase};
use super::map::Map;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Protection reason: the keyframe sits in a local optimization window.
pub const PROTECT_LOCAL_WINDOW: u8 = 0x01;

/// Protection reason: the keyframe is a loop-closure candidate under
/// verification.
pub const PROTECT_LOOP_CANDIDATE: u8 = 0x02;

/// Lifecycle of a keyframe. Transitions are one-way:
/// `Active → PendingErase → Erased` or `Active → Erased`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErasureState {
    /// Live member of the graph.
    Active,
    /// Erasure was requested while a protection bit was set; it runs as
    /// soon as the last bit clears.
    PendingErase,
    /// Permanently removed from the graph. Terminal.
    Erased,
}

/// State guarded by the connections lock: covisibility edges, spanning
/// tree, loop edges and the erase lifecycle, mirroring how they are always
/// mutated together.
struct Connections {
    /// Covisibility weights: neighbor → number of shared MapPoints.
    weights: HashMap<KeyFrameId, usize>,

    /// Cached neighbor list, non-increasing by weight, ties by ascending
    /// id. Rebuilt lazily when `dirty`.
    ordered: Vec<(KeyFrameId, usize)>,
    dirty: bool,

    /// True until the first successful `update_connections`, which
    /// attaches the keyframe to its best neighbor as spanning-tree parent.
    first_connection: bool,

    /// Parent in the spanning tree. None for the root.
    parent: Option<KeyFrameId>,

    /// Children in the spanning tree.
    children: HashSet<KeyFrameId>,

    /// Extra edges added by loop closure.
    loop_edges: HashSet<KeyFrameId>,

    /// OR of independently-owned protection reason bits.
    not_erase: u8,

    state: ErasureState,
}

impl Connections {
    fn new() -> Self {
        Self {
            weights: HashMap::new(),
            ordered: Vec::new(),
            dirty: false,
            first_connection: true,
            parent: None,
            children: HashSet::new(),
            loop_edges: HashSet::new(),
            not_erase: 0,
            state: ErasureState::Active,
        }
    }

    fn ensure_sorted(&mut self) {
        if !self.dirty {
            return;
        }
        self.ordered = self.weights.iter().map(|(&id, &w)| (id, w)).collect();
        self.ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.dirty = false;
    }
}

/// A KeyFrame in the SLAM map.
///
/// Created by tracking from a [`Frame`] snapshot; mutated by local mapping
/// (graph updates, culling) and loop closing (loop edges, reparenting).
/// All methods take `&self`: shared across threads via `Arc`, with
/// fine-grained interior locking.
pub struct KeyFrame {
    /// Unique identifier, assigned monotonically by the [`Map`].
    pub id: KeyFrameId,

    /// Id of the source frame this keyframe was created from.
    pub frame_id: u64,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Camera calibration, copied from the frame.
    pub camera: CameraIntrinsics,

    /// Undistorted image bounds, copied from the frame.
    pub bounds: ImageBounds,

    keypoints: Vec<KeyPoint>,
    descriptors: Vec<Descriptor>,
    bow: BowVector,

    // Lock domains. Deliberately separate: pose is read constantly by
    // tracking, observations by local mapping, connections by loop closing.
    pose: Mutex<SE3>,
    observations: Mutex<Vec<Option<MapPointId>>>,
    connections: Mutex<Connections>,

    // Non-owning back-relations for registration/erasure only.
    map: Weak<Map>,
    db: Weak<KeyFrameDatabase>,
}

impl KeyFrame {
    /// Create a keyframe from a frame snapshot and register it with the
    /// map and the place-recognition database.
    pub fn new(frame: Frame, map: &Arc<Map>, db: &Arc<KeyFrameDatabase>) -> Arc<Self> {
        let id = map.next_keyframe_id();
        let num_features = frame.keypoints.len();

        let kf = Arc::new(Self {
            id,
            frame_id: frame.id,
            timestamp_ns: frame.timestamp_ns,
            camera: frame.camera,
            bounds: frame.bounds,
            keypoints: frame.keypoints,
            descriptors: frame.descriptors,
            bow: frame.bow.clone(),
            pose: Mutex::new(frame.pose),
            observations: Mutex::new(vec![None; num_features]),
            connections: Mutex::new(Connections::new()),
            map: Arc::downgrade(map),
            db: Arc::downgrade(db),
        });

        map.register(kf.clone());
        db.add(id, frame.bow);
        kf
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pose
    // ─────────────────────────────────────────────────────────────────────

    /// Replace the pose (camera-to-world). No-op on an erased keyframe.
    pub fn set_pose(&self, pose: SE3) {
        if self.is_bad() {
            return;
        }
        *self.pose.lock() = pose;
    }

    /// Current pose, camera-to-world (T_wc). Reads are torn-free: the
    /// whole transform is copied under the pose lock.
    pub fn get_pose(&self) -> SE3 {
        *self.pose.lock()
    }

    /// World-to-camera transform (T_cw).
    pub fn get_pose_inverse(&self) -> SE3 {
        self.pose.lock().inverse()
    }

    /// Camera-to-world rotation.
    pub fn get_rotation(&self) -> UnitQuaternion<f64> {
        self.pose.lock().rotation
    }

    /// Camera-to-world translation.
    pub fn get_translation(&self) -> Vector3<f64> {
        self.pose.lock().translation
    }

    /// Camera position in the world frame, derived from the pose.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.lock().translation
    }

    /// The 3x3 calibration matrix K.
    pub fn get_calibration_matrix(&self) -> Matrix3<f64> {
        self.camera.calibration_matrix()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Feature snapshot
    // ─────────────────────────────────────────────────────────────────────

    /// Detected keypoints copied from the source frame.
    pub fn keypoints(&self) -> &[KeyPoint] {
        &self.keypoints
    }

    /// Descriptor rows copied from the source frame.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Number of features in this keyframe.
    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Bag-of-words retrieval descriptor.
    pub fn bow_vector(&self) -> &BowVector {
        &self.bow
    }

    /// Whether a pixel coordinate falls inside the undistorted image.
    pub fn is_in_image(&self, u: f32, v: f32) -> bool {
        self.bounds.contains(u, v)
    }

    /// Indices of keypoints within `radius` pixels of (u, v), optionally
    /// restricted to a scale-level range.
    pub fn get_features_in_area(
        &self,
        u: f32,
        v: f32,
        radius: f32,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        let mut indices = Vec::new();

        for (i, kp) in self.keypoints.iter().enumerate() {
            if let Some(min) = min_level {
                if kp.octave < min {
                    continue;
                }
            }
            if let Some(max) = max_level {
                if kp.octave > max {
                    continue;
                }
            }

            let du = kp.u - u;
            let dv = kp.v - v;
            if du * du + dv * dv <= radius_sq {
                indices.push(i);
            }
        }

        indices
    }

    // ─────────────────────────────────────────────────────────────────────
    // MapPoint observations
    // ─────────────────────────────────────────────────────────────────────

    /// Associate feature slot `slot` with a landmark, bidirectionally:
    /// the slot records the landmark and the landmark records the
    /// (keyframe, slot) observation.
    pub fn add_map_point(&self, mp: &Arc<MapPoint>, slot: usize) {
        if self.is_bad() {
            return;
        }
        {
            let mut obs = self.observations.lock();
            match obs.get_mut(slot) {
                Some(entry) => *entry = Some(mp.id),
                None => return,
            }
        }
        mp.add_observation(self.id, slot);
    }

    /// The landmark associated with a feature slot, if any.
    pub fn get_map_point(&self, slot: usize) -> Option<MapPointId> {
        self.observations.lock().get(slot).copied().flatten()
    }

    /// Remove the association at `slot` and the landmark's reverse
    /// observation. Erasing an empty slot is a no-op.
    pub fn erase_map_point_match(&self, slot: usize) {
        if self.is_bad() {
            return;
        }
        let removed = {
            let mut obs = self.observations.lock();
            obs.get_mut(slot).and_then(|entry| entry.take())
        };
        let Some(mp_id) = removed else { return };

        if let Some(map) = self.map.upgrade() {
            if let Some(mp) = map.get_map_point(mp_id) {
                mp.erase_observation(self.id);
            }
        }
    }

    /// Remove the association with a landmark, resolving the slot through
    /// the landmark's observation list. Absent associations are a no-op.
    pub fn erase_map_point_match_by(&self, mp: &MapPoint) {
        if self.is_bad() {
            return;
        }
        let slot = mp.observation_slot(self.id).or_else(|| {
            self.observations
                .lock()
                .iter()
                .position(|entry| *entry == Some(mp.id))
        });
        let Some(slot) = slot else { return };

        {
            let mut obs = self.observations.lock();
            if let Some(entry) = obs.get_mut(slot) {
                if *entry == Some(mp.id) {
                    *entry = None;
                }
            }
        }
        mp.erase_observation(self.id);
    }

    /// Ids of all associated landmarks that are still live (non-bad).
    pub fn get_map_points(&self) -> HashSet<MapPointId> {
        let slots: Vec<MapPointId> = self.observations.lock().iter().flatten().copied().collect();

        let Some(map) = self.map.upgrade() else {
            return slots.into_iter().collect();
        };
        slots
            .into_iter()
            .filter(|&mp_id| map.get_map_point(mp_id).is_some_and(|mp| !mp.is_bad()))
            .collect()
    }

    /// Number of live landmark associations.
    pub fn tracked_map_points(&self) -> usize {
        self.get_map_points().len()
    }

    /// Median depth of the associated landmarks in this keyframe's camera
    /// frame. `q = 2` gives the median, larger `q` a nearer quantile.
    pub fn compute_scene_median_depth(&self, q: usize) -> Option<f64> {
        let map = self.map.upgrade()?;
        let slots: Vec<MapPointId> = self.observations.lock().iter().flatten().copied().collect();
        let t_cw = self.get_pose_inverse();

        let mut depths: Vec<f64> = slots
            .into_iter()
            .filter_map(|mp_id| map.get_map_point(mp_id))
            .filter(|mp| !mp.is_bad())
            .map(|mp| t_cw.transform_point(&mp.position()).z)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(depths[(depths.len() - 1) / q.max(1)])
    }

    // ─────────────────────────────────────────────────────────────────────
    // Covisibility graph
    // ─────────────────────────────────────────────────────────────────────

    /// Insert or update this keyframe's directed edge to `kf_id` and
    /// invalidate the cached ordering. The mirror edge is written when the
    /// neighbor runs its own update.
    pub fn add_connection(&self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        let mut conn = self.connections.lock();
        if conn.state == ErasureState::Erased {
            return;
        }
        conn.weights.insert(kf_id, weight);
        conn.dirty = true;
    }

    /// Remove this keyframe's own edge to `kf_id`. The neighbor's
    /// reciprocal edge is untouched; symmetric cleanup is the caller's
    /// responsibility or part of the erasure cascade.
    pub fn erase_connection(&self, kf_id: KeyFrameId) {
        let mut conn = self.connections.lock();
        if conn.state == ErasureState::Erased {
            return;
        }
        if conn.weights.remove(&kf_id).is_some() {
            conn.dirty = true;
        }
    }

    /// Recompute all outgoing edges from the current landmark
    /// associations, replacing the previous edge set.
    ///
    /// For every landmark this keyframe observes, every other live
    /// observer gets a shared-observation count. Neighbors at or above the
    /// configured threshold become edges (and receive the mirror edge);
    /// if none qualifies, the single best neighbor is kept so the
    /// keyframe is never isolated. On the first successful update the
    /// keyframe attaches to its best neighbor as spanning-tree parent.
    pub fn update_connections(&self) {
        let Some(map) = self.map.upgrade() else { return };
        if self.is_bad() {
            return;
        }

        let slots: Vec<MapPointId> = self.observations.lock().iter().flatten().copied().collect();

        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for mp_id in slots {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if mp.is_bad() {
                continue;
            }
            for (kf_id, _slot) in mp.observations() {
                if kf_id == self.id {
                    continue;
                }
                *counter.entry(kf_id).or_insert(0) += 1;
            }
        }
        if counter.is_empty() {
            return;
        }

        let threshold = map.config().min_shared_observations;

        // (weight, id) so ties resolve to the smaller id.
        let mut best: Option<(usize, KeyFrameId)> = None;
        let mut connected: Vec<(KeyFrameId, usize)> = Vec::new();
        for (&kf_id, &count) in &counter {
            let Some(other) = map.get_keyframe(kf_id) else {
                continue;
            };
            if other.is_bad() {
                continue;
            }
            let beats = match best {
                None => true,
                Some((bw, bid)) => count > bw || (count == bw && kf_id < bid),
            };
            if beats {
                best = Some((count, kf_id));
            }
            if count >= threshold {
                connected.push((kf_id, count));
            }
        }

        // Fallback edge: keep the single best neighbor when nothing
        // reaches the threshold.
        if connected.is_empty() {
            let Some((count, kf_id)) = best else { return };
            connected.push((kf_id, count));
        }

        connected.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let attach_parent = {
            let mut conn = self.connections.lock();
            if conn.state == ErasureState::Erased {
                return;
            }
            conn.weights = connected.iter().copied().collect();
            conn.ordered = connected.clone();
            conn.dirty = false;

            if conn.first_connection && !map.is_origin(self.id) {
                conn.first_connection = false;
                conn.parent = Some(connected[0].0);
                Some(connected[0].0)
            } else {
                if conn.first_connection {
                    // The root keeps no parent but counts as connected.
                    conn.first_connection = false;
                }
                None
            }
        };

        // Mirror edges are written only after the commit above confirmed
        // this keyframe is still live; a concurrent erasure between the
        // count and the commit therefore leaves no stale edges behind.
        for &(kf_id, count) in &connected {
            if let Some(other) = map.get_keyframe(kf_id) {
                other.add_connection(self.id, count);
            }
        }

        if let Some(parent_id) = attach_parent {
            if let Some(parent) = map.get_keyframe(parent_id) {
                parent.add_child(self.id);
            }
        }
    }

    /// Rebuild the cached sorted neighbor list now.
    pub fn update_best_covisibles(&self) {
        self.connections.lock().ensure_sorted();
    }

    /// The covisibility weight with `kf_id`, 0 when not connected.
    pub fn get_weight(&self, kf_id: KeyFrameId) -> usize {
        self.connections.lock().weights.get(&kf_id).copied().unwrap_or(0)
    }

    /// All connected keyframes, unordered.
    pub fn get_connected_keyframes(&self) -> HashSet<KeyFrameId> {
        self.connections.lock().weights.keys().copied().collect()
    }

    /// The `n` best covisible keyframes, most shared landmarks first.
    pub fn get_best_covisibility_keyframes(&self, n: usize) -> Vec<KeyFrameId> {
        let mut conn = self.connections.lock();
        conn.ensure_sorted();
        conn.ordered.iter().take(n).map(|&(id, _)| id).collect()
    }

    /// Covisible keyframes with weight at least `w`, best first.
    pub fn get_covisibles_by_weight(&self, w: usize) -> Vec<KeyFrameId> {
        let mut conn = self.connections.lock();
        conn.ensure_sorted();
        conn.ordered
            .iter()
            .take_while(|&&(_, weight)| weight >= w)
            .map(|&(id, _)| id)
            .collect()
    }

    /// Sorted (neighbor, weight) snapshot, best first.
    pub fn covisibles_with_weights(&self) -> Vec<(KeyFrameId, usize)> {
        let mut conn = self.connections.lock();
        conn.ensure_sorted();
        conn.ordered.clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Spanning tree and loop edges
    // ─────────────────────────────────────────────────────────────────────

    /// Parent in the spanning tree. None for the root.
    pub fn get_parent(&self) -> Option<KeyFrameId> {
        self.connections.lock().parent
    }

    /// Children in the spanning tree.
    pub fn get_children(&self) -> HashSet<KeyFrameId> {
        self.connections.lock().children.clone()
    }

    /// Whether `kf_id` is a spanning-tree child of this keyframe.
    pub fn has_child(&self, kf_id: KeyFrameId) -> bool {
        self.connections.lock().children.contains(&kf_id)
    }

    /// Record `kf_id` as a spanning-tree child.
    pub fn add_child(&self, kf_id: KeyFrameId) {
        let mut conn = self.connections.lock();
        if conn.state == ErasureState::Erased {
            return;
        }
        conn.children.insert(kf_id);
    }

    /// Remove `kf_id` from the children set.
    pub fn erase_child(&self, kf_id: KeyFrameId) {
        let mut conn = self.connections.lock();
        if conn.state == ErasureState::Erased {
            return;
        }
        conn.children.remove(&kf_id);
    }

    /// Move this keyframe under a new parent: detach from the old
    /// parent's children, attach to the new one, and establish or refresh
    /// the covisibility edge (parent-child implies covisibility).
    pub fn change_parent(&self, new_parent: &Arc<KeyFrame>) {
        if new_parent.id == self.id || self.is_bad() {
            return;
        }
        let Some(map) = self.map.upgrade() else { return };
        // The origin is the spanning-tree root; it never gains a parent.
        if map.is_origin(self.id) {
            return;
        }

        let old_parent = {
            let mut conn = self.connections.lock();
            let old = conn.parent;
            conn.parent = Some(new_parent.id);
            conn.first_connection = false;
            old
        };

        if let Some(old_id) = old_parent {
            if old_id != new_parent.id {
                if let Some(old) = map.get_keyframe(old_id) {
                    old.erase_child(self.id);
                }
            }
        }
        new_parent.add_child(self.id);

        let weight = self.get_weight(new_parent.id).max(1);
        self.add_connection(new_parent.id, weight);
        new_parent.add_connection(self.id, weight);
    }

    /// Record a loop-closure edge on both keyframes.
    pub fn add_loop_edge(&self, other: &Arc<KeyFrame>) {
        if other.id == self.id || self.is_bad() || other.is_bad() {
            return;
        }
        {
            let mut conn = self.connections.lock();
            if conn.state == ErasureState::Erased {
                return;
            }
            conn.loop_edges.insert(other.id);
        }
        let mut conn = other.connections.lock();
        if conn.state != ErasureState::Erased {
            conn.loop_edges.insert(self.id);
        }
    }

    /// Loop-closure edges attached to this keyframe.
    pub fn get_loop_edges(&self) -> HashSet<KeyFrameId> {
        self.connections.lock().loop_edges.clone()
    }

    /// Whether any loop edge is attached. Keyframes anchoring a loop must
    /// not be culled as redundant.
    pub fn has_loop_edges(&self) -> bool {
        !self.connections.lock().loop_edges.is_empty()
    }

    pub(crate) fn erase_loop_edge(&self, kf_id: KeyFrameId) {
        self.connections.lock().loop_edges.remove(&kf_id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Erase / protection lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Set protection reason bits. While any bit is set, erasure requests
    /// are deferred, never dropped.
    pub fn set_not_erase(&self, bits: u8) {
        let mut conn = self.connections.lock();
        if conn.state == ErasureState::Erased {
            return;
        }
        conn.not_erase |= bits;
    }

    /// Clear protection reason bits. If the mask reaches zero with an
    /// erase pending, the erasure cascade runs immediately.
    pub fn set_erase(&self, bits: u8) {
        let run_pending = {
            let mut conn = self.connections.lock();
            conn.not_erase &= !bits;
            conn.not_erase == 0 && conn.state == ErasureState::PendingErase
        };
        if run_pending {
            self.set_bad_flag();
        }
    }

    /// Current protection bitmask.
    pub fn not_erase_mask(&self) -> u8 {
        self.connections.lock().not_erase
    }

    /// Whether an erase request is waiting on protection bits.
    pub fn is_erase_pending(&self) -> bool {
        self.connections.lock().state == ErasureState::PendingErase
    }

    /// Whether this keyframe has been erased from the graph.
    pub fn is_bad(&self) -> bool {
        self.connections.lock().state == ErasureState::Erased
    }

    /// Request permanent removal from the graph.
    ///
    /// Refused for the origin keyframe (the spanning-tree root) and for a
    /// keyframe without a parent (not yet connected to the graph).
    /// Deferred while any protection bit is set. Otherwise the
    /// erasure cascade runs: children are reparented into the surviving
    /// subtree, every edge referencing this keyframe is removed, and the
    /// keyframe unregisters from the database and the map.
    pub fn set_bad_flag(&self) {
        // The root's identity is fixed at registration; it stays even if
        // the graph around it is rebuilt.
        if self.map.upgrade().is_some_and(|m| m.is_origin(self.id)) {
            return;
        }
        {
            let mut conn = self.connections.lock();
            if conn.state == ErasureState::Erased {
                return;
            }
            if conn.parent.is_none() {
                return;
            }
            if conn.not_erase != 0 {
                conn.state = ErasureState::PendingErase;
                return;
            }
            // Mark terminal before fanning out so concurrent requests and
            // graph readers already observe the keyframe as bad.
            conn.state = ErasureState::Erased;
        }
        self.erase_cascade();
    }

    /// The erasure cascade. Runs with the lifecycle already in `Erased`;
    /// mutates other entities one lock at a time.
    fn erase_cascade(&self) {
        let map = self.map.upgrade();

        let (neighbors, children, parent_id, loop_edges) = {
            let conn = self.connections.lock();
            (
                conn.weights.keys().copied().collect::<Vec<_>>(),
                conn.children.iter().copied().collect::<Vec<_>>(),
                conn.parent,
                conn.loop_edges.iter().copied().collect::<Vec<_>>(),
            )
        };

        // Landmarks stop listing this keyframe as an observer. The slot
        // table itself is kept as a last-valid cache.
        let slots: Vec<MapPointId> = self.observations.lock().iter().flatten().copied().collect();
        if let Some(map) = &map {
            for mp_id in slots {
                if let Some(mp) = map.get_map_point(mp_id) {
                    mp.erase_observation(self.id);
                }
            }

            for kf_id in &neighbors {
                if let Some(other) = map.get_keyframe(*kf_id) {
                    other.erase_connection(self.id);
                }
            }
            for kf_id in &loop_edges {
                if let Some(other) = map.get_keyframe(*kf_id) {
                    other.erase_loop_edge(self.id);
                }
            }
        }

        if let (Some(map), Some(parent_id)) = (&map, parent_id) {
            // Reparent children into the surviving subtree: repeatedly pick
            // the (child, candidate) pair with the highest covisibility
            // weight, where candidates start as this keyframe's parent and
            // grow with every reparented child.
            let mut candidates: HashSet<KeyFrameId> = HashSet::new();
            candidates.insert(parent_id);
            let mut remaining: HashSet<KeyFrameId> = children.iter().copied().collect();
            remaining.retain(|&child_id| {
                map.get_keyframe(child_id).is_some_and(|child| !child.is_bad())
            });

            loop {
                let mut best: Option<(usize, KeyFrameId, KeyFrameId)> = None;
                for &child_id in &remaining {
                    let Some(child) = map.get_keyframe(child_id) else {
                        continue;
                    };
                    // First candidate hit in the sorted list is this
                    // child's best ancestor-connected neighbor.
                    for (neighbor_id, weight) in child.covisibles_with_weights() {
                        if !candidates.contains(&neighbor_id) {
                            continue;
                        }
                        // Ties go to the smaller child id, like everywhere
                        // else in the graph.
                        let beats = match best {
                            None => true,
                            Some((bw, bc, _)) => {
                                weight > bw || (weight == bw && child_id < bc)
                            }
                        };
                        if beats {
                            best = Some((weight, child_id, neighbor_id));
                        }
                        break;
                    }
                }

                let Some((_, child_id, new_parent_id)) = best else {
                    break;
                };
                if let (Some(child), Some(new_parent)) =
                    (map.get_keyframe(child_id), map.get_keyframe(new_parent_id))
                {
                    child.change_parent(&new_parent);
                }
                candidates.insert(child_id);
                remaining.remove(&child_id);
            }

            // Skip-level fallback: children with no edge into the
            // surviving subtree hang off this keyframe's own parent.
            if let Some(parent) = map.get_keyframe(parent_id) {
                for child_id in remaining {
                    if let Some(child) = map.get_keyframe(child_id) {
                        child.change_parent(&parent);
                    }
                }
                parent.erase_child(self.id);
            }
        }

        {
            let mut conn = self.connections.lock();
            conn.weights.clear();
            conn.ordered.clear();
            conn.dirty = false;
            conn.children.clear();
            conn.loop_edges.clear();
            conn.parent = None;
        }

        debug!(kf = %self.id, "keyframe erased from graph");

        if let Some(db) = self.db.upgrade() {
            db.erase(self.id);
        }
        if let Some(map) = map {
            map.unregister(self.id);
        }
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let conn = self.connections.lock();
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("frame_id", &self.frame_id)
            .field("num_features", &self.keypoints.len())
            .field("covisibles", &conn.weights.len())
            .field("parent", &conn.parent)
            .field("num_children", &conn.children.len())
            .field("state", &conn.state)
            .finish()
    }
}
