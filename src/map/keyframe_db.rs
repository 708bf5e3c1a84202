//! KeyFrameDatabase - place-recognition index over keyframes.
//!
//! Keyframes register their bag-of-words vector here at construction and
//! remove it when erased. Loop closing and relocalization query the
//! database for similar keyframes; the scoring is a plain dot product
//! between sparse histograms, which is enough for the graph core and can
//! be upgraded without touching the keyframe lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::KeyFrameId;

/// Bag-of-words vector: word id → weight. Opaque to this crate; produced
/// by an external vocabulary.
pub type BowVector = HashMap<u32, f64>;

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
}

/// Database of keyframe retrieval descriptors.
pub struct KeyFrameDatabase {
    entries: RwLock<HashMap<KeyFrameId, BowVector>>,
}

impl KeyFrameDatabase {
    /// Create an empty database.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Add or update a keyframe entry. Called at keyframe construction.
    pub fn add(&self, kf_id: KeyFrameId, bow: BowVector) {
        self.entries.write().insert(kf_id, bow);
    }

    /// Remove a keyframe entry. Called when the keyframe is erased.
    pub fn erase(&self, kf_id: KeyFrameId) {
        self.entries.write().remove(&kf_id);
    }

    /// Number of indexed keyframes.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the database is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Keyframes similar to `query`, best first, excluding the given set
    /// (typically the query keyframe and its covisible neighborhood).
    pub fn detect_candidates(
        &self,
        query: &BowVector,
        exclude: &HashSet<KeyFrameId>,
        max_results: usize,
    ) -> Vec<Candidate> {
        let entries = self.entries.read();

        let mut candidates = Vec::new();
        for (&kf_id, bow) in entries.iter() {
            if exclude.contains(&kf_id) {
                continue;
            }

            let mut score = 0.0;
            for (word_id, weight) in query {
                if let Some(other) = bow.get(word_id) {
                    score += weight * other;
                }
            }
            if score > 0.0 {
                candidates.push(Candidate {
                    keyframe_id: kf_id,
                    score,
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.keyframe_id.cmp(&b.keyframe_id))
        });
        candidates.truncate(max_results);
        candidates
    }
}
