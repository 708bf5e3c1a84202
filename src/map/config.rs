//! Tunables for covisibility-graph maintenance and keyframe culling.

use serde::{Deserialize, Serialize};

/// Configuration for the covisibility graph and redundancy culling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Minimum number of shared MapPoint observations for a covisibility
    /// edge. Neighbors below this are dropped during `update_connections`,
    /// except the single best neighbor which is always kept as a fallback.
    pub min_shared_observations: usize,

    /// A keyframe is redundant when at least this fraction of its tracked
    /// MapPoints is observed by `redundancy_min_observers` other keyframes.
    pub redundancy_ratio: f64,

    /// Number of other keyframes that must observe a MapPoint for it to
    /// count as redundantly covered.
    pub redundancy_min_observers: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            min_shared_observations: 15,
            redundancy_ratio: 0.9,
            redundancy_min_observers: 3,
        }
    }
}
