//! Engine configuration for simile.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Page size in bytes. Pages are the unit of I/O and of locking.
pub const PAGE_SIZE: usize = 8192;

/// On-disk width of a plain string field, including padding.
pub const STRING_LEN: usize = 32;

/// On-disk width of the text portion of an embedded-text field.
pub const TEXT_CHAR_LEN: usize = 120;

/// Runtime configuration for the engine.
///
/// Constructed once at startup and threaded through the buffer pool, the
/// heap layer, and the index builder. Tests that vary a knob hold their own
/// instance instead of mutating global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Dimension of text embeddings. Must match the embedding service.
    pub embedding_dim: usize,
    /// Time a blocked lock acquisition sleeps before re-checking.
    pub block_time: Duration,
    /// Number of failed acquisition attempts between deadlock checks.
    pub cycle_check_interval: u32,
    /// Allow writers to reserve exclusive locks before readers drain.
    pub allow_reservations: bool,
    /// Abort the calling transaction when it observes a deadlock.
    pub abort_on_deadlock: bool,
    /// Evict pages in FIFO order instead of fewest-open-slots-first.
    pub use_evict_queue: bool,
    /// Baseline number of centroids probed by an NN scan.
    pub default_probe: usize,
    /// Iteration budget for k-means index construction.
    pub max_kmeans_iterations: usize,
    /// Convergence threshold accepted by the k-means interface.
    /// Currently unused by the algorithm; termination is iteration-count only.
    pub kmeans_delta_threshold: f64,
    /// Maximum buffered left-hand rows per block in the equality join.
    pub join_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            block_time: Duration::from_millis(2),
            cycle_check_interval: 2,
            allow_reservations: true,
            abort_on_deadlock: true,
            use_evict_queue: false,
            default_probe: 3,
            max_kmeans_iterations: 10,
            kmeans_delta_threshold: 1.0,
            join_buffer_size: 100,
        }
    }
}

impl EngineConfig {
    /// Configuration for tests: tiny embeddings, default behavior otherwise.
    pub fn for_tests() -> Self {
        Self {
            embedding_dim: 4,
            ..Default::default()
        }
    }
}
