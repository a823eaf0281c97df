//! Replacement policies for the cache store

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Rule used to pick eviction victims when the cache is over budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementPolicy {
    /// Evict the least recently accessed entries first
    #[default]
    Lru,
    /// Evict the least frequently accessed entries first
    Lfu,
    /// Evict in insertion order
    Fifo,
    /// Evict by ascending `access_count / max(1, seconds_since_last_access)`;
    /// keeps entries that are both frequently and recently used
    Adaptive,
}

impl ReplacementPolicy {
    /// Eviction score for an entry; lower scores are evicted first.
    ///
    /// FIFO is handled by insertion order and never consults this score.
    pub(crate) fn score(&self, last_accessed: Instant, access_count: u64, now: Instant) -> f64 {
        match self {
            ReplacementPolicy::Lru => {
                // Older access time -> larger elapsed -> smaller score
                -(now.duration_since(last_accessed).as_secs_f64())
            }
            ReplacementPolicy::Lfu => access_count as f64,
            ReplacementPolicy::Adaptive => {
                let idle_secs = now.duration_since(last_accessed).as_secs().max(1);
                access_count as f64 / idle_secs as f64
            }
            ReplacementPolicy::Fifo => 0.0,
        }
    }
}

impl std::fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplacementPolicy::Lru => "lru",
            ReplacementPolicy::Lfu => "lfu",
            ReplacementPolicy::Fifo => "fifo",
            ReplacementPolicy::Adaptive => "adaptive",
        };
        write!(f, "{}", name)
    }
}
