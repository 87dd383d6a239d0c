//! Configuration for the mapping cache.

use serde::{Deserialize, Serialize};

/// Default mapping budget (100MB).
pub const DEFAULT_MAPPING_LIMIT: usize = 100 * 1024 * 1024;

/// Default number of eviction priority tiers.
pub const DEFAULT_NUM_PRIORITIES: usize = 2;

/// Mapping cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Bytes that may be mapped before unused pages are evicted.
    pub mapping_limit: usize,
    /// Number of priority tiers; tier 0 is evicted first.
    pub num_priorities: usize,
}

impl CacheConfig {
    /// Budget given in megabytes, as the command line takes it.
    pub fn with_limit_mb(mut self, megabytes: usize) -> Self {
        self.mapping_limit = megabytes << 20;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            mapping_limit: DEFAULT_MAPPING_LIMIT,
            num_priorities: DEFAULT_NUM_PRIORITIES,
        }
    }
}
