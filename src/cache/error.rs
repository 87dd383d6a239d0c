//! Mapping cache error types.

use std::io;
use thiserror::Error;

/// Errors that can occur in the mapping cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to map {size} bytes at offset {offset} of {file}: {source}")]
    MappingFailed {
        file: String,
        offset: u64,
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("Failed to sync {size} bytes at offset {offset} of {file} ({flushed} pages flushed before): {source}")]
    SyncFailed {
        file: String,
        offset: u64,
        size: usize,
        flushed: usize,
        #[source]
        source: io::Error,
    },
}

/// Result type for mapping cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
