//! Journal header error types.

use std::io;
use thiserror::Error;

/// Errors that can occur while laying out, persisting or recovering a
/// journal header.
#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: requires {required} bytes but only {actual} available")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("Header size {header_size} cannot hold the {required} bytes of header and user data")]
    HeaderTooSmall { header_size: u32, required: usize },

    #[error("Invalid journal parameters: {0}")]
    InvalidParameters(String),

    #[error("Bad magic number: {found:#010x}")]
    BadMagic { found: u32 },

    #[error("Unsupported format version: {found}")]
    UnsupportedVersion { found: u32 },

    #[error("No committed header state could be recovered")]
    NoCommittedState,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for journal header operations.
pub type HeaderResult<T> = Result<T, HeaderError>;
