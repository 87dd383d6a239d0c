//! Crash-recoverable journal header.
//!
//! The header describes the logical state of a journal file: how many pages
//! it has and where its record and fill-page lists start and end. Key
//! components:
//!
//! - **Envelope**: immutable geometry written once at creation
//! - **HeaderState**: one version of the logical state; the header keeps two
//! - **JournalHeader**: commits, rolls back and recovers the double buffer
//!
//! A header is usually persisted inside a page mapped by the
//! [`MappingManager`](crate::cache::MappingManager) and flushed through a
//! dirty list on commit.

pub mod error;
pub mod header;
pub mod layout;
pub mod params;

pub use error::{HeaderError, HeaderResult};
pub use header::{JournalHeader, RecoveryStatus};
pub use layout::{Envelope, HeaderState, ListDescriptor, INVALID_HANDLE};
pub use params::JournalParameters;
