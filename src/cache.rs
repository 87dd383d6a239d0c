//! Transactional memory-mapped page cache.
//!
//! This module maps fixed-size regions of files into memory on demand and
//! recycles the mappings under a global byte budget. Key components:
//!
//! - **MappingManager**: owns the used list, the priority-tiered unused lists
//!   and the budget, and drives the map/evict/use/release state machine
//! - **PageHandle**: generation-checked token naming a registered page
//! - **Dirty lists**: caller-owned batches of modified pages, flushed or
//!   discarded in bulk
//! - **FileMapper**: the map/unmap/sync primitive, `mmap(2)` by default
//!
//! Taking another reference on a page that is already in use, and dropping
//! any reference but the last, are lock-free. Everything that changes list
//! membership goes through a single cache mutex.

pub mod error;
pub mod guard;
pub mod manager;
pub mod mapper;
pub mod page;
mod page_list;
mod use_state;

pub use error::{CacheError, CacheResult};
pub use guard::{PageReadGuard, PageWriteGuard};
pub use manager::{DirtyListHandle, MappingManager};
pub use mapper::{Access, FileMapper, MappedRegion, MmapMapper};
pub use page::PageHandle;
