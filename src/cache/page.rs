use super::page_list::Links;
use super::mapper::{Access, MappedRegion};
use super::use_state::UseState;
use super::DirtyListHandle;
use std::fs::File;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

pub type SlotIndex = u32;

/// The part of a page that lock-free paths may touch.
#[derive(Debug)]
pub(crate) struct PageCore {
    index: SlotIndex,
    generation: AtomicU32,
    pub(crate) use_state: UseState,
    data: AtomicPtr<u8>,
    size: AtomicUsize,
    writable: AtomicBool,
}

impl PageCore {
    fn new(index: SlotIndex) -> Self {
        Self {
            index,
            generation: AtomicU32::new(0),
            use_state: UseState::new(),
            data: AtomicPtr::new(ptr::null_mut()),
            size: AtomicUsize::new(0),
            writable: AtomicBool::new(false),
        }
    }

    pub(crate) fn index(&self) -> SlotIndex {
        self.index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn data(&self) -> *mut u8 {
        self.data.load(Ordering::Acquire)
    }

    pub(crate) fn set_data(&self, data: *mut u8) {
        self.data.store(data, Ordering::Release);
    }

    pub(crate) fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }
}

/// Opaque token for a page registered with a
/// [`MappingManager`](super::MappingManager).
///
/// Only the cache that issued the handle accepts it, and a handle stops being
/// valid once its page is removed.
#[derive(Debug, Clone)]
pub struct PageHandle {
    pub(crate) cache: usize,
    pub(crate) generation: u32,
    pub(crate) core: Arc<PageCore>,
}

impl PageHandle {
    /// Returns the shared page state after checking the handle is still live.
    pub(crate) fn core(&self) -> &PageCore {
        assert_eq!(
            self.core.generation(),
            self.generation,
            "stale page handle for slot {}",
            self.core.index()
        );
        &self.core
    }
}

impl PartialEq for PageHandle {
    fn eq(&self, other: &Self) -> bool {
        self.cache == other.cache
            && self.generation == other.generation
            && Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for PageHandle {}

/// Which clean list a page currently sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    /// Not on any clean list: never mapped, or evicted.
    Detached,
    Used,
    Unused(usize),
}

/// Identity and mapping of a live page. Only touched under the cache lock.
#[derive(Debug)]
pub(crate) struct PageEntry {
    pub file: Arc<File>,
    pub offset: u64,
    pub size: usize,
    pub access: Access,
    pub priority: usize,
    pub dirty_list: Option<DirtyListHandle>,
    pub region: Option<MappedRegion>,
    pub location: Location,
}

impl PageEntry {
    pub fn is_mapped(&self) -> bool {
        self.region.is_some()
    }

    pub fn describe_file(&self) -> String {
        format!("{:?}", self.file)
    }
}

/// A pooled page slot. The core is allocated once and reused by every page
/// that later occupies the slot.
#[derive(Debug)]
pub(crate) struct PageSlot {
    pub core: Arc<PageCore>,
    pub entry: Option<PageEntry>,
    pub clean: Links,
    pub dirty: Links,
}

impl PageSlot {
    pub fn vacant(index: SlotIndex) -> Self {
        Self {
            core: Arc::new(PageCore::new(index)),
            entry: None,
            clean: Links::default(),
            dirty: Links::default(),
        }
    }

    /// Installs a new page into a vacant slot.
    pub fn occupy(&mut self, entry: PageEntry) {
        debug_assert!(self.entry.is_none(), "slot already occupied");
        debug_assert!(!self.clean.is_linked() && !self.dirty.is_linked());
        self.core.use_state.reset();
        self.core.set_data(ptr::null_mut());
        self.core.size.store(entry.size, Ordering::Relaxed);
        self.core
            .writable
            .store(entry.access.is_writable(), Ordering::Relaxed);
        self.entry = Some(entry);
    }

    /// Empties the slot and invalidates every outstanding handle to it.
    pub fn vacate(&mut self) -> Option<PageEntry> {
        self.core.generation.fetch_add(1, Ordering::AcqRel);
        self.core.use_state.reset();
        self.core.set_data(ptr::null_mut());
        self.entry.take()
    }

    pub fn entry(&self) -> &PageEntry {
        match &self.entry {
            Some(entry) => entry,
            None => panic!("page slot {} is vacant", self.core.index()),
        }
    }

    pub fn entry_mut(&mut self) -> &mut PageEntry {
        let index = self.core.index();
        match &mut self.entry {
            Some(entry) => entry,
            None => panic!("page slot {} is vacant", index),
        }
    }
}
