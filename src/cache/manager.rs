use super::error::{CacheError, CacheResult};
use super::guard::{PageReadGuard, PageWriteGuard};
use super::mapper::{Access, FileMapper, MmapMapper};
use super::page::{Location, PageCore, PageEntry, PageHandle, PageSlot, SlotIndex};
use super::page_list::{Clean, Dirty, PageList};
use crate::config::CacheConfig;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::fs::File;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_CACHE_ID: AtomicUsize = AtomicUsize::new(1);

/// Opaque token for a dirty list created by a [`MappingManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirtyListHandle {
    cache: usize,
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct DirtyListSlot {
    generation: u32,
    list: Option<PageList<Dirty>>,
}

#[derive(Debug)]
struct CacheInner {
    slots: Vec<PageSlot>,
    free_slots: Vec<SlotIndex>,
    used: PageList<Clean>,
    unused: Vec<PageList<Clean>>,
    dirty_lists: Vec<DirtyListSlot>,
    free_dirty_lists: Vec<u32>,
    total_mapped: usize,
    mapping_limit: usize,
    map_count: u64,
}

/// Maps fixed-size file regions on demand and recycles the mappings under a
/// global byte budget.
///
/// Pages in use sit on the used list and are never evicted. Released pages
/// stay mapped on the unused list of their priority tier until a later
/// `use_page` needs the room; tier 0 is drained first, and each tier is
/// drained oldest first.
pub struct MappingManager {
    id: usize,
    num_priorities: usize,
    mapper: Box<dyn FileMapper>,
    inner: Mutex<CacheInner>,
}

impl MappingManager {
    pub fn new(mapping_limit: usize, num_priorities: usize) -> Self {
        Self::with_mapper(mapping_limit, num_priorities, Box::new(MmapMapper))
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.mapping_limit, config.num_priorities)
    }

    pub fn with_mapper(
        mapping_limit: usize,
        num_priorities: usize,
        mapper: Box<dyn FileMapper>,
    ) -> Self {
        assert!(num_priorities > 0, "at least one priority tier is required");
        Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            num_priorities,
            mapper,
            inner: Mutex::new(CacheInner {
                slots: Vec::new(),
                free_slots: Vec::new(),
                used: PageList::new(),
                unused: (0..num_priorities).map(|_| PageList::new()).collect(),
                dirty_lists: Vec::new(),
                free_dirty_lists: Vec::new(),
                total_mapped: 0,
                mapping_limit,
                map_count: 0,
            }),
        }
    }

    pub fn num_priorities(&self) -> usize {
        self.num_priorities
    }

    pub fn mapping_limit(&self) -> usize {
        self.inner.lock().mapping_limit
    }

    /// Changes the budget. Takes effect on the next mapping; nothing is
    /// evicted eagerly.
    pub fn set_mapping_limit(&self, bytes: usize) {
        self.inner.lock().mapping_limit = bytes;
    }

    pub fn total_mapped(&self) -> usize {
        self.inner.lock().total_mapped
    }

    /// Registers an unmapped page for `size` bytes of `file` at `offset`.
    pub fn add_page(
        &self,
        file: &Arc<File>,
        offset: u64,
        size: usize,
        access: Access,
        priority: usize,
        dirty_list: Option<DirtyListHandle>,
    ) -> PageHandle {
        assert!(size > 0, "page size must be non-zero");
        assert!(
            priority < self.num_priorities,
            "priority {} out of range (tiers: {})",
            priority,
            self.num_priorities
        );

        let mut inner = self.inner.lock();
        if let Some(list) = dirty_list {
            self.dirty_list_index(&inner, list);
        }

        let index = match inner.free_slots.pop() {
            Some(index) => index,
            None => {
                let index = inner.slots.len() as SlotIndex;
                inner.slots.push(PageSlot::vacant(index));
                index
            }
        };

        let slot = &mut inner.slots[index as usize];
        slot.occupy(PageEntry {
            file: file.clone(),
            offset,
            size,
            access,
            priority,
            dirty_list,
            region: None,
            location: Location::Detached,
        });
        trace!("added page {} ({} bytes at offset {})", index, size, offset);

        PageHandle {
            cache: self.id,
            generation: slot.core.generation(),
            core: slot.core.clone(),
        }
    }

    /// Takes a reference on the page and returns its mapped address, mapping
    /// it first if needed. With `mark_dirty` the page joins its dirty list;
    /// the dirty bit then stays set until the list is flushed or cleared.
    pub fn use_page(&self, handle: &PageHandle, mark_dirty: bool) -> CacheResult<NonNull<u8>> {
        let core = self.core(handle);
        if core.use_state.try_increment(mark_dirty) {
            // The slot may have been recycled between the check and the CAS
            debug_assert_eq!(
                core.generation(),
                handle.generation,
                "stale page handle for slot {}",
                core.index()
            );
            return Ok(mapped_data(core));
        }
        self.use_page_locked(handle, mark_dirty)
    }

    fn use_page_locked(&self, handle: &PageHandle, mark_dirty: bool) -> CacheResult<NonNull<u8>> {
        let mut inner = self.inner.lock();
        let index = self.slot_index(&inner, handle);
        let core = handle.core();

        if core.use_state.is_in_use() {
            // Already on the used list; only the count changes
            core.use_state.increment();
        } else {
            // Take it off its unused list, or map it if it has no mapping
            let inner = &mut *inner;
            let location = inner.slots[index as usize].entry().location;
            match location {
                Location::Unused(priority) => {
                    inner.unused[priority].remove(&mut inner.slots, index);
                }
                Location::Detached => self.map_slot(inner, index)?,
                Location::Used => unreachable!("unused page {} on the used list", index),
            }
            inner.used.push_back(&mut inner.slots, index);
            inner.slots[index as usize].entry_mut().location = Location::Used;
            core.use_state.activate();
        }

        // Only the clean-to-dirty transition joins the dirty list
        if mark_dirty && core.use_state.try_set_dirty() {
            let dirty_list = inner.slots[index as usize].entry().dirty_list;
            if let Some(list) = dirty_list {
                let list_index = self.dirty_list_index(&inner, list);
                let inner = &mut *inner;
                if let Some(dirty) = inner.dirty_lists[list_index].list.as_mut() {
                    dirty.push_back(&mut inner.slots, index);
                }
            }
        }

        Ok(mapped_data(core))
    }

    /// Drops a reference taken by [`use_page`](Self::use_page). The last
    /// release moves the page to its tier's unused list; it stays mapped.
    pub fn release_page(&self, handle: &PageHandle) {
        let core = self.core(handle);
        if core.use_state.try_decrement() {
            return;
        }

        let mut inner = self.inner.lock();
        let index = self.slot_index(&inner, handle);
        if core.use_state.decrement_and_check_zero() {
            let inner = &mut *inner;
            let priority = inner.slots[index as usize].entry().priority;
            inner.used.remove(&mut inner.slots, index);
            inner.unused[priority].push_back(&mut inner.slots, index);
            inner.slots[index as usize].entry_mut().location = Location::Unused(priority);
        }
    }

    /// Returns the mapped address of a page that is in use.
    pub fn page_data(&self, handle: &PageHandle) -> NonNull<u8> {
        let core = self.core(handle);
        assert!(core.use_state.is_in_use(), "page data requested for an unused page");
        mapped_data(core)
    }

    pub fn page_use_count(&self, handle: &PageHandle) -> u32 {
        self.core(handle).use_state.use_count()
    }

    pub fn is_page_dirty(&self, handle: &PageHandle) -> bool {
        self.core(handle).use_state.is_dirty()
    }

    pub fn page_size(&self, handle: &PageHandle) -> usize {
        self.core(handle).size()
    }

    /// Uses the page and wraps it in a guard that releases it on drop.
    pub fn read_page(&self, handle: &PageHandle) -> CacheResult<PageReadGuard<'_>> {
        let data = self.use_page(handle, false)?;
        Ok(PageReadGuard::new(self, handle.clone(), data))
    }

    /// Uses the page dirty and wraps it in a guard that releases it on drop.
    ///
    /// Concurrent writers to the same page must be serialized by the caller.
    pub fn write_page(&self, handle: &PageHandle) -> CacheResult<PageWriteGuard<'_>> {
        assert!(
            self.core(handle).is_writable(),
            "write access requested for a read-only page"
        );
        let data = self.use_page(handle, true)?;
        Ok(PageWriteGuard::new(self, handle.clone(), data))
    }

    /// Unregisters a page, unmapping it first if needed. The handle and all
    /// its clones become invalid.
    ///
    /// # Panics
    ///
    /// Panics if the page is still in use.
    pub fn remove_page(&self, handle: PageHandle) {
        let mut inner = self.inner.lock();
        let index = self.slot_index(&inner, &handle);
        let inner = &mut *inner;

        let core = handle.core();
        assert!(
            !core.use_state.is_in_use(),
            "removing page {} while it has {} users",
            index,
            core.use_state.use_count()
        );

        let location = inner.slots[index as usize].entry().location;
        match location {
            Location::Used => inner.used.remove(&mut inner.slots, index),
            Location::Unused(priority) => inner.unused[priority].remove(&mut inner.slots, index),
            Location::Detached => {}
        }
        if inner.slots[index as usize].entry().is_mapped() {
            self.unmap_slot(inner, index);
        }
        self.unlink_dirty(inner, index);

        inner.slots[index as usize].vacate();
        inner.free_slots.push(index);
        trace!("removed page {}", index);
    }

    pub fn create_dirty_list(&self) -> DirtyListHandle {
        let mut inner = self.inner.lock();
        let index = match inner.free_dirty_lists.pop() {
            Some(index) => index,
            None => {
                inner.dirty_lists.push(DirtyListSlot {
                    generation: 0,
                    list: None,
                });
                (inner.dirty_lists.len() - 1) as u32
            }
        };

        let slot = &mut inner.dirty_lists[index as usize];
        slot.list = Some(PageList::new());
        DirtyListHandle {
            cache: self.id,
            index,
            generation: slot.generation,
        }
    }

    /// Deletes an empty dirty list. Pages registered with it must not be
    /// dirtied afterwards.
    pub fn delete_dirty_list(&self, handle: DirtyListHandle) {
        let mut inner = self.inner.lock();
        let index = self.dirty_list_index(&inner, handle);
        let slot = &mut inner.dirty_lists[index];
        assert!(
            slot.list.as_ref().map_or(true, |list| list.is_empty()),
            "deleting a dirty list that still holds pages"
        );
        slot.list = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free_dirty_lists.push(index as u32);
    }

    pub fn dirty_list_len(&self, handle: DirtyListHandle) -> usize {
        let inner = self.inner.lock();
        let index = self.dirty_list_index(&inner, handle);
        inner.dirty_lists[index].list.as_ref().map_or(0, |list| list.len())
    }

    /// Drains the list and clears each page's dirty bit without writing it
    /// back. Returns the number of pages drained.
    pub fn clear_dirty_list(&self, handle: DirtyListHandle) -> usize {
        let mut inner = self.inner.lock();
        let index = self.dirty_list_index(&inner, handle);
        let CacheInner {
            slots, dirty_lists, ..
        } = &mut *inner;
        let Some(list) = dirty_lists[index].list.as_mut() else {
            return 0;
        };

        let mut count = 0;
        while let Some(page) = list.pop_front(slots) {
            slots[page as usize].core.use_state.clear_dirty();
            count += 1;
        }
        debug!("cleared {} dirty pages", count);
        count
    }

    /// Writes every page on the list back to its file and clears its dirty
    /// bit. Returns the number of pages flushed.
    ///
    /// A page is taken off the list only after its sync succeeds, so on error
    /// the failing page and everything behind it stay dirty for a retry.
    pub fn flush_dirty_list(&self, handle: DirtyListHandle, synchronous: bool) -> CacheResult<usize> {
        let mut inner = self.inner.lock();
        let index = self.dirty_list_index(&inner, handle);
        let CacheInner {
            slots, dirty_lists, ..
        } = &mut *inner;
        let Some(list) = dirty_lists[index].list.as_mut() else {
            return Ok(0);
        };

        let mut count = 0;
        while let Some(page) = list.front() {
            let entry = slots[page as usize].entry();
            let region = match entry.region.as_ref() {
                Some(region) => region,
                None => unreachable!("dirty page {} is not mapped", page),
            };
            if let Err(source) = self.mapper.sync(region, synchronous) {
                warn!("sync of page {} failed after {} pages", page, count);
                return Err(CacheError::SyncFailed {
                    file: entry.describe_file(),
                    offset: entry.offset,
                    size: entry.size,
                    flushed: count,
                    source,
                });
            }
            list.pop_front(slots);
            slots[page as usize].core.use_state.clear_dirty();
            count += 1;
        }
        debug!("flushed {} dirty pages (synchronous: {})", count, synchronous);
        Ok(count)
    }

    /// Returns the number of real mappings made since the last call, and
    /// resets it.
    pub fn map_count_reset(&self) -> u64 {
        std::mem::take(&mut self.inner.lock().map_count)
    }

    fn map_slot(&self, inner: &mut CacheInner, index: SlotIndex) -> CacheResult<()> {
        let size = inner.slots[index as usize].entry().size;

        // Make room first; pages in use are never candidates
        while inner.total_mapped + size >= inner.mapping_limit {
            if !self.evict_one(inner) {
                debug!(
                    "mapping limit {} exceeded with nothing left to evict ({} mapped)",
                    inner.mapping_limit, inner.total_mapped
                );
                break;
            }
        }

        let entry = inner.slots[index as usize].entry_mut();
        let region = self
            .mapper
            .map(&entry.file, entry.offset, entry.size, entry.access)
            .map_err(|source| CacheError::MappingFailed {
                file: entry.describe_file(),
                offset: entry.offset,
                size: entry.size,
                source,
            })?;

        // Publish the address for the lock-free paths
        let data = region.as_mut_ptr();
        entry.region = Some(region);
        inner.slots[index as usize].core.set_data(data);
        inner.total_mapped += size;
        inner.map_count += 1;
        trace!("mapped page {} ({} bytes, {} total)", index, size, inner.total_mapped);
        Ok(())
    }

    /// Unmaps the oldest page of the lowest non-empty unused tier.
    fn evict_one(&self, inner: &mut CacheInner) -> bool {
        let CacheInner { unused, slots, .. } = &mut *inner;
        let victim = unused.iter_mut().find_map(|list| list.pop_front(slots));
        let Some(index) = victim else {
            return false;
        };

        inner.slots[index as usize].entry_mut().location = Location::Detached;
        self.unmap_slot(inner, index);
        self.unlink_dirty(inner, index);
        trace!("evicted page {}", index);
        true
    }

    fn unmap_slot(&self, inner: &mut CacheInner, index: SlotIndex) {
        let slot = &mut inner.slots[index as usize];
        slot.core.set_data(std::ptr::null_mut());
        let entry = slot.entry_mut();
        let Some(region) = entry.region.take() else {
            return;
        };
        let size = entry.size;
        if let Err(e) = self.mapper.unmap(region) {
            warn!("unmap of page {} failed: {}", index, e);
        }
        inner.total_mapped -= size;
    }

    /// Clears the dirty bit and takes the page off its dirty list.
    fn unlink_dirty(&self, inner: &mut CacheInner, index: SlotIndex) {
        let slot = &inner.slots[index as usize];
        slot.core.use_state.clear_dirty();
        if !slot.dirty.is_linked() {
            return;
        }
        let dirty_list = slot.entry().dirty_list;
        if let Some(list) = dirty_list {
            let list_index = self.dirty_list_index(inner, list);
            if let Some(dirty) = inner.dirty_lists[list_index].list.as_mut() {
                dirty.remove(&mut inner.slots, index);
            }
        }
    }

    fn core<'a>(&self, handle: &'a PageHandle) -> &'a PageCore {
        assert_eq!(handle.cache, self.id, "page handle from another cache");
        handle.core()
    }

    fn slot_index(&self, inner: &CacheInner, handle: &PageHandle) -> SlotIndex {
        let core = self.core(handle);
        let index = core.index();
        let slot = &inner.slots[index as usize];
        assert!(
            Arc::ptr_eq(&slot.core, &handle.core) && slot.entry.is_some(),
            "page handle does not name a live page"
        );
        index
    }

    fn dirty_list_index(&self, inner: &CacheInner, handle: DirtyListHandle) -> usize {
        assert_eq!(handle.cache, self.id, "dirty list handle from another cache");
        let index = handle.index as usize;
        let slot = inner
            .dirty_lists
            .get(index)
            .filter(|slot| slot.generation == handle.generation && slot.list.is_some());
        assert!(slot.is_some(), "stale dirty list handle {}", handle.index);
        index
    }
}

impl Drop for MappingManager {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let inner = self.inner.get_mut();
        assert!(inner.used.is_empty(), "mapping cache dropped with pages in use");
        assert!(
            inner.unused.iter().all(|list| list.is_empty()),
            "mapping cache dropped with mapped pages still registered"
        );
    }
}

fn mapped_data(core: &PageCore) -> NonNull<u8> {
    match NonNull::new(core.data()) {
        Some(data) => data,
        None => panic!("page {} is in use but not mapped", core.index()),
    }
}
