use super::manager::MappingManager;
use super::page::PageHandle;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Holds one reference on a page and exposes its mapped bytes.
pub struct PageReadGuard<'a> {
    cache: &'a MappingManager,
    handle: PageHandle,
    data: NonNull<u8>,
    len: usize,
}

impl<'a> PageReadGuard<'a> {
    pub(crate) fn new(cache: &'a MappingManager, handle: PageHandle, data: NonNull<u8>) -> Self {
        let len = cache.page_size(&handle);
        Self {
            cache,
            handle,
            data,
            len,
        }
    }

    pub fn handle(&self) -> &PageHandle {
        &self.handle
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.cache.release_page(&self.handle);
    }
}

/// Holds one reference on a dirty page and exposes its mapped bytes mutably.
pub struct PageWriteGuard<'a> {
    cache: &'a MappingManager,
    handle: PageHandle,
    data: NonNull<u8>,
    len: usize,
}

impl<'a> PageWriteGuard<'a> {
    pub(crate) fn new(cache: &'a MappingManager, handle: PageHandle, data: NonNull<u8>) -> Self {
        let len = cache.page_size(&handle);
        Self {
            cache,
            handle,
            data,
            len,
        }
    }

    pub fn handle(&self) -> &PageHandle {
        &self.handle
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.cache.release_page(&self.handle);
    }
}

// The mapping stays put while the guard holds its reference
unsafe impl Send for PageReadGuard<'_> {}
unsafe impl Sync for PageReadGuard<'_> {}
unsafe impl Send for PageWriteGuard<'_> {}
unsafe impl Sync for PageWriteGuard<'_> {}
