//! Packed reference count and dirty flag of a page.
//!
//! The raw value is `use_count << 1 | dirty`, so adding or subtracting
//! `USE_UNIT` changes the count without ever touching the dirty bit.

use std::sync::atomic::{AtomicU32, Ordering};

const DIRTY: u32 = 1;
const USE_UNIT: u32 = 2;

#[derive(Debug, Default)]
pub struct UseState {
    raw: AtomicU32,
}

impl UseState {
    pub fn new() -> Self {
        Self {
            raw: AtomicU32::new(0),
        }
    }

    pub fn use_count(&self) -> u32 {
        self.raw.load(Ordering::Acquire) >> 1
    }

    pub fn is_dirty(&self) -> bool {
        self.raw.load(Ordering::Acquire) & DIRTY != 0
    }

    pub fn is_in_use(&self) -> bool {
        self.raw.load(Ordering::Acquire) >= USE_UNIT
    }

    /// Lock-free increment. Succeeds only while the page is already in use
    /// and no dirty transition is needed, i.e. nothing about list membership
    /// changes.
    pub fn try_increment(&self, mark_dirty: bool) -> bool {
        let mut current = self.raw.load(Ordering::Acquire);
        loop {
            if current < USE_UNIT || (mark_dirty && current & DIRTY == 0) {
                return false;
            }
            match self.raw.compare_exchange_weak(
                current,
                current + USE_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Increments a page that is already in use. Must be called with the
    /// cache lock held, so the count cannot drop to zero underneath it.
    pub fn increment(&self) {
        let previous = self.raw.fetch_add(USE_UNIT, Ordering::AcqRel);
        debug_assert!(previous >= USE_UNIT, "increment on an unused page");
    }

    /// Moves an unused page to a use count of one, keeping any existing
    /// dirty bit. Must be called with the cache lock held.
    pub fn activate(&self) {
        let previous = self.raw.fetch_add(USE_UNIT, Ordering::AcqRel);
        debug_assert!(previous < USE_UNIT, "activate on a page already in use");
    }

    /// Lock-free decrement. Succeeds only if the count stays at one or more.
    pub fn try_decrement(&self) -> bool {
        let mut current = self.raw.load(Ordering::Acquire);
        loop {
            if current < 2 * USE_UNIT {
                return false;
            }
            match self.raw.compare_exchange_weak(
                current,
                current - USE_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrements the use count; returns `true` when it reached zero. Must be
    /// called with the cache lock held.
    pub fn decrement_and_check_zero(&self) -> bool {
        let mut current = self.raw.load(Ordering::Acquire);
        loop {
            assert!(current >= USE_UNIT, "release of a page that is not in use");
            match self.raw.compare_exchange_weak(
                current,
                current - USE_UNIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - USE_UNIT < USE_UNIT,
                Err(actual) => current = actual,
            }
        }
    }

    /// Sets the dirty bit; returns `true` if it was previously clear.
    pub fn try_set_dirty(&self) -> bool {
        self.raw.fetch_or(DIRTY, Ordering::AcqRel) & DIRTY == 0
    }

    /// Clears the dirty bit; returns `true` if it was previously set.
    pub fn clear_dirty(&self) -> bool {
        self.raw.fetch_and(!DIRTY, Ordering::AcqRel) & DIRTY != 0
    }

    /// Forces the state back to unused and clean.
    pub fn reset(&self) {
        self.raw.store(0, Ordering::Release);
    }
}
