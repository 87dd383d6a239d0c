//! Intrusive FIFO lists of page slots.
//!
//! Each [`PageSlot`] carries two independent link pairs, so a page can sit on
//! a clean list (used or unused) and on a dirty list at the same time. A
//! [`PageList`] is parameterized by which pair it threads through.

use super::page::{PageSlot, SlotIndex};
use std::marker::PhantomData;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Links {
    prev: Option<SlotIndex>,
    next: Option<SlotIndex>,
    linked: bool,
}

impl Links {
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// Selects the link pair a list uses.
pub(crate) trait LinkSlot {
    fn links(slot: &PageSlot) -> &Links;
    fn links_mut(slot: &mut PageSlot) -> &mut Links;
}

/// Used and unused list membership.
#[derive(Debug)]
pub(crate) enum Clean {}

/// Dirty list membership.
#[derive(Debug)]
pub(crate) enum Dirty {}

impl LinkSlot for Clean {
    fn links(slot: &PageSlot) -> &Links {
        &slot.clean
    }

    fn links_mut(slot: &mut PageSlot) -> &mut Links {
        &mut slot.clean
    }
}

impl LinkSlot for Dirty {
    fn links(slot: &PageSlot) -> &Links {
        &slot.dirty
    }

    fn links_mut(slot: &mut PageSlot) -> &mut Links {
        &mut slot.dirty
    }
}

#[derive(Debug)]
pub(crate) struct PageList<L> {
    head: Option<SlotIndex>,
    tail: Option<SlotIndex>,
    len: usize,
    _links: PhantomData<L>,
}

impl<L: LinkSlot> PageList<L> {
    pub fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _links: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        debug_assert_eq!(self.head.is_none(), self.tail.is_none());
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn front(&self) -> Option<SlotIndex> {
        self.head
    }

    pub fn push_back(&mut self, slots: &mut [PageSlot], index: SlotIndex) {
        let links = L::links_mut(&mut slots[index as usize]);
        assert!(!links.linked, "slot {} is already linked", index);
        *links = Links {
            prev: self.tail,
            next: None,
            linked: true,
        };

        match self.tail {
            Some(tail) => L::links_mut(&mut slots[tail as usize]).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    pub fn pop_front(&mut self, slots: &mut [PageSlot]) -> Option<SlotIndex> {
        let head = self.head?;
        self.remove(slots, head);
        Some(head)
    }

    pub fn remove(&mut self, slots: &mut [PageSlot], index: SlotIndex) {
        let links = *L::links(&slots[index as usize]);
        assert!(links.linked, "slot {} is not linked", index);

        match links.prev {
            Some(prev) => L::links_mut(&mut slots[prev as usize]).next = links.next,
            None => {
                debug_assert_eq!(self.head, Some(index));
                self.head = links.next;
            }
        }
        match links.next {
            Some(next) => L::links_mut(&mut slots[next as usize]).prev = links.prev,
            None => {
                debug_assert_eq!(self.tail, Some(index));
                self.tail = links.prev;
            }
        }

        *L::links_mut(&mut slots[index as usize]) = Links::default();
        self.len -= 1;
    }

    /// Walks the list from head to tail.
    #[cfg(test)]
    pub fn iter<'a>(&self, slots: &'a [PageSlot]) -> impl Iterator<Item = SlotIndex> + 'a
    where
        L: 'a,
    {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = L::links(&slots[current as usize]).next;
            Some(current)
        })
    }
}

impl<L: LinkSlot> Default for PageList<L> {
    fn default() -> Self {
        Self::new()
    }
}
