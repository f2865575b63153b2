/// Typed view over the slots and roots of a mapped segment.
///
/// An `Arena` is only ever built while the segment lock is held (or, at
/// creation time, before any other process can see the object), and its
/// lifetime is tied to that guard. All accessors re-derive references
/// from the base pointer, so callers copy fields out instead of holding
/// two `&mut` into the region at once.
use std::marker::PhantomData;

use super::layout::{self, Geometry, Header, Roots, Slot, HEADER_OFFSET, ROOTS_OFFSET};

pub struct Arena<'g> {
    base: *mut u8,
    capacity: u32,
    _guard: PhantomData<&'g mut ()>,
}

impl<'g> Arena<'g> {
    /// # Safety
    /// `base` must point to a region of at least `layout::region_size(capacity)`
    /// bytes, and the caller must have exclusive access to its roots and
    /// slots for `'g`.
    pub unsafe fn from_raw(base: *mut u8, capacity: u32) -> Self {
        Arena {
            base,
            capacity,
            _guard: PhantomData,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn roots(&mut self) -> &mut Roots {
        unsafe { &mut *(self.base.add(ROOTS_OFFSET) as *mut Roots) }
    }

    #[inline]
    pub fn slot(&mut self, index: u32) -> &mut Slot {
        debug_assert!(index < self.capacity, "slot {index} out of range");
        unsafe { &mut *(self.base.add(layout::slot_offset(index)) as *mut Slot) }
    }

    /// Lay out an empty table: geometry stamped, every slot on the free
    /// list, trie empty.
    ///
    /// Only valid on a segment no other process can see yet.
    pub fn format(&mut self) {
        let header = unsafe { &mut *(self.base.add(HEADER_OFFSET) as *mut Header) };
        header.geometry = Geometry::for_capacity(self.capacity);
        super::trie::init(self);
        super::recency::init(self);
    }
}
