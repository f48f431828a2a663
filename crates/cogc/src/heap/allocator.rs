//! Object allocation.
//!
//! Small objects are bump-allocated from a linear allocation buffer (LAB)
//! that is refilled from a segregated free list or a fresh normal page.
//! Large objects get a page of their own.

use std::ptr::NonNull;

use parking_lot::Mutex;

use super::header::{HeapObjectHeader, MIN_OBJECT_SIZE};
use super::page::{PageBackend, LARGE_OBJECT_SIZE_THRESHOLD};
use crate::gc_info::GcInfoIndex;

const BUCKET_COUNT: usize = usize::BITS as usize;

/// Free list segregated by the floor of the log2 of the entry size.
#[derive(Debug)]
struct FreeList {
    buckets: [Vec<(usize, usize)>; BUCKET_COUNT],
}

impl FreeList {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Vec::new()),
        }
    }

    const fn floor_log2(size: usize) -> usize {
        (usize::BITS - 1 - size.leading_zeros()) as usize
    }

    fn add(&mut self, address: usize, size: usize) {
        debug_assert!(size >= MIN_OBJECT_SIZE);
        self.buckets[Self::floor_log2(size)].push((address, size));
    }

    fn take(&mut self, size: usize) -> Option<(usize, usize)> {
        let floor = Self::floor_log2(size);
        // Entries in the floor bucket may still be large enough.
        if let Some(pos) = self.buckets[floor].iter().position(|&(_, len)| len >= size) {
            return Some(self.buckets[floor].swap_remove(pos));
        }
        self.buckets[floor + 1..]
            .iter_mut()
            .find_map(std::vec::Vec::pop)
    }

    fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    fn size(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().map(|&(_, len)| len))
            .sum()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LinearAllocationBuffer {
    start: usize,
    end: usize,
}

impl LinearAllocationBuffer {
    const fn remaining(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug)]
struct AllocatorState {
    lab: LinearAllocationBuffer,
    free_list: FreeList,
}

/// Allocates object memory from a [`PageBackend`].
#[derive(Debug)]
pub struct ObjectAllocator {
    state: Mutex<AllocatorState>,
}

impl ObjectAllocator {
    /// Creates an allocator without any buffer or free memory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                lab: LinearAllocationBuffer::default(),
                free_list: FreeList::new(),
            }),
        }
    }

    /// Allocates `size` bytes, header included, and writes an
    /// in-construction header with `index`. The payload is zeroed.
    ///
    /// `size` must be a multiple of the allocation granularity and at least
    /// [`MIN_OBJECT_SIZE`].
    pub fn allocate(
        &self,
        backend: &PageBackend,
        size: usize,
        index: GcInfoIndex,
    ) -> NonNull<HeapObjectHeader> {
        debug_assert!(size >= MIN_OBJECT_SIZE);

        let address = if size > LARGE_OBJECT_SIZE_THRESHOLD {
            // SAFETY: freshly allocated pages are valid.
            unsafe { backend.allocate_large_page(size).as_ref() }.payload_start()
        } else {
            let mut state = self.state.lock();
            if state.lab.remaining() < size {
                Self::refill(&mut state, backend, size);
            }
            let address = state.lab.start;
            state.lab.start += size;
            drop(state);

            address
        };

        #[cfg(feature = "young-generation")]
        {
            use super::cage::{Age, CagedHeap};
            let offset = CagedHeap::offset_from_address(address);
            backend
                .cage()
                .local_data()
                .age_table
                .set_age_for_range(offset, offset + size, Age::Young);
        }

        // SAFETY: `[address, address + size)` was just carved out of a page
        // and is owned by this allocation.
        let header = unsafe {
            let header = HeapObjectHeader::write_object(address as *mut u8, size, index);
            std::ptr::write_bytes(header.payload(), 0, header.payload_size());
            header
        };

        // The header must be in place before the bit makes it discoverable.
        let Some(page) = backend.lookup(address) else {
            fatal!("ObjectAllocator: address {address:#x} is not on a page");
        };
        if !page.is_large() {
            page.object_start_bitmap().set_bit(address);
        }
        NonNull::from(header)
    }

    fn refill(state: &mut AllocatorState, backend: &PageBackend, size: usize) {
        Self::reset_lab(state, backend);

        state.lab = if let Some((address, len)) = state.free_list.take(size) {
            LinearAllocationBuffer {
                start: address,
                end: address + len,
            }
        } else {
            // SAFETY: freshly allocated pages are valid.
            let page = unsafe { backend.allocate_normal_page().as_ref() };
            LinearAllocationBuffer {
                start: page.payload_start(),
                end: page.payload_end(),
            }
        };

        // Only new objects will live in the buffer.
        #[cfg(feature = "young-generation")]
        {
            use super::cage::{Age, CagedHeap};
            backend.cage().local_data().age_table.set_age_for_range(
                CagedHeap::offset_from_address(state.lab.start),
                CagedHeap::offset_from_address(state.lab.end),
                Age::Young,
            );
        }
    }

    fn reset_lab(state: &mut AllocatorState, backend: &PageBackend) {
        let lab = std::mem::take(&mut state.lab);
        let remaining = lab.remaining();
        if remaining == 0 {
            return;
        }
        // SAFETY: the unused LAB tail is owned by the allocator.
        unsafe { HeapObjectHeader::write_free(lab.start as *mut u8, remaining) };
        if let Some(page) = backend.lookup(lab.start) {
            page.object_start_bitmap().set_bit(lab.start);
        }
        if remaining >= MIN_OBJECT_SIZE {
            state.free_list.add(lab.start, remaining);
        }
    }

    /// Turns the unused part of the current LAB into free space so that
    /// every byte of every normal page is covered by a header.
    pub fn reset_linear_allocation_buffers(&self, backend: &PageBackend) {
        Self::reset_lab(&mut self.state.lock(), backend);
    }

    /// Drops all free list entries. Used by the sweeper before rebuilding.
    pub fn clear_free_list(&self) {
        self.state.lock().free_list.clear();
    }

    /// Adds a free block whose free header has already been written.
    pub fn add_to_free_list(&self, address: usize, size: usize) {
        if size >= MIN_OBJECT_SIZE {
            self.state.lock().free_list.add(address, size);
        }
    }

    /// Bytes available in the free list.
    #[must_use]
    pub fn free_list_size(&self) -> usize {
        self.state.lock().free_list.size()
    }

    /// Bytes left in the current LAB.
    #[must_use]
    pub fn linear_allocation_buffer_size(&self) -> usize {
        self.state.lock().lab.remaining()
    }

    /// Gives the memory of an object back right away. An object that ends
    /// where the LAB starts is merged into the LAB, large objects return
    /// their page and everything else goes to the free list.
    ///
    /// Returns the number of bytes released.
    ///
    /// # Safety
    ///
    /// The object must be finalized already and never be referenced again.
    pub unsafe fn free(&self, backend: &PageBackend, header: &HeapObjectHeader) -> usize {
        let address = header.address();
        let size = header.size();
        let Some(page) = backend.lookup(address) else {
            fatal!("ObjectAllocator: freeing {address:#x}, which is not on a page");
        };
        if page.is_large() {
            // SAFETY: the page holds nothing but the object.
            unsafe { backend.free_page(NonNull::from(page)) };
            return size;
        }

        let mut state = self.state.lock();
        if state.lab.start == header.end() {
            page.object_start_bitmap().clear_bit(address);
            state.lab.start = address;
        } else {
            // SAFETY: the object's memory belongs to the allocator again.
            unsafe { HeapObjectHeader::write_free(address as *mut u8, size) };
            state.free_list.add(address, size);
        }
        size
    }

    /// Grows or shrinks a small object in place to `new_size` bytes,
    /// header included.
    ///
    /// Growing only succeeds if the object is directly followed by the LAB.
    /// Shrinking hands the tail to the LAB or the free list; a tail too
    /// small for a free list entry stays with the object. Large objects
    /// keep their size. Returns `true` if the object now has room for
    /// `new_size` bytes.
    pub fn try_resize(
        &self,
        backend: &PageBackend,
        header: &HeapObjectHeader,
        new_size: usize,
    ) -> bool {
        debug_assert!(new_size >= MIN_OBJECT_SIZE);
        let old_size = header.size();
        if new_size == old_size {
            return true;
        }
        let Some(page) = backend.lookup(header.address()) else {
            return false;
        };
        if page.is_large() {
            return false;
        }

        let mut state = self.state.lock();
        let followed_by_lab = state.lab.start == header.end();
        if new_size > old_size {
            let delta = new_size - old_size;
            if !followed_by_lab || state.lab.remaining() < delta {
                return false;
            }
            // SAFETY: the bytes are taken from the LAB, which owns them.
            unsafe { std::ptr::write_bytes(state.lab.start as *mut u8, 0, delta) };
            state.lab.start += delta;
            header.set_size(new_size);
            return true;
        }

        let delta = old_size - new_size;
        if followed_by_lab {
            state.lab.start -= delta;
            header.set_size(new_size);
        } else if delta >= MIN_OBJECT_SIZE {
            let tail = header.address() + new_size;
            header.set_size(new_size);
            // SAFETY: the tail is no longer part of the object.
            unsafe { HeapObjectHeader::write_free(tail as *mut u8, delta) };
            page.object_start_bitmap().set_bit(tail);
            state.free_list.add(tail, delta);
        }
        true
    }
}

impl Default for ObjectAllocator {
    fn default() -> Self {
        Self::new()
    }
}
