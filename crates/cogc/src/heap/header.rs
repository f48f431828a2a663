//! Per-object header.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::gc_info::{GcInfo, GcInfoIndex, GcInfoTable, HeapObjectName};

/// All allocations are multiples of this size and payloads are aligned to it.
pub const ALLOCATION_GRANULARITY: usize = 8;

/// Size of [`HeapObjectHeader`].
pub const HEADER_SIZE: usize = std::mem::size_of::<HeapObjectHeader>();

/// Smallest allocation handed out for an object.
pub const MIN_OBJECT_SIZE: usize = 2 * ALLOCATION_GRANULARITY;

const INDEX_MASK: u32 = (1 << 14) - 1;
const MARK_BIT: u32 = 1 << 14;
const FULLY_CONSTRUCTED_BIT: u32 = 1 << 15;
const FREE_BIT: u32 = 1 << 16;

/// Header preceding every object, free list entry and filler on the heap.
///
/// `size` covers the header itself. `encoded` packs the type index (14 bits),
/// the mark bit, the fully-constructed bit and the free bit. The
/// in-construction state is the absence of the fully-constructed bit so that
/// a freshly written header starts out in construction.
#[repr(C, align(8))]
#[derive(Debug)]
pub struct HeapObjectHeader {
    size: AtomicU32,
    encoded: AtomicU32,
}

const _: () = assert!(HEADER_SIZE == ALLOCATION_GRANULARITY);

impl HeapObjectHeader {
    /// Writes an in-construction object header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be granularity aligned and valid for `size` bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn write_object<'a>(at: *mut u8, size: usize, index: GcInfoIndex) -> &'a Self {
        debug_assert_eq!(at as usize % ALLOCATION_GRANULARITY, 0);
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        // SAFETY: guaranteed by the caller. Every bit pattern is a valid
        // header, and concurrent readers only ever access it atomically.
        let header = unsafe { &*at.cast::<Self>() };
        header.size.store(size as u32, Ordering::Relaxed);
        header
            .encoded
            .store(u32::from(index.get()) & INDEX_MASK, Ordering::Release);
        header
    }

    /// Writes a free-space header of `size` bytes at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be granularity aligned and valid for `size` bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn write_free<'a>(at: *mut u8, size: usize) -> &'a Self {
        debug_assert_eq!(at as usize % ALLOCATION_GRANULARITY, 0);
        // SAFETY: see `write_object`.
        let header = unsafe { &*at.cast::<Self>() };
        header.size.store(size as u32, Ordering::Relaxed);
        header.encoded.store(FREE_BIT, Ordering::Release);
        header
    }

    /// Returns the header of the object whose payload starts at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be the payload address of a heap object.
    #[inline]
    #[must_use]
    pub unsafe fn from_payload<'a>(payload: *const u8) -> &'a Self {
        // SAFETY: the header immediately precedes the payload.
        unsafe { &*payload.sub(HEADER_SIZE).cast::<Self>() }
    }

    /// Address of the header.
    #[inline]
    #[must_use]
    pub fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Address of the first payload byte.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> *mut u8 {
        (self.address() + HEADER_SIZE) as *mut u8
    }

    /// Size of the allocation including the header.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed) as usize
    }

    /// Changes the size of the allocation. Only valid while no collection
    /// is running.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn set_size(&self, size: usize) {
        debug_assert_eq!(size % ALLOCATION_GRANULARITY, 0);
        self.size.store(size as u32, Ordering::Relaxed);
    }

    /// Size of the payload.
    #[inline]
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.size() - HEADER_SIZE
    }

    /// One past the last byte of the allocation.
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.address() + self.size()
    }

    /// Type index of the object.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn gc_info_index(&self) -> GcInfoIndex {
        GcInfoIndex::from_raw((self.encoded.load(Ordering::Relaxed) & INDEX_MASK) as u16)
    }

    /// Metadata of the object's type.
    #[inline]
    #[must_use]
    pub fn gc_info(&self) -> &'static GcInfo {
        GcInfoTable::global().gc_info_from_index(self.gc_info_index())
    }

    /// Diagnostic name of the object.
    #[must_use]
    pub fn name(&self) -> HeapObjectName {
        if self.is_free() {
            return HeapObjectName {
                value: "FreeSpace",
                name_was_hidden: false,
            };
        }
        // SAFETY: the header belongs to a live, non-free object.
        unsafe { (self.gc_info().name)(self.payload()) }
    }

    /// Returns `true` if the mark bit is set.
    #[inline]
    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.encoded.load(Ordering::Acquire) & MARK_BIT != 0
    }

    /// Sets the mark bit. Returns `true` if this call set it.
    #[inline]
    pub fn try_mark_atomic(&self) -> bool {
        self.encoded.fetch_or(MARK_BIT, Ordering::AcqRel) & MARK_BIT == 0
    }

    /// Clears the mark bit.
    #[inline]
    pub fn unmark(&self) {
        self.encoded.fetch_and(!MARK_BIT, Ordering::Release);
    }

    /// Returns `true` while the object's constructor has not finished.
    #[inline]
    #[must_use]
    pub fn is_in_construction(&self) -> bool {
        self.encoded.load(Ordering::Acquire) & FULLY_CONSTRUCTED_BIT == 0
    }

    /// Publishes the object as fully constructed.
    #[inline]
    pub fn mark_as_fully_constructed(&self) {
        self.encoded
            .fetch_or(FULLY_CONSTRUCTED_BIT, Ordering::Release);
    }

    /// Turns an abandoned allocation into free space of the same size.
    pub fn convert_to_free(&self) {
        self.encoded.store(FREE_BIT, Ordering::Release);
    }

    /// Returns `true` for free list entries and fillers.
    #[inline]
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.encoded.load(Ordering::Relaxed) & FREE_BIT != 0
    }
}

/// Rounds `size` up to the allocation granularity.
#[inline]
#[must_use]
pub const fn round_up_to_granularity(size: usize) -> usize {
    (size + ALLOCATION_GRANULARITY - 1) & !(ALLOCATION_GRANULARITY - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Storage([u8; 64]);

    #[test]
    fn test_new_object_is_in_construction_and_unmarked() {
        let mut storage = Storage([0xAA; 64]);
        let header = unsafe {
            HeapObjectHeader::write_object(storage.0.as_mut_ptr(), 32, GcInfoIndex::from_raw(5))
        };

        assert_eq!(header.size(), 32);
        assert_eq!(header.payload_size(), 24);
        assert_eq!(header.gc_info_index(), GcInfoIndex::from_raw(5));
        assert!(header.is_in_construction());
        assert!(!header.is_marked());
        assert!(!header.is_free());

        header.mark_as_fully_constructed();
        assert!(!header.is_in_construction());
        assert_eq!(header.gc_info_index(), GcInfoIndex::from_raw(5));
    }

    #[test]
    fn test_try_mark_is_idempotent() {
        let mut storage = Storage([0; 64]);
        let header = unsafe {
            HeapObjectHeader::write_object(storage.0.as_mut_ptr(), 16, GcInfoIndex::from_raw(1))
        };

        assert!(header.try_mark_atomic());
        assert!(!header.try_mark_atomic());
        assert!(header.is_marked());

        header.unmark();
        assert!(!header.is_marked());
        assert!(header.try_mark_atomic());
    }

    #[test]
    fn test_payload_round_trip() {
        let mut storage = Storage([0; 64]);
        let header = unsafe {
            HeapObjectHeader::write_object(storage.0.as_mut_ptr(), 24, GcInfoIndex::from_raw(2))
        };
        let payload = header.payload();
        assert_eq!(payload as usize, storage.0.as_ptr() as usize + HEADER_SIZE);

        let again = unsafe { HeapObjectHeader::from_payload(payload) };
        assert!(std::ptr::eq(header, again));
        assert_eq!(header.end(), storage.0.as_ptr() as usize + 24);
    }

    #[test]
    fn test_free_header() {
        let mut storage = Storage([0; 64]);
        let header = unsafe { HeapObjectHeader::write_free(storage.0.as_mut_ptr(), 48) };
        assert!(header.is_free());
        assert_eq!(header.size(), 48);
        assert_eq!(header.name().value, "FreeSpace");
    }

    #[test]
    fn test_convert_to_free_keeps_size() {
        let mut storage = Storage([0; 64]);
        let header = unsafe {
            HeapObjectHeader::write_object(storage.0.as_mut_ptr(), 40, GcInfoIndex::from_raw(3))
        };
        header.convert_to_free();
        assert!(header.is_free());
        assert!(!header.is_marked());
        assert_eq!(header.size(), 40);
    }

    #[test]
    fn test_round_up_to_granularity() {
        assert_eq!(round_up_to_granularity(0), 0);
        assert_eq!(round_up_to_granularity(1), 8);
        assert_eq!(round_up_to_granularity(8), 8);
        assert_eq!(round_up_to_granularity(13), 16);
    }
}
