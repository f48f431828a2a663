//! The caged heap reservation.
//!
//! Each heap lives in one contiguous reservation aligned to its own size.
//! Rounding any address inside the cage down to the alignment yields the
//! cage start, where [`CagedHeapLocalData`] lives. The write barrier relies
//! on this to find the marking flag of a heap from a raw value.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use sys_alloc::{Mmap, MmapOptions};

use crate::heap::HeapBase;

/// Size of a cage. Also its alignment.
pub const CAGED_HEAP_RESERVATION_SIZE: usize = 1 << 28;

/// Alignment of a cage.
pub const CAGED_HEAP_RESERVATION_ALIGNMENT: usize = CAGED_HEAP_RESERVATION_SIZE;

/// Data stored at the start of every cage.
#[repr(C)]
#[derive(Debug)]
pub struct CagedHeapLocalData {
    /// The heap that owns the cage.
    pub heap: AtomicPtr<HeapBase>,
    /// Set while the owning heap is marking incrementally or concurrently.
    pub is_incremental_marking_in_progress: AtomicBool,
    /// Age of every card of the cage.
    #[cfg(feature = "young-generation")]
    pub age_table: AgeTable,
}

/// A heap's reserved address range.
pub struct CagedHeap {
    reservation: Mmap,
}

impl CagedHeap {
    /// Reserves a new cage and initializes its local data.
    ///
    /// # Errors
    ///
    /// Returns an error if the address space cannot be reserved.
    pub fn new() -> io::Result<Self> {
        // SAFETY: the reservation is owned by the cage and every pointer into
        // it is derived from a heap that keeps the cage alive.
        let reservation = unsafe {
            MmapOptions::new()
                .len(CAGED_HEAP_RESERVATION_SIZE)
                .alignment(CAGED_HEAP_RESERVATION_ALIGNMENT)
                .no_reserve(true)
                .map_anon()?
        };

        // SAFETY: the start of the reservation is aligned, writable and large
        // enough for the local data.
        unsafe {
            reservation
                .ptr()
                .cast::<CagedHeapLocalData>()
                .write(CagedHeapLocalData {
                    heap: AtomicPtr::new(std::ptr::null_mut()),
                    is_incremental_marking_in_progress: AtomicBool::new(false),
                    #[cfg(feature = "young-generation")]
                    age_table: AgeTable::new(),
                });
        }

        Ok(Self { reservation })
    }

    /// First address of the cage.
    #[inline]
    #[must_use]
    pub fn base(&self) -> usize {
        self.reservation.ptr() as usize
    }

    /// Returns `true` if `address` lies inside the cage.
    #[inline]
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        self.reservation.contains(address)
    }

    /// Offset of `address` from the cage start.
    #[inline]
    #[must_use]
    pub const fn offset_from_address(address: usize) -> usize {
        address & (CAGED_HEAP_RESERVATION_ALIGNMENT - 1)
    }

    /// The local data of this cage.
    #[inline]
    #[must_use]
    pub fn local_data(&self) -> &CagedHeapLocalData {
        // SAFETY: written in `new` and alive as long as the reservation.
        unsafe { &*self.reservation.ptr().cast::<CagedHeapLocalData>() }
    }

    /// The backing reservation.
    #[must_use]
    pub const fn reservation(&self) -> &Mmap {
        &self.reservation
    }

    /// Flags the cage as (not) marking.
    pub fn set_incremental_marking_in_progress(&self, value: bool) {
        self.local_data()
            .is_incremental_marking_in_progress
            .store(value, Ordering::Release);
    }
}

impl Drop for CagedHeap {
    fn drop(&mut self) {
        // SAFETY: the local data was initialized in `new`.
        unsafe {
            std::ptr::drop_in_place(self.reservation.ptr().cast::<CagedHeapLocalData>());
        }
    }
}

// ============================================================================
// Age table
// ============================================================================

#[cfg(feature = "young-generation")]
pub use age::{Age, AgeTable, CARD_SIZE};

#[cfg(feature = "young-generation")]
mod age {
    use std::sync::atomic::{AtomicU8, Ordering};

    use super::CAGED_HEAP_RESERVATION_SIZE;

    /// Granularity of the age table.
    pub const CARD_SIZE: usize = 4096;

    const CARD_COUNT: usize = CAGED_HEAP_RESERVATION_SIZE / CARD_SIZE;

    /// Generation of a card.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Age {
        /// Survived a collection.
        Old = 0,
        /// Allocated since the last collection.
        Young = 1,
        /// Holds both old and young objects.
        Mixed = 2,
    }

    impl Age {
        const fn from_u8(v: u8) -> Self {
            match v {
                1 => Self::Young,
                2 => Self::Mixed,
                _ => Self::Old,
            }
        }
    }

    /// Card-granular ages of a cage, indexed by offset from the cage start.
    #[derive(Debug)]
    pub struct AgeTable {
        cards: [AtomicU8; CARD_COUNT],
    }

    impl AgeTable {
        pub(super) const fn new() -> Self {
            Self {
                cards: [const { AtomicU8::new(Age::Old as u8) }; CARD_COUNT],
            }
        }

        /// Age of the card containing `offset`.
        #[inline]
        #[must_use]
        pub fn get_age(&self, offset: usize) -> Age {
            Age::from_u8(self.cards[offset / CARD_SIZE].load(Ordering::Relaxed))
        }

        /// Sets the age of the card containing `offset`.
        #[inline]
        pub fn set_age(&self, offset: usize, age: Age) {
            self.cards[offset / CARD_SIZE].store(age as u8, Ordering::Relaxed);
        }

        /// Sets the age of `[begin, end)`.
        ///
        /// Cards only partially covered by the range become `Mixed` when
        /// their current age differs.
        pub fn set_age_for_range(&self, begin: usize, end: usize, age: Age) {
            if begin >= end {
                return;
            }
            let first = begin / CARD_SIZE;
            let last = (end - 1) / CARD_SIZE;
            for card in first..=last {
                let card_begin = card * CARD_SIZE;
                let covered = begin <= card_begin && end >= card_begin + CARD_SIZE;
                let current = Age::from_u8(self.cards[card].load(Ordering::Relaxed));
                let new_age = if covered || current == age {
                    age
                } else {
                    Age::Mixed
                };
                self.cards[card].store(new_age as u8, Ordering::Relaxed);
            }
        }

        /// Marks every card old.
        pub fn reset(&self) {
            for card in &self.cards {
                card.store(Age::Old as u8, Ordering::Relaxed);
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_range_boundaries_become_mixed() {
            let table = Box::new(AgeTable::new());
            table.set_age_for_range(CARD_SIZE / 2, 3 * CARD_SIZE, Age::Young);

            assert_eq!(table.get_age(0), Age::Mixed);
            assert_eq!(table.get_age(CARD_SIZE), Age::Young);
            assert_eq!(table.get_age(2 * CARD_SIZE), Age::Young);
            assert_eq!(table.get_age(3 * CARD_SIZE), Age::Old);

            table.reset();
            assert_eq!(table.get_age(CARD_SIZE), Age::Old);
        }
    }
}
