//! Object start bitmap for normal pages.
//!
//! One bit per allocation granule records where a header starts. Finding the
//! header of an inner pointer scans backwards for the closest set bit.

use std::sync::atomic::{AtomicU64, Ordering};

use super::header::ALLOCATION_GRANULARITY;
use super::page::PAGE_SIZE;

const BITS_PER_CELL: usize = u64::BITS as usize;

/// Number of cells needed to cover one page.
pub const CELL_COUNT: usize = PAGE_SIZE / ALLOCATION_GRANULARITY / BITS_PER_CELL;

/// A page-level bitmap of object start addresses.
///
/// Bits are set with release and read with acquire semantics so that a
/// reader that observes a bit also observes the header written before it.
#[derive(Debug)]
pub struct ObjectStartBitmap {
    offset: usize,
    cells: [AtomicU64; CELL_COUNT],
}

impl ObjectStartBitmap {
    /// Creates an empty bitmap covering the page that starts at `offset`.
    #[must_use]
    pub const fn new(offset: usize) -> Self {
        Self {
            offset,
            cells: [const { AtomicU64::new(0) }; CELL_COUNT],
        }
    }

    #[inline]
    fn index(&self, address: usize) -> (usize, usize) {
        debug_assert!(address >= self.offset);
        debug_assert_eq!(address % ALLOCATION_GRANULARITY, 0);
        let granule = (address - self.offset) / ALLOCATION_GRANULARITY;
        debug_assert!(granule < CELL_COUNT * BITS_PER_CELL);
        (granule / BITS_PER_CELL, granule % BITS_PER_CELL)
    }

    /// Records a header at `address`.
    #[inline]
    pub fn set_bit(&self, address: usize) {
        let (cell, bit) = self.index(address);
        self.cells[cell].fetch_or(1 << bit, Ordering::Release);
    }

    /// Forgets the header at `address`.
    #[inline]
    pub fn clear_bit(&self, address: usize) {
        let (cell, bit) = self.index(address);
        self.cells[cell].fetch_and(!(1 << bit), Ordering::Release);
    }

    /// Returns `true` if a header starts at `address`.
    #[inline]
    #[must_use]
    pub fn check_bit(&self, address: usize) -> bool {
        let (cell, bit) = self.index(address);
        self.cells[cell].load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Returns the address of the closest header at or before `address`.
    #[must_use]
    pub fn find_header(&self, address: usize) -> Option<usize> {
        let aligned = address & !(ALLOCATION_GRANULARITY - 1);
        let (mut cell, bit) = self.index(aligned);
        let mut word = self.cells[cell].load(Ordering::Acquire) & (u64::MAX >> (63 - bit));
        while word == 0 {
            if cell == 0 {
                return None;
            }
            cell -= 1;
            word = self.cells[cell].load(Ordering::Acquire);
        }
        let bit = BITS_PER_CELL - 1 - word.leading_zeros() as usize;
        Some(self.offset + (cell * BITS_PER_CELL + bit) * ALLOCATION_GRANULARITY)
    }

    /// Calls `f` with every recorded header address in increasing order.
    pub fn iterate(&self, mut f: impl FnMut(usize)) {
        for (cell_index, cell) in self.cells.iter().enumerate() {
            let mut word = cell.load(Ordering::Acquire);
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                f(self.offset + (cell_index * BITS_PER_CELL + bit) * ALLOCATION_GRANULARITY);
            }
        }
    }

    /// Clears all bits.
    pub fn clear(&self) {
        for cell in &self.cells {
            cell.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10_0000;

    #[test]
    fn test_set_check_clear() {
        let bitmap = ObjectStartBitmap::new(BASE);
        assert!(!bitmap.check_bit(BASE + 64));

        bitmap.set_bit(BASE + 64);
        assert!(bitmap.check_bit(BASE + 64));
        assert!(!bitmap.check_bit(BASE + 72));

        bitmap.clear_bit(BASE + 64);
        assert!(!bitmap.check_bit(BASE + 64));
    }

    #[test]
    fn test_find_header_scans_backwards() {
        let bitmap = ObjectStartBitmap::new(BASE);
        bitmap.set_bit(BASE);
        bitmap.set_bit(BASE + 80);

        assert_eq!(bitmap.find_header(BASE), Some(BASE));
        assert_eq!(bitmap.find_header(BASE + 79), Some(BASE));
        assert_eq!(bitmap.find_header(BASE + 80), Some(BASE + 80));
        assert_eq!(bitmap.find_header(BASE + 4000), Some(BASE + 80));
    }

    #[test]
    fn test_find_header_crosses_cells() {
        let bitmap = ObjectStartBitmap::new(BASE);
        bitmap.set_bit(BASE + 8);
        let far = BASE + 10 * BITS_PER_CELL * ALLOCATION_GRANULARITY + 3;
        assert_eq!(bitmap.find_header(far), Some(BASE + 8));
    }

    #[test]
    fn test_find_header_without_bits() {
        let bitmap = ObjectStartBitmap::new(BASE);
        assert_eq!(bitmap.find_header(BASE + 512), None);
    }

    #[test]
    fn test_iterate_in_order() {
        let bitmap = ObjectStartBitmap::new(BASE);
        let addresses = [BASE + 16, BASE + 8 * 64, BASE + 8 * 65, BASE + 8 * 300];
        for &address in addresses.iter().rev() {
            bitmap.set_bit(address);
        }

        let mut seen = Vec::new();
        bitmap.iterate(|address| seen.push(address));
        assert_eq!(seen, addresses);

        bitmap.clear();
        let mut count = 0;
        bitmap.iterate(|_| count += 1);
        assert_eq!(count, 0);
    }
}
