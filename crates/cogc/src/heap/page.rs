//! Pages and the page backend.
//!
//! The cage is divided into units of [`PAGE_SIZE`]. Unit zero holds the
//! cage local data. A normal page occupies one unit and hosts many objects
//! tracked by an object start bitmap; a large page spans as many units as
//! its single object needs. The page table maps every unit to the page that
//! covers it, which is how raw addresses are resolved to object headers.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::cage::{CagedHeap, CagedHeapLocalData, CAGED_HEAP_RESERVATION_SIZE};
use super::header::{round_up_to_granularity, HeapObjectHeader, HEADER_SIZE};
use super::object_start_bitmap::ObjectStartBitmap;

/// Size of a page unit.
pub const PAGE_SIZE: usize = 1 << 17;

/// Objects larger than this get a large page of their own.
pub const LARGE_OBJECT_SIZE_THRESHOLD: usize = PAGE_SIZE / 2;

const UNIT_COUNT: usize = CAGED_HEAP_RESERVATION_SIZE / PAGE_SIZE;

const PAGE_MAGIC: usize = 0x636f_6763_7061_6765;

const _: () = assert!(std::mem::size_of::<CagedHeapLocalData>() <= PAGE_SIZE);

/// Kind of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Hosts many objects.
    Normal,
    /// Hosts exactly one object.
    Large,
}

/// Header at the start of every page.
#[repr(C)]
#[derive(Debug)]
pub struct BasePage {
    magic: usize,
    kind: PageKind,
    unit_count: usize,
    object_start_bitmap: ObjectStartBitmap,
}

/// Offset of the first payload byte from the page start.
pub const PAGE_HEADER_SIZE: usize = round_up_to_granularity(std::mem::size_of::<BasePage>());

impl BasePage {
    /// Address of the page.
    #[inline]
    #[must_use]
    pub fn start(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Kind of the page.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> PageKind {
        self.kind
    }

    /// Returns `true` for large pages.
    #[inline]
    #[must_use]
    pub fn is_large(&self) -> bool {
        self.kind == PageKind::Large
    }

    /// Size of the page in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.unit_count * PAGE_SIZE
    }

    /// First address available for objects.
    #[inline]
    #[must_use]
    pub fn payload_start(&self) -> usize {
        self.start() + PAGE_HEADER_SIZE
    }

    /// One past the last address available for objects.
    #[inline]
    #[must_use]
    pub fn payload_end(&self) -> usize {
        self.start() + self.size()
    }

    /// The object start bitmap. Unused on large pages.
    #[inline]
    #[must_use]
    pub const fn object_start_bitmap(&self) -> &ObjectStartBitmap {
        &self.object_start_bitmap
    }

    /// Header of the single object of a large page.
    #[must_use]
    pub fn large_object_header(&self) -> &HeapObjectHeader {
        debug_assert!(self.is_large());
        // SAFETY: large pages are created together with their header.
        unsafe { &*(self.payload_start() as *const HeapObjectHeader) }
    }

    /// Resolves any address inside an object to the object's header.
    ///
    /// Returns `None` for addresses outside the payload area, inside free
    /// space or past the last object on the page.
    #[must_use]
    pub fn try_object_header_from_inner_address(&self, address: usize) -> Option<&HeapObjectHeader> {
        if address < self.payload_start() || address >= self.payload_end() {
            return None;
        }
        let header = if self.is_large() {
            self.large_object_header()
        } else {
            let start = self.object_start_bitmap.find_header(address)?;
            // SAFETY: set bits always point at initialized headers.
            unsafe { &*(start as *const HeapObjectHeader) }
        };
        if header.is_free() || address >= header.end() {
            return None;
        }
        Some(header)
    }

    /// Calls `f` with every header on the page, including free space.
    ///
    /// Linear allocation buffers must have been reset.
    pub fn for_each_header(&self, mut f: impl FnMut(&HeapObjectHeader)) {
        if self.is_large() {
            f(self.large_object_header());
            return;
        }
        let mut current = self.payload_start();
        let end = self.payload_end();
        while current < end {
            // SAFETY: without a LAB every byte of a normal page payload is
            // covered by an object, free entry or filler header.
            let header = unsafe { &*(current as *const HeapObjectHeader) };
            let size = header.size();
            debug_assert!(size >= HEADER_SIZE, "corrupted header at {current:#x}");
            if size == 0 {
                break;
            }
            f(header);
            current += size;
        }
    }
}

// ============================================================================
// PageBackend
// ============================================================================

#[derive(Debug, Default)]
struct BackendState {
    next_unit: usize,
    free_runs: Vec<(usize, usize)>,
    pages: Vec<usize>,
}

/// Owns the cage and hands out pages from it.
pub struct PageBackend {
    cage: CagedHeap,
    page_table: Box<[AtomicUsize]>,
    state: Mutex<BackendState>,
}

impl PageBackend {
    /// Reserves a cage and creates an empty backend over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the cage cannot be reserved.
    pub fn new() -> io::Result<Self> {
        let cage = CagedHeap::new()?;
        let page_table = (0..UNIT_COUNT).map(|_| AtomicUsize::new(0)).collect();
        Ok(Self {
            cage,
            page_table,
            state: Mutex::new(BackendState {
                next_unit: 1,
                ..BackendState::default()
            }),
        })
    }

    /// The cage the pages live in.
    #[inline]
    #[must_use]
    pub const fn cage(&self) -> &CagedHeap {
        &self.cage
    }

    fn take_units(state: &mut BackendState, count: usize) -> usize {
        if let Some(pos) = state.free_runs.iter().position(|&(_, len)| len >= count) {
            let (first, len) = state.free_runs[pos];
            if len == count {
                state.free_runs.swap_remove(pos);
            } else {
                state.free_runs[pos] = (first + count, len - count);
            }
            return first;
        }
        if state.next_unit + count > UNIT_COUNT {
            fatal!(
                "PageBackend: cage exhausted while allocating {} page units",
                count
            );
        }
        let first = state.next_unit;
        state.next_unit += count;
        first
    }

    fn create_page(&self, kind: PageKind, unit_count: usize) -> NonNull<BasePage> {
        let mut state = self.state.lock();
        let first_unit = Self::take_units(&mut state, unit_count);
        let start = self.cage.base() + first_unit * PAGE_SIZE;

        // SAFETY: the units were just taken from the cage and are unused.
        let page = unsafe {
            let page = start as *mut BasePage;
            page.write(BasePage {
                magic: PAGE_MAGIC,
                kind,
                unit_count,
                object_start_bitmap: ObjectStartBitmap::new(start),
            });
            NonNull::new_unchecked(page)
        };

        for unit in first_unit..first_unit + unit_count {
            self.page_table[unit].store(start, Ordering::Release);
        }
        state.pages.push(start);
        page
    }

    /// Allocates a page for small objects.
    pub fn allocate_normal_page(&self) -> NonNull<BasePage> {
        self.create_page(PageKind::Normal, 1)
    }

    /// Allocates a page for one object of `object_size` bytes, header
    /// included.
    pub fn allocate_large_page(&self, object_size: usize) -> NonNull<BasePage> {
        let unit_count = (PAGE_HEADER_SIZE + object_size).div_ceil(PAGE_SIZE);
        self.create_page(PageKind::Large, unit_count)
    }

    /// Returns a page to the cage.
    ///
    /// # Safety
    ///
    /// No object on the page may be referenced afterwards.
    pub unsafe fn free_page(&self, page: NonNull<BasePage>) {
        // SAFETY: the page is still mapped until the caller drops references.
        let (start, unit_count) = unsafe {
            let page = page.as_ref();
            (page.start(), page.unit_count)
        };
        let first_unit = (start - self.cage.base()) / PAGE_SIZE;

        let mut state = self.state.lock();
        for unit in first_unit..first_unit + unit_count {
            self.page_table[unit].store(0, Ordering::Release);
        }
        state.pages.retain(|&p| p != start);

        // SAFETY: the page header is no longer reachable through the table.
        unsafe { std::ptr::drop_in_place(page.as_ptr()) };
        let offset = start - self.cage.base();
        if let Err(_err) = self
            .cage
            .reservation()
            .discard(offset, unit_count * PAGE_SIZE)
        {
            #[cfg(feature = "tracing")]
            ::tracing::warn!(error = %_err, "failed to discard freed page");
        }
        state.free_runs.push((first_unit, unit_count));
    }

    /// Returns the page covering `address`, if any.
    #[inline]
    #[must_use]
    pub fn lookup(&self, address: usize) -> Option<&BasePage> {
        if !self.cage.contains(address) {
            return None;
        }
        let unit = (address - self.cage.base()) / PAGE_SIZE;
        let start = self.page_table[unit].load(Ordering::Acquire);
        if start == 0 {
            return None;
        }
        // SAFETY: the page table only holds addresses of live pages.
        let page = unsafe { &*(start as *const BasePage) };
        debug_assert_eq!(page.magic, PAGE_MAGIC);
        Some(page)
    }

    /// Resolves an arbitrary address to the header of the object containing
    /// it. This is the only place raw addresses are turned into headers.
    #[must_use]
    pub fn try_object_header_from_inner_address(&self, address: usize) -> Option<&HeapObjectHeader> {
        self.lookup(address)?
            .try_object_header_from_inner_address(address)
    }

    /// Snapshot of all pages.
    #[must_use]
    pub fn pages(&self) -> Vec<NonNull<BasePage>> {
        self.state
            .lock()
            .pages
            .iter()
            .filter_map(|&start| NonNull::new(start as *mut BasePage))
            .collect()
    }

    /// Total size of all pages.
    #[must_use]
    pub fn committed_size(&self) -> usize {
        self.pages()
            .into_iter()
            // SAFETY: pages in the list are live.
            .map(|page| unsafe { page.as_ref() }.size())
            .sum()
    }
}
