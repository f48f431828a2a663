//! Virtual memory primitives used by the collector.
//!
//! Provides anonymous reservations (optionally aligned to a power of two),
//! page protection changes and discarding of physical backing.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// When requesting a specific address, it should be aligned to this granularity.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Access rights of a range of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Pages can be read and written.
    ReadWrite,
    /// Pages can only be read. Writes fault.
    ReadOnly,
    /// Any access faults.
    NoAccess,
}

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped. For
/// aligned mappings the underlying reservation is larger than `len()`; only
/// the aligned window is exposed.
pub struct Mmap {
    inner: os::MmapInner,
    offset: usize,
    len: usize,
}

impl Mmap {
    /// Returns a pointer to the start of the usable window.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        // SAFETY: `offset + len` never exceeds the reservation.
        unsafe { self.inner.ptr().add(self.offset) }
    }

    /// Returns the length of the usable window in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the window is empty. Mappings are never empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if `address` lies inside the usable window.
    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        let start = self.ptr() as usize;
        address >= start && address - start < self.len
    }

    /// Changes the access rights of `[offset, offset + len)` of the window.
    ///
    /// Both `offset` and `len` must be multiples of [`page_size`].
    ///
    /// # Errors
    ///
    /// Returns an error if the range is misaligned, out of bounds or the OS
    /// rejects the request.
    pub fn protect(&self, offset: usize, len: usize, protection: Protection) -> io::Result<()> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range was validated against the window above.
        unsafe { os::protect(self.ptr().add(offset), len, protection) }
    }

    /// Releases the physical backing of `[offset, offset + len)`.
    ///
    /// The range stays reserved and accessible; its contents are unspecified
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is misaligned, out of bounds or the OS
    /// rejects the request.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range was validated against the window above.
        unsafe { os::discard(self.ptr().add(offset), len) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        if offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range must be page aligned",
            ));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range exceeds the mapping",
            )),
        }
    }
}

// SAFETY: the mapping is plain memory owned by this handle.
unsafe impl Send for Mmap {}
// SAFETY: see Send impl
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    alignment: usize,
    hint_addr: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            alignment: 0,
            hint_addr: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requests the start of the mapping to be aligned to `alignment`.
    ///
    /// `alignment` must be a power of two. Alignments at or below
    /// [`allocation_granularity`] are always satisfied.
    #[must_use]
    pub const fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets a hint address for the mapping.
    ///
    /// The OS is not required to honor this request.
    #[must_use]
    pub const fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Sets whether to reserve swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled, read-write memory map.
    ///
    /// # Errors
    ///
    /// Fails if the length is zero, the alignment is not a power of two or
    /// the OS refuses the reservation.
    ///
    /// # Safety
    ///
    /// The returned memory is valid for as long as the `Mmap` lives. Callers
    /// handing out raw pointers into it must not use them past that point.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.alignment != 0 && !self.alignment.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }

        let slack = if self.alignment > allocation_granularity() {
            self.alignment
        } else {
            0
        };
        let reserved = self
            .len
            .checked_add(slack)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

        let inner = unsafe {
            os::MmapInner::map_anon(self.hint_addr, reserved, self.populate, self.no_reserve)?
        };

        let base = inner.ptr() as usize;
        let offset = if slack == 0 {
            0
        } else {
            ((base + self.alignment - 1) & !(self.alignment - 1)) - base
        };

        Ok(Mmap {
            inner,
            offset,
            len: self.len,
        })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(
            ag & (ag - 1),
            0,
            "Allocation granularity should be power of 2"
        );
        assert!(ag >= page_size());
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = unsafe { MmapOptions::new().len(len).map_anon().expect("failed to map") };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = unsafe { MmapOptions::new().map_anon() };
        assert!(err.is_err());
    }

    #[test]
    fn test_aligned_map() {
        let align = 1 << 22;
        let len = 1 << 20;
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .alignment(align)
                .no_reserve(true)
                .map_anon()
                .expect("failed to map")
        };

        assert_eq!(mmap.ptr() as usize % align, 0);
        assert_eq!(mmap.len(), len);
        assert!(mmap.contains(mmap.ptr() as usize));
        assert!(mmap.contains(mmap.ptr() as usize + len - 1));
        assert!(!mmap.contains(mmap.ptr() as usize + len));

        unsafe {
            ptr::write_volatile(mmap.ptr().add(len - 1), 7);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(len - 1)), 7);
        }
    }

    #[test]
    fn test_bad_alignment_rejected() {
        let err = unsafe { MmapOptions::new().len(page_size()).alignment(3).map_anon() };
        assert!(err.is_err());
    }

    #[test]
    fn test_protect_round_trip() {
        let page = page_size();
        let mmap = unsafe { MmapOptions::new().len(2 * page).map_anon().expect("failed to map") };

        mmap.protect(0, page, Protection::ReadOnly)
            .expect("protect read-only");
        // Reads from the protected page still work.
        unsafe {
            assert_eq!(ptr::read_volatile(mmap.ptr()), 0);
        }
        mmap.protect(0, page, Protection::ReadWrite)
            .expect("protect read-write");
        unsafe {
            ptr::write_volatile(mmap.ptr(), 1);
            assert_eq!(ptr::read_volatile(mmap.ptr()), 1);
        }
    }

    #[test]
    fn test_protect_rejects_bad_ranges() {
        let page = page_size();
        let mmap = unsafe { MmapOptions::new().len(page).map_anon().expect("failed to map") };

        assert!(mmap.protect(1, page, Protection::ReadOnly).is_err());
        assert!(mmap.protect(0, 2 * page, Protection::ReadOnly).is_err());
        assert!(mmap.protect(0, 0, Protection::ReadOnly).is_ok());
    }

    #[test]
    fn test_discard_keeps_range_usable() {
        let page = page_size();
        let mmap = unsafe { MmapOptions::new().len(page).map_anon().expect("failed to map") };

        unsafe { ptr::write_volatile(mmap.ptr(), 9) };
        mmap.discard(0, page).expect("discard");
        unsafe {
            ptr::write_volatile(mmap.ptr(), 3);
            assert_eq!(ptr::read_volatile(mmap.ptr()), 3);
        }
    }
}
