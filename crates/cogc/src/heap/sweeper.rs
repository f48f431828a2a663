//! Sweeping.
//!
//! Sweeping runs in two passes over all pages:
//! - Pass 1 runs the finalizers of dead objects while every object is still
//!   in place, then turns each dead object into free space.
//! - Pass 2 coalesces adjacent free space, clears the mark bits of
//!   survivors, rebuilds the free list and returns empty pages to the cage.
//!
//! Objects still under construction are kept alive.

use std::ptr::NonNull;

use super::allocator::ObjectAllocator;
use super::header::HeapObjectHeader;
use super::page::{BasePage, PageBackend};
use crate::metrics::SweepResult;

/// Returns `true` if `header` is an object the last marking did not reach.
fn is_dead(header: &HeapObjectHeader) -> bool {
    !header.is_free() && !header.is_marked() && !header.is_in_construction()
}

/// Runs the finalizer of a dead object unless its lifetime is managed
/// elsewhere. Returns `true` if a finalizer ran.
pub(crate) fn finalize(header: &HeapObjectHeader) -> bool {
    let info = header.gc_info();
    let payload = header.payload();
    if let Some(is_externally_managed) = info.is_externally_managed {
        // SAFETY: the object is fully constructed and not yet reclaimed.
        if unsafe { is_externally_managed(payload) } {
            return false;
        }
    }
    let Some(finalize) = info.finalize else {
        return false;
    };
    // SAFETY: the object is dead, so nothing reads it after this point.
    unsafe { finalize(payload) };
    true
}

/// Sweeps every page of `backend`.
///
/// Must run after marking and before any mark bit is cleared. Allocation
/// is not allowed while sweeping.
pub fn sweep(backend: &PageBackend, allocator: &ObjectAllocator) -> SweepResult {
    #[cfg(feature = "tracing")]
    ::tracing::debug!(committed = backend.committed_size(), "sweep_start");

    allocator.reset_linear_allocation_buffers(backend);
    let pages = backend.pages();
    let mut result = SweepResult::default();

    // Pass 1: finalize.
    for page in &pages {
        // SAFETY: pages in the snapshot stay live until pass 2 frees them.
        let page = unsafe { page.as_ref() };
        page.for_each_header(|header| {
            if !is_dead(header) {
                return;
            }
            if finalize(header) {
                result.finalized_objects += 1;
            }
            result.swept_bytes += header.size();
            header.convert_to_free();
        });
    }

    // Pass 2: reclaim.
    allocator.clear_free_list();
    for page in pages {
        // SAFETY: see above.
        let keep = if unsafe { page.as_ref() }.is_large() {
            sweep_large_page(page, &mut result)
        } else {
            sweep_normal_page(page, allocator, &mut result)
        };
        if !keep {
            // SAFETY: nothing on the page is alive.
            unsafe { backend.free_page(page) };
            result.freed_pages += 1;
        }
    }

    #[cfg(feature = "tracing")]
    ::tracing::debug!(
        swept_bytes = result.swept_bytes,
        live_bytes = result.live_bytes,
        freed_pages = result.freed_pages,
        "sweep_end"
    );

    result
}

/// Runs the finalizer of every fully constructed object. Used when the
/// heap is torn down. Returns the number of finalizers that ran.
pub(crate) fn finalize_all(backend: &PageBackend, allocator: &ObjectAllocator) -> usize {
    allocator.reset_linear_allocation_buffers(backend);
    let mut finalized = 0;
    for page in backend.pages() {
        // SAFETY: pages stay live until the backend is dropped.
        let page = unsafe { page.as_ref() };
        page.for_each_header(|header| {
            if header.is_free() || header.is_in_construction() {
                return;
            }
            if finalize(header) {
                finalized += 1;
            }
            header.convert_to_free();
        });
    }
    finalized
}

fn sweep_large_page(page: NonNull<BasePage>, result: &mut SweepResult) -> bool {
    // SAFETY: the page is live.
    let header = unsafe { page.as_ref() }.large_object_header();
    if header.is_free() {
        return false;
    }
    header.unmark();
    result.live_bytes += header.size();
    true
}

/// Returns `false` if the page holds no object any more.
fn sweep_normal_page(
    page: NonNull<BasePage>,
    allocator: &ObjectAllocator,
    result: &mut SweepResult,
) -> bool {
    // SAFETY: the page is live.
    let page = unsafe { page.as_ref() };
    let bitmap = page.object_start_bitmap();
    let mut has_objects = false;
    let mut runs: Vec<(usize, usize)> = Vec::new();
    let mut run: Option<(usize, usize)> = None;

    page.for_each_header(|header| {
        if header.is_free() {
            match &mut run {
                Some((_, size)) => {
                    *size += header.size();
                    bitmap.clear_bit(header.address());
                }
                None => run = Some((header.address(), header.size())),
            }
            return;
        }
        if let Some(finished) = run.take() {
            runs.push(finished);
        }
        has_objects = true;
        header.unmark();
        result.live_bytes += header.size();
    });
    runs.extend(run);

    if !has_objects {
        return false;
    }
    for (start, size) in runs {
        // SAFETY: the run only covers free space of this page.
        unsafe { HeapObjectHeader::write_free(start as *mut u8, size) };
        bitmap.set_bit(start);
        allocator.add_to_free_list(start, size);
    }
    true
}
