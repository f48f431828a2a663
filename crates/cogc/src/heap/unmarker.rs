//! Clearing stale mark bits.
//!
//! A cycle that skips sweeping leaves every live object marked. Before the
//! next marking those bits have to be cleared, either right away or on a
//! background thread that the next cycle waits for.

use std::ptr::NonNull;
use std::thread::JoinHandle;

use super::page::BasePage;

/// How stale marks are cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnmarkConfig {
    /// On the calling thread.
    #[default]
    Atomic,
    /// On a background thread.
    Concurrent,
}

/// Page addresses handed to the unmarking thread.
struct PageList(Vec<usize>);

impl PageList {
    fn new(pages: &[NonNull<BasePage>]) -> Self {
        Self(pages.iter().map(|page| page.as_ptr() as usize).collect())
    }

    fn unmark(&self) -> usize {
        let mut unmarked = 0;
        for &start in &self.0 {
            // SAFETY: pages are not freed while an unmarker runs.
            let page = unsafe { &*(start as *const BasePage) };
            unmarked += unmark_page(page);
        }
        unmarked
    }
}

/// Clears the mark bits on `page`. Returns how many were set.
///
/// Objects are found through the object start bitmap rather than by
/// walking the page, so the mutator may allocate on the page meanwhile.
fn unmark_page(page: &BasePage) -> usize {
    let mut unmarked = 0;
    let mut unmark = |header: &super::HeapObjectHeader| {
        if header.is_marked() {
            header.unmark();
            unmarked += 1;
        }
    };
    if page.is_large() {
        unmark(page.large_object_header());
    } else {
        page.object_start_bitmap().iterate(|address| {
            // SAFETY: bits are only set once the header is written.
            unmark(unsafe { &*(address as *const super::HeapObjectHeader) });
        });
    }
    unmarked
}

/// A running or finished unmarking pass.
#[derive(Debug)]
pub struct Unmarker {
    handle: Option<JoinHandle<usize>>,
    unmarked: usize,
}

impl Unmarker {
    /// Starts clearing the marks on `pages`.
    ///
    /// The pages must stay allocated until [`Unmarker::finish`] returns.
    #[must_use]
    pub fn start(pages: &[NonNull<BasePage>], config: UnmarkConfig) -> Self {
        let list = PageList::new(pages);
        match config {
            UnmarkConfig::Atomic => Self {
                handle: None,
                unmarked: list.unmark(),
            },
            UnmarkConfig::Concurrent => {
                let spawned = std::thread::Builder::new()
                    .name("cogc-unmarker".into())
                    .spawn(move || list.unmark());
                match spawned {
                    Ok(handle) => Self {
                        handle: Some(handle),
                        unmarked: 0,
                    },
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        ::tracing::warn!(error = %_err, "failed to spawn unmarker, unmarking atomically");
                        Self {
                            handle: None,
                            unmarked: PageList::new(pages).unmark(),
                        }
                    }
                }
            }
        }
    }

    /// Waits for the pass to complete. Returns the number of cleared marks.
    pub fn finish(mut self) -> usize {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(unmarked) => self.unmarked += unmarked,
                Err(_) => fatal!("Unmarker: unmarking thread panicked"),
            }
        }
        self.unmarked
    }
}
