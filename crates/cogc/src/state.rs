//! Collector state shared by all heaps of a process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use crate::registry::HeapRegistry;

/// State shared by every heap of a process: the heap registry and the
/// count of heaps that are marking. The type table is process-wide on its
/// own, since every type caches its index in a static slot.
///
/// Tests create private instances to stay independent from other heaps
/// in the same process.
#[derive(Debug)]
pub struct GlobalCollectorState {
    marking_counter: AtomicUsize,
    registry: HeapRegistry,
}

static PROCESS_STATE: LazyLock<Arc<GlobalCollectorState>> =
    LazyLock::new(|| Arc::new(GlobalCollectorState::new()));

impl GlobalCollectorState {
    /// Creates a fresh state with no heaps.
    #[must_use]
    pub fn new() -> Self {
        Self {
            marking_counter: AtomicUsize::new(0),
            registry: HeapRegistry::new(),
        }
    }

    /// The process-wide instance.
    #[must_use]
    pub fn process() -> Arc<Self> {
        Arc::clone(&PROCESS_STATE)
    }

    /// Called when a heap starts incremental or concurrent marking.
    pub fn enter_incremental_or_concurrent_marking(&self) {
        self.marking_counter.fetch_add(1, Ordering::AcqRel);
    }

    /// Called when a heap leaves incremental or concurrent marking.
    pub fn exit_incremental_or_concurrent_marking(&self) {
        let previous = self.marking_counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "marking counter underflow");
    }

    /// Returns `true` while any heap is marking incrementally or
    /// concurrently.
    #[must_use]
    pub fn is_any_incremental_or_concurrent_marking(&self) -> bool {
        self.marking_counter.load(Ordering::Acquire) > 0
    }

    /// The heap registry.
    #[must_use]
    pub const fn registry(&self) -> &HeapRegistry {
        &self.registry
    }
}

impl Default for GlobalCollectorState {
    fn default() -> Self {
        Self::new()
    }
}
