//! Process heap registry.
//!
//! Keeps track of every live heap so that an arbitrary address can be
//! mapped back to the heap that owns it. Only compiled in with debug
//! assertions or the `heap-registry` feature; otherwise every operation is
//! a no-op and lookups always fail.

use std::sync::{Arc, Weak};

use crate::heap::HeapBase;
use crate::state::GlobalCollectorState;

#[cfg(any(debug_assertions, feature = "heap-registry"))]
mod imp {
    use std::sync::{Arc, Weak};

    use parking_lot::Mutex;

    use crate::heap::HeapBase;

    /// The set of live heaps.
    #[derive(Debug, Default)]
    pub struct HeapRegistry {
        heaps: Mutex<Vec<Weak<HeapBase>>>,
    }

    impl HeapRegistry {
        /// Creates an empty registry.
        #[must_use]
        pub const fn new() -> Self {
            Self {
                heaps: Mutex::new(Vec::new()),
            }
        }

        /// Adds `heap`.
        pub fn register_heap(&self, heap: &Weak<HeapBase>) {
            let mut heaps = self.heaps.lock();
            debug_assert!(!heaps.iter().any(|h| Weak::ptr_eq(h, heap)));
            heaps.push(Weak::clone(heap));
        }

        /// Removes `heap`. The heap must be registered.
        pub fn unregister_heap(&self, heap: &Weak<HeapBase>) {
            let mut heaps = self.heaps.lock();
            let Some(pos) = heaps.iter().position(|h| Weak::ptr_eq(h, heap)) else {
                drop(heaps);
                fatal!("HeapRegistry: unregistering a heap that is not registered");
            };
            heaps.swap_remove(pos);
        }

        /// Returns the live heap whose pages contain `address`.
        #[must_use]
        pub fn try_from_managed_pointer(&self, address: usize) -> Option<Arc<HeapBase>> {
            // Upgraded heaps may be dropped here, which unregisters them.
            self.heaps()
                .into_iter()
                .find(|heap| heap.page_backend().lookup(address).is_some())
        }

        /// Snapshot of the registered heaps that are still alive.
        #[must_use]
        pub fn heaps(&self) -> Vec<Arc<HeapBase>> {
            self.heaps.lock().iter().filter_map(Weak::upgrade).collect()
        }

        /// Number of registered heaps.
        #[must_use]
        pub fn len(&self) -> usize {
            self.heaps.lock().len()
        }

        /// Returns `true` if no heap is registered.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.heaps.lock().is_empty()
        }
    }
}

#[cfg(not(any(debug_assertions, feature = "heap-registry")))]
mod imp {
    use std::sync::{Arc, Weak};

    use crate::heap::HeapBase;

    /// Registry stand-in for release builds without `heap-registry`.
    #[derive(Debug, Default)]
    pub struct HeapRegistry;

    impl HeapRegistry {
        /// Creates the no-op registry.
        #[must_use]
        pub const fn new() -> Self {
            Self
        }

        /// Does nothing.
        pub fn register_heap(&self, _heap: &Weak<HeapBase>) {}

        /// Does nothing.
        pub fn unregister_heap(&self, _heap: &Weak<HeapBase>) {}

        /// Always `None`.
        #[must_use]
        pub fn try_from_managed_pointer(&self, _address: usize) -> Option<Arc<HeapBase>> {
            None
        }

        /// Always empty.
        #[must_use]
        pub fn heaps(&self) -> Vec<Arc<HeapBase>> {
            Vec::new()
        }

        /// Always zero.
        #[must_use]
        pub const fn len(&self) -> usize {
            0
        }

        /// Always `true`.
        #[must_use]
        pub const fn is_empty(&self) -> bool {
            true
        }
    }
}

pub use imp::HeapRegistry;

/// Keeps a heap registered for as long as it lives.
#[derive(Debug)]
pub struct HeapRegistrySubscription {
    state: Arc<GlobalCollectorState>,
    heap: Weak<HeapBase>,
}

impl HeapRegistrySubscription {
    /// Registers `heap` with the registry of `state`.
    #[must_use]
    pub fn new(state: Arc<GlobalCollectorState>, heap: Weak<HeapBase>) -> Self {
        state.registry().register_heap(&heap);
        Self { state, heap }
    }
}

impl Drop for HeapRegistrySubscription {
    fn drop(&mut self) {
        self.state.registry().unregister_heap(&self.heap);
    }
}
