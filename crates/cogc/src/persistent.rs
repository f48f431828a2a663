//! Persistent roots.
//!
//! A [`Persistent`] keeps its referent alive from outside the heap, for
//! example from a Rust struct that is not itself garbage collected. A
//! [`WeakPersistent`] refers to an object without keeping it alive and is
//! cleared once its referent dies.
//!
//! Handles register a node in the strong or weak [`PersistentRegion`] of
//! their heap and release it on drop. The marker traces the strong region
//! when it visits the roots and the weak region during weakness
//! processing.

use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::heap::HeapBase;
use crate::ptr::{clear_weak_slot_if_dead, Gc};
use crate::trace::{GarbageCollected, TraceCallback, TraceDescriptor, Visitor};

/// One registered root.
struct PersistentNode {
    payload: AtomicPtr<u8>,
    trace: TraceCallback,
}

impl PersistentNode {
    fn payload(&self) -> *const u8 {
        self.payload.load(Ordering::Acquire).cast_const()
    }
}

/// Identifies a node of a [`PersistentRegion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PersistentId(usize);

#[derive(Default)]
struct RegionState {
    nodes: Vec<Option<Arc<PersistentNode>>>,
    free: Vec<usize>,
}

/// Table of the persistent handles of one heap and one strength.
pub struct PersistentRegion {
    weak: bool,
    state: Mutex<RegionState>,
}

impl fmt::Debug for PersistentRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentRegion")
            .field("weak", &self.weak)
            .field("len", &self.len())
            .finish()
    }
}

impl PersistentRegion {
    /// Creates an empty region. Nodes of a weak region are cleared when
    /// their referent dies.
    #[must_use]
    pub fn new(weak: bool) -> Self {
        Self {
            weak,
            state: Mutex::new(RegionState::default()),
        }
    }

    fn allocate(&self, node: Arc<PersistentNode>) -> PersistentId {
        let mut state = self.state.lock();
        if let Some(index) = state.free.pop() {
            state.nodes[index] = Some(node);
            return PersistentId(index);
        }
        state.nodes.push(Some(node));
        PersistentId(state.nodes.len() - 1)
    }

    fn free(&self, id: PersistentId) {
        let mut state = self.state.lock();
        let Some(slot) = state.nodes.get_mut(id.0) else {
            fatal!("PersistentRegion: freeing unknown node {}", id.0);
        };
        if slot.take().is_none() {
            fatal!("PersistentRegion: node {} freed twice", id.0);
        }
        state.free.push(id.0);
    }

    /// Number of registered handles, empty or not.
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.nodes.len() - state.free.len()
    }

    /// Returns `true` if no handle is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reports every non-empty node to `visitor`, as strong roots for a
    /// strong region and as weak roots for a weak one.
    pub fn trace(&self, visitor: &mut dyn Visitor) {
        // Weak callbacks run with the lock released.
        let nodes: Vec<Arc<PersistentNode>> = self.state.lock().nodes.iter().flatten().cloned().collect();
        for node in nodes {
            let payload = node.payload();
            if payload.is_null() {
                continue;
            }
            let desc = TraceDescriptor {
                base_object_payload: payload,
                callback: node.trace,
            };
            if self.weak {
                let slot = std::ptr::from_ref(&node.payload).cast::<u8>();
                visitor.visit_weak_root(payload, desc, clear_weak_slot_if_dead, slot);
            } else {
                visitor.visit_root(payload, desc);
            }
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

struct Handle<T: GarbageCollected> {
    node: Arc<PersistentNode>,
    heap: Weak<HeapBase>,
    id: PersistentId,
    weak: bool,
    _marker: PhantomData<Gc<T>>,
}

impl<T: GarbageCollected> Handle<T> {
    fn new(heap: &Arc<HeapBase>, value: Option<Gc<T>>, weak: bool) -> Self {
        let node = Arc::new(PersistentNode {
            payload: AtomicPtr::new(to_raw(value)),
            trace: crate::GcInfoTrait::<T>::trace_callback(),
        });
        let region = if weak {
            heap.weak_persistent_region()
        } else {
            heap.strong_persistent_region()
        };
        let id = region.allocate(Arc::clone(&node));
        Self {
            node,
            heap: Arc::downgrade(heap),
            id,
            weak,
            _marker: PhantomData,
        }
    }

    fn get(&self) -> Option<Gc<T>> {
        let ptr = self.node.payload.load(Ordering::Acquire).cast::<T>();
        // SAFETY: the node only ever holds payloads of `T` objects that are
        // kept alive by this handle or were not yet cleared.
        NonNull::new(ptr).map(|ptr| unsafe { Gc::from_payload(ptr) })
    }

    fn set(&self, value: Option<Gc<T>>) {
        self.node.payload.store(to_raw(value), Ordering::Release);
    }
}

impl<T: GarbageCollected> Drop for Handle<T> {
    fn drop(&mut self) {
        let Some(heap) = self.heap.upgrade() else {
            return;
        };
        if self.weak {
            heap.weak_persistent_region().free(self.id);
        } else {
            heap.strong_persistent_region().free(self.id);
        }
    }
}

fn to_raw<T: GarbageCollected>(value: Option<Gc<T>>) -> *mut u8 {
    value.map_or(std::ptr::null_mut(), |gc| Gc::as_ptr(&gc).cast::<u8>().cast_mut())
}

/// A strong root.
pub struct Persistent<T: GarbageCollected> {
    handle: Handle<T>,
}

impl<T: GarbageCollected> Persistent<T> {
    /// Roots `value` in `heap`.
    #[must_use]
    pub fn new(heap: &Arc<HeapBase>, value: Gc<T>) -> Self {
        Self {
            handle: Handle::new(heap, Some(value), false),
        }
    }

    /// Registers an empty root in `heap`.
    #[must_use]
    pub fn empty(heap: &Arc<HeapBase>) -> Self {
        Self {
            handle: Handle::new(heap, None, false),
        }
    }

    /// The rooted object.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        self.handle.get()
    }

    /// Replaces the rooted object.
    pub fn set(&self, value: Option<Gc<T>>) {
        self.handle.set(value);
    }

    /// Stops rooting anything. The handle stays registered.
    pub fn clear(&self) {
        self.handle.set(None);
    }
}

impl<T: GarbageCollected> fmt::Debug for Persistent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Persistent").field(&self.handle.node.payload()).finish()
    }
}

/// A weak root, cleared when its referent dies.
pub struct WeakPersistent<T: GarbageCollected> {
    handle: Handle<T>,
}

impl<T: GarbageCollected> WeakPersistent<T> {
    /// Refers to `value` without keeping it alive.
    #[must_use]
    pub fn new(heap: &Arc<HeapBase>, value: Gc<T>) -> Self {
        Self {
            handle: Handle::new(heap, Some(value), true),
        }
    }

    /// The referent, or `None` once it has been collected.
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        self.handle.get()
    }

    /// Replaces the referent.
    pub fn set(&self, value: Option<Gc<T>>) {
        self.handle.set(value);
    }

    /// Drops the reference.
    pub fn clear(&self) {
        self.handle.set(None);
    }
}

impl<T: GarbageCollected> fmt::Debug for WeakPersistent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakPersistent").field(&self.handle.node.payload()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::WeakCallback;

    #[derive(Default)]
    struct Recorder {
        strong: Vec<usize>,
        weak: Vec<usize>,
    }

    impl Visitor for Recorder {
        fn visit(&mut self, object: *const u8, _desc: TraceDescriptor) {
            self.strong.push(object as usize);
        }

        fn visit_weak(
            &mut self,
            _object: *const u8,
            _desc: TraceDescriptor,
            _callback: WeakCallback,
            _slot: *const u8,
        ) {
        }

        fn visit_weak_root(
            &mut self,
            object: *const u8,
            _desc: TraceDescriptor,
            _callback: WeakCallback,
            _slot: *const u8,
        ) {
            self.weak.push(object as usize);
        }
    }

    unsafe fn no_trace(_: &mut dyn Visitor, _: *const u8) {}

    fn node(payload: usize) -> Arc<PersistentNode> {
        Arc::new(PersistentNode {
            payload: AtomicPtr::new(payload as *mut u8),
            trace: no_trace,
        })
    }

    #[test]
    fn test_region_reuses_freed_nodes() {
        let region = PersistentRegion::new(false);
        let a = region.allocate(node(0x1000));
        let b = region.allocate(node(0x2000));
        assert_eq!(region.len(), 2);

        region.free(a);
        assert_eq!(region.len(), 1);
        let c = region.allocate(node(0x3000));
        assert_eq!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn test_trace_skips_empty_nodes() {
        let strong = PersistentRegion::new(false);
        strong.allocate(node(0x1000));
        strong.allocate(node(0));

        let weak = PersistentRegion::new(true);
        weak.allocate(node(0x2000));

        let mut recorder = Recorder::default();
        strong.trace(&mut recorder);
        weak.trace(&mut recorder);
        assert_eq!(recorder.strong, vec![0x1000]);
        assert_eq!(recorder.weak, vec![0x2000]);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_is_fatal() {
        let region = PersistentRegion::new(false);
        let id = region.allocate(node(0x1000));
        region.free(id);
        region.free(id);
    }
}
