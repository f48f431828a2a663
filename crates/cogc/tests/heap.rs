//! Integration tests for heaps: allocation, full cycles, roots, weak
//! references and statistics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cogc::gc::StackState;
use cogc::heap::{LARGE_OBJECT_SIZE_THRESHOLD, PAGE_SIZE};
use cogc::stack::{ManualStack, StackScanner};
use cogc::{
    AllocationObserver, Gc, GcConfig, GarbageCollected, GlobalCollectorState, HeapBase,
    HeapConfig, Member, Persistent, Trace, UnmarkConfig, WeakMember, WeakPersistent,
};

fn heap() -> (Arc<HeapBase>, Arc<ManualStack>) {
    let stack = Arc::new(ManualStack::new());
    let heap = HeapBase::with_state(
        HeapConfig::default()
            .with_concurrent_marking_workers(1)
            .with_verify_marking(true),
        Arc::new(GlobalCollectorState::new()),
        Arc::clone(&stack) as Arc<dyn StackScanner>,
    )
    .expect("create heap");
    (heap, stack)
}

#[derive(Debug, Trace, GarbageCollected)]
struct Node {
    next: Member<Node>,
    weak: WeakMember<Node>,
}

#[derive(Trace, GarbageCollected)]
struct Blob {
    words: [u64; LARGE_OBJECT_SIZE_THRESHOLD / 8],
}

impl Node {
    fn new() -> Self {
        Self {
            next: Member::null(),
            weak: WeakMember::null(),
        }
    }
}

/// Counts its own finalization in a per-test counter.
struct Counted {
    drops: Arc<AtomicUsize>,
}

unsafe impl Trace for Counted {
    fn trace(&self, _visitor: &mut dyn cogc::Visitor) {}
}

impl Drop for Counted {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

cogc::impl_garbage_collected!(Counted);

#[test]
fn test_unreachable_objects_are_finalized() {
    let (heap, _stack) = heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let kept = heap.allocate(Counted {
        drops: Arc::clone(&drops),
    });
    let root = Persistent::new(&heap, kept);
    for _ in 0..10 {
        heap.allocate(Counted {
            drops: Arc::clone(&drops),
        });
    }

    let event = heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.load(Ordering::SeqCst), 10);
    assert_eq!(event.finalized_objects, 10);
    assert_eq!(event.epoch, 1);

    // Dropping the heap finalizes the survivor.
    drop(root);
    drop(heap);
    assert_eq!(drops.load(Ordering::SeqCst), 11);
}

#[test]
fn test_cleared_persistent_releases_object() {
    let (heap, _stack) = heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let object = heap.allocate(Counted {
        drops: Arc::clone(&drops),
    });
    let root = Persistent::new(&heap, object);

    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(root.get().is_some());

    root.clear();
    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(root.get().is_none());
}

#[test]
fn test_conservative_stack_keeps_object_alive() {
    let (heap, stack) = heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let object = heap.allocate(Counted {
        drops: Arc::clone(&drops),
    });
    // An interior pointer is enough.
    stack.push(Gc::as_ptr(&object) as usize + 4);

    heap.collect_garbage(GcConfig::conservative_atomic());
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_weak_member_is_cleared_when_target_dies() {
    let (heap, _stack) = heap();
    let holder = heap.allocate(Node::new());
    let _root = Persistent::new(&heap, holder);
    let strong_target = heap.allocate(Node::new());
    let weak_target = heap.allocate(Node::new());
    holder.next.set(Some(strong_target));
    holder.weak.set(Some(weak_target));
    strong_target.weak.set(Some(holder));

    heap.collect_garbage(GcConfig::precise_atomic());
    assert!(holder.weak.get().is_none());
    assert_eq!(holder.next.get(), Some(strong_target));
    assert_eq!(strong_target.weak.get(), Some(holder));
}

#[test]
fn test_weak_persistent_follows_liveness() {
    let (heap, _stack) = heap();
    let live = heap.allocate(Node::new());
    let dead = heap.allocate(Node::new());
    let _root = Persistent::new(&heap, live);
    let weak_live = WeakPersistent::new(&heap, live);
    let weak_dead = WeakPersistent::new(&heap, dead);

    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(weak_live.get(), Some(live));
    assert!(weak_dead.get().is_none());
    assert_eq!(heap.weak_persistent_region().len(), 2);
}

#[test]
fn test_collect_garbage_finalizes_running_incremental_cycle() {
    let (heap, _stack) = heap();
    let root = heap.allocate(Node::new());
    let _persistent = Persistent::new(&heap, root);

    heap.start_incremental_garbage_collection(GcConfig::precise_incremental_and_concurrent());
    assert!(heap.is_marking());
    root.next.set(Some(heap.allocate(Node::new())));

    let event = heap.collect_garbage(GcConfig::precise_atomic());
    assert!(!heap.is_marking());
    assert_eq!(event.finalized_objects, 0);
    assert_eq!(event.swept_bytes, 0);
    assert!(root.next.get().is_some());
}

#[test]
fn test_empty_pages_return_to_cage() {
    let (heap, _stack) = heap();
    for _ in 0..(2 * PAGE_SIZE / 32) {
        heap.allocate(Node::new());
    }
    heap.allocate(Blob {
        words: [0; LARGE_OBJECT_SIZE_THRESHOLD / 8],
    });
    let committed = heap.page_backend().committed_size();
    assert!(committed > 2 * PAGE_SIZE);

    let event = heap.collect_garbage(GcConfig::precise_atomic());
    assert!(event.freed_pages >= 3);
    assert_eq!(heap.page_backend().committed_size(), 0);
}

#[test]
fn test_concurrent_unmarking_between_cycles() {
    let (heap, _stack) = heap();
    let objects: Vec<_> = (0..100).map(|_| heap.allocate(Node::new())).collect();
    let roots: Vec<_> = objects.iter().map(|o| Persistent::new(&heap, *o)).collect();

    heap.collect_garbage(GcConfig::precise_atomic().without_sweeping());
    assert!(objects.iter().all(|o| Gc::header(o).is_marked()));

    heap.start_unmarking(UnmarkConfig::Concurrent);
    assert_eq!(heap.finish_unmarking(), 100);
    assert!(objects.iter().all(|o| !Gc::header(o).is_marked()));
    // Nothing is stale any more.
    heap.start_unmarking(UnmarkConfig::Atomic);
    assert_eq!(heap.finish_unmarking(), 0);
    drop(roots);
}

#[derive(Default)]
struct Recorder {
    increased: AtomicUsize,
    resets: AtomicUsize,
}

impl AllocationObserver for Recorder {
    fn allocated_object_size_increased(&self, bytes: usize) {
        self.increased.fetch_add(bytes, Ordering::SeqCst);
    }

    fn allocated_object_size_decreased(&self, _bytes: usize) {}

    fn reset_allocated_object_size(&self, _marked_bytes: usize) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_allocation_observer_sees_allocations_and_cycles() {
    let (heap, _stack) = heap();
    let recorder = Arc::new(Recorder::default());
    heap.stats_collector()
        .register_observer(Arc::clone(&recorder) as Arc<dyn AllocationObserver>);

    for _ in 0..200 {
        heap.allocate(Node::new());
    }
    assert!(recorder.increased.load(Ordering::SeqCst) >= 1024);
    assert!(heap.stats_collector().allocated_object_size() > 0);

    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(recorder.resets.load(Ordering::SeqCst), 1);
    assert_eq!(heap.stats_collector().marked_bytes(), 0);
    assert_eq!(heap.stats_collector().previous_event().epoch, 1);
}

#[test]
#[should_panic(expected = "collection requested during")]
fn test_collection_from_finalizer_is_fatal() {
    struct Reentrant(Arc<HeapBase>);

    unsafe impl Trace for Reentrant {
        fn trace(&self, _visitor: &mut dyn cogc::Visitor) {}
    }

    impl Drop for Reentrant {
        fn drop(&mut self) {
            self.0.collect_garbage(GcConfig::precise_atomic());
        }
    }

    cogc::impl_garbage_collected!(Reentrant);

    let (heap, _stack) = heap();
    // The panic leaves the heap mid-sweep; never tear it down.
    std::mem::forget(Arc::clone(&heap));
    heap.allocate(Reentrant(Arc::clone(&heap)));
    heap.collect_garbage(GcConfig::precise_atomic());
}

#[cfg(feature = "young-generation")]
#[test]
fn test_old_to_young_store_is_remembered() {
    let (heap, _stack) = heap();
    let old = heap.allocate(Node::new());
    let _root = Persistent::new(&heap, old);
    heap.collect_garbage(GcConfig::precise_atomic());

    // Move past the card shared with `old`.
    let filler = cogc::heap::cage::CARD_SIZE / Gc::header(&old).size() + 1;
    for _ in 0..filler {
        heap.allocate(Node::new());
    }
    let young = heap.allocate(Node::new());
    old.next.set(Some(young));
    assert_eq!(heap.remembered_set_size(), 1);

    // Young-to-young stores are not remembered.
    let other = heap.allocate(Node::new());
    young.next.set(Some(other));
    assert_eq!(heap.remembered_set_size(), 1);

    heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(heap.remembered_set_size(), 0);
}

#[test]
fn test_finalize_with_stack_scan_after_incremental_start() {
    let (heap, stack) = heap();
    let drops = Arc::new(AtomicUsize::new(0));
    heap.start_incremental_garbage_collection(GcConfig::precise_incremental());
    let object = heap.allocate(Counted {
        drops: Arc::clone(&drops),
    });
    stack.push(Gc::as_ptr(&object) as usize);

    let event = heap
        .finalize_incremental_garbage_collection_if_running(StackState::MayContainHeapPointers)
        .expect("cycle was running");
    assert_eq!(event.finalized_objects, 0);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
}

#[test]
fn test_free_unreferenced_object_finalizes_and_reuses_memory() {
    let (heap, _stack) = heap();
    let drops = Arc::new(AtomicUsize::new(0));
    let object = heap.allocate(Counted {
        drops: Arc::clone(&drops),
    });
    let address = Gc::as_ptr(&object) as usize;

    // SAFETY: `object` is not used again.
    assert!(unsafe { heap.free_unreferenced_object(object) });
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(heap
        .page_backend()
        .try_object_header_from_inner_address(address)
        .is_none());

    // The memory went back to the allocation buffer.
    let next = heap.allocate(Counted {
        drops: Arc::clone(&drops),
    });
    assert_eq!(Gc::as_ptr(&next) as usize, address);

    let event = heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(event.finalized_objects, 1);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test]
fn test_free_unreferenced_large_object_returns_page() {
    let (heap, _stack) = heap();
    let blob = heap.allocate(Blob {
        words: [0; LARGE_OBJECT_SIZE_THRESHOLD / 8],
    });
    let address = Gc::as_ptr(&blob) as usize;
    assert!(heap.page_backend().lookup(address).is_some());

    // SAFETY: `blob` is not used again.
    assert!(unsafe { heap.free_unreferenced_object(blob) });
    assert!(heap.page_backend().lookup(address).is_none());
    assert_eq!(heap.page_backend().committed_size(), 0);
}

#[test]
fn test_explicit_management_waits_for_running_cycle() {
    let (heap, _stack) = heap();
    let object = heap.allocate_with_additional_bytes(Node::new(), 64);

    heap.start_incremental_garbage_collection(GcConfig::precise_incremental().without_sweeping());
    assert!(!heap.resize(object, 128));
    // SAFETY: the call does nothing while marking.
    assert!(!unsafe { heap.free_unreferenced_object(object) });
    heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");

    assert!(heap.resize(object, 0));
    // SAFETY: `object` is not used again.
    assert!(unsafe { heap.free_unreferenced_object(object) });
}

#[test]
fn test_resize_grows_and_shrinks_in_place() {
    let (heap, _stack) = heap();
    let object = heap.allocate_with_additional_bytes(Node::new(), 16);
    let base = Gc::header(&object).size() - 16;
    let address = Gc::as_ptr(&object) as usize;

    assert!(heap.resize(object, 256));
    assert_eq!(Gc::header(&object).size(), base + 256);
    assert_eq!(Gc::as_ptr(&object) as usize, address);
    // SAFETY: the trailing payload belongs to the object.
    let trailing = unsafe {
        std::slice::from_raw_parts(
            (address + std::mem::size_of::<Node>()) as *const u8,
            256,
        )
    };
    assert!(trailing.iter().all(|&b| b == 0));

    assert!(heap.resize(object, 0));
    assert_eq!(Gc::header(&object).size(), base);

    // Something else follows the object now.
    let other = heap.allocate(Node::new());
    assert!(!heap.resize(object, 64));
    assert_eq!(Gc::header(&object).size(), base);
    assert!(heap.resize(other, 32));

    let _roots = (Persistent::new(&heap, object), Persistent::new(&heap, other));
    let event = heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(event.finalized_objects, 0);
    assert_eq!(event.marked_bytes, base + Gc::header(&other).size());
}

#[test]
fn test_large_objects_are_not_resized() {
    let (heap, _stack) = heap();
    let blob = heap.allocate(Blob {
        words: [0; LARGE_OBJECT_SIZE_THRESHOLD / 8],
    });
    let size = Gc::header(&blob).size();
    assert!(!heap.resize(blob, 64));
    assert_eq!(Gc::header(&blob).size(), size);
}
