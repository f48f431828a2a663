//! Integration tests for resolving managed pointers to their heap.

#![cfg(any(debug_assertions, feature = "heap-registry"))]

use std::sync::Arc;

use cogc::stack::{ManualStack, StackScanner};
use cogc::{Gc, GarbageCollected, GlobalCollectorState, HeapBase, HeapConfig, Member, Trace};

#[derive(Trace, GarbageCollected)]
struct Cell {
    next: Member<Cell>,
    value: u64,
}

fn heap(state: &Arc<GlobalCollectorState>) -> Arc<HeapBase> {
    HeapBase::with_state(
        HeapConfig::default(),
        Arc::clone(state),
        Arc::new(ManualStack::new()) as Arc<dyn StackScanner>,
    )
    .expect("create heap")
}

fn cell(value: u64) -> Cell {
    Cell {
        next: Member::null(),
        value,
    }
}

#[test]
fn test_payload_resolves_to_owning_heap() {
    let state = Arc::new(GlobalCollectorState::new());
    let first = heap(&state);
    let second = heap(&state);

    let a = first.allocate(cell(1));
    let b = second.allocate(cell(2));
    let registry = state.registry();

    let owner = registry
        .try_from_managed_pointer(Gc::as_ptr(&a) as usize)
        .expect("a is managed");
    assert!(Arc::ptr_eq(&owner, &first));
    let owner = registry
        .try_from_managed_pointer(Gc::as_ptr(&b) as usize + 8)
        .expect("interior pointers resolve too");
    assert!(Arc::ptr_eq(&owner, &second));
    assert_eq!(a.value + b.value, 3);
}

#[test]
fn test_unmanaged_address_resolves_to_nothing() {
    let state = Arc::new(GlobalCollectorState::new());
    let _heap = heap(&state);
    let local = 0u64;

    assert!(state
        .registry()
        .try_from_managed_pointer(std::ptr::addr_of!(local) as usize)
        .is_none());
    assert!(state.registry().try_from_managed_pointer(0).is_none());
}

#[test]
fn test_dropped_heap_is_forgotten() {
    let state = Arc::new(GlobalCollectorState::new());
    let heap = heap(&state);
    let address = Gc::as_ptr(&heap.allocate(cell(3))) as usize;
    assert!(state.registry().try_from_managed_pointer(address).is_some());

    drop(heap);
    assert!(state.registry().is_empty());
    assert!(state.registry().try_from_managed_pointer(address).is_none());
}
