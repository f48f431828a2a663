//! An incremental and concurrent mark-sweep garbage collector core.
//!
//! `cogc` manages objects in isolated heaps. Each [`HeapBase`] reserves a
//! cage of virtual memory, allocates objects with an 8-byte header into
//! pages inside it, and reclaims unreachable objects with a tracing
//! mark-sweep collector.
//!
//! # Features
//!
//! - **Type table**: every garbage-collected type gets a small
//!   [`GcInfoIndex`] into a process-wide, append-only [`GcInfoTable`] whose
//!   filled pages are write protected
//! - **Three marking modes**: atomic, incremental in deadline-bounded steps,
//!   and incremental with concurrent background workers
//! - **Write barriers**: Dijkstra and Steele marking barriers, plus a
//!   generational barrier behind the `young-generation` feature
//! - **Conservative stack scanning**, including objects still under
//!   construction
//! - **Marking verifier** in debug builds or with the `verify-heap` feature
//!
//! # Quick Start
//!
//! ```ignore
//! use cogc::{GcConfig, GarbageCollected, HeapBase, HeapConfig, Member, Persistent, Trace};
//!
//! #[derive(Trace, GarbageCollected)]
//! struct Node {
//!     next: Member<Node>,
//! }
//!
//! let heap = HeapBase::new(HeapConfig::default())?;
//! let tail = heap.allocate(Node { next: Member::null() });
//! let head = heap.allocate(Node { next: Member::new(Some(tail)) });
//! let root = Persistent::new(&heap, head);
//!
//! heap.collect_garbage(GcConfig::precise_atomic());
//! assert!(root.get().is_some());
//! ```
//!
//! # Incremental Marking
//!
//! ```ignore
//! use std::time::Duration;
//!
//! heap.start_incremental_garbage_collection(GcConfig::precise_incremental_and_concurrent());
//! while !heap
//!     .advance_incremental_garbage_collection(Duration::from_millis(1))
//!     .is_complete()
//! {
//!     // mutator work; every `Member::set` runs the write barrier
//! }
//! heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers);
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

extern crate self as cogc;

#[macro_use]
mod macros;

pub mod gc;
pub mod gc_info;
/// Heap internals: cage, pages, headers, allocation and sweeping.
///
/// Public for testing and for embedders that drive cycles themselves.
pub mod heap;
pub mod metrics;
mod persistent;
mod ptr;
pub mod registry;
pub mod stack;
pub mod state;
mod trace;
pub mod tracing;

pub use gc::{
    CollectionType, GcConfig, HeapConfig, MarkingConfig, MarkingStepResult, MarkingType,
    StackState, SweepingType,
};
pub use gc_info::{
    GcInfo, GcInfoIndex, GcInfoIndexSlot, GcInfoTable, GcInfoTrait, HeapObjectName,
};
pub use heap::{HeapBase, HeapObjectHeader, UnderConstruction, UnmarkConfig};
pub use metrics::{AllocationObserver, Event, StatsCollector};
pub use persistent::{Persistent, PersistentRegion, WeakPersistent};
pub use ptr::{Gc, Member, WeakMember, SENTINEL_POINTER};
pub use state::GlobalCollectorState;
pub use trace::{
    GarbageCollected, LivenessBroker, Trace, TraceCallback, TraceDescriptor, Visitor,
    WeakCallback,
};

// Re-export derive macros when the feature is enabled
#[cfg(feature = "derive")]
pub use cogc_derive::{GarbageCollected, Trace};
