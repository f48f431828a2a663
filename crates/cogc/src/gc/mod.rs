//! Marking: the marker, its worklists and visitors, the write barrier and
//! marking verification.

pub mod concurrent;
pub mod config;
pub mod marker;
pub mod marking_visitor;
#[cfg(any(debug_assertions, feature = "verify-heap"))]
pub mod verifier;
pub mod worklist;
pub mod write_barrier;

#[cfg(feature = "tracing")]
pub mod tracing;

pub use concurrent::ConcurrentMarker;
pub use config::{
    CollectionType, GcConfig, HeapConfig, MarkingConfig, MarkingType, StackState, SweepingType,
};
pub use marker::{Marker, MarkerPhase, MarkingStepResult, DEADLINE_CHECK_INTERVAL};
pub use marking_visitor::{MarkingVisitor, StackMarkingVisitor};
#[cfg(any(debug_assertions, feature = "verify-heap"))]
pub use verifier::MarkingVerifier;
pub use worklist::{MarkingWorklists, WeakCallbackItem, Worklist, MAX_NUM_TASKS, MUTATOR_THREAD_ID};
pub use write_barrier::{HeapConsistency, WriteBarrier, WriteBarrierParams, WriteBarrierType};
