//! The marker.
//!
//! A [`Marker`] drives one marking cycle of its heap through the phases
//! `NotStarted -> Marking -> AtomicPause -> WeaknessProcessing -> Finished`.
//! Marking may run atomically, in mutator steps bounded by a deadline, or
//! with background workers helping between steps.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::gc::concurrent::ConcurrentMarker;
use crate::gc::config::{MarkingConfig, MarkingType, StackState};
use crate::gc::marking_visitor::{MarkingVisitor, StackMarkingVisitor};
use crate::gc::worklist::{MarkingWorklists, Worklist, MUTATOR_THREAD_ID};
use crate::heap::{HeapBase, HeapObjectHeader};
use crate::trace::LivenessBroker;

/// Number of items processed between two deadline checks.
pub const DEADLINE_CHECK_INTERVAL: usize = 1250;

/// Outcome of a bounded marking step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingStepResult {
    /// The worklists were drained.
    Complete,
    /// The deadline passed with work left.
    DeadlineExceeded,
}

impl MarkingStepResult {
    /// Returns `true` for [`MarkingStepResult::Complete`].
    #[must_use]
    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Phases of a marking cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MarkerPhase {
    /// No cycle has run yet.
    NotStarted = 0,
    /// Roots were visited; marking proceeds in steps.
    Marking = 1,
    /// The final, non-interruptible part of marking.
    AtomicPause = 2,
    /// Weak references are being cleared.
    WeaknessProcessing = 3,
    /// The cycle is over.
    Finished = 4,
}

impl MarkerPhase {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    fn from_usize(v: usize) -> Option<Self> {
        match v {
            0 => Some(Self::NotStarted),
            1 => Some(Self::Marking),
            2 => Some(Self::AtomicPause),
            3 => Some(Self::WeaknessProcessing),
            4 => Some(Self::Finished),
            _ => None,
        }
    }

    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Marking => "marking",
            Self::AtomicPause => "atomic_pause",
            Self::WeaknessProcessing => "weakness_processing",
            Self::Finished => "finished",
        }
    }

    const fn is_valid_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::NotStarted | Self::AtomicPause | Self::Finished, Self::Marking)
                | (Self::Marking, Self::AtomicPause)
                | (Self::AtomicPause, Self::WeaknessProcessing)
                | (Self::WeaknessProcessing, Self::Finished)
        )
    }
}

/// Marks the live objects of one heap.
pub struct Marker {
    heap: *const HeapBase,
    worklists: Arc<MarkingWorklists>,
    phase: AtomicUsize,
    config: Mutex<MarkingConfig>,
    marked_bytes: AtomicUsize,
    incremental: AtomicBool,
    concurrent: Mutex<Option<ConcurrentMarker>>,
}

// SAFETY: the heap pointer is only dereferenced while the heap is alive, as
// the marker is owned by it. Everything else is synchronized.
unsafe impl Send for Marker {}
// SAFETY: see Send impl
unsafe impl Sync for Marker {}

impl std::fmt::Debug for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marker")
            .field("phase", &self.phase())
            .field("config", &*self.config.lock())
            .field("marked_bytes", &self.marked_bytes())
            .finish_non_exhaustive()
    }
}

impl Marker {
    /// Creates the marker of `heap`.
    ///
    /// `heap` may not be initialized yet, but must be by the time marking
    /// starts.
    #[must_use]
    pub(crate) fn new(heap: *const HeapBase) -> Self {
        if heap.is_null() {
            fatal!("Marker: created without a heap");
        }
        Self {
            heap,
            worklists: Arc::new(MarkingWorklists::new()),
            phase: AtomicUsize::new(MarkerPhase::NotStarted as usize),
            config: Mutex::new(MarkingConfig::default()),
            marked_bytes: AtomicUsize::new(0),
            incremental: AtomicBool::new(false),
            concurrent: Mutex::new(None),
        }
    }

    #[inline]
    fn heap(&self) -> &HeapBase {
        // SAFETY: the heap owns the marker and outlives it.
        unsafe { &*self.heap }
    }

    // ========================================================================
    // Phases
    // ========================================================================

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> MarkerPhase {
        let raw = self.phase.load(Ordering::Acquire);
        let Some(phase) = MarkerPhase::from_usize(raw) else {
            fatal!("Marker: corrupted phase {raw}");
        };
        phase
    }

    fn transition_to(&self, to: MarkerPhase) {
        let from = self.phase();
        if !MarkerPhase::is_valid_transition(from, to) {
            fatal!("Marker: invalid phase transition {from:?} -> {to:?}");
        }
        self.phase.store(to as usize, Ordering::Release);

        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_phase_transition(to.as_str(), self.marked_bytes());
    }

    /// Returns `true` between the start of marking and the end of the
    /// atomic pause.
    #[must_use]
    pub fn is_marking(&self) -> bool {
        matches!(
            self.phase(),
            MarkerPhase::Marking | MarkerPhase::AtomicPause
        )
    }

    /// The configuration of the current or last cycle.
    #[must_use]
    pub fn config(&self) -> MarkingConfig {
        *self.config.lock()
    }

    /// The worklists of this marker.
    #[must_use]
    pub fn worklists(&self) -> &MarkingWorklists {
        &self.worklists
    }

    /// Bytes marked so far in the current or last cycle.
    #[must_use]
    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes.load(Ordering::Relaxed)
    }

    fn add_marked_bytes(&self, bytes: usize) {
        self.marked_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    // ========================================================================
    // Cycle
    // ========================================================================

    /// Starts a cycle: clears stale marks, visits the roots and, for
    /// incremental configurations, switches the write barrier on.
    pub fn start_marking(&self, config: MarkingConfig) {
        let heap = self.heap();
        heap.prepare_for_marking();

        self.transition_to(MarkerPhase::Marking);
        self.marked_bytes.store(0, Ordering::Relaxed);
        heap.stats_collector()
            .notify_marking_started(config.collection_type, config.marking_type);
        *self.config.lock() = config;

        self.visit_roots(config.stack_state);

        if config.marking_type.is_incremental_or_concurrent() {
            self.enter_incremental_marking();

            #[cfg(feature = "tracing")]
            crate::gc::tracing::log_incremental_start(config.marking_type.as_str());
        }

        if config.marking_type == MarkingType::IncrementalAndConcurrent {
            let workers = heap.config().concurrent_marking_workers;
            if workers > 0 {
                // Roots are only visible to workers once published.
                self.worklists.flush_task(MUTATOR_THREAD_ID);
                *self.concurrent.lock() = Some(ConcurrentMarker::start(&self.worklists, workers));
            }
        }
    }

    fn enter_incremental_marking(&self) {
        if self.incremental.swap(true, Ordering::AcqRel) {
            return;
        }
        let heap = self.heap();
        heap.state().enter_incremental_or_concurrent_marking();
        heap.page_backend()
            .cage()
            .set_incremental_marking_in_progress(true);
    }

    fn exit_incremental_marking(&self) {
        if !self.incremental.swap(false, Ordering::AcqRel) {
            return;
        }
        let heap = self.heap();
        heap.page_backend()
            .cage()
            .set_incremental_marking_in_progress(false);
        heap.state().exit_incremental_or_concurrent_marking();
    }

    fn join_concurrent_marking(&self) {
        let Some(concurrent) = self.concurrent.lock().take() else {
            return;
        };
        let bytes = concurrent.join();
        self.add_marked_bytes(bytes);
    }

    /// Marks everything directly reachable from the persistent region and,
    /// if it may hold heap pointers, the stack.
    fn visit_roots(&self, stack_state: StackState) {
        let heap = self.heap();
        let backend = heap.page_backend();
        heap.object_allocator().reset_linear_allocation_buffers(backend);

        let mut visitor = MarkingVisitor::new(&self.worklists, MUTATOR_THREAD_ID);
        heap.strong_persistent_region().trace(&mut visitor);

        if stack_state == StackState::MayContainHeapPointers {
            let mut stack_visitor = StackMarkingVisitor::new(&mut visitor, backend);
            heap.stack().iterate_pointers(&mut stack_visitor);
        }

        self.add_marked_bytes(visitor.marked_bytes());
    }

    /// Processes worklist items until they are drained or `max_duration`
    /// passes. [`Duration::MAX`] never times out.
    pub fn advance_marking_with_deadline(&self, max_duration: Duration) -> MarkingStepResult {
        debug_assert!(self.is_marking(), "advancing marking outside of a cycle");

        #[cfg(feature = "tracing")]
        let _span = crate::gc::tracing::span_incremental_mark(self.phase().as_str()).entered();

        let deadline = Instant::now().checked_add(max_duration);
        let mut visitor = MarkingVisitor::new(&self.worklists, MUTATOR_THREAD_ID);
        let complete = self.process_worklists_with_deadline(&mut visitor, deadline);
        self.add_marked_bytes(visitor.marked_bytes());

        if !complete && self.concurrent.lock().is_some() {
            // Let the workers see what the mutator found.
            self.worklists.flush_task(MUTATOR_THREAD_ID);
        }

        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_incremental_step(self.marked_bytes(), complete);

        if complete {
            MarkingStepResult::Complete
        } else {
            MarkingStepResult::DeadlineExceeded
        }
    }

    fn process_worklists_with_deadline(
        &self,
        visitor: &mut MarkingVisitor<'_>,
        deadline: Option<Instant>,
    ) -> bool {
        let backend = self.heap().page_backend();
        let worklists = &*self.worklists;
        let in_atomic_pause = self.phase() == MarkerPhase::AtomicPause;

        loop {
            if in_atomic_pause {
                self.process_not_fully_constructed(visitor);
            }

            let drained = drain_with_deadline(
                &worklists.previously_not_fully_constructed,
                deadline,
                |payload| visitor.dynamically_mark_address(backend, payload),
            );
            if !drained {
                return false;
            }

            let drained = drain_with_deadline(&worklists.marking, deadline, |desc| {
                // SAFETY: marking items name payloads of marked, fully
                // constructed objects.
                let header = unsafe { HeapObjectHeader::from_payload(desc.base_object_payload) };
                visitor.account_marked_bytes(header);
                // SAFETY: see above.
                unsafe { (desc.callback)(&mut *visitor, desc.base_object_payload) };
            });
            if !drained {
                return false;
            }

            let drained = drain_with_deadline(&worklists.write_barrier, deadline, |address| {
                // SAFETY: write barrier items are headers of marked, fully
                // constructed objects.
                let header = unsafe { &*(address as *const HeapObjectHeader) };
                visitor.account_marked_bytes(header);
                // SAFETY: see above.
                unsafe { (header.gc_info().trace)(&mut *visitor, header.payload()) };
            });
            if !drained {
                return false;
            }

            if worklists.marking.is_local_view_empty(MUTATOR_THREAD_ID)
                && worklists.marking.is_global_pool_empty()
                && worklists.write_barrier.is_local_view_empty(MUTATOR_THREAD_ID)
                && (!in_atomic_pause || worklists.not_fully_constructed.is_empty())
            {
                return true;
            }
        }
    }

    /// Handles objects that were found under construction, according to
    /// the stack state of the atomic pause.
    fn process_not_fully_constructed(&self, visitor: &mut MarkingVisitor<'_>) {
        let worklists = &*self.worklists;
        let stack_state = self.config.lock().stack_state;
        match stack_state {
            StackState::NoHeapPointers => {
                // Nothing is under construction any more.
                worklists.not_fully_constructed.flush_to_global(MUTATOR_THREAD_ID);
                worklists
                    .previously_not_fully_constructed
                    .merge_global_pool(&worklists.not_fully_constructed);
            }
            StackState::MayContainHeapPointers => {
                let backend = self.heap().page_backend();
                while let Some(payload) = worklists.not_fully_constructed.pop(MUTATOR_THREAD_ID) {
                    visitor.conservatively_mark_address(backend, payload);
                }
            }
        }
    }

    /// Stops concurrent marking, leaves incremental marking and revisits
    /// the roots with `stack_state`.
    pub fn enter_atomic_pause(&self, stack_state: StackState) {
        self.join_concurrent_marking();
        self.exit_incremental_marking();
        self.transition_to(MarkerPhase::AtomicPause);
        self.config.lock().stack_state = stack_state;

        self.visit_roots(stack_state);

        let mut visitor = MarkingVisitor::new(&self.worklists, MUTATOR_THREAD_ID);
        self.process_not_fully_constructed(&mut visitor);
        self.add_marked_bytes(visitor.marked_bytes());
    }

    /// Publishes the marked bytes of the cycle.
    pub fn finish_marking(&self) {
        debug_assert_eq!(self.phase(), MarkerPhase::AtomicPause);
        self.heap()
            .stats_collector()
            .notify_marking_completed(self.marked_bytes());
    }

    /// Clears weak persistents and runs the weak callbacks registered
    /// during marking.
    pub fn process_weakness(&self) {
        self.transition_to(MarkerPhase::WeaknessProcessing);
        debug_assert!(self.worklists.marking.is_empty());

        let mut visitor = MarkingVisitor::new(&self.worklists, MUTATOR_THREAD_ID);
        self.heap().weak_persistent_region().trace(&mut visitor);

        let broker = LivenessBroker::new();
        while let Some(item) = self.worklists.weak_callback.pop(MUTATOR_THREAD_ID) {
            // SAFETY: the callback was registered together with its
            // parameter, which lives in a marked object or a root.
            unsafe { (item.callback)(&broker, item.parameter) };
        }

        debug_assert!(self.worklists.marking.is_empty());
        self.transition_to(MarkerPhase::Finished);
    }

    /// Checks that objects left on the not fully constructed worklist were
    /// marked by other means, then drops them.
    pub(crate) fn check_not_fully_constructed(&self) {
        #[cfg(debug_assertions)]
        {
            let backend = self.heap().page_backend();
            self.worklists
                .not_fully_constructed
                .flush_to_global(MUTATOR_THREAD_ID);
            while let Some(payload) = self.worklists.not_fully_constructed.pop(MUTATOR_THREAD_ID) {
                if let Some(header) = backend.try_object_header_from_inner_address(payload) {
                    debug_assert!(
                        header.is_marked(),
                        "object under construction at {payload:#x} was never marked"
                    );
                }
            }
        }
        self.worklists.not_fully_constructed.clear();
    }

    /// Runs the atomic pause and a full drain.
    pub fn finish_marking_for_testing(&self, stack_state: StackState) {
        self.enter_atomic_pause(stack_state);
        let result = self.advance_marking_with_deadline(Duration::MAX);
        debug_assert!(result.is_complete());
        self.finish_marking();
    }

    /// Drops every worklist item.
    pub fn clear_all_worklists_for_testing(&self) {
        self.worklists.clear();
    }

    // ========================================================================
    // Write barrier entry points
    // ========================================================================

    /// Queues a fully constructed object the barrier just marked.
    pub fn write_barrier_for_object(&self, header: &HeapObjectHeader) {
        self.worklists
            .write_barrier
            .push(MUTATOR_THREAD_ID, header.address());
    }

    /// Defers an object the barrier found under construction. Its mark is
    /// dropped so that it is handled once construction ends.
    pub fn write_barrier_for_in_construction_object(&self, header: &HeapObjectHeader) {
        header.unmark();
        self.worklists
            .not_fully_constructed
            .push(MUTATOR_THREAD_ID, header.payload() as usize);
    }

    /// Stops any ongoing marking. Called when the heap goes away.
    pub(crate) fn shutdown(&self) {
        self.join_concurrent_marking();
        self.exit_incremental_marking();
        self.worklists.clear();
    }
}

impl Drop for Marker {
    fn drop(&mut self) {
        if let Some(concurrent) = self.concurrent.get_mut().take() {
            concurrent.join();
        }
    }
}

fn drain_with_deadline<T>(
    worklist: &Worklist<T>,
    deadline: Option<Instant>,
    mut process: impl FnMut(T),
) -> bool {
    let mut processed = 0usize;
    while let Some(item) = worklist.pop(MUTATOR_THREAD_ID) {
        process(item);
        processed += 1;
        if processed % DEADLINE_CHECK_INTERVAL == 0
            && deadline.is_some_and(|deadline| Instant::now() >= deadline)
        {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use MarkerPhase::*;

        assert!(MarkerPhase::is_valid_transition(NotStarted, Marking));
        assert!(MarkerPhase::is_valid_transition(Marking, AtomicPause));
        assert!(MarkerPhase::is_valid_transition(AtomicPause, WeaknessProcessing));
        assert!(MarkerPhase::is_valid_transition(WeaknessProcessing, Finished));
        assert!(MarkerPhase::is_valid_transition(Finished, Marking));

        assert!(!MarkerPhase::is_valid_transition(NotStarted, AtomicPause));
        assert!(!MarkerPhase::is_valid_transition(Marking, Finished));
        assert!(!MarkerPhase::is_valid_transition(Finished, WeaknessProcessing));
    }

    #[test]
    fn test_phase_round_trips_through_usize() {
        for phase in [
            MarkerPhase::NotStarted,
            MarkerPhase::Marking,
            MarkerPhase::AtomicPause,
            MarkerPhase::WeaknessProcessing,
            MarkerPhase::Finished,
        ] {
            assert_eq!(MarkerPhase::from_usize(phase as usize), Some(phase));
        }
        assert_eq!(MarkerPhase::from_usize(5), None);
    }

    #[test]
    fn test_drain_checks_deadline_in_batches() {
        let worklist = Worklist::new();
        for i in 0..3 * DEADLINE_CHECK_INTERVAL {
            worklist.push(MUTATOR_THREAD_ID, i);
        }
        let expired = Some(Instant::now());

        let mut processed = 0;
        assert!(!drain_with_deadline(&worklist, expired, |_| processed += 1));
        assert_eq!(processed, DEADLINE_CHECK_INTERVAL);

        assert!(drain_with_deadline(&worklist, None, |_| processed += 1));
        assert_eq!(processed, 3 * DEADLINE_CHECK_INTERVAL);
    }
}
