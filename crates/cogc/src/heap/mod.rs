//! The managed heap.
//!
//! A [`HeapBase`] owns one cage with its pages, the allocator, the
//! persistent regions and the marker, and drives collection cycles over
//! them. Heaps are independent of each other; they only share the type
//! table and the [`GlobalCollectorState`].

use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::gc::config::{GcConfig, HeapConfig, MarkingType, StackState, SweepingType};
use crate::gc::marker::{Marker, MarkingStepResult};
use crate::metrics::{Event, PhaseTimer, StatsCollector, SweepResult};
use crate::persistent::PersistentRegion;
use crate::ptr::Gc;
use crate::registry::HeapRegistrySubscription;
use crate::stack::{StackScanner, ThreadStack};
use crate::state::GlobalCollectorState;
use crate::trace::GarbageCollected;
use crate::tracing::GcId;

mod allocator;
pub mod cage;
mod header;
mod object_start_bitmap;
mod page;
mod sweeper;
mod unmarker;

pub use allocator::ObjectAllocator;
pub use header::{
    round_up_to_granularity, HeapObjectHeader, ALLOCATION_GRANULARITY, HEADER_SIZE,
    MIN_OBJECT_SIZE,
};
pub use object_start_bitmap::ObjectStartBitmap;
pub use page::{
    BasePage, PageBackend, PageKind, LARGE_OBJECT_SIZE_THRESHOLD, PAGE_HEADER_SIZE, PAGE_SIZE,
};
pub use sweeper::sweep;
pub use unmarker::{UnmarkConfig, Unmarker};

#[derive(Debug, Clone, Copy)]
struct CycleState {
    config: GcConfig,
    timer: PhaseTimer,
    gc_id: GcId,
}

/// One isolated garbage collected heap.
///
/// Always handed out as `Arc<HeapBase>`; the cage stores a pointer back to
/// the heap for the write barrier.
pub struct HeapBase {
    _subscription: HeapRegistrySubscription,
    marker: Marker,
    strong_persistents: PersistentRegion,
    weak_persistents: PersistentRegion,
    allocator: ObjectAllocator,
    backend: PageBackend,
    stack: Arc<dyn StackScanner>,
    stats: StatsCollector,
    config: HeapConfig,
    state: Arc<GlobalCollectorState>,
    unmarker: Mutex<Option<Unmarker>>,
    marks_are_stale: AtomicBool,
    in_atomic_pause: AtomicBool,
    sweeping: AtomicBool,
    cycle: Mutex<CycleState>,
    #[cfg(feature = "young-generation")]
    remembered_set: Mutex<std::collections::HashSet<usize>>,
}

impl std::fmt::Debug for HeapBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBase")
            .field("cage", &format_args!("{:#x}", self.backend.cage().base()))
            .field("config", &self.config)
            .field("marker", &self.marker)
            .field("committed", &self.backend.committed_size())
            .finish_non_exhaustive()
    }
}

impl HeapBase {
    /// Creates a heap that scans the stack of the collecting thread and
    /// uses the process-wide collector state.
    ///
    /// # Errors
    ///
    /// Returns an error if the cage cannot be reserved.
    pub fn new(config: HeapConfig) -> io::Result<Arc<Self>> {
        Self::with_state(config, GlobalCollectorState::process(), Arc::new(ThreadStack))
    }

    /// Creates a heap with an explicit collector state and stack scanner.
    ///
    /// # Errors
    ///
    /// Returns an error if the cage cannot be reserved.
    pub fn with_state(
        config: HeapConfig,
        state: Arc<GlobalCollectorState>,
        stack: Arc<dyn StackScanner>,
    ) -> io::Result<Arc<Self>> {
        let backend = PageBackend::new()?;
        let heap = Arc::new_cyclic(|weak| Self {
            _subscription: HeapRegistrySubscription::new(Arc::clone(&state), weak.clone()),
            marker: Marker::new(weak.as_ptr()),
            strong_persistents: PersistentRegion::new(false),
            weak_persistents: PersistentRegion::new(true),
            allocator: ObjectAllocator::new(),
            backend,
            stack,
            stats: StatsCollector::new(),
            config,
            state,
            unmarker: Mutex::new(None),
            marks_are_stale: AtomicBool::new(false),
            in_atomic_pause: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            cycle: Mutex::new(CycleState {
                config: GcConfig::default(),
                timer: PhaseTimer::new(),
                gc_id: crate::tracing::internal::next_gc_id(),
            }),
            #[cfg(feature = "young-generation")]
            remembered_set: Mutex::new(std::collections::HashSet::new()),
        });
        heap.backend
            .cage()
            .local_data()
            .heap
            .store(Arc::as_ptr(&heap).cast_mut(), Ordering::Release);

        #[cfg(feature = "tracing")]
        ::tracing::debug!(
            cage = format_args!("{:#x}", heap.backend.cage().base()),
            workers = heap.config.concurrent_marking_workers,
            "heap_created"
        );

        Ok(heap)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The marker of this heap.
    #[inline]
    #[must_use]
    pub const fn marker(&self) -> &Marker {
        &self.marker
    }

    /// The page backend of this heap.
    #[inline]
    #[must_use]
    pub const fn page_backend(&self) -> &PageBackend {
        &self.backend
    }

    /// The object allocator of this heap.
    #[inline]
    #[must_use]
    pub const fn object_allocator(&self) -> &ObjectAllocator {
        &self.allocator
    }

    /// The stack scanner used for conservative root scanning.
    #[must_use]
    pub fn stack(&self) -> &dyn StackScanner {
        &*self.stack
    }

    /// Allocation and cycle statistics.
    #[must_use]
    pub const fn stats_collector(&self) -> &StatsCollector {
        &self.stats
    }

    /// The configuration this heap was created with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The collector state this heap belongs to.
    #[must_use]
    pub fn state(&self) -> &GlobalCollectorState {
        &self.state
    }

    /// Roots of this heap.
    #[must_use]
    pub const fn strong_persistent_region(&self) -> &PersistentRegion {
        &self.strong_persistents
    }

    /// Weak roots of this heap.
    #[must_use]
    pub const fn weak_persistent_region(&self) -> &PersistentRegion {
        &self.weak_persistents
    }

    /// Returns `true` during the atomic pause of a cycle.
    #[must_use]
    pub fn in_atomic_pause(&self) -> bool {
        self.in_atomic_pause.load(Ordering::Acquire)
    }

    /// Returns `true` while a marking cycle is running.
    #[must_use]
    pub fn is_marking(&self) -> bool {
        self.marker.is_marking()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates `value` on the heap.
    pub fn allocate<T: GarbageCollected>(&self, value: T) -> Gc<T> {
        self.allocate_uninit::<T>().finish(value)
    }

    /// Reserves memory for a `T` without initializing it.
    ///
    /// The object stays under construction until
    /// [`UnderConstruction::finish`] is called. Collections in the meantime
    /// keep it alive and never run its trace callback.
    pub fn allocate_uninit<T: GarbageCollected>(&self) -> UnderConstruction<'_, T> {
        self.allocate_uninit_with_additional_bytes(0)
    }

    /// Allocates `value` followed by `additional_bytes` of zeroed trailing
    /// payload, for types that keep inline variable-sized data.
    pub fn allocate_with_additional_bytes<T: GarbageCollected>(
        &self,
        value: T,
        additional_bytes: usize,
    ) -> Gc<T> {
        self.allocate_uninit_with_additional_bytes::<T>(additional_bytes)
            .finish(value)
    }

    fn allocate_uninit_with_additional_bytes<T: GarbageCollected>(
        &self,
        additional_bytes: usize,
    ) -> UnderConstruction<'_, T> {
        const {
            assert!(
                std::mem::align_of::<T>() <= ALLOCATION_GRANULARITY,
                "over-aligned types cannot be allocated on the heap"
            );
        }
        if self.sweeping.load(Ordering::Acquire) {
            fatal!("HeapBase: allocation during sweeping");
        }
        self.stats.allocated_object_size_safepoint();

        let size = Self::object_size::<T>(additional_bytes);
        if u32::try_from(size).is_err() {
            fatal!("HeapBase: object of {size} bytes exceeds the maximum object size");
        }
        let index = crate::GcInfoTrait::<T>::index();
        let header = self.allocator.allocate(&self.backend, size, index);
        self.stats.increase_allocated_object_size(size);

        UnderConstruction {
            heap: self,
            header,
            _marker: PhantomData,
        }
    }

    fn object_size<T>(additional_bytes: usize) -> usize {
        round_up_to_granularity(HEADER_SIZE + std::mem::size_of::<T>() + additional_bytes)
            .max(MIN_OBJECT_SIZE)
    }

    // ========================================================================
    // Explicit management
    // ========================================================================

    /// Returns `true` while a cycle may still look at objects.
    fn in_collection(&self) -> bool {
        self.in_atomic_pause() || self.marker.is_marking() || self.sweeping.load(Ordering::Acquire)
    }

    fn check_owns(&self, header: &HeapObjectHeader) {
        if self.backend.lookup(header.address()).is_none() {
            fatal!(
                "HeapBase: object at {:#x} does not belong to this heap",
                header.payload() as usize
            );
        }
    }

    /// Finalizes `object` and reclaims its memory without waiting for a
    /// cycle.
    ///
    /// Returns `false` and leaves the object alone while a cycle is
    /// running; the next sweep reclaims it once it is unreachable.
    ///
    /// # Safety
    ///
    /// Nothing may use `object` afterwards: no [`Gc`], `Member`,
    /// `Persistent` or raw pointer to it may be dereferenced, and it must
    /// not be reachable from roots or other objects.
    pub unsafe fn free_unreferenced_object<T: GarbageCollected>(&self, object: Gc<T>) -> bool {
        if self.in_collection() {
            return false;
        }
        let header = Gc::header(&object);
        self.check_owns(header);
        #[cfg_attr(
            not(any(feature = "tracing", feature = "young-generation")),
            allow(unused_variables)
        )]
        let (start, end) = (header.address(), header.end());

        sweeper::finalize(header);
        // SAFETY: finalized above; unreferenced per the caller.
        let freed = unsafe { self.allocator.free(&self.backend, header) };
        self.stats.decrease_allocated_object_size(freed);
        #[cfg(feature = "young-generation")]
        self.forget_slots_in(start, end);

        #[cfg(feature = "tracing")]
        ::tracing::trace!(
            address = format_args!("{start:#x}"),
            bytes = end - start,
            "object_freed"
        );
        true
    }

    /// Changes the trailing payload of `object` to `additional_bytes`, as
    /// allocated by [`HeapBase::allocate_with_additional_bytes`], without
    /// moving it. New bytes are zeroed.
    ///
    /// Returns `false` if the object could not be resized in place: while a
    /// cycle is running, for large objects, and when growing an object that
    /// is not the last one allocated.
    pub fn resize<T: GarbageCollected>(&self, object: Gc<T>, additional_bytes: usize) -> bool {
        if self.in_collection() {
            return false;
        }
        let header = Gc::header(&object);
        self.check_owns(header);
        let old_size = header.size();
        if !self
            .allocator
            .try_resize(&self.backend, header, Self::object_size::<T>(additional_bytes))
        {
            return false;
        }

        let new_size = header.size();
        if new_size > old_size {
            self.stats.increase_allocated_object_size(new_size - old_size);
        } else if new_size < old_size {
            self.stats.decrease_allocated_object_size(old_size - new_size);
            #[cfg(feature = "young-generation")]
            self.forget_slots_in(header.end(), header.address() + old_size);
        }
        true
    }

    // ========================================================================
    // Collection
    // ========================================================================

    fn check_not_in_collection(&self) {
        if self.sweeping.load(Ordering::Acquire) {
            fatal!("HeapBase: collection requested during sweeping");
        }
        if self.in_atomic_pause() {
            fatal!("HeapBase: collection requested during the atomic pause");
        }
    }

    /// Runs a full cycle. A running incremental cycle is finalized instead,
    /// using the stack state of `config`.
    pub fn collect_garbage(&self, config: GcConfig) -> Event {
        self.check_not_in_collection();
        if !self.marker.is_marking() {
            let mut atomic = config;
            atomic.marking.marking_type = MarkingType::Atomic;
            self.start_garbage_collection(atomic);
        }
        self.finalize_garbage_collection(config.marking.stack_state)
    }

    /// Starts an incremental or concurrent cycle. Does nothing if a cycle
    /// is running already.
    pub fn start_incremental_garbage_collection(&self, config: GcConfig) {
        debug_assert!(
            config.marking.marking_type.is_incremental_or_concurrent(),
            "incremental collection started with atomic marking"
        );
        self.check_not_in_collection();
        if self.marker.is_marking() {
            return;
        }
        self.start_garbage_collection(config);
    }

    /// Runs one marking step of at most `max_duration`.
    pub fn advance_incremental_garbage_collection(&self, max_duration: Duration) -> MarkingStepResult {
        if !self.marker.is_marking() {
            return MarkingStepResult::Complete;
        }
        let mut timer = self.cycle.lock().timer;
        timer.start();
        let result = self.marker.advance_marking_with_deadline(max_duration);
        timer.end_mark();
        self.cycle.lock().timer = timer;
        result
    }

    /// Finishes the running cycle, if any.
    pub fn finalize_incremental_garbage_collection_if_running(
        &self,
        stack_state: StackState,
    ) -> Option<Event> {
        self.check_not_in_collection();
        if !self.marker.is_marking() {
            return None;
        }
        Some(self.finalize_garbage_collection(stack_state))
    }

    fn start_garbage_collection(&self, config: GcConfig) {
        let gc_id = crate::tracing::internal::next_gc_id();

        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_gc_collection(
            config.marking.marking_type.as_str(),
            gc_id,
        );

        let mut timer = PhaseTimer::new();
        timer.start();
        self.prepare_for_marking();
        timer.end_unmark();

        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase =
                crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Mark);
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_phase_start(
                crate::tracing::internal::GcPhase::Mark,
                self.stats.allocated_object_size(),
            );

            self.marker.start_marking(config.marking);
        }
        timer.end_mark();

        *self.cycle.lock() = CycleState {
            config,
            timer,
            gc_id,
        };
    }

    fn finalize_garbage_collection(&self, stack_state: StackState) -> Event {
        let CycleState {
            config,
            mut timer,
            gc_id: _gc_id,
        } = *self.cycle.lock();

        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_gc_collection(
            config.marking.marking_type.as_str(),
            _gc_id,
        );

        self.in_atomic_pause.store(true, Ordering::Release);
        timer.start();
        {
            #[cfg(feature = "tracing")]
            let _phase = crate::tracing::internal::trace_phase(
                crate::tracing::internal::GcPhase::AtomicPause,
            );

            self.marker.enter_atomic_pause(stack_state);
            let result = self.marker.advance_marking_with_deadline(Duration::MAX);
            debug_assert!(result.is_complete());
            self.marker.finish_marking();
            self.marker.process_weakness();
            self.marker.check_not_fully_constructed();

            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_phase_end(
                crate::tracing::internal::GcPhase::Mark,
                self.marker.marked_bytes(),
            );
        }
        timer.end_mark();

        #[cfg(any(debug_assertions, feature = "verify-heap"))]
        if self.config.verify_marking {
            crate::gc::verifier::MarkingVerifier::new(self).run(stack_state);
        }
        self.in_atomic_pause.store(false, Ordering::Release);

        let result = match config.sweeping_type {
            SweepingType::Atomic => {
                #[cfg(feature = "tracing")]
                let _phase =
                    crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Sweep);

                timer.start();
                self.sweeping.store(true, Ordering::Release);
                let result = sweeper::sweep(&self.backend, &self.allocator);
                self.sweeping.store(false, Ordering::Release);
                timer.end_sweep();

                #[cfg(feature = "tracing")]
                crate::tracing::internal::log_phase_end(
                    crate::tracing::internal::GcPhase::Sweep,
                    result.swept_bytes,
                );
                result
            }
            SweepingType::None => {
                self.marks_are_stale.store(true, Ordering::Release);
                SweepResult {
                    live_bytes: self.marker.marked_bytes(),
                    ..SweepResult::default()
                }
            }
        };

        #[cfg(feature = "young-generation")]
        {
            // Every survivor of a full cycle is old.
            self.backend.cage().local_data().age_table.reset();
            self.remembered_set.lock().clear();
        }

        self.cycle.lock().timer = timer;
        self.stats
            .notify_sweeping_completed(config.sweeping_type, result, &timer)
    }

    // ========================================================================
    // Unmarking
    // ========================================================================

    /// Clears the marks left by a cycle that did not sweep. Finishes a
    /// pending unmarker first.
    pub(crate) fn prepare_for_marking(&self) {
        if let Some(unmarker) = self.unmarker.lock().take() {
            unmarker.finish();
        }
        if self.marks_are_stale.swap(false, Ordering::AcqRel) {
            #[cfg(feature = "tracing")]
            let _phase =
                crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Unmark);

            self.allocator.reset_linear_allocation_buffers(&self.backend);
            Unmarker::start(&self.backend.pages(), UnmarkConfig::Atomic).finish();
        }
    }

    /// Starts clearing stale marks ahead of the next cycle. Does nothing if
    /// the marks are not stale.
    pub fn start_unmarking(&self, config: UnmarkConfig) {
        debug_assert!(!self.marker.is_marking(), "unmarking while marking");
        if !self.marks_are_stale.swap(false, Ordering::AcqRel) {
            return;
        }
        self.allocator.reset_linear_allocation_buffers(&self.backend);
        let unmarker = Unmarker::start(&self.backend.pages(), config);
        *self.unmarker.lock() = Some(unmarker);
    }

    /// Waits for an unmarker started with [`HeapBase::start_unmarking`].
    /// Returns the number of cleared marks.
    pub fn finish_unmarking(&self) -> usize {
        self.unmarker
            .lock()
            .take()
            .map_or(0, Unmarker::finish)
    }

    // ========================================================================
    // Young generation
    // ========================================================================

    /// Records `slot` as a possible old-to-young reference.
    #[cfg(feature = "young-generation")]
    pub fn remember_slot(&self, slot: usize) {
        self.remembered_set.lock().insert(slot);
    }

    #[cfg(feature = "young-generation")]
    fn forget_slots_in(&self, start: usize, end: usize) {
        self.remembered_set
            .lock()
            .retain(|&slot| slot < start || slot >= end);
    }

    /// Number of remembered slots.
    #[cfg(feature = "young-generation")]
    #[must_use]
    pub fn remembered_set_size(&self) -> usize {
        self.remembered_set.lock().len()
    }
}

impl Drop for HeapBase {
    fn drop(&mut self) {
        self.backend
            .cage()
            .local_data()
            .heap
            .store(std::ptr::null_mut(), Ordering::Release);
        self.marker.shutdown();
        if let Some(unmarker) = self.unmarker.get_mut().take() {
            unmarker.finish();
        }
        let _finalized = sweeper::finalize_all(&self.backend, &self.allocator);

        #[cfg(feature = "tracing")]
        ::tracing::debug!(finalized = _finalized, "heap_dropped");
    }
}

// ============================================================================
// UnderConstruction
// ============================================================================

/// An allocated object whose value has not been written yet.
///
/// Dropping it without calling [`UnderConstruction::finish`] turns the
/// memory into free space.
pub struct UnderConstruction<'h, T: GarbageCollected> {
    heap: &'h HeapBase,
    header: NonNull<HeapObjectHeader>,
    _marker: PhantomData<T>,
}

impl<T: GarbageCollected> UnderConstruction<'_, T> {
    /// Header of the object.
    #[must_use]
    pub fn header(&self) -> &HeapObjectHeader {
        // SAFETY: the allocation is owned by `self`.
        unsafe { self.header.as_ref() }
    }

    /// Payload address of the object. The memory is zeroed.
    #[must_use]
    pub fn payload(&self) -> *mut T {
        self.header().payload().cast()
    }

    /// Writes `value` and publishes the object as fully constructed.
    pub fn finish(self, value: T) -> Gc<T> {
        let header = self.header();
        let payload = self.payload();
        // SAFETY: the payload is sized and aligned for `T` and nothing else
        // writes to it while under construction.
        unsafe { payload.write(value) };
        header.mark_as_fully_constructed();

        // A conservative scan may have marked the object with only part of
        // its fields written; trace it again.
        let marker = self.heap.marker();
        if header.is_marked() && marker.is_marking() {
            marker.write_barrier_for_object(header);
        }

        std::mem::forget(self);
        // SAFETY: the object is now fully constructed.
        unsafe { Gc::from_payload(NonNull::new_unchecked(payload)) }
    }
}

impl<T: GarbageCollected> Drop for UnderConstruction<'_, T> {
    fn drop(&mut self) {
        let header = self.header();
        let size = header.size();
        header.convert_to_free();
        self.heap.stats.decrease_allocated_object_size(size);
    }
}

impl<T: GarbageCollected> std::fmt::Debug for UnderConstruction<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnderConstruction")
            .field("header", &self.header())
            .finish_non_exhaustive()
    }
}
