//! Heap statistics.
//!
//! [`StatsCollector`] tracks marked bytes, bytes allocated since the last
//! marking cycle, and per-cycle [`Event`]s. Allocation changes are buffered
//! and only published to [`AllocationObserver`]s at safepoints once they
//! exceed [`ALLOCATION_THRESHOLD_BYTES`].

use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::gc::{CollectionType, MarkingType, SweepingType};

/// Allocation changes below this many bytes are not published.
pub const ALLOCATION_THRESHOLD_BYTES: usize = 1024;

/// Observes the allocated object size of a heap.
///
/// Callbacks run at allocation safepoints on the allocating thread. They may
/// trigger a collection.
pub trait AllocationObserver: Send + Sync {
    /// The allocated object size grew by `bytes`.
    fn allocated_object_size_increased(&self, bytes: usize);

    /// The allocated object size shrank by `bytes`.
    fn allocated_object_size_decreased(&self, bytes: usize);

    /// Marking finished and found `marked_bytes` live bytes; all previously
    /// reported deltas are superseded.
    fn reset_allocated_object_size(&self, marked_bytes: usize) {
        let _ = marked_bytes;
    }
}

/// Record of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Event {
    /// Sequence number of the cycle, starting at 1.
    pub epoch: u64,
    /// Collection type of the cycle.
    pub collection_type: CollectionType,
    /// Marking type the cycle started with.
    pub marking_type: MarkingType,
    /// Sweeping type of the cycle.
    pub sweeping_type: SweepingType,
    /// Bytes found live by marking.
    pub marked_bytes: usize,
    /// Bytes reclaimed by sweeping.
    pub swept_bytes: usize,
    /// Objects whose finalizer ran.
    pub finalized_objects: usize,
    /// Pages returned to the cage.
    pub freed_pages: usize,
    /// Time spent clearing stale marks.
    pub unmark_duration: Duration,
    /// Time spent marking, including the atomic pause.
    pub mark_duration: Duration,
    /// Time spent sweeping.
    pub sweep_duration: Duration,
}

/// Result of a sweep, folded into the cycle's [`Event`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Bytes reclaimed.
    pub swept_bytes: usize,
    /// Bytes kept.
    pub live_bytes: usize,
    /// Objects whose finalizer ran.
    pub finalized_objects: usize,
    /// Pages returned to the cage.
    pub freed_pages: usize,
}

/// Internal helper for capturing phase durations.
///
/// ```
/// use cogc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... marking ...
/// timer.end_mark();
/// assert!(timer.sweep.is_zero());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Accumulated unmark time.
    pub unmark: Duration,
    /// Accumulated mark time.
    pub mark: Duration,
    /// Accumulated sweep time.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            unmark: Duration::ZERO,
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the unmark phase and add its duration.
    pub fn end_unmark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.unmark += start.elapsed();
        }
    }

    /// End a marking step and add its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark += start.elapsed();
        }
    }

    /// End the sweep phase and add its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep += start.elapsed();
        }
    }
}

#[derive(Debug, Default)]
struct Events {
    current: Event,
    previous: Event,
}

/// Per-heap statistics.
pub struct StatsCollector {
    allocated_bytes_since_safepoint: AtomicUsize,
    explicitly_freed_bytes_since_safepoint: AtomicUsize,
    allocated_bytes_since_end_of_marking: AtomicIsize,
    marked_bytes_of_last_marking: AtomicUsize,
    epoch: AtomicU64,
    events: Mutex<Events>,
    observers: Mutex<Vec<Arc<dyn AllocationObserver>>>,
}

impl std::fmt::Debug for StatsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsCollector")
            .field("allocated_object_size", &self.allocated_object_size())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("observers", &self.observers.lock().len())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_possible_wrap)]
#[allow(clippy::cast_sign_loss)]
impl StatsCollector {
    /// Creates a collector with no history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            allocated_bytes_since_safepoint: AtomicUsize::new(0),
            explicitly_freed_bytes_since_safepoint: AtomicUsize::new(0),
            allocated_bytes_since_end_of_marking: AtomicIsize::new(0),
            marked_bytes_of_last_marking: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            events: Mutex::new(Events::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Adds an observer.
    pub fn register_observer(&self, observer: Arc<dyn AllocationObserver>) {
        let mut observers = self.observers.lock();
        debug_assert!(!observers.iter().any(|o| same_observer(o, &observer)));
        observers.push(observer);
    }

    /// Removes an observer added with [`StatsCollector::register_observer`].
    pub fn unregister_observer(&self, observer: &Arc<dyn AllocationObserver>) {
        self.observers.lock().retain(|o| !same_observer(o, observer));
    }

    /// Records `bytes` of newly allocated objects.
    #[inline]
    pub fn increase_allocated_object_size(&self, bytes: usize) {
        self.allocated_bytes_since_safepoint
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records `bytes` of explicitly freed objects.
    #[inline]
    pub fn decrease_allocated_object_size(&self, bytes: usize) {
        self.explicitly_freed_bytes_since_safepoint
            .fetch_add(bytes, Ordering::Relaxed);
    }

    fn safepoint_delta(&self) -> isize {
        self.allocated_bytes_since_safepoint.load(Ordering::Relaxed) as isize
            - self
                .explicitly_freed_bytes_since_safepoint
                .load(Ordering::Relaxed) as isize
    }

    fn reset_safepoint_counters(&self) {
        self.allocated_bytes_since_safepoint
            .store(0, Ordering::Relaxed);
        self.explicitly_freed_bytes_since_safepoint
            .store(0, Ordering::Relaxed);
    }

    /// Publishes buffered allocation changes once they reach
    /// [`ALLOCATION_THRESHOLD_BYTES`].
    pub fn allocated_object_size_safepoint(&self) {
        let delta = self.safepoint_delta();
        if delta.unsigned_abs() < ALLOCATION_THRESHOLD_BYTES {
            return;
        }
        self.allocated_bytes_since_end_of_marking
            .fetch_add(delta, Ordering::Relaxed);

        let saved_epoch = self.epoch.load(Ordering::Acquire);
        let observers = self.observers.lock().clone();
        for observer in &observers {
            // An observer may have triggered a collection, which resets the
            // counters for everyone after it.
            let delta = self.safepoint_delta();
            if delta < 0 {
                observer.allocated_object_size_decreased(delta.unsigned_abs());
            } else {
                observer.allocated_object_size_increased(delta as usize);
            }
        }
        if saved_epoch == self.epoch.load(Ordering::Acquire) {
            self.reset_safepoint_counters();
        }
    }

    /// Starts a new cycle.
    pub fn notify_marking_started(
        &self,
        collection_type: CollectionType,
        marking_type: MarkingType,
    ) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let mut events = self.events.lock();
        events.current = Event {
            epoch,
            collection_type,
            marking_type,
            ..Event::default()
        };
    }

    /// Records the result of marking and resets the allocation counters.
    pub fn notify_marking_completed(&self, marked_bytes: usize) {
        self.events.lock().current.marked_bytes = marked_bytes;
        self.marked_bytes_of_last_marking
            .store(marked_bytes, Ordering::Relaxed);
        self.allocated_bytes_since_end_of_marking
            .store(0, Ordering::Relaxed);
        self.reset_safepoint_counters();
        self.epoch.fetch_add(1, Ordering::AcqRel);

        let observers = self.observers.lock().clone();
        for observer in &observers {
            observer.reset_allocated_object_size(marked_bytes);
        }
    }

    /// Closes the cycle and returns its event.
    pub fn notify_sweeping_completed(
        &self,
        sweeping_type: SweepingType,
        result: SweepResult,
        timer: &PhaseTimer,
    ) -> Event {
        let mut events = self.events.lock();
        let mut event = events.current;
        event.sweeping_type = sweeping_type;
        event.swept_bytes = result.swept_bytes;
        event.finalized_objects = result.finalized_objects;
        event.freed_pages = result.freed_pages;
        event.unmark_duration = timer.unmark;
        event.mark_duration = timer.mark;
        event.sweep_duration = timer.sweep;
        events.previous = event;
        events.current = Event::default();
        event
    }

    /// Bytes marked by the last marking plus the published allocation
    /// changes since then.
    #[must_use]
    pub fn allocated_object_size(&self) -> usize {
        let marked = self.marked_bytes_of_last_marking.load(Ordering::Relaxed) as isize;
        let since = self
            .allocated_bytes_since_end_of_marking
            .load(Ordering::Relaxed);
        (marked + since).max(0) as usize
    }

    /// Bytes marked by the last completed marking.
    #[must_use]
    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes_of_last_marking.load(Ordering::Relaxed)
    }

    /// The event of the last completed cycle.
    #[must_use]
    pub fn previous_event(&self) -> Event {
        self.events.lock().previous
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn same_observer(a: &Arc<dyn AllocationObserver>, b: &Arc<dyn AllocationObserver>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
