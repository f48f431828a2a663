//! Collection and heap configuration.

use crate::gc::worklist::MAX_NUM_TASKS;

/// Which part of the heap a cycle collects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionType {
    /// Young objects only.
    Minor,
    /// The whole heap.
    #[default]
    Major,
}

/// Whether the stack may hold heap pointers when a phase starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StackState {
    /// The stack is known to hold no heap pointers; no scan is needed.
    NoHeapPointers,
    /// The stack must be scanned conservatively.
    #[default]
    MayContainHeapPointers,
}

/// How marking is scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MarkingType {
    /// All marking happens in one pause.
    #[default]
    Atomic,
    /// Marking is interleaved with the mutator in deadline-bounded steps.
    Incremental,
    /// Like `Incremental`, with background workers marking in parallel.
    IncrementalAndConcurrent,
}

impl MarkingType {
    /// Returns `true` for types that run marking outside the atomic pause.
    #[must_use]
    pub const fn is_incremental_or_concurrent(self) -> bool {
        matches!(self, Self::Incremental | Self::IncrementalAndConcurrent)
    }

    #[cfg(feature = "tracing")]
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Atomic => "atomic",
            Self::Incremental => "incremental",
            Self::IncrementalAndConcurrent => "incremental_and_concurrent",
        }
    }
}

/// When dead objects are reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SweepingType {
    /// Sweep right after the atomic pause.
    #[default]
    Atomic,
    /// Do not sweep. Marks stay in place until the next cycle clears them.
    None,
}

/// Configuration of one marking cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkingConfig {
    /// Which part of the heap is marked.
    pub collection_type: CollectionType,
    /// Whether the stack is scanned.
    pub stack_state: StackState,
    /// How marking is scheduled.
    pub marking_type: MarkingType,
}

impl MarkingConfig {
    /// A configuration with the given scheduling, scanning the stack.
    #[must_use]
    pub const fn new(marking_type: MarkingType, stack_state: StackState) -> Self {
        Self {
            collection_type: CollectionType::Major,
            stack_state,
            marking_type,
        }
    }
}

/// Configuration of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcConfig {
    /// Marking part of the cycle.
    pub marking: MarkingConfig,
    /// Sweeping part of the cycle.
    pub sweeping_type: SweepingType,
}

impl GcConfig {
    const fn with(marking_type: MarkingType, stack_state: StackState) -> Self {
        Self {
            marking: MarkingConfig::new(marking_type, stack_state),
            sweeping_type: SweepingType::Atomic,
        }
    }

    /// Atomic marking with a conservative stack scan, then atomic sweep.
    #[must_use]
    pub const fn conservative_atomic() -> Self {
        Self::with(MarkingType::Atomic, StackState::MayContainHeapPointers)
    }

    /// Atomic marking without a stack scan, then atomic sweep.
    #[must_use]
    pub const fn precise_atomic() -> Self {
        Self::with(MarkingType::Atomic, StackState::NoHeapPointers)
    }

    /// Incremental marking finalized with a conservative stack scan.
    #[must_use]
    pub const fn conservative_incremental() -> Self {
        Self::with(MarkingType::Incremental, StackState::MayContainHeapPointers)
    }

    /// Incremental marking finalized without a stack scan.
    #[must_use]
    pub const fn precise_incremental() -> Self {
        Self::with(MarkingType::Incremental, StackState::NoHeapPointers)
    }

    /// Incremental and concurrent marking finalized with a conservative
    /// stack scan.
    #[must_use]
    pub const fn conservative_incremental_and_concurrent() -> Self {
        Self::with(
            MarkingType::IncrementalAndConcurrent,
            StackState::MayContainHeapPointers,
        )
    }

    /// Incremental and concurrent marking finalized without a stack scan.
    #[must_use]
    pub const fn precise_incremental_and_concurrent() -> Self {
        Self::with(
            MarkingType::IncrementalAndConcurrent,
            StackState::NoHeapPointers,
        )
    }

    /// Same cycle without sweeping.
    #[must_use]
    pub const fn without_sweeping(mut self) -> Self {
        self.sweeping_type = SweepingType::None;
        self
    }
}

/// Configuration of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Number of background threads used for concurrent marking.
    ///
    /// Capped at `MAX_NUM_TASKS - 1`; task id 0 belongs to the mutator.
    pub concurrent_marking_workers: usize,
    /// Run the marking verifier at the end of every atomic pause.
    ///
    /// Only honored when the verifier is compiled in (debug builds or the
    /// `verify-heap` feature).
    pub verify_marking: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        Self {
            concurrent_marking_workers: parallelism.saturating_sub(1).clamp(1, MAX_NUM_TASKS - 1),
            verify_marking: false,
        }
    }
}

impl HeapConfig {
    /// Set the number of concurrent marking workers.
    pub fn set_concurrent_marking_workers(&mut self, workers: usize) {
        self.concurrent_marking_workers = workers.min(MAX_NUM_TASKS - 1);
    }

    /// Enable or disable marking verification.
    pub const fn set_verify_marking(&mut self, enabled: bool) {
        self.verify_marking = enabled;
    }

    /// Builder form of [`HeapConfig::set_concurrent_marking_workers`].
    #[must_use]
    pub fn with_concurrent_marking_workers(mut self, workers: usize) -> Self {
        self.set_concurrent_marking_workers(workers);
        self
    }

    /// Builder form of [`HeapConfig::set_verify_marking`].
    #[must_use]
    pub const fn with_verify_marking(mut self, enabled: bool) -> Self {
        self.verify_marking = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_config_factories() {
        let config = GcConfig::precise_incremental();
        assert_eq!(config.marking.marking_type, MarkingType::Incremental);
        assert_eq!(config.marking.stack_state, StackState::NoHeapPointers);
        assert_eq!(config.sweeping_type, SweepingType::Atomic);

        let config = GcConfig::conservative_atomic().without_sweeping();
        assert_eq!(config.marking.stack_state, StackState::MayContainHeapPointers);
        assert_eq!(config.sweeping_type, SweepingType::None);
    }

    #[test]
    fn test_worker_count_is_capped() {
        let config = HeapConfig::default().with_concurrent_marking_workers(64);
        assert_eq!(config.concurrent_marking_workers, MAX_NUM_TASKS - 1);
        assert!(HeapConfig::default().concurrent_marking_workers >= 1);
        assert!(!HeapConfig::default().verify_marking);
    }

    #[test]
    fn test_incremental_predicate() {
        assert!(!MarkingType::Atomic.is_incremental_or_concurrent());
        assert!(MarkingType::Incremental.is_incremental_or_concurrent());
        assert!(MarkingType::IncrementalAndConcurrent.is_incremental_or_concurrent());
    }
}
