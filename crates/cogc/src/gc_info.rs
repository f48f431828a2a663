//! Process-wide type metadata.
//!
//! Every garbage-collected type is described by a [`GcInfo`] record that is
//! registered once into the [`GcInfoTable`] and afterwards referred to by a
//! small [`GcInfoIndex`] stored in each object header. The table is
//! append-only: published entries never change, and once the table grows the
//! pages holding older entries are made read-only.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::LazyLock;

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions, Protection};

use crate::trace::{GarbageCollected, TraceCallback, Visitor};

// ============================================================================
// GcInfo
// ============================================================================

/// Runs the destructor of the object at the given payload address.
pub type FinalizationCallback = unsafe fn(*mut u8);

/// Returns the name of the object at the given payload address.
pub type NameCallback = unsafe fn(*const u8) -> HeapObjectName;

/// Reports whether the object's lifetime is managed outside the heap.
pub type ExternalLifetimeCallback = unsafe fn(*const u8) -> bool;

/// Human readable name of a heap object, used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObjectName {
    /// The name itself.
    pub value: &'static str,
    /// Set when the real name is not available and `value` is a placeholder.
    pub name_was_hidden: bool,
}

/// Per-type metadata record.
///
/// This is the capability table of a garbage-collected type: the collector
/// never dispatches on the Rust type, only on these callbacks.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GcInfo {
    /// Destructor, `None` for types without drop glue.
    pub finalize: Option<FinalizationCallback>,
    /// Reports all outgoing references of an object to a visitor.
    pub trace: TraceCallback,
    /// Produces the object name for diagnostics.
    pub name: NameCallback,
    /// Present for types whose objects may be owned by an external system.
    pub is_externally_managed: Option<ExternalLifetimeCallback>,
    /// The type is reached through trait objects.
    pub has_vtable: bool,
}

impl std::fmt::Debug for GcInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcInfo")
            .field("finalize", &self.finalize.is_some())
            .field("is_externally_managed", &self.is_externally_managed.is_some())
            .field("has_vtable", &self.has_vtable)
            .finish_non_exhaustive()
    }
}

/// Index of a [`GcInfo`] in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcInfoIndex(u16);

impl GcInfoIndex {
    /// Smallest valid index. Zero means "unassigned".
    pub const MIN: u16 = 1;
    /// One past the largest valid index; indices fit into 14 bits.
    pub const MAX: u16 = 1 << 14;

    /// Wraps a raw index without validation.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Returns the raw index.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

// ============================================================================
// GcInfoIndexSlot
// ============================================================================

/// Lazily assigned, published-once index of a type.
///
/// The slot starts at zero. The table stores the assigned index with release
/// semantics while holding its registration lock; readers load it with
/// acquire semantics and only take the lock when the slot is still empty.
#[derive(Debug)]
pub struct GcInfoIndexSlot(AtomicU16);

impl GcInfoIndexSlot {
    /// Creates an empty slot.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU16::new(0))
    }

    /// Returns the published index, if any.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<GcInfoIndex> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            raw => Some(GcInfoIndex(raw)),
        }
    }

    /// Returns the published index, registering `info` into `table` first if
    /// the slot is still empty.
    #[inline]
    pub fn get_or_register(&self, table: &GcInfoTable, info: GcInfo) -> GcInfoIndex {
        match self.get() {
            Some(index) => index,
            None => table.ensure_gc_info_index(info, self),
        }
    }

    fn publish(&self, index: GcInfoIndex) {
        self.0.store(index.0, Ordering::Release);
    }

    /// Returns a leaked slot unique to `T`.
    ///
    /// Used for generic types, which cannot own a `static` per instantiation.
    #[must_use]
    pub fn for_type<T: 'static>() -> &'static Self {
        static SLOTS: LazyLock<Mutex<HashMap<TypeId, &'static GcInfoIndexSlot>>> =
            LazyLock::new(|| Mutex::new(HashMap::new()));

        *SLOTS
            .lock()
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::leak(Box::new(Self::new())))
    }
}

impl Default for GcInfoIndexSlot {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// GcInfoTable
// ============================================================================

/// Number of entries the table wants to start with.
const INITIAL_WANTED_LIMIT: usize = 512;

const ENTRY_SIZE: usize = std::mem::size_of::<GcInfo>();

const MAX_TABLE_SIZE: usize = GcInfoIndex::MAX as usize * ENTRY_SIZE;

struct TableState {
    /// End offset of the prefix that is already read-only.
    read_only_end: usize,
}

/// Append-only table mapping [`GcInfoIndex`] to [`GcInfo`].
///
/// The whole table is reserved up front. `limit` is the usable capacity and
/// doubles on demand; whenever it grows, the pages fully covered by the old
/// capacity are made read-only so that stray writes to published metadata
/// fault immediately.
pub struct GcInfoTable {
    memory: Mmap,
    limit: AtomicUsize,
    current_index: AtomicU16,
    lock: Mutex<TableState>,
}

impl std::fmt::Debug for GcInfoTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcInfoTable")
            .field("limit", &self.limit.load(Ordering::Relaxed))
            .field("current_index", &self.current_index.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl GcInfoTable {
    /// Creates a standalone table.
    ///
    /// # Panics
    ///
    /// Panics if the virtual memory for the table cannot be reserved.
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: the mapping is owned by the table and outlives every
        // reference handed out by `gc_info_from_index`.
        let memory = match unsafe { MmapOptions::new().len(MAX_TABLE_SIZE).map_anon() } {
            Ok(memory) => memory,
            Err(err) => fatal!("GcInfoTable: failed to reserve table memory: {err}"),
        };

        let table = Self {
            memory,
            limit: AtomicUsize::new(0),
            current_index: AtomicU16::new(GcInfoIndex::MIN),
            lock: Mutex::new(TableState { read_only_end: 0 }),
        };
        {
            let mut state = table.lock.lock();
            table.resize(&mut state);
        }
        table
    }

    /// Returns the process-wide table used by [`GcInfoTrait`].
    #[must_use]
    pub fn global() -> &'static Self {
        static INSTANCE: LazyLock<GcInfoTable> = LazyLock::new(GcInfoTable::new);
        &INSTANCE
    }

    fn initial_table_limit() -> usize {
        let page = sys_alloc::page_size();
        let wanted = INITIAL_WANTED_LIMIT * ENTRY_SIZE;
        let limit = wanted.div_ceil(page) * page / ENTRY_SIZE;
        limit.min(GcInfoIndex::MAX as usize)
    }

    fn resize(&self, state: &mut TableState) {
        let old_limit = self.limit.load(Ordering::Relaxed);
        let new_limit = if old_limit == 0 {
            Self::initial_table_limit()
        } else {
            (old_limit * 2).min(GcInfoIndex::MAX as usize)
        };
        if new_limit <= old_limit {
            fatal!(
                "GcInfoTable: cannot grow beyond {} entries",
                GcInfoIndex::MAX
            );
        }

        let page = sys_alloc::page_size();
        let old_end = (old_limit * ENTRY_SIZE) / page * page;
        if old_end > state.read_only_end {
            let delta = old_end - state.read_only_end;
            if let Err(err) = self
                .memory
                .protect(state.read_only_end, delta, Protection::ReadOnly)
            {
                fatal!("GcInfoTable: failed to protect published entries: {err}");
            }
            state.read_only_end = old_end;
        }

        self.limit.store(new_limit, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        ::tracing::debug!(old_limit, new_limit, "gc_info_table_resize");
    }

    /// Assigns an index to `info` and publishes it to `slot`.
    ///
    /// If another thread won the race for the same slot, its index is
    /// returned and `info` is dropped.
    ///
    /// # Panics
    ///
    /// Registering more than `GcInfoIndex::MAX - GcInfoIndex::MIN` types is
    /// fatal.
    pub fn ensure_gc_info_index(&self, info: GcInfo, slot: &GcInfoIndexSlot) -> GcInfoIndex {
        let mut state = self.lock.lock();

        if let Some(index) = slot.get() {
            return index;
        }

        let index = self.current_index.load(Ordering::Relaxed);
        if index >= GcInfoIndex::MAX {
            fatal!(
                "GcInfoTable: exhausted the index space of {} entries",
                GcInfoIndex::MAX - GcInfoIndex::MIN
            );
        }
        if usize::from(index) >= self.limit.load(Ordering::Relaxed) {
            self.resize(&mut state);
        }

        // SAFETY: `index < limit`, so the entry lies in the writable part of
        // the reservation, and no reader can observe it before the release
        // store below.
        unsafe {
            self.entry_ptr(index).write(info);
        }
        self.current_index.store(index + 1, Ordering::Release);

        let index = GcInfoIndex(index);
        slot.publish(index);
        index
    }

    /// Returns the metadata for `index`.
    ///
    /// Lock-free; entries below the current index never change.
    #[inline]
    #[must_use]
    pub fn gc_info_from_index(&self, index: GcInfoIndex) -> &GcInfo {
        debug_assert!(index.0 >= GcInfoIndex::MIN);
        debug_assert!(index.0 < self.current_index.load(Ordering::Acquire));
        // SAFETY: published entries are initialized and immutable.
        unsafe { &*self.entry_ptr(index.0) }
    }

    fn entry_ptr(&self, index: u16) -> *mut GcInfo {
        // SAFETY: `index < GcInfoIndex::MAX`, within the reservation.
        unsafe { self.memory.ptr().cast::<GcInfo>().add(usize::from(index)) }
    }

    /// Number of assigned entries plus the reserved index zero.
    #[must_use]
    pub fn number_of_gc_infos(&self) -> u16 {
        self.current_index.load(Ordering::Acquire)
    }

    #[doc(hidden)]
    #[must_use]
    pub fn limit_for_testing(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    #[doc(hidden)]
    #[must_use]
    pub fn table_slot_for_testing(&self, index: GcInfoIndex) -> *mut GcInfo {
        self.entry_ptr(index.0)
    }
}

impl Default for GcInfoTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// GcInfoTrait
// ============================================================================

/// Builds and caches the [`GcInfo`] of a garbage-collected type.
pub struct GcInfoTrait<T>(PhantomData<fn() -> T>);

impl<T: GarbageCollected> GcInfoTrait<T> {
    /// Returns the index of `T` in the process-wide table, registering it on
    /// first use.
    #[inline]
    #[must_use]
    pub fn index() -> GcInfoIndex {
        T::gc_info_slot().get_or_register(GcInfoTable::global(), Self::info())
    }

    /// Returns the trace callback of `T`.
    #[inline]
    #[must_use]
    pub fn trace_callback() -> TraceCallback {
        trace_trampoline::<T>
    }

    /// Builds the metadata record of `T`.
    #[must_use]
    pub fn info() -> GcInfo {
        GcInfo {
            finalize: if std::mem::needs_drop::<T>() {
                Some(finalize_trampoline::<T>)
            } else {
                None
            },
            trace: trace_trampoline::<T>,
            name: name_trampoline::<T>,
            is_externally_managed: if T::IS_EXTERNALLY_MANAGED {
                Some(external_trampoline::<T>)
            } else {
                None
            },
            has_vtable: T::HAS_VTABLE,
        }
    }
}

unsafe fn trace_trampoline<T: GarbageCollected>(visitor: &mut dyn Visitor, object: *const u8) {
    // SAFETY: the collector only traces fully constructed objects of type `T`.
    unsafe { (*object.cast::<T>()).trace(visitor) }
}

unsafe fn finalize_trampoline<T: GarbageCollected>(object: *mut u8) {
    // SAFETY: called once by the sweeper on a dead, fully constructed `T`.
    unsafe { std::ptr::drop_in_place(object.cast::<T>()) }
}

unsafe fn name_trampoline<T: GarbageCollected>(object: *const u8) -> HeapObjectName {
    // SAFETY: `object` is the payload of a live heap object.
    let header = unsafe { crate::heap::HeapObjectHeader::from_payload(object) };
    if header.is_in_construction() {
        return HeapObjectName {
            value: std::any::type_name::<T>(),
            name_was_hidden: false,
        };
    }
    // SAFETY: fully constructed objects are valid `T`s.
    unsafe { (*object.cast::<T>()).name() }
}

unsafe fn external_trampoline<T: GarbageCollected>(object: *const u8) -> bool {
    // SAFETY: only called on fully constructed objects.
    unsafe { (*object.cast::<T>()).is_externally_managed() }
}
