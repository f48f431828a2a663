//! Handles to heap objects.
//!
//! [`Gc`] is a plain, copyable reference that is only traced when it is
//! reachable from a root or another object. [`Member`] and [`WeakMember`]
//! are the mutable reference fields of heap objects: they store their
//! pointer atomically so that concurrent markers can read them, and they run
//! the write barrier on every store.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::gc::write_barrier::{WriteBarrier, WriteBarrierParams, WriteBarrierType};
use crate::heap::HeapObjectHeader;
use crate::trace::{GarbageCollected, LivenessBroker, Trace, TraceDescriptor, Visitor};

/// Distinguished non-null value that is never a heap object.
///
/// Stored in a [`Member`] it means "deliberately empty, but not null"; the
/// barrier, the marker and weakness processing all skip it.
pub const SENTINEL_POINTER: usize = 1;

#[inline]
fn is_null_or_sentinel<T>(ptr: *mut T) -> bool {
    ptr.is_null() || ptr as usize == SENTINEL_POINTER
}

// ============================================================================
// Gc
// ============================================================================

/// A reference to a fully constructed heap object.
pub struct Gc<T: GarbageCollected> {
    ptr: NonNull<T>,
}

impl<T: GarbageCollected> Gc<T> {
    /// Wraps the payload of a fully constructed `T`.
    ///
    /// # Safety
    ///
    /// `payload` must be the payload of a fully constructed heap object of
    /// type `T`.
    #[inline]
    pub(crate) const unsafe fn from_payload(payload: NonNull<T>) -> Self {
        Self { ptr: payload }
    }

    /// Rebuilds a handle from [`Gc::as_ptr`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from a `Gc<T>` whose object has not
    /// been swept.
    #[inline]
    #[must_use]
    pub const unsafe fn from_raw(ptr: *const T) -> Self {
        // SAFETY: guaranteed non-null by the caller.
        unsafe { Self::from_payload(NonNull::new_unchecked(ptr.cast_mut())) }
    }

    /// Payload address of the object.
    #[inline]
    #[must_use]
    pub const fn as_ptr(this: &Self) -> *const T {
        this.ptr.as_ptr()
    }

    /// Returns `true` if both handles refer to the same object.
    #[inline]
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr == other.ptr
    }

    /// Header of the object.
    #[inline]
    #[must_use]
    pub fn header(this: &Self) -> &HeapObjectHeader {
        // SAFETY: a `Gc` always refers to a heap payload.
        unsafe { HeapObjectHeader::from_payload(this.ptr.as_ptr().cast()) }
    }
}

impl<T: GarbageCollected> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: GarbageCollected> Copy for Gc<T> {}

// SAFETY: `T: Send + Sync` is required by `GarbageCollected`.
unsafe impl<T: GarbageCollected> Send for Gc<T> {}
// SAFETY: see Send impl
unsafe impl<T: GarbageCollected> Sync for Gc<T> {}

impl<T: GarbageCollected> Deref for Gc<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the object is fully constructed and kept alive by whoever
        // holds the handle.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: GarbageCollected> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T: GarbageCollected> Eq for Gc<T> {}

impl<T: GarbageCollected + fmt::Debug> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

unsafe impl<T: GarbageCollected> Trace for Gc<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        let payload = self.ptr.as_ptr().cast::<u8>().cast_const();
        visitor.visit(payload, TraceDescriptor::of::<T>(payload));
    }
}

// ============================================================================
// Member
// ============================================================================

/// A strong, mutable reference field of a heap object.
pub struct Member<T: GarbageCollected> {
    raw: AtomicPtr<T>,
    _marker: PhantomData<Gc<T>>,
}

impl<T: GarbageCollected> Member<T> {
    /// An empty member.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            raw: AtomicPtr::new(std::ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Creates a member for a field that is not yet reachable from the heap.
    ///
    /// No barrier runs; the owning object is still under construction.
    #[must_use]
    pub fn new(value: Option<Gc<T>>) -> Self {
        Self {
            raw: AtomicPtr::new(value.map_or(std::ptr::null_mut(), |gc| gc.ptr.as_ptr())),
            _marker: PhantomData,
        }
    }

    /// Current target, `None` when null or the sentinel.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        let ptr = self.raw.load(Ordering::Acquire);
        if is_null_or_sentinel(ptr) {
            return None;
        }
        // SAFETY: non-null members only ever hold payloads of `T`.
        Some(unsafe { Gc::from_payload(NonNull::new_unchecked(ptr)) })
    }

    /// Stores `value` and runs the write barrier.
    pub fn set(&self, value: Option<Gc<T>>) {
        let ptr = value.map_or(std::ptr::null_mut(), |gc| gc.ptr.as_ptr());
        self.raw.store(ptr, Ordering::Release);
        // SAFETY: the value is null or a heap payload.
        unsafe { write_barrier(std::ptr::from_ref(&self.raw).cast(), ptr.cast_const().cast()) };
    }

    /// Stores `value` without any barrier.
    ///
    /// # Safety
    ///
    /// While marking is in progress the new target may be reclaimed even
    /// though it is reachable. Only for fields of objects the marker has not
    /// seen yet, or for tests that exercise the barrier.
    pub unsafe fn set_without_barrier(&self, value: Option<Gc<T>>) {
        let ptr = value.map_or(std::ptr::null_mut(), |gc| gc.ptr.as_ptr());
        self.raw.store(ptr, Ordering::Release);
    }

    /// Resets to null. Erasing a reference never needs a barrier.
    pub fn clear(&self) {
        self.raw.store(std::ptr::null_mut(), Ordering::Release);
    }

    /// Stores the sentinel.
    pub fn set_sentinel(&self) {
        self.raw
            .store(SENTINEL_POINTER as *mut T, Ordering::Release);
    }

    /// Returns `true` if the sentinel is stored.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.raw.load(Ordering::Acquire) as usize == SENTINEL_POINTER
    }
}

impl<T: GarbageCollected> Default for Member<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: GarbageCollected> From<Gc<T>> for Member<T> {
    fn from(value: Gc<T>) -> Self {
        Self::new(Some(value))
    }
}

impl<T: GarbageCollected> fmt::Debug for Member<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Member")
            .field(&self.raw.load(Ordering::Relaxed))
            .finish()
    }
}

unsafe impl<T: GarbageCollected> Trace for Member<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(gc) = self.get() {
            gc.trace(visitor);
        }
    }
}

// ============================================================================
// WeakMember
// ============================================================================

/// A weak, mutable reference field of a heap object.
///
/// Cleared during weakness processing when the target did not survive.
pub struct WeakMember<T: GarbageCollected> {
    raw: AtomicPtr<T>,
    _marker: PhantomData<Gc<T>>,
}

impl<T: GarbageCollected> WeakMember<T> {
    /// An empty weak member.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            raw: AtomicPtr::new(std::ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Creates a weak member without running the barrier.
    #[must_use]
    pub fn new(value: Option<Gc<T>>) -> Self {
        Self {
            raw: AtomicPtr::new(value.map_or(std::ptr::null_mut(), |gc| gc.ptr.as_ptr())),
            _marker: PhantomData,
        }
    }

    /// Current target, `None` when null, the sentinel or cleared.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<Gc<T>> {
        let ptr = self.raw.load(Ordering::Acquire);
        if is_null_or_sentinel(ptr) {
            return None;
        }
        // SAFETY: see `Member::get`.
        Some(unsafe { Gc::from_payload(NonNull::new_unchecked(ptr)) })
    }

    /// Stores `value` and runs the write barrier.
    pub fn set(&self, value: Option<Gc<T>>) {
        let ptr = value.map_or(std::ptr::null_mut(), |gc| gc.ptr.as_ptr());
        self.raw.store(ptr, Ordering::Release);
        // SAFETY: the value is null or a heap payload.
        unsafe { write_barrier(std::ptr::from_ref(&self.raw).cast(), ptr.cast_const().cast()) };
    }

    /// Resets to null.
    pub fn clear(&self) {
        self.raw.store(std::ptr::null_mut(), Ordering::Release);
    }
}

impl<T: GarbageCollected> Default for WeakMember<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: GarbageCollected> fmt::Debug for WeakMember<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakMember")
            .field(&self.raw.load(Ordering::Relaxed))
            .finish()
    }
}

unsafe impl<T: GarbageCollected> Trace for WeakMember<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        let ptr = self.raw.load(Ordering::Acquire);
        if is_null_or_sentinel(ptr) {
            return;
        }
        let payload = ptr.cast::<u8>().cast_const();
        visitor.visit_weak(
            payload,
            TraceDescriptor::of::<T>(payload),
            clear_weak_slot_if_dead,
            std::ptr::from_ref(&self.raw).cast(),
        );
    }
}

/// Weak callback shared by [`WeakMember`] and weak persistents: `slot`
/// points at an `AtomicPtr` that is nulled when its target is dead.
pub(crate) unsafe fn clear_weak_slot_if_dead(broker: &LivenessBroker, slot: *const u8) {
    // SAFETY: registered together with the address of an `AtomicPtr` slot
    // whose owner is alive during weakness processing.
    let slot = unsafe { &*slot.cast::<AtomicPtr<u8>>() };
    if !broker.is_heap_object_alive(slot.load(Ordering::Acquire)) {
        slot.store(std::ptr::null_mut(), Ordering::Release);
    }
}

/// Runs the barrier appropriate for storing `value` into `slot`.
///
/// # Safety
///
/// `value` must be null, the sentinel or a heap payload.
#[inline]
unsafe fn write_barrier(slot: *const u8, value: *const u8) {
    let mut params = WriteBarrierParams::default();
    match WriteBarrier::get_write_barrier_type(slot, value, &mut params) {
        WriteBarrierType::None => {}
        // SAFETY: forwarded from the caller.
        WriteBarrierType::Marking => unsafe { WriteBarrier::dijkstra_marking_barrier(&params, value) },
        // SAFETY: `slot` lies inside the cage when the generational type is
        // returned.
        WriteBarrierType::Generational => unsafe { WriteBarrier::generational_barrier(&params, slot) },
    }
}
