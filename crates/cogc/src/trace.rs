//! Trace trait and Visitor interface.
//!
//! Types that implement [`Trace`] report their outgoing references to a
//! [`Visitor`]. The visitor interface is object safe so that per-type trace
//! callbacks stored in [`GcInfo`](crate::GcInfo) can be invoked uniformly by
//! the marker and the marking verifier.

use std::marker::PhantomData;

use crate::gc_info::{GcInfoIndexSlot, HeapObjectName};
use crate::heap::HeapObjectHeader;
use crate::ptr::SENTINEL_POINTER;

// ============================================================================
// Callbacks
// ============================================================================

/// Traces the object at the given payload address.
pub type TraceCallback = unsafe fn(&mut dyn Visitor, *const u8);

/// Called after marking with the address that was registered alongside it.
pub type WeakCallback = unsafe fn(&LivenessBroker, *const u8);

/// Describes how to trace a heap object.
#[derive(Debug, Clone, Copy)]
pub struct TraceDescriptor {
    /// Payload address of the object that owns the reference target.
    pub base_object_payload: *const u8,
    /// Trace callback of that object.
    pub callback: TraceCallback,
}

// SAFETY: the descriptor is a plain address plus a function pointer; the
// object it names is only dereferenced by the collector.
unsafe impl Send for TraceDescriptor {}
// SAFETY: see Send impl
unsafe impl Sync for TraceDescriptor {}

impl TraceDescriptor {
    /// Builds the descriptor of a `T` at `payload`.
    #[inline]
    #[must_use]
    pub fn of<T: GarbageCollected>(payload: *const u8) -> Self {
        Self {
            base_object_payload: payload,
            callback: crate::GcInfoTrait::<T>::trace_callback(),
        }
    }
}

// ============================================================================
// Core Traits
// ============================================================================

/// A type that can be traced by the garbage collector.
///
/// # Safety
///
/// Implementations **MUST** report every reference to a heap object they
/// hold, directly or through nested values. A missed reference lets the
/// collector reclaim a live object.
///
/// Prefer `#[derive(Trace)]` over manual implementations.
///
/// ```ignore
/// unsafe impl Trace for Pair {
///     fn trace(&self, visitor: &mut dyn Visitor) {
///         self.left.trace(visitor);
///         self.right.trace(visitor);
///     }
/// }
/// ```
pub unsafe trait Trace {
    /// Reports all references held by `self`.
    fn trace(&self, visitor: &mut dyn Visitor);
}

/// Receives the references reported by [`Trace`] implementations.
///
/// Users generally do not implement this trait; the collector provides the
/// marking, stack and verification visitors.
pub trait Visitor {
    /// Visits a strong reference to `object`.
    fn visit(&mut self, object: *const u8, desc: TraceDescriptor);

    /// Visits a weak reference stored at `slot`.
    ///
    /// `callback` is run after marking if the reference must be processed.
    fn visit_weak(
        &mut self,
        object: *const u8,
        desc: TraceDescriptor,
        callback: WeakCallback,
        slot: *const u8,
    );

    /// Visits a strong root.
    fn visit_root(&mut self, object: *const u8, desc: TraceDescriptor) {
        self.visit(object, desc);
    }

    /// Visits a weak root. Weak roots are only traced once marking is done.
    fn visit_weak_root(
        &mut self,
        object: *const u8,
        desc: TraceDescriptor,
        callback: WeakCallback,
        slot: *const u8,
    ) {
        let _ = (object, desc, callback, slot);
    }

    /// Registers `callback` to run with `data` during weakness processing.
    fn register_weak_callback(&mut self, callback: WeakCallback, data: *const u8) {
        let _ = (callback, data);
    }
}

/// A type whose values can be allocated on the managed heap.
///
/// Objects may be read by concurrent marking threads, so they must be
/// `Send + Sync`, and every mutable reference field must use an atomic
/// handle such as [`Member`](crate::Member).
///
/// Implement it with `#[derive(GarbageCollected)]` or
/// [`impl_garbage_collected!`](crate::impl_garbage_collected).
pub trait GarbageCollected: Trace + Send + Sync + 'static {
    /// Objects of this type are reached through trait objects.
    const HAS_VTABLE: bool = false;

    /// Objects of this type may have their lifetime managed externally, see
    /// [`GarbageCollected::is_externally_managed`].
    const IS_EXTERNALLY_MANAGED: bool = false;

    /// Storage for the type's [`GcInfoIndex`](crate::GcInfoIndex).
    #[must_use]
    fn gc_info_slot() -> &'static GcInfoIndexSlot
    where
        Self: Sized,
    {
        GcInfoIndexSlot::for_type::<Self>()
    }

    /// Name used in diagnostics.
    fn name(&self) -> HeapObjectName {
        HeapObjectName {
            value: std::any::type_name::<Self>(),
            name_was_hidden: false,
        }
    }

    /// Returns `true` while another system owns this object, in which case
    /// the sweeper reclaims its memory without running its destructor.
    ///
    /// Only consulted when `IS_EXTERNALLY_MANAGED` is set.
    fn is_externally_managed(&self) -> bool {
        false
    }
}

// ============================================================================
// LivenessBroker
// ============================================================================

/// Answers liveness queries during weakness processing.
#[derive(Debug)]
pub struct LivenessBroker {
    _private: (),
}

impl LivenessBroker {
    pub(crate) const fn new() -> Self {
        Self { _private: () }
    }

    /// Returns whether the object at `payload` survived marking.
    ///
    /// Null and sentinel pointers are reported alive so that they are never
    /// cleared.
    #[must_use]
    pub fn is_heap_object_alive(&self, payload: *const u8) -> bool {
        if payload.is_null() || payload as usize == SENTINEL_POINTER {
            return true;
        }
        // SAFETY: weak references only ever hold payload addresses of heap
        // objects, which stay allocated until sweeping.
        unsafe { HeapObjectHeader::from_payload(payload) }.is_marked()
    }
}

// ============================================================================
// Trace implementations for std types
// ============================================================================

macro_rules! empty_trace {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl Trace for $t {
                #[inline]
                fn trace(&self, _visitor: &mut dyn Visitor) {}
            }
        )*
    };
}

empty_trace!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    str,
    String,
    std::sync::atomic::AtomicBool,
    std::sync::atomic::AtomicU8,
    std::sync::atomic::AtomicU16,
    std::sync::atomic::AtomicU32,
    std::sync::atomic::AtomicU64,
    std::sync::atomic::AtomicUsize,
    std::sync::atomic::AtomicI32,
    std::sync::atomic::AtomicI64,
    std::time::Duration,
);

unsafe impl<T: ?Sized> Trace for PhantomData<T> {
    #[inline]
    fn trace(&self, _visitor: &mut dyn Visitor) {}
}

unsafe impl<T: ?Sized + 'static> Trace for &'static T {
    #[inline]
    fn trace(&self, _visitor: &mut dyn Visitor) {}
}

unsafe impl<T: Trace + ?Sized> Trace for Box<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        (**self).trace(visitor);
    }
}

unsafe impl<T: Trace> Trace for Option<T> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        if let Some(value) = self {
            value.trace(visitor);
        }
    }
}

unsafe impl<T: Trace, E: Trace> Trace for Result<T, E> {
    #[inline]
    fn trace(&self, visitor: &mut dyn Visitor) {
        match self {
            Ok(value) => value.trace(visitor),
            Err(err) => err.trace(visitor),
        }
    }
}

unsafe impl<T: Trace> Trace for [T] {
    fn trace(&self, visitor: &mut dyn Visitor) {
        for item in self {
            item.trace(visitor);
        }
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.as_slice().trace(visitor);
    }
}

unsafe impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, visitor: &mut dyn Visitor) {
        self.as_slice().trace(visitor);
    }
}

macro_rules! tuple_trace {
    ($(($($name:ident),+)),* $(,)?) => {
        $(
            unsafe impl<$($name: Trace),+> Trace for ($($name,)+) {
                #[allow(non_snake_case)]
                fn trace(&self, visitor: &mut dyn Visitor) {
                    let ($($name,)+) = self;
                    $($name.trace(visitor);)+
                }
            }
        )*
    };
}

tuple_trace!(
    (A),
    (A, B),
    (A, B, C),
    (A, B, C, D),
    (A, B, C, D, E),
    (A, B, C, D, E, F),
);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingVisitor {
        strong: Vec<usize>,
    }

    impl Visitor for CountingVisitor {
        fn visit(&mut self, object: *const u8, _desc: TraceDescriptor) {
            self.strong.push(object as usize);
        }

        fn visit_weak(
            &mut self,
            _object: *const u8,
            _desc: TraceDescriptor,
            _callback: WeakCallback,
            _slot: *const u8,
        ) {
        }
    }

    unsafe fn noop(_: &mut dyn Visitor, _: *const u8) {}

    struct FakeRef(usize);

    unsafe impl Trace for FakeRef {
        fn trace(&self, visitor: &mut dyn Visitor) {
            visitor.visit(
                self.0 as *const u8,
                TraceDescriptor {
                    base_object_payload: self.0 as *const u8,
                    callback: noop,
                },
            );
        }
    }

    #[test]
    fn test_containers_forward_to_elements() {
        let value = (
            vec![FakeRef(8), FakeRef(16)],
            Some(Box::new(FakeRef(24))),
            [FakeRef(32)],
            Option::<FakeRef>::None,
            7u32,
        );
        let mut visitor = CountingVisitor::default();
        value.trace(&mut visitor);
        assert_eq!(visitor.strong, vec![8, 16, 24, 32]);
    }

    #[test]
    fn test_primitives_report_nothing() {
        let mut visitor = CountingVisitor::default();
        42u64.trace(&mut visitor);
        String::from("text").trace(&mut visitor);
        "str".trace(&mut visitor);
        assert!(visitor.strong.is_empty());
    }

    #[test]
    fn test_broker_treats_null_and_sentinel_as_alive() {
        let broker = LivenessBroker::new();
        assert!(broker.is_heap_object_alive(std::ptr::null()));
        assert!(broker.is_heap_object_alive(SENTINEL_POINTER as *const u8));
    }
}
