//! Internal macros.

/// Reports an unrecoverable collector error and panics.
///
/// Used for design-limit exhaustion and invariant violations. With the
/// `tracing` feature the message is emitted as an error event first.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        #[cfg(feature = "tracing")]
        ::tracing::error!($($arg)*);
        panic!($($arg)*)
    }};
}

/// Implements [`GarbageCollected`](crate::GarbageCollected) for a
/// non-generic type, giving it a dedicated static index slot.
///
/// ```ignore
/// struct Leaf { value: u64 }
/// unsafe impl Trace for Leaf { fn trace(&self, _: &mut dyn Visitor) {} }
/// cogc::impl_garbage_collected!(Leaf);
/// ```
#[macro_export]
macro_rules! impl_garbage_collected {
    ($ty:ty) => {
        impl $crate::GarbageCollected for $ty {
            fn gc_info_slot() -> &'static $crate::GcInfoIndexSlot {
                static SLOT: $crate::GcInfoIndexSlot = $crate::GcInfoIndexSlot::new();
                &SLOT
            }
        }
    };
}
