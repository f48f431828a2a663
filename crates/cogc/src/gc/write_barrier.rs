//! Write barriers.
//!
//! Every store of a heap reference into a heap object goes through
//! [`WriteBarrier::get_write_barrier_type`], whose fast path only reads the
//! marking flag of the cage the value lives in. The slow paths report the
//! store to the marker of the owning heap so that incremental and
//! concurrent marking never miss an object.

use std::sync::atomic::Ordering;

use crate::gc::marking_visitor::MarkingVisitor;
use crate::gc::worklist::MUTATOR_THREAD_ID;
use crate::heap::cage::{
    CagedHeapLocalData, CAGED_HEAP_RESERVATION_ALIGNMENT, CAGED_HEAP_RESERVATION_SIZE,
};
use crate::heap::HeapBase;
use crate::trace::TraceCallback;

/// Which slow path a store needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBarrierType {
    /// No barrier.
    None,
    /// The owning heap is marking.
    Marking,
    /// The store may create an old-to-young reference.
    Generational,
}

/// Data computed on the fast path and consumed by the slow paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteBarrierParams {
    /// Start of the cage.
    pub start: usize,
    /// Offset of the slot from the cage start.
    pub slot_offset: usize,
    /// Offset of the value from the cage start; zero when unknown.
    pub value_offset: usize,
    #[cfg(debug_assertions)]
    ty: Option<WriteBarrierType>,
}

impl WriteBarrierParams {
    fn caged_heap(&self) -> &CagedHeapLocalData {
        // SAFETY: `start` was derived from a value inside a live cage.
        unsafe { &*(self.start as *const CagedHeapLocalData) }
    }

    fn heap(&self) -> Option<&HeapBase> {
        let heap = self.caged_heap().heap.load(Ordering::Acquire);
        // SAFETY: the heap publishes itself into its cage on creation and
        // outlives every object allocated in the cage.
        unsafe { heap.as_ref() }
    }

    fn set_type(&mut self, ty: WriteBarrierType) -> WriteBarrierType {
        #[cfg(debug_assertions)]
        {
            self.ty = Some(ty);
        }
        ty
    }

    #[inline]
    fn check_type(&self, _ty: WriteBarrierType) {
        #[cfg(debug_assertions)]
        debug_assert_eq!(self.ty, Some(_ty), "slow path does not match barrier type");
    }
}

/// Entry points of the write barrier.
#[derive(Debug)]
pub struct WriteBarrier;

impl WriteBarrier {
    /// Finds the cage of `value` and checks that `slot` lies in it.
    ///
    /// Fails for null, the sentinel and for slots outside the heap such as
    /// stack slots.
    #[inline]
    fn try_get_caged_heap(slot: usize, value: usize, params: &mut WriteBarrierParams) -> bool {
        let start = value & !(CAGED_HEAP_RESERVATION_ALIGNMENT - 1);
        if start == 0 {
            return false;
        }
        let slot_offset = slot.wrapping_sub(start);
        if slot_offset >= CAGED_HEAP_RESERVATION_SIZE {
            return false;
        }
        params.start = start;
        params.slot_offset = slot_offset;
        true
    }

    /// Fast path: decides which barrier storing `value` into `slot` needs.
    #[inline]
    pub fn get_write_barrier_type(
        slot: *const u8,
        value: *const u8,
        params: &mut WriteBarrierParams,
    ) -> WriteBarrierType {
        let (slot, value) = (slot as usize, value as usize);
        if !Self::try_get_caged_heap(slot, value, params) {
            return WriteBarrierType::None;
        }
        if params
            .caged_heap()
            .is_incremental_marking_in_progress
            .load(Ordering::Acquire)
        {
            return params.set_type(WriteBarrierType::Marking);
        }
        if cfg!(feature = "young-generation") {
            params.value_offset = value - params.start;
            return params.set_type(WriteBarrierType::Generational);
        }
        WriteBarrierType::None
    }

    /// Fast path for stores whose value is not known, such as bulk copies
    /// into `slot`.
    #[inline]
    pub fn get_write_barrier_type_for_slot(
        slot: *const u8,
        params: &mut WriteBarrierParams,
    ) -> WriteBarrierType {
        let slot = slot as usize;
        if !Self::try_get_caged_heap(slot, slot, params) {
            return WriteBarrierType::None;
        }
        if params
            .caged_heap()
            .is_incremental_marking_in_progress
            .load(Ordering::Acquire)
        {
            return params.set_type(WriteBarrierType::Marking);
        }
        if cfg!(feature = "young-generation") {
            params.value_offset = 0;
            return params.set_type(WriteBarrierType::Generational);
        }
        WriteBarrierType::None
    }

    /// Dijkstra insertion barrier: marks `value` and queues it.
    ///
    /// # Safety
    ///
    /// `value` must be null, the sentinel or the payload of an object on the
    /// heap `params` was computed for.
    pub unsafe fn dijkstra_marking_barrier(params: &WriteBarrierParams, value: *const u8) {
        params.check_type(WriteBarrierType::Marking);
        let Some(heap) = params.heap() else {
            return;
        };
        let Some(header) = heap
            .page_backend()
            .try_object_header_from_inner_address(value as usize)
        else {
            return;
        };
        if !header.try_mark_atomic() {
            return;
        }
        if header.is_in_construction() {
            heap.marker()
                .write_barrier_for_in_construction_object(header);
        } else {
            heap.marker().write_barrier_for_object(header);
        }
    }

    /// Steele barrier: re-queues `value` for tracing if it is already
    /// marked, for stores that mutate an object the marker may have
    /// traced already.
    ///
    /// # Safety
    ///
    /// As for [`WriteBarrier::dijkstra_marking_barrier`].
    pub unsafe fn steele_marking_barrier(params: &WriteBarrierParams, value: *const u8) {
        params.check_type(WriteBarrierType::Marking);
        let Some(heap) = params.heap() else {
            return;
        };
        let Some(header) = heap
            .page_backend()
            .try_object_header_from_inner_address(value as usize)
        else {
            return;
        };
        if !header.is_marked() {
            return;
        }
        if header.is_in_construction() {
            heap.marker()
                .write_barrier_for_in_construction_object(header);
        } else {
            heap.marker().write_barrier_for_object(header);
        }
    }

    /// Barrier for a bulk store of `count` inline elements starting at
    /// `first`: traces every element with the mutator marking visitor.
    ///
    /// # Safety
    ///
    /// `first` must point at `count` initialized elements of
    /// `element_size` bytes each, all traceable by `trace_callback`.
    pub unsafe fn dijkstra_marking_barrier_range(
        params: &WriteBarrierParams,
        first: *const u8,
        element_size: usize,
        count: usize,
        trace_callback: TraceCallback,
    ) {
        params.check_type(WriteBarrierType::Marking);
        let Some(heap) = params.heap() else {
            return;
        };
        let marker = heap.marker();
        if !marker.is_marking() {
            return;
        }
        let mut visitor = MarkingVisitor::new(marker.worklists(), MUTATOR_THREAD_ID);
        for i in 0..count {
            // SAFETY: guaranteed by the caller.
            unsafe { trace_callback(&mut visitor, first.add(i * element_size)) };
        }
    }

    /// Generational barrier: records `slot` in the remembered set when it
    /// may now hold an old-to-young reference.
    ///
    /// # Safety
    ///
    /// `slot` must lie inside a heap object of the heap `params` was
    /// computed for.
    #[cfg(feature = "young-generation")]
    pub unsafe fn generational_barrier(params: &WriteBarrierParams, slot: *const u8) {
        use crate::heap::cage::Age;

        params.check_type(WriteBarrierType::Generational);
        let local_data = params.caged_heap();
        let age_table = &local_data.age_table;
        if age_table.get_age(params.slot_offset) == Age::Young {
            return;
        }
        let Some(heap) = params.heap() else {
            return;
        };
        // Slots are processed in the atomic pause anyway.
        if heap.in_atomic_pause() {
            return;
        }
        if params.value_offset > 0 && age_table.get_age(params.value_offset) == Age::Old {
            return;
        }
        heap.remember_slot(slot as usize);
    }

    /// Generational barrier stand-in when young generation support is off.
    ///
    /// # Safety
    ///
    /// Always safe; never reached.
    #[cfg(not(feature = "young-generation"))]
    pub const unsafe fn generational_barrier(_params: &WriteBarrierParams, _slot: *const u8) {}
}

/// Barrier entry points for hand-written containers that store heap
/// references without going through [`Member`](crate::Member).
#[derive(Debug)]
pub struct HeapConsistency;

impl HeapConsistency {
    /// See [`WriteBarrier::get_write_barrier_type`].
    #[inline]
    pub fn get_write_barrier_type(
        slot: *const u8,
        value: *const u8,
        params: &mut WriteBarrierParams,
    ) -> WriteBarrierType {
        WriteBarrier::get_write_barrier_type(slot, value, params)
    }

    /// See [`WriteBarrier::dijkstra_marking_barrier`].
    ///
    /// # Safety
    ///
    /// As for [`WriteBarrier::dijkstra_marking_barrier`].
    pub unsafe fn dijkstra_write_barrier(params: &WriteBarrierParams, value: *const u8) {
        // SAFETY: forwarded.
        unsafe { WriteBarrier::dijkstra_marking_barrier(params, value) }
    }

    /// See [`WriteBarrier::dijkstra_marking_barrier_range`].
    ///
    /// # Safety
    ///
    /// As for [`WriteBarrier::dijkstra_marking_barrier_range`].
    pub unsafe fn dijkstra_write_barrier_range(
        params: &WriteBarrierParams,
        first: *const u8,
        element_size: usize,
        count: usize,
        trace_callback: TraceCallback,
    ) {
        // SAFETY: forwarded.
        unsafe {
            WriteBarrier::dijkstra_marking_barrier_range(
                params,
                first,
                element_size,
                count,
                trace_callback,
            );
        }
    }

    /// See [`WriteBarrier::steele_marking_barrier`].
    ///
    /// # Safety
    ///
    /// As for [`WriteBarrier::steele_marking_barrier`].
    pub unsafe fn steele_write_barrier(params: &WriteBarrierParams, value: *const u8) {
        // SAFETY: forwarded.
        unsafe { WriteBarrier::steele_marking_barrier(params, value) }
    }

    /// See [`WriteBarrier::generational_barrier`].
    ///
    /// # Safety
    ///
    /// As for [`WriteBarrier::generational_barrier`].
    pub unsafe fn generational_barrier(params: &WriteBarrierParams, slot: *const u8) {
        // SAFETY: forwarded.
        unsafe { WriteBarrier::generational_barrier(params, slot) }
    }
}
