//! Visitors used while marking.

use crate::gc::worklist::{MarkingWorklists, WeakCallbackItem};
use crate::heap::{HeapObjectHeader, PageBackend};
use crate::stack::StackVisitor;
use crate::trace::{LivenessBroker, TraceDescriptor, Visitor, WeakCallback};

/// Marks objects reported by trace callbacks and queues them for tracing.
///
/// Every marking task owns one visitor bound to its task id, so pushes only
/// touch that task's local views.
#[derive(Debug)]
pub struct MarkingVisitor<'a> {
    worklists: &'a MarkingWorklists,
    task_id: usize,
    marked_bytes: usize,
}

impl<'a> MarkingVisitor<'a> {
    /// Creates a visitor for `task_id`.
    #[must_use]
    pub const fn new(worklists: &'a MarkingWorklists, task_id: usize) -> Self {
        Self {
            worklists,
            task_id,
            marked_bytes: 0,
        }
    }

    /// The worklists this visitor pushes to.
    #[must_use]
    pub const fn worklists(&self) -> &'a MarkingWorklists {
        self.worklists
    }

    /// Task id of this visitor.
    #[must_use]
    pub const fn task_id(&self) -> usize {
        self.task_id
    }

    /// Marks `header` and queues it for tracing with `desc`.
    ///
    /// Objects under construction cannot be traced yet; they are deferred
    /// to the not fully constructed worklist without being marked.
    pub fn mark_header(&mut self, header: &HeapObjectHeader, desc: TraceDescriptor) {
        if header.is_in_construction() {
            self.worklists
                .not_fully_constructed
                .push(self.task_id, header.payload() as usize);
        } else if header.try_mark_atomic() {
            self.worklists.marking.push(self.task_id, desc);
        }
    }

    /// Marks the object containing `address`, looking up its trace callback
    /// in the type table. The object must be fully constructed.
    pub fn dynamically_mark_address(&mut self, backend: &PageBackend, address: usize) {
        let Some(header) = backend.try_object_header_from_inner_address(address) else {
            return;
        };
        debug_assert!(
            !header.is_in_construction(),
            "object at {address:#x} is still under construction"
        );
        if header.try_mark_atomic() {
            self.worklists.marking.push(
                self.task_id,
                TraceDescriptor {
                    base_object_payload: header.payload().cast_const(),
                    callback: header.gc_info().trace,
                },
            );
        }
    }

    /// Marks the object containing `address` if it is a heap object.
    ///
    /// Fully constructed objects are queued normally. Objects under
    /// construction are marked and their payload is scanned word by word,
    /// since their trace callback may not run on partially written fields.
    pub fn conservatively_mark_address(&mut self, backend: &PageBackend, address: usize) {
        let Some(header) = backend.try_object_header_from_inner_address(address) else {
            return;
        };
        if header.is_marked() {
            return;
        }
        if !header.is_in_construction() {
            let desc = TraceDescriptor {
                base_object_payload: header.payload().cast_const(),
                callback: header.gc_info().trace,
            };
            self.mark_header(header, desc);
            return;
        }
        if !header.try_mark_atomic() {
            return;
        }
        let payload = header.payload() as usize;
        let words = header.payload_size() / std::mem::size_of::<usize>();
        for i in 0..words {
            // SAFETY: the payload lies inside an allocated object. It may be
            // partially written, so every word is read as an opaque value.
            let word = unsafe {
                std::ptr::read_volatile((payload + i * std::mem::size_of::<usize>()) as *const usize)
            };
            self.conservatively_mark_address(backend, word);
        }
        self.account_marked_bytes(header);
    }

    /// Adds the size of `header` to the bytes marked by this visitor.
    #[inline]
    pub fn account_marked_bytes(&mut self, header: &HeapObjectHeader) {
        self.marked_bytes += header.size();
    }

    /// Bytes marked by this visitor so far.
    #[must_use]
    pub const fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }

    /// Returns and resets the bytes marked so far.
    pub const fn take_marked_bytes(&mut self) -> usize {
        let bytes = self.marked_bytes;
        self.marked_bytes = 0;
        bytes
    }
}

impl Visitor for MarkingVisitor<'_> {
    fn visit(&mut self, _object: *const u8, desc: TraceDescriptor) {
        // SAFETY: descriptors always name the payload of a heap object.
        let header = unsafe { HeapObjectHeader::from_payload(desc.base_object_payload) };
        self.mark_header(header, desc);
    }

    fn visit_weak(
        &mut self,
        _object: *const u8,
        desc: TraceDescriptor,
        callback: WeakCallback,
        slot: *const u8,
    ) {
        // SAFETY: see `visit`.
        let header = unsafe { HeapObjectHeader::from_payload(desc.base_object_payload) };
        // Already marked targets stay alive; the barrier keeps any later
        // store alive as well.
        if !header.is_in_construction() && header.is_marked() {
            return;
        }
        self.register_weak_callback(callback, slot);
    }

    fn visit_weak_root(
        &mut self,
        _object: *const u8,
        desc: TraceDescriptor,
        callback: WeakCallback,
        slot: *const u8,
    ) {
        // SAFETY: see `visit`.
        let header = unsafe { HeapObjectHeader::from_payload(desc.base_object_payload) };
        if header.is_in_construction() {
            return;
        }
        // Weak roots are only visited in the atomic pause, after marking.
        // SAFETY: the callback was registered together with `slot`.
        unsafe { callback(&LivenessBroker::new(), slot) };
    }

    fn register_weak_callback(&mut self, callback: WeakCallback, data: *const u8) {
        self.worklists.weak_callback.push(
            self.task_id,
            WeakCallbackItem {
                callback,
                parameter: data,
            },
        );
    }
}

/// Feeds conservatively scanned stack words into a [`MarkingVisitor`].
pub struct StackMarkingVisitor<'v, 'a> {
    visitor: &'v mut MarkingVisitor<'a>,
    backend: &'v PageBackend,
}

impl<'v, 'a> StackMarkingVisitor<'v, 'a> {
    /// Wraps `visitor`, resolving words through `backend`.
    pub fn new(visitor: &'v mut MarkingVisitor<'a>, backend: &'v PageBackend) -> Self {
        Self { visitor, backend }
    }
}

impl StackVisitor for StackMarkingVisitor<'_, '_> {
    fn visit_pointer(&mut self, address: usize) {
        self.visitor
            .conservatively_mark_address(self.backend, address);
    }
}
