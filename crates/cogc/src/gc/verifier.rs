//! Marking verification.
//!
//! After the atomic pause every object reachable from a marked object must
//! be marked as well. [`MarkingVerifier`] re-derives that independently of
//! the marker by walking all pages and tracing every marked object once.
//! A violation means a missing write barrier or a broken trace
//! implementation and is fatal.

use std::collections::HashSet;

use crate::gc::config::StackState;
use crate::heap::{HeapBase, HeapObjectHeader, PageBackend};
use crate::stack::StackVisitor;
use crate::trace::{TraceDescriptor, Visitor, WeakCallback};

#[derive(Default)]
struct VerificationState {
    parent: Option<usize>,
    in_construction_from_heap: HashSet<usize>,
    in_construction_from_stack: HashSet<usize>,
}

fn describe(header: &HeapObjectHeader) -> String {
    format!("{} ({:#x})", header.name().value, header.payload() as usize)
}

impl VerificationState {
    /// Objects under construction are held to the same standard: the
    /// marker marks them on discovery.
    fn verify_marked(&self, child: &HeapObjectHeader) {
        if child.is_marked() {
            return;
        }
        let parent = self.parent.map_or_else(
            || "<root>".to_owned(),
            // SAFETY: parents are headers of the page walk.
            |parent| describe(unsafe { &*(parent as *const HeapObjectHeader) }),
        );
        fatal!(
            "MarkingVerifier: encountered unmarked object\n  {parent} -> {}",
            describe(child)
        );
    }
}

/// Checks the marks of one heap against its object graph.
pub struct MarkingVerifier<'h> {
    heap: &'h HeapBase,
    state: VerificationState,
}

impl<'h> MarkingVerifier<'h> {
    /// Creates a verifier for `heap`. Must be run after marking and before
    /// sweeping.
    #[must_use]
    pub fn new(heap: &'h HeapBase) -> Self {
        Self {
            heap,
            state: VerificationState::default(),
        }
    }

    /// Verifies every marked object. With
    /// [`StackState::MayContainHeapPointers`] the objects under
    /// construction reachable from the stack must also be exactly the
    /// marked ones.
    pub fn run(mut self, stack_state: StackState) {
        let heap = self.heap;
        let backend = heap.page_backend();
        heap.object_allocator()
            .reset_linear_allocation_buffers(backend);

        #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
        let mut verified = 0usize;
        for page in backend.pages() {
            // SAFETY: no page is freed before sweeping.
            let page = unsafe { page.as_ref() };
            page.for_each_header(|header| {
                if header.is_free() || !header.is_marked() {
                    return;
                }
                self.verify_object(backend, header);
                verified += 1;
            });
        }

        if stack_state == StackState::MayContainHeapPointers {
            let mut scan = StackScan {
                backend,
                found: &mut self.state.in_construction_from_stack,
            };
            heap.stack().iterate_pointers(&mut scan);
            if self.state.in_construction_from_heap != self.state.in_construction_from_stack {
                fatal!(
                    "MarkingVerifier: {} marked objects under construction, {} reachable from the stack",
                    self.state.in_construction_from_heap.len(),
                    self.state.in_construction_from_stack.len()
                );
            }
        }

        #[cfg(feature = "tracing")]
        ::tracing::debug!(verified, "marking_verified");
    }

    fn verify_object(&mut self, backend: &PageBackend, header: &HeapObjectHeader) {
        self.state.parent = Some(header.address());
        if header.is_in_construction() {
            self.state
                .in_construction_from_heap
                .insert(header.address());
            for_each_payload_word(header, |word| {
                if let Some(child) = backend.try_object_header_from_inner_address(word) {
                    self.state.verify_marked(child);
                }
            });
        } else {
            let trace = header.gc_info().trace;
            let mut visitor = VerificationVisitor {
                state: &self.state,
            };
            // SAFETY: the object is fully constructed and not yet swept.
            unsafe { trace(&mut visitor, header.payload().cast_const()) };
        }
        self.state.parent = None;
    }
}

impl std::fmt::Debug for MarkingVerifier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkingVerifier").finish_non_exhaustive()
    }
}

fn for_each_payload_word(header: &HeapObjectHeader, mut f: impl FnMut(usize)) {
    let payload = header.payload() as usize;
    let words = header.payload_size() / std::mem::size_of::<usize>();
    for i in 0..words {
        // SAFETY: the payload is allocated; partially written words are
        // read as opaque values.
        let word = unsafe {
            std::ptr::read_volatile((payload + i * std::mem::size_of::<usize>()) as *const usize)
        };
        f(word);
    }
}

/// Checks the targets reported by a trace callback. Weak references are
/// held to the same standard, as dead targets were cleared already.
struct VerificationVisitor<'s> {
    state: &'s VerificationState,
}

impl Visitor for VerificationVisitor<'_> {
    fn visit(&mut self, _object: *const u8, desc: TraceDescriptor) {
        // SAFETY: descriptors name heap payloads.
        let child = unsafe { HeapObjectHeader::from_payload(desc.base_object_payload) };
        self.state.verify_marked(child);
    }

    fn visit_weak(
        &mut self,
        object: *const u8,
        desc: TraceDescriptor,
        _callback: WeakCallback,
        _slot: *const u8,
    ) {
        self.visit(object, desc);
    }
}

/// Collects the objects under construction reachable from the stack,
/// following their payloads the way the marker does.
struct StackScan<'a> {
    backend: &'a PageBackend,
    found: &'a mut HashSet<usize>,
}

impl StackVisitor for StackScan<'_> {
    fn visit_pointer(&mut self, address: usize) {
        let backend = self.backend;
        let Some(header) = backend.try_object_header_from_inner_address(address) else {
            return;
        };
        if !header.is_in_construction() || !self.found.insert(header.address()) {
            return;
        }
        for_each_payload_word(header, |word| self.visit_pointer(word));
    }
}
