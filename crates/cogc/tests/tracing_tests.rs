//! Integration tests for the `tracing` feature.
//!
//! A capturing layer records span names and event messages emitted during
//! collection cycles.

#![cfg(feature = "tracing")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cogc::gc::StackState;
use cogc::stack::{ManualStack, StackScanner};
use cogc::{
    GarbageCollected, GcConfig, GlobalCollectorState, HeapBase, HeapConfig, Member, Persistent,
    Trace,
};
use tracing::field::{Field, Visit};
use tracing::span::Attributes;
use tracing::{Event, Id, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;

#[derive(Trace, GarbageCollected)]
struct Node {
    next: Member<Node>,
}

#[derive(Clone, Default)]
struct Captured {
    spans: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<Vec<String>>>,
}

impl Captured {
    fn spans(&self) -> Vec<String> {
        self.spans.lock().expect("lock").clone()
    }

    fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("lock").clone()
    }
}

struct MessageVisitor<'a>(&'a mut Option<String>);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for Captured {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.spans
            .lock()
            .expect("lock")
            .push(attrs.metadata().name().to_owned());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut message = None;
        event.record(&mut MessageVisitor(&mut message));
        if let Some(message) = message {
            self.messages.lock().expect("lock").push(message);
        }
    }
}

fn heap(workers: usize) -> Arc<HeapBase> {
    HeapBase::with_state(
        HeapConfig::default().with_concurrent_marking_workers(workers),
        Arc::new(GlobalCollectorState::new()),
        Arc::new(ManualStack::new()) as Arc<dyn StackScanner>,
    )
    .expect("create heap")
}

fn with_capture(f: impl FnOnce()) -> Captured {
    let captured = Captured::default();
    let subscriber = Registry::default().with(captured.clone());
    tracing::subscriber::with_default(subscriber, f);
    captured
}

#[test]
fn test_atomic_cycle_emits_phase_spans() {
    let captured = with_capture(|| {
        let heap = heap(0);
        let node = heap.allocate(Node {
            next: Member::null(),
        });
        let _root = Persistent::new(&heap, node);
        heap.allocate(Node {
            next: Member::null(),
        });
        heap.collect_garbage(GcConfig::precise_atomic());
    });

    let spans = captured.spans();
    assert!(spans.iter().any(|s| s == "gc_collect"), "{spans:?}");
    assert_eq!(spans.iter().filter(|s| *s == "gc_phase").count(), 3, "{spans:?}");

    let messages = captured.messages();
    for expected in ["phase_start", "phase_end", "sweep_start", "heap_dropped"] {
        assert!(messages.iter().any(|m| m == expected), "{expected}: {messages:?}");
    }
}

#[test]
fn test_incremental_steps_are_logged() {
    let captured = with_capture(|| {
        let heap = heap(1);
        let node = heap.allocate(Node {
            next: Member::null(),
        });
        let _root = Persistent::new(&heap, node);

        heap.start_incremental_garbage_collection(GcConfig::precise_incremental_and_concurrent());
        while !heap
            .advance_incremental_garbage_collection(Duration::from_millis(1))
            .is_complete()
        {}
        heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
            .expect("cycle was running");
    });

    let spans = captured.spans();
    assert!(spans.iter().any(|s| s == "incremental_mark"), "{spans:?}");

    let messages = captured.messages();
    for expected in [
        "incremental_start",
        "incremental_step",
        "phase_transition",
        "concurrent_marking_start",
        "concurrent_marking_end",
    ] {
        assert!(messages.iter().any(|m| m == expected), "{expected}: {messages:?}");
    }
}

#[test]
#[should_panic(expected = "allocation during sweeping")]
fn test_fatal_errors_are_reported_before_panicking() {
    struct Allocating(Arc<HeapBase>);

    unsafe impl Trace for Allocating {
        fn trace(&self, _visitor: &mut dyn cogc::Visitor) {}
    }

    impl Drop for Allocating {
        fn drop(&mut self) {
            self.0.allocate(Node {
                next: Member::null(),
            });
        }
    }

    cogc::impl_garbage_collected!(Allocating);

    let captured = Captured::default();
    let subscriber = Registry::default().with(captured.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let heap = heap(0);
    // The panic leaves the heap mid-sweep; never tear it down.
    std::mem::forget(Arc::clone(&heap));
    heap.allocate(Allocating(Arc::clone(&heap)));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        heap.collect_garbage(GcConfig::precise_atomic());
    }));

    let messages = captured.messages();
    assert!(
        messages.iter().any(|m| m.contains("allocation during sweeping")),
        "{messages:?}"
    );
    if let Err(payload) = result {
        std::panic::resume_unwind(payload);
    }
}
