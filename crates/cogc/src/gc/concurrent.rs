//! Background marking workers.
//!
//! While incremental marking is in progress, worker threads drain the
//! `marking` and `write_barrier` worklists in parallel with the mutator.
//! Each worker uses its own task id, so it only pushes into its own local
//! views. Views are flushed to the global pool whenever a worker runs out of
//! work and when it exits, which makes everything it discovered visible to
//! the mutator before the atomic pause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::gc::marker::DEADLINE_CHECK_INTERVAL;
use crate::gc::marking_visitor::MarkingVisitor;
use crate::gc::worklist::{MarkingWorklists, MAX_NUM_TASKS, MUTATOR_THREAD_ID};
use crate::heap::HeapObjectHeader;

const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Handles of the running marking workers.
#[derive(Debug)]
pub struct ConcurrentMarker {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<usize>>,
}

impl ConcurrentMarker {
    /// Spawns up to `workers` threads with task ids `1..=workers`.
    ///
    /// Threads that cannot be spawned are skipped; the mutator finishes
    /// their share of the work.
    #[must_use]
    pub fn start(worklists: &Arc<MarkingWorklists>, workers: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let workers = workers.min(MAX_NUM_TASKS - 1);
        let mut handles = Vec::with_capacity(workers);

        for task_id in (MUTATOR_THREAD_ID + 1)..=workers {
            let worklists = Arc::clone(worklists);
            let stop = Arc::clone(&stop);
            let spawned = std::thread::Builder::new()
                .name(format!("cogc-marker-{task_id}"))
                .spawn(move || worker_loop(&worklists, task_id, &stop));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    ::tracing::warn!(task_id, error = %_err, "failed to spawn marking worker");
                }
            }
        }

        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_concurrent_workers_started(handles.len());

        Self { stop, handles }
    }

    /// Number of running workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stops all workers and waits for them. Returns the bytes they marked.
    pub fn join(self) -> usize {
        self.stop.store(true, Ordering::Release);
        for handle in &self.handles {
            handle.thread().unpark();
        }
        let mut marked_bytes = 0;
        for handle in self.handles {
            match handle.join() {
                Ok(bytes) => marked_bytes += bytes,
                Err(_) => fatal!("ConcurrentMarker: marking worker panicked"),
            }
        }

        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_concurrent_workers_joined(marked_bytes);

        marked_bytes
    }
}

fn worker_loop(worklists: &MarkingWorklists, task_id: usize, stop: &AtomicBool) -> usize {
    let mut visitor = MarkingVisitor::new(worklists, task_id);

    while !stop.load(Ordering::Acquire) {
        let mut processed = 0usize;

        while let Some(desc) = worklists.marking.pop(task_id) {
            // SAFETY: marking items name payloads of marked, fully
            // constructed objects.
            let header = unsafe { HeapObjectHeader::from_payload(desc.base_object_payload) };
            visitor.account_marked_bytes(header);
            // SAFETY: see above.
            unsafe { (desc.callback)(&mut visitor, desc.base_object_payload) };
            processed += 1;
            if processed % DEADLINE_CHECK_INTERVAL == 0 && stop.load(Ordering::Acquire) {
                break;
            }
        }

        while let Some(address) = worklists.write_barrier.pop(task_id) {
            // SAFETY: write barrier items are headers of marked, fully
            // constructed objects.
            let header = unsafe { &*(address as *const HeapObjectHeader) };
            visitor.account_marked_bytes(header);
            // SAFETY: see above.
            unsafe { (header.gc_info().trace)(&mut visitor, header.payload()) };
            processed += 1;
            if processed % DEADLINE_CHECK_INTERVAL == 0 && stop.load(Ordering::Acquire) {
                break;
            }
        }

        worklists.flush_task(task_id);
        if processed == 0 {
            std::thread::park_timeout(IDLE_WAIT);
        }
    }

    worklists.flush_task(task_id);
    visitor.marked_bytes()
}
