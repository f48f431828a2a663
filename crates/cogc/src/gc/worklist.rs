//! Marking worklists.
//!
//! A [`Worklist`] gives every marking task a private local view made of a
//! push segment and a pop segment, plus a shared global pool of full
//! segments. Tasks only contend on their own view's lock and on the
//! lock-free global pool. Task [`MUTATOR_THREAD_ID`] belongs to the mutator.

use std::mem;

use crossbeam::utils::CachePadded;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::trace::{TraceDescriptor, WeakCallback};

/// Number of local views of every worklist.
pub const MAX_NUM_TASKS: usize = 4;

/// Task id of the mutator thread.
pub const MUTATOR_THREAD_ID: usize = 0;

const SEGMENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct Local<T> {
    push: Vec<T>,
    pop: Vec<T>,
}

impl<T> Local<T> {
    const fn new() -> Self {
        Self {
            push: Vec::new(),
            pop: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.push.is_empty() && self.pop.is_empty()
    }
}

/// A segmented multi-producer, multi-consumer worklist.
#[derive(Debug)]
pub struct Worklist<T> {
    locals: [CachePadded<Mutex<Local<T>>>; MAX_NUM_TASKS],
    global: SegQueue<Vec<T>>,
}

impl<T> Worklist<T> {
    /// Creates an empty worklist.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locals: std::array::from_fn(|_| CachePadded::new(Mutex::new(Local::new()))),
            global: SegQueue::new(),
        }
    }

    /// Pushes `item` to the local view of `task`. Full push segments are
    /// published to the global pool.
    pub fn push(&self, task: usize, item: T) {
        let mut local = self.locals[task].lock();
        if local.push.len() >= SEGMENT_CAPACITY {
            let full = mem::replace(&mut local.push, Vec::with_capacity(SEGMENT_CAPACITY));
            self.global.push(full);
        }
        local.push.push(item);
    }

    /// Pops an item for `task`, refilling its view from the global pool
    /// when the view is empty.
    pub fn pop(&self, task: usize) -> Option<T> {
        let mut local = self.locals[task].lock();
        if let Some(item) = local.pop.pop() {
            return Some(item);
        }
        if !local.push.is_empty() {
            let local = &mut *local;
            mem::swap(&mut local.push, &mut local.pop);
            return local.pop.pop();
        }
        let segment = self.global.pop()?;
        local.pop = segment;
        local.pop.pop()
    }

    /// Returns `true` if the local view of `task` holds no items.
    #[must_use]
    pub fn is_local_view_empty(&self, task: usize) -> bool {
        self.locals[task].lock().is_empty()
    }

    /// Returns `true` if the global pool holds no segments.
    #[must_use]
    pub fn is_global_pool_empty(&self) -> bool {
        self.global.is_empty()
    }

    /// Returns `true` if no view and no pool segment holds an item.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.is_global_pool_empty()
            && (0..MAX_NUM_TASKS).all(|task| self.is_local_view_empty(task))
    }

    /// Publishes everything in the local view of `task` to the global pool.
    pub fn flush_to_global(&self, task: usize) {
        let mut local = self.locals[task].lock();
        for segment in [mem::take(&mut local.push), mem::take(&mut local.pop)] {
            if !segment.is_empty() {
                self.global.push(segment);
            }
        }
    }

    /// Moves every segment of `other`'s global pool into this pool.
    pub fn merge_global_pool(&self, other: &Self) {
        while let Some(segment) = other.global.pop() {
            self.global.push(segment);
        }
    }

    /// Drops all items.
    pub fn clear(&self) {
        for local in &self.locals {
            let mut local = local.lock();
            local.push.clear();
            local.pop.clear();
        }
        while self.global.pop().is_some() {}
    }

    /// Number of items in all views and the pool. Not linearizable.
    #[must_use]
    pub fn len(&self) -> usize {
        let locals: usize = self
            .locals
            .iter()
            .map(|local| {
                let local = local.lock();
                local.push.len() + local.pop.len()
            })
            .sum();
        let mut global = 0;
        let mut segments = Vec::new();
        while let Some(segment) = self.global.pop() {
            global += segment.len();
            segments.push(segment);
        }
        for segment in segments {
            self.global.push(segment);
        }
        locals + global
    }
}

impl<T> Default for Worklist<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered weak callback and its argument.
#[derive(Debug, Clone, Copy)]
pub struct WeakCallbackItem {
    /// The callback.
    pub callback: WeakCallback,
    /// Argument passed to the callback, usually a slot address.
    pub parameter: *const u8,
}

// SAFETY: the parameter is only dereferenced by the callback during weakness
// processing, after marking threads have been joined.
unsafe impl Send for WeakCallbackItem {}
// SAFETY: see Send impl
unsafe impl Sync for WeakCallbackItem {}

/// The five worklists of a marker.
///
/// Not fully constructed items are payload addresses; write barrier items
/// are header addresses.
#[derive(Debug, Default)]
pub struct MarkingWorklists {
    /// Marked objects whose outgoing references still need tracing.
    pub marking: Worklist<TraceDescriptor>,
    /// Objects found while still under construction.
    pub not_fully_constructed: Worklist<usize>,
    /// Objects that were under construction when the atomic pause started
    /// and are known to be constructed now.
    pub previously_not_fully_constructed: Worklist<usize>,
    /// Objects marked by the write barrier.
    pub write_barrier: Worklist<usize>,
    /// Weak callbacks to run during weakness processing.
    pub weak_callback: Worklist<WeakCallbackItem>,
}

impl MarkingWorklists {
    /// Creates empty worklists.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the local views of `task` in every worklist.
    pub fn flush_task(&self, task: usize) {
        self.marking.flush_to_global(task);
        self.not_fully_constructed.flush_to_global(task);
        self.previously_not_fully_constructed.flush_to_global(task);
        self.write_barrier.flush_to_global(task);
        self.weak_callback.flush_to_global(task);
    }

    /// Drops every item of every worklist.
    pub fn clear(&self) {
        self.marking.clear();
        self.not_fully_constructed.clear();
        self.previously_not_fully_constructed.clear();
        self.write_barrier.clear();
        self.weak_callback.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pop_is_lifo_within_view() {
        let list = Worklist::new();
        list.push(MUTATOR_THREAD_ID, 1);
        list.push(MUTATOR_THREAD_ID, 2);
        list.push(MUTATOR_THREAD_ID, 3);

        assert_eq!(list.pop(MUTATOR_THREAD_ID), Some(3));
        assert_eq!(list.pop(MUTATOR_THREAD_ID), Some(2));
        assert_eq!(list.pop(MUTATOR_THREAD_ID), Some(1));
        assert_eq!(list.pop(MUTATOR_THREAD_ID), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_full_segments_are_published() {
        let list = Worklist::new();
        for i in 0..=SEGMENT_CAPACITY {
            list.push(MUTATOR_THREAD_ID, i);
        }
        assert!(!list.is_global_pool_empty());
        assert_eq!(list.len(), SEGMENT_CAPACITY + 1);

        // Another task can take the published segment.
        let mut stolen = 0;
        while list.pop(1).is_some() {
            stolen += 1;
        }
        assert_eq!(stolen, SEGMENT_CAPACITY);
        assert!(!list.is_local_view_empty(MUTATOR_THREAD_ID));
    }

    #[test]
    fn test_flush_makes_items_visible_to_other_tasks() {
        let list = Worklist::new();
        list.push(2, 7);
        assert_eq!(list.pop(1), None);

        list.flush_to_global(2);
        assert!(list.is_local_view_empty(2));
        assert_eq!(list.pop(1), Some(7));
    }

    #[test]
    fn test_merge_global_pool() {
        let from = Worklist::new();
        let into = Worklist::new();
        from.push(MUTATOR_THREAD_ID, 5);
        from.flush_to_global(MUTATOR_THREAD_ID);

        into.merge_global_pool(&from);
        assert!(from.is_empty());
        assert_eq!(into.pop(MUTATOR_THREAD_ID), Some(5));
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        let list = Arc::new(Worklist::new());
        let producers: Vec<_> = (1..MAX_NUM_TASKS)
            .map(|task| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        list.push(task, i);
                    }
                    list.flush_to_global(task);
                })
            })
            .collect();
        for handle in producers {
            handle.join().expect("producer");
        }

        let mut count = 0;
        while list.pop(MUTATOR_THREAD_ID).is_some() {
            count += 1;
        }
        assert_eq!(count, 1000 * (MAX_NUM_TASKS - 1));
        list.clear();
        assert!(list.is_empty());
    }
}
