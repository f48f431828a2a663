//! Conservative stack scanning.
//!
//! The collector does not know where the mutator keeps pointers on its
//! stack. When a collection may see heap pointers on the stack, every word
//! of the stack (and the callee-saved registers) is reported to a
//! [`StackVisitor`], which decides whether it points into the heap.

use parking_lot::Mutex;

/// Receives candidate words from a stack scan.
pub trait StackVisitor {
    /// Called with every word that might be a heap pointer.
    fn visit_pointer(&mut self, address: usize);
}

/// A source of conservative roots.
pub trait StackScanner: Send + Sync {
    /// Reports every word of the scanned range to `visitor`.
    fn iterate_pointers(&self, visitor: &mut dyn StackVisitor);
}

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy)]
pub struct StackBounds {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address).
    pub top: usize,
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "linux", not(miri)))]
#[must_use]
pub fn get_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: the attribute object is initialized by `pthread_getattr_np`
    // and destroyed on every path.
    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }

        Some(StackBounds {
            bottom: stackaddr as usize + stacksize,
            top: stackaddr as usize,
        })
    }
}

/// Retrieve the stack bounds for the current thread (not available here).
#[cfg(any(not(target_os = "linux"), miri))]
#[must_use]
pub fn get_stack_bounds() -> Option<StackBounds> {
    None
}

/// Spill CPU registers onto the stack and execute a closure to scan the stack.
///
/// This ensures all callee-saved registers are flushed to the
/// stack, allowing a conservative scan to find roots that might only exist
/// in registers.
///
/// # Safety
///
/// Must be called on the thread whose stack bounds are used.
#[inline(never)]
pub unsafe fn spill_registers_and_scan<F>(mut scan_fn: F)
where
    F: FnMut(usize),
{
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    let mut regs = [0usize; 6];
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    // SAFETY: only moves callee-saved registers into locals.
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
        );
    }
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    std::hint::black_box(&regs);

    #[cfg(any(not(target_arch = "x86_64"), miri))]
    let regs = [0usize; 32];
    #[cfg(any(not(target_arch = "x86_64"), miri))]
    std::hint::black_box(&regs);

    for r in &regs {
        scan_fn(*r);
    }

    let Some(bounds) = get_stack_bounds() else {
        return;
    };

    // The address of a local approximates the stack pointer. The stack grows
    // downwards.
    let sp = std::ptr::addr_of!(scan_fn) as usize;
    let mut current = sp & !(std::mem::align_of::<usize>() - 1);

    while current < bounds.bottom {
        // SAFETY: `[sp, bottom)` is the live part of this thread's stack.
        let word = unsafe { std::ptr::read_volatile(current as *const usize) };
        scan_fn(word);
        current += std::mem::size_of::<usize>();
    }
}

/// Scans the stack of the thread that runs the collection.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadStack;

impl StackScanner for ThreadStack {
    fn iterate_pointers(&self, visitor: &mut dyn StackVisitor) {
        // SAFETY: scanning the current thread's own stack.
        unsafe { spill_registers_and_scan(|word| visitor.visit_pointer(word)) };
    }
}

/// A scanner over an explicit list of words.
///
/// Lets tests and embedders that keep their roots elsewhere control exactly
/// what the conservative scan sees.
#[derive(Debug, Default)]
pub struct ManualStack {
    words: Mutex<Vec<usize>>,
}

impl ManualStack {
    /// Creates an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            words: Mutex::new(Vec::new()),
        }
    }

    /// Adds a word.
    pub fn push(&self, word: usize) {
        self.words.lock().push(word);
    }

    /// Removes all words.
    pub fn clear(&self) {
        self.words.lock().clear();
    }
}

impl StackScanner for ManualStack {
    fn iterate_pointers(&self, visitor: &mut dyn StackVisitor) {
        let words = self.words.lock().clone();
        for word in words {
            visitor.visit_pointer(word);
        }
    }
}
