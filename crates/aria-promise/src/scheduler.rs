//! Deferred invocation of promise handlers.
//!
//! Nothing in the engine calls user code from inside `resolve`, `then` or
//! `all`. Every notification is pushed onto a [`TaskQueue`] and runs on a
//! later turn of the host's event loop. That is what keeps the engine free
//! of reentrancy without any locking: a handler may resolve or chain promises
//! freely because no engine operation is ever on the stack below it.
//!
//! # Stack baseline
//!
//! Deferred callbacks are started by the queue's drain loop, never by
//! another callback, so every handler observes the same nesting depth
//! (see [`depth`]). A handler that panics is unwound back to the deferred
//! boundary by [`invoke_guarded`] and the queue carries on from the same
//! baseline.
//!
//! # Example
//!
//! ```rust
//! use aria_promise::scheduler::{LocalQueue, TaskQueue};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let queue = LocalQueue::new();
//! let ran = Rc::new(Cell::new(0));
//!
//! let counter = Rc::clone(&ran);
//! queue.enqueue(Box::new(move || counter.set(counter.get() + 1)));
//! assert_eq!(ran.get(), 0);
//!
//! assert_eq!(queue.run_until_idle(), 1);
//! assert_eq!(ran.get(), 1);
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::HandlerFault;

/// A zero-argument callback scheduled to run later.
pub type Deferred = Box<dyn FnOnce() + 'static>;

/// The host's "run this later" primitive.
///
/// Implementations must preserve submission order and must not run the
/// task before `enqueue` returns.
pub trait TaskQueue {
    fn enqueue(&self, task: Deferred);
}

thread_local! {
    /// Number of deferred callbacks currently on the stack.
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Nesting depth of deferred callbacks on this thread.
///
/// `0` outside any callback, `1` inside every handler.
pub fn depth() -> usize {
    DEPTH.with(Cell::get)
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Queue `task` for a later turn, tracking callback depth while it runs.
pub(crate) fn defer<F>(queue: &dyn TaskQueue, task: F)
where
    F: FnOnce() + 'static,
{
    tracing::trace!("deferring promise callback");
    queue.enqueue(Box::new(move || {
        let _guard = DepthGuard::enter();
        task();
    }));
}

/// Run a handler, converting a panic into a [`HandlerFault`].
///
/// The unwind stops here, so the caller's frame is intact whether or not
/// the handler reached its normal exit.
pub(crate) fn invoke_guarded<F, R>(f: F) -> Result<R, HandlerFault>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| HandlerFault::from_panic(payload.as_ref()))
}

/// Single-threaded FIFO task queue.
///
/// This is the default event loop used when the host does not supply its
/// own [`TaskQueue`].
#[derive(Default)]
pub struct LocalQueue {
    tasks: RefCell<VecDeque<Deferred>>,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Run the oldest queued task. Returns `false` if the queue was empty.
    pub fn run_once(&self) -> bool {
        // The borrow must end before the task runs: tasks enqueue more tasks.
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks queued by the
    /// tasks themselves. Returns the number of tasks run.
    ///
    /// Called from inside a deferred callback this does nothing: draining
    /// there would run handlers above another handler's frame.
    pub fn run_until_idle(&self) -> usize {
        if depth() > 0 {
            tracing::warn!("run_until_idle called from inside a promise callback; ignored");
            return 0;
        }

        let mut ran = 0;
        while self.run_once() {
            ran += 1;
        }
        ran
    }

    /// Drop every queued task without running it.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut *self.tasks.borrow_mut());
        let count = dropped.len();
        drop(dropped);
        count
    }
}

impl TaskQueue for LocalQueue {
    fn enqueue(&self, task: Deferred) {
        self.tasks.borrow_mut().push_back(task);
    }
}

impl std::fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalQueue")
            .field("len", &self.len())
            .finish()
    }
}
