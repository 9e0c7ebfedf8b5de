//! Process-wide promise engine state.
//!
//! The engine owns the handle table and the task queue. It lives in a
//! thread-local: the programming model is a single thread of control with
//! deferred callbacks, and a `Promise` handle is only meaningful on the
//! thread whose engine minted it.
//!
//! # Lifecycle
//!
//! [`init`] installs a fresh engine (a default one is created lazily on
//! first use). [`audit`] reports handles that are still live, and
//! [`shutdown`] audits and resets. Handles from a previous engine become
//! stale; operations on them report `InvalidHandle`.
//!
//! # Borrowing
//!
//! Engine methods never call user code. Handler closures that must be
//! dropped while the engine is borrowed are parked in a graveyard, and
//! deferred callbacks are staged instead of handed to the host queue; both
//! are dealt with by [`with_engine`] once the borrow has ended. Handle
//! releases that arrive while the engine is busy are queued and applied
//! right after.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::PromiseError;
use crate::promise::{Phase, Record, Settlement, Waiter};
use crate::scheduler::{self, Deferred, LocalQueue, TaskQueue};
use crate::table::{HandleTable, PromiseId};
use crate::PromiseConfig;

thread_local! {
    static ENGINE: RefCell<Engine> = RefCell::new(Engine::new(PromiseConfig::default()));

    /// Releases requested while the engine was borrowed.
    static DEFERRED_RELEASES: RefCell<Vec<PromiseId>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct Engine {
    pub(crate) config: PromiseConfig,
    table: HandleTable<Record>,
    queue: Rc<dyn TaskQueue>,
    /// Set when the engine drives its own queue.
    local: Option<Rc<LocalQueue>>,
    /// Waiters dropped under the borrow; destroyed after it ends.
    graveyard: Vec<Waiter>,
    /// Callbacks not yet handed to `queue`, in submission order.
    staged: VecDeque<Deferred>,
}

impl Engine {
    fn new(config: PromiseConfig) -> Self {
        let local = Rc::new(LocalQueue::new());
        let mut engine = Self::with_queue(config, Rc::clone(&local) as Rc<dyn TaskQueue>);
        engine.local = Some(local);
        engine
    }

    fn with_queue(config: PromiseConfig, queue: Rc<dyn TaskQueue>) -> Self {
        Self {
            table: HandleTable::with_capacity(config.initial_capacity),
            config,
            queue,
            local: None,
            graveyard: Vec::new(),
            staged: VecDeque::new(),
        }
    }

    /// Allocate a pending record owned by one caller handle.
    pub(crate) fn create(&mut self) -> PromiseId {
        let id = self.table.insert(Record::new());
        tracing::debug!(%id, "promise created");
        id
    }

    pub(crate) fn record(&self, id: PromiseId) -> Result<&Record, PromiseError> {
        self.table.get(id).ok_or(PromiseError::InvalidHandle(id))
    }

    pub(crate) fn record_mut(&mut self, id: PromiseId) -> Result<&mut Record, PromiseError> {
        self.table.get_mut(id).ok_or(PromiseError::InvalidHandle(id))
    }

    pub(crate) fn contains(&self, id: PromiseId) -> bool {
        self.table.contains(id)
    }

    /// Add a reference.
    pub(crate) fn acquire(&mut self, id: PromiseId) -> Result<(), PromiseError> {
        self.record_mut(id)?.refcount += 1;
        Ok(())
    }

    /// Drop a reference, freeing the record (and anything only it kept
    /// alive) when none remain.
    pub(crate) fn release(&mut self, id: PromiseId) -> Result<(), PromiseError> {
        let record = self.record_mut(id)?;
        record.refcount -= 1;
        if record.refcount > 0 {
            return Ok(());
        }

        let mut doomed = vec![id];
        while let Some(id) = doomed.pop() {
            let Some(record) = self.table.remove(id) else {
                continue;
            };
            tracing::debug!(%id, "promise freed");

            if !record.waiters.is_empty() {
                tracing::warn!(
                    %id,
                    waiters = record.waiters.len(),
                    "pending promise released by its last owner; continuations abandoned"
                );
            }

            for waiter in record.waiters {
                if let Some(held) = waiter.abandon() {
                    if let Some(held_record) = self.table.get_mut(held) {
                        held_record.refcount -= 1;
                        if held_record.refcount == 0 {
                            doomed.push(held);
                        }
                    }
                }
                self.graveyard.push(waiter);
            }
        }
        Ok(())
    }

    /// Settle a plain pending record.
    pub(crate) fn settle(&mut self, id: PromiseId, settlement: Settlement) -> Result<(), PromiseError> {
        let phase = self.record(id)?.phase;
        match phase {
            Phase::Pending => {
                self.commit(id, settlement);
                Ok(())
            }
            Phase::DelegatingTo(_) | Phase::Settled(_) => Err(PromiseError::AlreadySettled(id)),
        }
    }

    /// Record the settlement and schedule every waiter, in order.
    pub(crate) fn commit(&mut self, id: PromiseId, settlement: Settlement) {
        let Some(record) = self.table.get_mut(id) else {
            return;
        };
        record.phase = Phase::Settled(settlement);
        let waiters = std::mem::take(&mut record.waiters);
        tracing::debug!(%id, ?settlement, waiters = waiters.len(), "promise settled");

        for waiter in waiters {
            self.schedule(waiter, settlement);
        }
    }

    /// Attach a waiter, or schedule it right away if `id` already settled.
    pub(crate) fn subscribe(&mut self, id: PromiseId, waiter: Waiter) -> Result<(), PromiseError> {
        let record = match self.table.get_mut(id) {
            Some(record) => record,
            None => {
                self.graveyard.push(waiter);
                return Err(PromiseError::InvalidHandle(id));
            }
        };
        let phase = record.phase;
        match phase {
            Phase::Settled(settlement) => self.schedule(waiter, settlement),
            Phase::Pending | Phase::DelegatingTo(_) => record.waiters.push(waiter),
        }
        Ok(())
    }

    fn schedule(&mut self, waiter: Waiter, settlement: Settlement) {
        self.defer(move || waiter.notify(settlement));
    }

    /// Run `task` on a later turn.
    ///
    /// The task reaches the host queue once the engine borrow has ended.
    pub(crate) fn defer<F>(&mut self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.staged.push_back(Box::new(task));
    }

    fn leaked(&self) -> Vec<PromiseId> {
        self.table.ids().collect()
    }
}

/// Run `f` against this thread's engine.
///
/// Must not be called from inside another `with_engine` closure; engine
/// methods never call back into user code, so that only happens on an
/// internal bug.
pub(crate) fn with_engine<F, R>(f: F) -> R
where
    F: FnOnce(&mut Engine) -> R,
{
    let (result, graveyard) = ENGINE.with(|cell| {
        let mut engine = cell.borrow_mut();
        let result = f(&mut engine);
        (result, std::mem::take(&mut engine.graveyard))
    });
    drop(graveyard);
    dispatch_staged();
    flush_deferred_releases();
    result
}

/// Hand staged callbacks to the host queue, oldest first.
///
/// Pops one task per borrow, so a queue that calls back into the engine
/// from `enqueue` neither deadlocks nor reorders the remaining tasks.
fn dispatch_staged() {
    loop {
        let next = ENGINE
            .try_with(|cell| {
                let mut engine = cell.try_borrow_mut().ok()?;
                let task = engine.staged.pop_front()?;
                Some((Rc::clone(&engine.queue), task))
            })
            .ok()
            .flatten();
        match next {
            Some((queue, task)) => scheduler::defer(queue.as_ref(), task),
            None => break,
        }
    }
}

/// Release a caller handle. Tolerates a busy or torn-down engine.
pub(crate) fn release_handle(id: PromiseId) {
    let busy = ENGINE.try_with(|cell| match cell.try_borrow_mut() {
        Ok(mut engine) => {
            if let Err(err) = engine.release(id) {
                tracing::debug!(%err, "released a stale promise handle");
            }
            let graveyard = std::mem::take(&mut engine.graveyard);
            drop(engine);
            drop(graveyard);
            false
        }
        Err(_) => true,
    });

    match busy {
        Ok(true) => {
            let _ = DEFERRED_RELEASES.try_with(|pending| pending.borrow_mut().push(id));
        }
        Ok(false) => {
            dispatch_staged();
            flush_deferred_releases();
        }
        // Thread is shutting down; the engine is gone with it.
        Err(_) => {}
    }
}

fn flush_deferred_releases() {
    loop {
        let next = DEFERRED_RELEASES
            .try_with(|pending| pending.borrow_mut().pop())
            .ok()
            .flatten();
        match next {
            Some(id) => release_handle(id),
            None => break,
        }
    }
}

fn replace_engine(mut engine: Engine) {
    let (previous, records) = ENGINE.with(|cell| {
        let mut current = cell.borrow_mut();
        // The new engine continues the old table's generations, so handles
        // of the old engine never name its records.
        let records = current.table.recycle();
        engine.table = std::mem::take(&mut current.table);
        engine.table.reserve(engine.config.initial_capacity);
        (std::mem::replace(&mut *current, engine), records)
    });
    // Old records and queued callbacks may own handles; drop them now that
    // the new engine is installed and not borrowed.
    drop(records);
    drop(previous);
    flush_deferred_releases();
}

/// Install a fresh engine driving its own [`LocalQueue`].
///
/// Call once at startup. Handles created before are invalidated.
pub fn init(config: PromiseConfig) {
    tracing::debug!(?config, "promise engine initialised");
    replace_engine(Engine::new(config));
}

/// Install a fresh engine that schedules callbacks on a host queue.
///
/// [`run_until_idle`] does nothing for such an engine; the host drives
/// its own queue.
pub fn init_with_queue(config: PromiseConfig, queue: Rc<dyn TaskQueue>) {
    tracing::debug!(?config, "promise engine initialised with host queue");
    replace_engine(Engine::with_queue(config, queue));
}

/// Drain the engine's own queue. Returns the number of callbacks run.
pub fn run_until_idle() -> usize {
    let local = with_engine(|engine| engine.local.clone());
    local.map_or(0, |queue| queue.run_until_idle())
}

/// Number of live promise records.
pub fn live_handles() -> usize {
    with_engine(|engine| engine.table.len())
}

/// Check that every promise has been released.
pub fn audit() -> Result<(), PromiseError> {
    let handles = with_engine(|engine| engine.leaked());
    if handles.is_empty() {
        return Ok(());
    }
    tracing::warn!(count = handles.len(), "leaked promise handles");
    Err(PromiseError::LeakedHandles {
        count: handles.len(),
        handles,
    })
}

/// Audit (if configured) and reset the engine, discarding queued callbacks.
pub fn shutdown() -> Result<(), PromiseError> {
    let config = with_engine(|engine| engine.config.clone());
    let result = if config.audit_on_shutdown {
        audit()
    } else {
        Ok(())
    };
    replace_engine(Engine::new(config));
    result
}

/// The active configuration.
pub fn config() -> PromiseConfig {
    with_engine(|engine| engine.config.clone())
}
