//! Promise records and the public `Promise` handle.
//!
//! A record moves `Pending -> Fulfilled` or `Pending -> Rejected` exactly
//! once. A pending record may instead be linked to another promise
//! (`DelegatingTo`), in which case it takes that promise's outcome when it
//! arrives and cannot be resolved any other way in the meantime.
//!
//! # Example
//!
//! ```rust
//! use aria_promise::{run_until_idle, Promise, PromiseState, Resolution, Value};
//!
//! let source = Promise::new();
//! let doubled = source.then(
//!     |value, _data| Resolution::Fulfill(Value::from_usize(value.as_usize() * 2)),
//!     |error, _data| Resolution::Reject(error),
//!     Value::NULL,
//! );
//!
//! source.fulfill(Value::from_usize(21)).unwrap();
//! // Handlers never run inline.
//! assert_eq!(doubled.state(), Ok(PromiseState::Pending));
//!
//! run_until_idle();
//! assert_eq!(doubled.value(), Ok(Some(Value::from_usize(42))));
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;

use crate::all::AllSubscription;
use crate::continuation::{Continuation, Handler};
use crate::delegate::Delegation;
use crate::engine::{self, with_engine};
use crate::error::{HandlerFault, PromiseError};
use crate::table::PromiseId;
use crate::value::Value;

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    /// Not settled yet. Includes promises delegating to another promise.
    Pending,
    /// Settled successfully.
    Fulfilled,
    /// Settled with an error.
    Rejected,
}

/// Terminal outcome of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Settlement {
    Fulfilled(Value),
    Rejected(Value),
}

impl Settlement {
    pub fn value(self) -> Value {
        match self {
            Settlement::Fulfilled(value) | Settlement::Rejected(value) => value,
        }
    }

    pub fn state(self) -> PromiseState {
        match self {
            Settlement::Fulfilled(_) => PromiseState::Fulfilled,
            Settlement::Rejected(_) => PromiseState::Rejected,
        }
    }
}

/// How to resolve a promise. Handlers return one of these as well.
#[derive(Debug)]
pub enum Resolution {
    /// Settle as fulfilled with the value.
    Fulfill(Value),
    /// Settle as rejected with the value.
    Reject(Value),
    /// Take whatever outcome this other promise eventually has.
    ///
    /// The handle is moved into the engine. Pass a clone to keep your own
    /// reference.
    Match(Promise),
}

impl Resolution {
    /// Lower into the engine's form. A `Match` handle becomes an owned raw
    /// reference.
    pub(crate) fn into_outcome(self) -> Outcome {
        match self {
            Resolution::Fulfill(value) => Outcome::Settle(Settlement::Fulfilled(value)),
            Resolution::Reject(value) => Outcome::Settle(Settlement::Rejected(value)),
            Resolution::Match(promise) => Outcome::Delegate(promise.into_raw()),
        }
    }
}

impl From<Settlement> for Resolution {
    fn from(settlement: Settlement) -> Self {
        match settlement {
            Settlement::Fulfilled(value) => Resolution::Fulfill(value),
            Settlement::Rejected(value) => Resolution::Reject(value),
        }
    }
}

/// Engine-side result of running a handler.
#[derive(Debug)]
pub(crate) enum Outcome {
    Settle(Settlement),
    /// Delegate to the promise; the engine owns one reference to it.
    Delegate(PromiseId),
    Fault(HandlerFault),
}

/// Lifecycle phase of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Pending,
    DelegatingTo(PromiseId),
    Settled(Settlement),
}

/// Something waiting for a record to settle.
pub(crate) enum Waiter {
    Then(Continuation),
    Delegate(Delegation),
    All(AllSubscription),
}

impl Waiter {
    /// Run the notification. Always called from a deferred callback.
    pub(crate) fn notify(self, settlement: Settlement) {
        match self {
            Waiter::Then(continuation) => continuation.notify(settlement),
            Waiter::Delegate(delegation) => delegation.notify(settlement),
            Waiter::All(subscription) => subscription.notify(settlement),
        }
    }

    /// Give up on a waiter whose record was freed before settling. Returns
    /// the record whose hold the waiter drops, if any.
    pub(crate) fn abandon(&self) -> Option<PromiseId> {
        match self {
            Waiter::Then(continuation) => Some(continuation.derived()),
            Waiter::Delegate(delegation) => Some(delegation.promise()),
            Waiter::All(subscription) => subscription.abandon(),
        }
    }
}

/// A promise record as stored in the handle table.
pub(crate) struct Record {
    pub(crate) phase: Phase,
    /// Notified in insertion order. Empty once settled.
    pub(crate) waiters: Vec<Waiter>,
    /// Caller handles plus internal holds.
    pub(crate) refcount: usize,
}

impl Record {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Pending,
            waiters: Vec::new(),
            refcount: 1,
        }
    }

    pub(crate) fn state(&self) -> PromiseState {
        match self.phase {
            Phase::Pending | Phase::DelegatingTo(_) => PromiseState::Pending,
            Phase::Settled(settlement) => settlement.state(),
        }
    }

    pub(crate) fn settlement(&self) -> Option<Settlement> {
        match self.phase {
            Phase::Settled(settlement) => Some(settlement),
            _ => None,
        }
    }
}

/// An owning handle to a promise.
///
/// Cloning acquires another reference and dropping releases one; the record
/// is freed once no handle and no internal bookkeeping refers to it.
/// Handles belong to the thread that created them.
pub struct Promise {
    id: PromiseId,
    _local: PhantomData<*const ()>,
}

impl Promise {
    /// Create a pending promise.
    pub fn new() -> Self {
        let id = with_engine(|engine| engine.create());
        Self::from_raw(id)
    }

    /// Adopt a raw reference, e.g. one produced by [`Promise::into_raw`].
    ///
    /// The returned handle releases that reference when dropped.
    pub fn from_raw(id: PromiseId) -> Self {
        Self {
            id,
            _local: PhantomData,
        }
    }

    /// Acquire a new reference to a raw handle the caller does not own.
    pub fn retain_raw(id: PromiseId) -> Result<Self, PromiseError> {
        with_engine(|engine| engine.acquire(id))?;
        Ok(Self::from_raw(id))
    }

    /// Give up the handle without releasing its reference.
    pub fn into_raw(self) -> PromiseId {
        let this = ManuallyDrop::new(self);
        this.id
    }

    pub fn id(&self) -> PromiseId {
        self.id
    }

    /// Release this handle now. Same as dropping it.
    pub fn release(self) {
        drop(self);
    }

    /// Resolve the promise.
    ///
    /// Fails with `AlreadySettled` if the promise is settled or already
    /// delegating; nothing changes in that case. Delegating to a promise
    /// that (transitively) waits on this one fails with `DelegationCycle`.
    pub fn resolve(&self, resolution: Resolution) -> Result<(), PromiseError> {
        match resolution {
            Resolution::Fulfill(value) => {
                with_engine(|engine| engine.settle(self.id, Settlement::Fulfilled(value)))
            }
            Resolution::Reject(value) => {
                with_engine(|engine| engine.settle(self.id, Settlement::Rejected(value)))
            }
            Resolution::Match(target) => {
                let target = target.into_raw();
                with_engine(|engine| {
                    let linked = engine.delegate(self.id, target);
                    if linked.is_err() {
                        // Not adopted; drop the reference we were handed.
                        let _ = engine.release(target);
                    }
                    linked
                })
            }
        }
    }

    pub fn fulfill(&self, value: Value) -> Result<(), PromiseError> {
        self.resolve(Resolution::Fulfill(value))
    }

    pub fn reject(&self, value: Value) -> Result<(), PromiseError> {
        self.resolve(Resolution::Reject(value))
    }

    /// Take on the eventual outcome of `other`.
    pub fn adopt(&self, other: Promise) -> Result<(), PromiseError> {
        self.resolve(Resolution::Match(other))
    }

    /// Register handlers and get the promise derived from them.
    ///
    /// Exactly one handler runs, on a later turn, with `(value, data)`:
    /// `on_fulfill` if this promise fulfills, `on_reject` if it rejects.
    /// The derived promise is resolved with what the handler returns. A
    /// handler that panics rejects the derived promise with the configured
    /// fault value.
    pub fn then<F, R>(&self, on_fulfill: F, on_reject: R, data: Value) -> Promise
    where
        F: FnOnce(Value, Value) -> Resolution + 'static,
        R: FnOnce(Value, Value) -> Resolution + 'static,
    {
        self.then_with(Some(Box::new(on_fulfill)), Some(Box::new(on_reject)), data)
    }

    /// Like [`Promise::then`] with only a fulfillment handler; rejections
    /// pass straight through to the derived promise.
    pub fn on_fulfilled<F>(&self, on_fulfill: F, data: Value) -> Promise
    where
        F: FnOnce(Value, Value) -> Resolution + 'static,
    {
        self.then_with(Some(Box::new(on_fulfill)), None, data)
    }

    /// Like [`Promise::then`] with only a rejection handler; fulfillments
    /// pass straight through to the derived promise.
    pub fn on_rejected<R>(&self, on_reject: R, data: Value) -> Promise
    where
        R: FnOnce(Value, Value) -> Resolution + 'static,
    {
        self.then_with(None, Some(Box::new(on_reject)), data)
    }

    pub(crate) fn then_with(
        &self,
        on_fulfill: Option<Handler>,
        on_reject: Option<Handler>,
        data: Value,
    ) -> Promise {
        let derived = with_engine(|engine| engine.then(self.id, on_fulfill, on_reject, data));
        Self::from_raw(derived)
    }

    pub fn state(&self) -> Result<PromiseState, PromiseError> {
        with_engine(|engine| engine.record(self.id).map(Record::state))
    }

    /// The settled value, or `None` while pending.
    pub fn value(&self) -> Result<Option<Value>, PromiseError> {
        self.settlement().map(|settlement| settlement.map(Settlement::value))
    }

    pub fn settlement(&self) -> Result<Option<Settlement>, PromiseError> {
        with_engine(|engine| engine.record(self.id).map(Record::settlement))
    }

    /// Whether the promise is waiting on another promise's outcome.
    pub fn is_delegating(&self) -> Result<bool, PromiseError> {
        with_engine(|engine| {
            engine
                .record(self.id)
                .map(|record| matches!(record.phase, Phase::DelegatingTo(_)))
        })
    }
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Promise {
    fn clone(&self) -> Self {
        if let Err(err) = with_engine(|engine| engine.acquire(self.id)) {
            tracing::debug!(%err, "cloned a stale promise handle");
        }
        Self::from_raw(self.id)
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        engine::release_handle(self.id);
    }
}

impl PartialEq for Promise {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Promise {}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("id", &self.id).finish()
    }
}
