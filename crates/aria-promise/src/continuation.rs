//! Continuations registered with `then`.
//!
//! A continuation owns both handlers, the caller's data word and one
//! reference to the derived promise. It is consumed by exactly one
//! notification: the handler matching the source's terminal state runs and
//! the other is dropped uninvoked.

use crate::engine::{with_engine, Engine};
use crate::promise::{Outcome, Phase, Resolution, Settlement, Waiter};
use crate::scheduler::invoke_guarded;
use crate::table::PromiseId;
use crate::value::Value;

/// A handler: `(settled value, data) -> resolution of the derived promise`.
pub(crate) type Handler = Box<dyn FnOnce(Value, Value) -> Resolution>;

pub(crate) struct Continuation {
    on_fulfill: Option<Handler>,
    on_reject: Option<Handler>,
    data: Value,
    derived: PromiseId,
}

impl Continuation {
    pub(crate) fn derived(&self) -> PromiseId {
        self.derived
    }

    pub(crate) fn notify(self, settlement: Settlement) {
        let Continuation {
            on_fulfill,
            on_reject,
            data,
            derived,
        } = self;

        let (handler, unused) = match settlement {
            Settlement::Fulfilled(_) => (on_fulfill, on_reject),
            Settlement::Rejected(_) => (on_reject, on_fulfill),
        };
        drop(unused);

        let outcome = match handler {
            Some(handler) => {
                let value = settlement.value();
                match invoke_guarded(move || handler(value, data)) {
                    Ok(resolution) => resolution.into_outcome(),
                    Err(fault) => Outcome::Fault(fault),
                }
            }
            // No handler for this outcome: pass the settlement through.
            None => Outcome::Settle(settlement),
        };

        with_engine(|engine| engine.complete_derived(derived, outcome));
    }
}

impl Engine {
    /// Register a continuation on `source` and return the derived promise.
    ///
    /// The returned id carries the caller's reference; the continuation
    /// holds a second one until it has resolved the derived promise.
    pub(crate) fn then(
        &mut self,
        source: PromiseId,
        on_fulfill: Option<Handler>,
        on_reject: Option<Handler>,
        data: Value,
    ) -> PromiseId {
        let derived = self.create();
        // Hold for the continuation; cannot fail on a record just created.
        let _ = self.acquire(derived);

        let continuation = Continuation {
            on_fulfill,
            on_reject,
            data,
            derived,
        };

        if let Err(err) = self.subscribe(source, Waiter::Then(continuation)) {
            tracing::error!(%err, %derived, "then on a stale promise; derived promise rejected");
            let fault_value = self.config.fault_value;
            let _ = self.settle(derived, Settlement::Rejected(fault_value));
            let _ = self.release(derived);
        }
        derived
    }

    /// Apply a handler's outcome to its derived promise and drop the
    /// continuation's hold on it.
    pub(crate) fn complete_derived(&mut self, derived: PromiseId, outcome: Outcome) {
        match outcome {
            Outcome::Settle(settlement) => {
                if let Err(err) = self.settle(derived, settlement) {
                    tracing::warn!(%err, "derived promise was resolved elsewhere; handler result ignored");
                }
            }
            Outcome::Delegate(target) => self.delegate_derived(derived, target),
            Outcome::Fault(fault) => {
                tracing::warn!(%derived, %fault, "promise handler faulted; rejecting");
                let fault_value = self.config.fault_value;
                if let Err(err) = self.settle(derived, Settlement::Rejected(fault_value)) {
                    tracing::warn!(%err, "derived promise was resolved elsewhere; fault ignored");
                }
            }
        }

        if let Err(err) = self.release(derived) {
            tracing::debug!(%err, "derived promise already gone");
        }
    }

    fn delegate_derived(&mut self, derived: PromiseId, target: PromiseId) {
        let Err(err) = self.delegate(derived, target) else {
            return;
        };
        let _ = self.release(target);

        let pending = matches!(
            self.record(derived).map(|record| record.phase),
            Ok(Phase::Pending)
        );
        if !pending {
            tracing::warn!(%err, "derived promise was resolved elsewhere; handler result ignored");
            return;
        }

        let rejection = match err {
            crate::PromiseError::DelegationCycle { .. } => {
                tracing::error!(%err, "handler returned a promise that waits on its own result");
                self.config.cycle_value
            }
            _ => {
                tracing::error!(%err, "handler returned an unusable promise");
                self.config.fault_value
            }
        };
        let _ = self.settle(derived, Settlement::Rejected(rejection));
    }
}
