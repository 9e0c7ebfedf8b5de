//! Resolution delegation (`Match`).
//!
//! A promise resolved with another promise takes that promise's fate. The
//! link is a `DelegatingTo` phase on the delegating record plus a waiter on
//! the target; when the target settles the waiter copies its settlement
//! across. Chains resolve one hop per settlement: if the target itself
//! delegates, it settles only when its own target does.
//!
//! Linking checks the chain first and refuses to close a cycle, so no
//! promise can end up waiting on itself.
//!
//! The waiter holds only the delegating promise. The target is kept alive by
//! whoever can still settle it; once nobody can, it is freed and the link is
//! abandoned along with it.

use crate::engine::{with_engine, Engine};
use crate::error::PromiseError;
use crate::promise::{Phase, Settlement, Waiter};
use crate::table::PromiseId;

/// Pending link from `promise` to `target`.
///
/// Holds a reference to `promise` until the target's notification runs.
pub(crate) struct Delegation {
    promise: PromiseId,
    target: PromiseId,
}

impl Delegation {
    pub(crate) fn promise(&self) -> PromiseId {
        self.promise
    }

    pub(crate) fn notify(self, settlement: Settlement) {
        with_engine(|engine| engine.finish_delegation(self, settlement));
    }
}

impl Engine {
    /// Make `promise` adopt `target`'s eventual outcome.
    ///
    /// On success the caller's reference to `target` is consumed. On error
    /// nothing changes and the caller still owns that reference.
    pub(crate) fn delegate(&mut self, promise: PromiseId, target: PromiseId) -> Result<(), PromiseError> {
        let phase = self.record(promise)?.phase;
        if phase != Phase::Pending {
            return Err(PromiseError::AlreadySettled(promise));
        }
        if !self.contains(target) {
            return Err(PromiseError::InvalidHandle(target));
        }
        if self.reaches(target, promise) {
            return Err(PromiseError::DelegationCycle { promise, target });
        }

        self.acquire(promise)?;
        self.record_mut(promise)?.phase = Phase::DelegatingTo(target);
        tracing::debug!(%promise, %target, "promise delegating");

        self.subscribe(target, Waiter::Delegate(Delegation { promise, target }))?;
        // A waiter never holds the record it waits on.
        let _ = self.release(target);
        Ok(())
    }

    /// Whether following delegation links from `from` arrives at `to`.
    fn reaches(&self, from: PromiseId, to: PromiseId) -> bool {
        let mut current = from;
        loop {
            if current == to {
                return true;
            }
            match self.record(current).map(|record| record.phase) {
                Ok(Phase::DelegatingTo(next)) => current = next,
                _ => return false,
            }
        }
    }

    fn finish_delegation(&mut self, delegation: Delegation, settlement: Settlement) {
        let Delegation { promise, target } = delegation;

        match self.record(promise).map(|record| record.phase) {
            Ok(Phase::DelegatingTo(linked)) if linked == target => {
                self.commit(promise, settlement);
            }
            _ => tracing::warn!(%promise, %target, "delegation finished on an unlinked promise"),
        }

        let _ = self.release(promise);
    }
}
