//! Error types for the promise engine.

use thiserror::Error;

use crate::table::PromiseId;

/// Errors reported by promise operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PromiseError {
    /// `resolve` was called on a promise that is settled or already
    /// delegating to another promise. State is left untouched.
    #[error("{0} has already been resolved")]
    AlreadySettled(PromiseId),

    /// The handle does not name a live record.
    #[error("{0} is not a live promise handle")]
    InvalidHandle(PromiseId),

    /// Linking `promise` to `target` would make it wait on itself.
    #[error("delegating {promise} to {target} would create a cycle")]
    DelegationCycle {
        promise: PromiseId,
        target: PromiseId,
    },

    /// An `all` result buffer cannot hold one slot per input.
    #[error("result buffer has {len} slots but {needed} inputs were given")]
    ResultBufferTooSmall { needed: usize, len: usize },

    /// Handles were still live at audit time.
    #[error("{count} promise handle(s) were never released")]
    LeakedHandles {
        count: usize,
        handles: Vec<PromiseId>,
    },
}

/// A handler panicked instead of returning a resolution.
///
/// The fault never crosses the deferred-call boundary; it becomes a
/// rejection of the handler's derived promise.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handler panicked: {message}")]
pub struct HandlerFault {
    pub message: String,
}

impl HandlerFault {
    /// Build a fault from a panic payload.
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown panic".to_string());
        Self { message }
    }
}
