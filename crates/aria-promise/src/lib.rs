//! Aria Promise - handle-based promise engine for the Aria runtime
//!
//! This crate provides the asynchronous completion primitive used by
//! compiled Aria code and by hosts embedding the runtime:
//! - `Promise` - An ownership-counted handle to a single-assignment cell
//! - `then` - Continuations producing derived promises
//! - `Resolution::Match` - Adopting another promise's eventual outcome
//! - `all` - Joining many promises into one
//! - `TaskQueue` - The host's "run this later" primitive
//!
//! # Execution Model
//!
//! The engine is single-threaded and cooperative. Operations (`create`,
//! `resolve`, `then`, `all`, `release`) never block and never call user
//! code: every handler is deferred onto the task queue and runs on a later
//! turn, from the same stack baseline, with panics converted into
//! rejections.
//!
//! # Example
//!
//! ```rust
//! use aria_promise::{run_until_idle, Promise, Resolution, Value};
//!
//! let start = Promise::new();
//! let step = start.then(
//!     |value, data| Resolution::Fulfill(Value::from_usize(value.as_usize() + data.as_usize())),
//!     |error, _| Resolution::Reject(error),
//!     Value::from_usize(1),
//! );
//! let recovered = step.on_rejected(|_, _| Resolution::Fulfill(Value::NULL), Value::NULL);
//!
//! start.fulfill(Value::from_usize(41)).unwrap();
//! run_until_idle();
//!
//! assert_eq!(recovered.value(), Ok(Some(Value::from_usize(42))));
//! ```
//!
//! # C ABI
//!
//! With the `ffi` feature (on by default) the `ffi` module exports the same
//! engine as `aria_promise_*` symbols for hosts that manage raw handles.

pub mod all;
mod continuation;
mod delegate;
pub mod engine;
pub mod error;
#[cfg(feature = "ffi")]
pub mod ffi;
pub mod promise;
pub mod scheduler;
pub mod table;
pub mod value;

pub use all::{all, ResultSink, ResultSlots};
pub use engine::{audit, config, init, init_with_queue, live_handles, run_until_idle, shutdown};
pub use error::{HandlerFault, PromiseError};
pub use promise::{Promise, PromiseState, Resolution, Settlement};
pub use scheduler::{depth, Deferred, LocalQueue, TaskQueue};
pub use table::PromiseId;
pub use value::Value;

/// Configuration for the promise engine.
#[derive(Debug, Clone)]
pub struct PromiseConfig {
    /// Slots reserved up front in the handle table
    pub initial_capacity: usize,
    /// Rejection value for a derived promise whose handler panicked
    pub fault_value: Value,
    /// Rejection value for a derived promise whose handler returned a
    /// promise that waits on the derived promise itself
    pub cycle_value: Value,
    /// Whether `shutdown` reports leaked handles
    pub audit_on_shutdown: bool,
}

impl Default for PromiseConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 64,
            fault_value: Value::NULL,
            cycle_value: Value::NULL,
            audit_on_shutdown: true,
        }
    }
}

impl PromiseConfig {
    /// Create a new engine configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many handle slots the engine reserves up front.
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set the rejection value used for handler faults.
    pub fn with_fault_value(mut self, value: Value) -> Self {
        self.fault_value = value;
        self
    }

    /// Set the rejection value used for delegation cycles.
    pub fn with_cycle_value(mut self, value: Value) -> Self {
        self.cycle_value = value;
        self
    }

    /// Set whether `shutdown` reports promises that are still alive.
    pub fn with_audit_on_shutdown(mut self, audit: bool) -> Self {
        self.audit_on_shutdown = audit;
        self
    }
}
