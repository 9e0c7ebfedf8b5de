//! FFI interface for aria-promise
//!
//! This module provides C-callable functions over the promise engine for
//! compiled Aria code and C hosts. Handles cross the boundary as bare words
//! (`0` is never a valid handle) and every handle returned by this module
//! owns one reference that must be given back with `aria_promise_destroy`.
//!
//! # Callbacks
//!
//! A callback receives an out-pointer for its result, the `data` word given
//! to `aria_promise_then`, and the settled value. It returns one of the
//! `ARIA_PROMISE_*` modes:
//! - `FULFILL` / `REJECT` settle the derived promise with `*result`
//! - `MATCH` makes the derived promise adopt the handle in `*result`; the
//!   callback keeps its own reference
//! - `MATCH_RELEASE` is `MATCH` but hands the reference to the engine
//!
//! Callbacks use the `C-unwind` ABI so that a Rust panic raised inside one
//! is intercepted at the deferred-call boundary and turned into a rejection.
//!
//! # Memory Safety
//!
//! The caller is responsible for ensuring:
//! - Handle arrays and result buffers are valid for the sizes given
//! - A result buffer outlives the `all` promise that writes into it
//! - Callbacks and their data are valid until the callback runs

use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::ptr;
use std::rc::Rc;

use crate::all::{all, ResultSink};
use crate::engine;
use crate::error::PromiseError;
use crate::promise::{Promise, Resolution};
use crate::table::PromiseId;
use crate::value::Value;

/// Raw promise handle. `0` means "no promise".
pub type AriaPromise = usize;

/// Resolution mode passed to `aria_promise_resolve` or returned by a
/// callback.
pub type AriaPromiseResult = u32;

pub const ARIA_PROMISE_FULFILL: AriaPromiseResult = 0;
pub const ARIA_PROMISE_MATCH: AriaPromiseResult = 1;
pub const ARIA_PROMISE_REJECT: AriaPromiseResult = 2;
pub const ARIA_PROMISE_MATCH_RELEASE: AriaPromiseResult = 3;

/// Status codes returned by `aria_promise_resolve`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AriaPromiseStatus {
    Ok = 0,
    AlreadySettled = 1,
    InvalidHandle = 2,
    DelegationCycle = 3,
    InvalidMode = 4,
}

impl From<&PromiseError> for AriaPromiseStatus {
    fn from(err: &PromiseError) -> Self {
        match err {
            PromiseError::AlreadySettled(_) => AriaPromiseStatus::AlreadySettled,
            PromiseError::DelegationCycle { .. } => AriaPromiseStatus::DelegationCycle,
            PromiseError::InvalidHandle(_)
            | PromiseError::ResultBufferTooSmall { .. }
            | PromiseError::LeakedHandles { .. } => AriaPromiseStatus::InvalidHandle,
        }
    }
}

/// Type of a promise callback.
pub type AriaPromiseCallback = unsafe extern "C-unwind" fn(
    result: *mut *mut c_void,
    data: *mut c_void,
    value: *mut c_void,
) -> AriaPromiseResult;

/// Borrow a raw handle as a `Promise` without touching its refcount.
fn borrowed(raw: AriaPromise) -> Option<ManuallyDrop<Promise>> {
    PromiseId::from_raw(raw).map(|id| ManuallyDrop::new(Promise::from_raw(id)))
}

/// Turn a mode and payload into a resolution.
///
/// `MATCH` acquires a reference of its own; `MATCH_RELEASE` adopts the
/// caller's.
fn resolution_from_abi(mode: AriaPromiseResult, value: Value) -> Result<Resolution, AriaPromiseStatus> {
    match mode {
        ARIA_PROMISE_FULFILL => Ok(Resolution::Fulfill(value)),
        ARIA_PROMISE_REJECT => Ok(Resolution::Reject(value)),
        ARIA_PROMISE_MATCH => {
            let id = PromiseId::from_value(value).ok_or(AriaPromiseStatus::InvalidHandle)?;
            Promise::retain_raw(id)
                .map(Resolution::Match)
                .map_err(|err| AriaPromiseStatus::from(&err))
        }
        ARIA_PROMISE_MATCH_RELEASE => {
            let id = PromiseId::from_value(value).ok_or(AriaPromiseStatus::InvalidHandle)?;
            // Adopt the caller's reference only if it is still live.
            let owned = ManuallyDrop::new(Promise::from_raw(id));
            owned.state().map_err(|err| AriaPromiseStatus::from(&err))?;
            Ok(Resolution::Match(ManuallyDrop::into_inner(owned)))
        }
        _ => Err(AriaPromiseStatus::InvalidMode),
    }
}

/// Wrap a C callback as a handler.
fn handler(callback: AriaPromiseCallback) -> impl FnOnce(Value, Value) -> Resolution {
    move |value, data| {
        let mut result: *mut c_void = ptr::null_mut();
        // SAFETY: the registrant guarantees `callback` is callable with
        // these arguments; `result` is a valid out-pointer for the call.
        let mode = unsafe { callback(&mut result, data.as_ptr(), value.as_ptr()) };
        match resolution_from_abi(mode, Value::from_ptr(result)) {
            Ok(resolution) => resolution,
            Err(status) => {
                tracing::error!(mode, ?status, "promise callback returned an unusable result");
                Resolution::Reject(engine::config().fault_value)
            }
        }
    }
}

/// Result buffer supplied by the host.
struct RawResults {
    slots: *mut *mut c_void,
    len: usize,
}

impl ResultSink for RawResults {
    fn len(&self) -> usize {
        self.len
    }

    fn store(&self, index: usize, value: Value) {
        if index < self.len {
            // SAFETY: `aria_promise_all` requires `slots` to hold `len`
            // entries for as long as the output promise is pending.
            unsafe { *self.slots.add(index) = value.as_ptr() };
        }
    }

    fn identity(&self) -> Value {
        Value::from_ptr(self.slots)
    }
}

/// Create a pending promise.
#[no_mangle]
pub extern "C" fn aria_promise_create() -> AriaPromise {
    Promise::new().into_raw().as_raw()
}

/// Release one reference to a promise.
#[no_mangle]
pub extern "C" fn aria_promise_destroy(promise: AriaPromise) {
    match PromiseId::from_raw(promise) {
        Some(id) => drop(Promise::from_raw(id)),
        None => tracing::debug!(promise, "destroy of a null promise handle"),
    }
}

/// Resolve a promise with a mode and payload.
///
/// For `MATCH` / `MATCH_RELEASE`, `value` is another promise handle.
#[no_mangle]
pub extern "C" fn aria_promise_resolve(
    promise: AriaPromise,
    mode: AriaPromiseResult,
    value: *mut c_void,
) -> AriaPromiseStatus {
    let Some(target) = borrowed(promise) else {
        return AriaPromiseStatus::InvalidHandle;
    };
    let resolution = match resolution_from_abi(mode, Value::from_ptr(value)) {
        Ok(resolution) => resolution,
        Err(status) => return status,
    };
    match target.resolve(resolution) {
        Ok(()) => AriaPromiseStatus::Ok,
        Err(err) => {
            tracing::debug!(%err, "aria_promise_resolve failed");
            AriaPromiseStatus::from(&err)
        }
    }
}

/// Register callbacks on `promise` and return the derived promise.
///
/// Either callback may be null, in which case that outcome passes straight
/// through. Returns `0` if `promise` is null.
#[no_mangle]
pub extern "C" fn aria_promise_then(
    promise: AriaPromise,
    on_fulfill: Option<AriaPromiseCallback>,
    on_reject: Option<AriaPromiseCallback>,
    data: *mut c_void,
) -> AriaPromise {
    let Some(source) = borrowed(promise) else {
        return 0;
    };
    let on_fulfill = on_fulfill.map(|cb| Box::new(handler(cb)) as crate::continuation::Handler);
    let on_reject = on_reject.map(|cb| Box::new(handler(cb)) as crate::continuation::Handler);
    source
        .then_with(on_fulfill, on_reject, Value::from_ptr(data))
        .into_raw()
        .as_raw()
}

/// Join `num` promises.
///
/// `results` may be null; otherwise it must point to `num` writable slots
/// that stay valid until the returned promise settles. On full success the
/// returned promise fulfills with `results` itself. Returns `0` if any
/// input handle is invalid.
///
/// # Safety
/// `promises` must point to `num` handles (it may be null when `num` is 0).
#[no_mangle]
pub unsafe extern "C" fn aria_promise_all(
    promises: *const AriaPromise,
    results: *mut *mut c_void,
    num: usize,
) -> AriaPromise {
    let raw: &[AriaPromise] = if num == 0 || promises.is_null() {
        &[]
    } else {
        // SAFETY: guaranteed by the caller.
        unsafe { std::slice::from_raw_parts(promises, num) }
    };

    let mut inputs = Vec::with_capacity(raw.len());
    for &handle in raw {
        match borrowed(handle) {
            Some(promise) => inputs.push(promise),
            None => return 0,
        }
    }

    let sink = (!results.is_null()).then(|| {
        Rc::new(RawResults {
            slots: results,
            len: num,
        }) as Rc<dyn ResultSink>
    });

    match all(inputs.iter().map(|promise| &**promise), sink) {
        Ok(joined) => joined.into_raw().as_raw(),
        Err(err) => {
            tracing::error!(%err, "aria_promise_all failed");
            0
        }
    }
}

/// Run queued callbacks until none remain. Returns the number run.
#[no_mangle]
pub extern "C" fn aria_promise_run_until_idle() -> usize {
    engine::run_until_idle()
}

/// Number of live promise records.
#[no_mangle]
pub extern "C" fn aria_promise_live_count() -> usize {
    engine::live_handles()
}
