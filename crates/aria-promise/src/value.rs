//! Opaque word-sized payloads carried by promises.

use std::ffi::c_void;
use std::fmt;

/// A single word of caller-defined data.
///
/// The engine never interprets a `Value` except when it is the payload of a
/// `Match` resolution coming through the C surface, where it carries a
/// promise handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Value(usize);

impl Value {
    /// The null word.
    pub const NULL: Value = Value(0);

    /// Wrap a raw word.
    pub const fn from_usize(word: usize) -> Self {
        Value(word)
    }

    /// Get the raw word.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Wrap a pointer by address.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Value(ptr as usize)
    }

    /// Reinterpret the word as a pointer.
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<usize> for Value {
    fn from(word: usize) -> Self {
        Value(word)
    }
}

impl From<Value> for usize {
    fn from(value: Value) -> Self {
        value.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:#x})", self.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
