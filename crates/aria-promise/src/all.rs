//! The `all` combinator.
//!
//! `all` joins N inputs into one output promise. Each fulfilled input writes
//! its value into slot `i` of a result sink; once every input has fulfilled
//! the output fulfills with the sink's identity word (the buffer itself, not
//! a copy of it). The first rejection observed, in notification order,
//! rejects the output; later settlements are still consumed but change
//! nothing.
//!
//! # Example
//!
//! ```rust
//! use aria_promise::{all, run_until_idle, Promise, ResultSink, ResultSlots, Value};
//! use std::rc::Rc;
//!
//! let inputs = [Promise::new(), Promise::new()];
//! let slots = ResultSlots::new(2);
//! let joined = all(&inputs, Some(slots.clone() as Rc<dyn ResultSink>)).unwrap();
//!
//! inputs[1].fulfill(Value::from_usize(2)).unwrap();
//! inputs[0].fulfill(Value::from_usize(1)).unwrap();
//! run_until_idle();
//!
//! assert_eq!(joined.value(), Ok(Some(slots.identity())));
//! assert_eq!(slots.to_vec(), vec![Value::from_usize(1), Value::from_usize(2)]);
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::{with_engine, Engine};
use crate::error::PromiseError;
use crate::promise::{Promise, Settlement, Waiter};
use crate::table::PromiseId;
use crate::value::Value;

/// Destination for the values of fulfilled inputs.
pub trait ResultSink {
    /// Number of slots.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the value of input `index`.
    fn store(&self, index: usize, value: Value);

    /// The word the output promise fulfills with.
    fn identity(&self) -> Value;
}

/// Heap-allocated result slots.
///
/// Identity is the address of the slots object, so a handler can compare the
/// output's value against [`ResultSink::identity`].
#[derive(Debug)]
pub struct ResultSlots {
    slots: RefCell<Vec<Value>>,
}

impl ResultSlots {
    pub fn new(len: usize) -> Rc<Self> {
        Rc::new(Self {
            slots: RefCell::new(vec![Value::NULL; len]),
        })
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.slots.borrow().get(index).copied()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.slots.borrow().clone()
    }
}

impl ResultSink for ResultSlots {
    fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    fn store(&self, index: usize, value: Value) {
        if let Some(slot) = self.slots.borrow_mut().get_mut(index) {
            *slot = value;
        }
    }

    fn identity(&self) -> Value {
        Value::from_ptr(self as *const Self)
    }
}

/// Sink together with the words read from it before entering the engine.
struct SinkBinding {
    sink: Rc<dyn ResultSink>,
    len: usize,
    identity: Value,
}

impl SinkBinding {
    fn read(sink: &Rc<dyn ResultSink>) -> Self {
        Self {
            sink: Rc::clone(sink),
            len: sink.len(),
            identity: sink.identity(),
        }
    }
}

/// Shared bookkeeping of one `all` call.
struct AllState {
    remaining: usize,
    /// Subscriptions not yet notified or abandoned.
    subscribers: usize,
    /// Output settled, or its hold given up.
    done: bool,
    output: PromiseId,
    identity: Value,
    sink: Option<Rc<dyn ResultSink>>,
}

/// Subscription of one input. Holds no reference to the input.
pub(crate) struct AllSubscription {
    state: Rc<RefCell<AllState>>,
    index: usize,
}

impl AllSubscription {
    pub(crate) fn notify(self, settlement: Settlement) {
        let AllSubscription { state, index } = self;

        if let Settlement::Fulfilled(value) = settlement {
            let sink = {
                let state = state.borrow();
                if state.done {
                    None
                } else {
                    state.sink.clone()
                }
            };
            if let Some(sink) = sink {
                sink.store(index, value);
            }
        }

        let (output, finished, orphaned) = {
            let mut state = state.borrow_mut();
            state.subscribers -= 1;
            let finished = if state.done {
                None
            } else {
                match settlement {
                    Settlement::Fulfilled(_) => {
                        state.remaining -= 1;
                        (state.remaining == 0).then_some(Settlement::Fulfilled(state.identity))
                    }
                    rejected @ Settlement::Rejected(_) => Some(rejected),
                }
            };
            // Some inputs were freed unsettled; nothing is left to finish.
            let orphaned = finished.is_none() && !state.done && state.subscribers == 0;
            if finished.is_some() || orphaned {
                state.done = true;
            }
            (state.output, finished, orphaned)
        };

        if let Some(settlement) = finished {
            with_engine(|engine| engine.finish_all(output, settlement));
        } else if orphaned {
            tracing::debug!(%output, "all can no longer fulfill");
            with_engine(|engine| {
                let _ = engine.release(output);
            });
        }
    }

    /// The input was freed before settling. Returns the output once its
    /// last subscription is gone without the output having settled.
    pub(crate) fn abandon(&self) -> Option<PromiseId> {
        let mut state = self.state.borrow_mut();
        state.subscribers -= 1;
        if state.done || state.subscribers > 0 {
            return None;
        }
        state.done = true;
        tracing::debug!(output = %state.output, "all abandoned by its inputs");
        Some(state.output)
    }
}

impl Engine {
    /// Join `inputs` into a new output promise.
    ///
    /// The output id carries the caller's reference. Validation happens
    /// before anything is created, so on error no subscription exists.
    fn all(&mut self, inputs: &[PromiseId], sink: Option<SinkBinding>) -> Result<PromiseId, PromiseError> {
        if let Some(binding) = &sink {
            if binding.len < inputs.len() {
                return Err(PromiseError::ResultBufferTooSmall {
                    needed: inputs.len(),
                    len: binding.len,
                });
            }
        }
        if let Some(&stale) = inputs.iter().find(|&&input| !self.contains(input)) {
            return Err(PromiseError::InvalidHandle(stale));
        }

        let identity = sink.as_ref().map_or(Value::NULL, |binding| binding.identity);
        let output = self.create();
        // Held until the output settles or every input is gone.
        self.acquire(output)?;

        if inputs.is_empty() {
            self.defer(move || {
                with_engine(|engine| engine.finish_all(output, Settlement::Fulfilled(identity)));
            });
            return Ok(output);
        }

        tracing::debug!(%output, inputs = inputs.len(), "joining promises");
        let state = Rc::new(RefCell::new(AllState {
            remaining: inputs.len(),
            subscribers: inputs.len(),
            done: false,
            output,
            identity,
            sink: sink.map(|binding| binding.sink),
        }));

        for (index, &input) in inputs.iter().enumerate() {
            let subscription = AllSubscription {
                state: Rc::clone(&state),
                index,
            };
            self.subscribe(input, Waiter::All(subscription))?;
        }
        Ok(output)
    }

    fn finish_all(&mut self, output: PromiseId, settlement: Settlement) {
        if let Err(err) = self.settle(output, settlement) {
            tracing::warn!(%err, "all output was resolved elsewhere");
        }
        let _ = self.release(output);
    }
}

/// Join promises: fulfills once all inputs fulfill, rejects on the first
/// rejection.
///
/// The combinator holds no reference to its inputs. An input dropped while
/// pending, with nobody left to settle it, is freed, and the output can then
/// never fulfill. With no sink the output fulfills with `Value::NULL`.
///
/// The sink's `len` and `identity` are read once, before the join is set up.
pub fn all<'a, I>(inputs: I, sink: Option<Rc<dyn ResultSink>>) -> Result<Promise, PromiseError>
where
    I: IntoIterator<Item = &'a Promise>,
{
    let ids: Vec<PromiseId> = inputs.into_iter().map(Promise::id).collect();
    let binding = sink.as_ref().map(SinkBinding::read);
    let joined = with_engine(|engine| engine.all(&ids, binding)).map(Promise::from_raw);
    drop(sink);
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{init, live_handles, run_until_idle};
    use crate::promise::{PromiseState, Resolution};
    use crate::PromiseConfig;
    use pretty_assertions::assert_eq;

    fn v(word: usize) -> Value {
        Value::from_usize(word)
    }

    fn sink(slots: &Rc<ResultSlots>) -> Option<Rc<dyn ResultSink>> {
        Some(Rc::clone(slots) as Rc<dyn ResultSink>)
    }

    #[test]
    fn test_all_empty_fulfills_later() {
        init(PromiseConfig::default());
        let slots = ResultSlots::new(0);
        let joined = all(&[], sink(&slots)).unwrap();

        assert_eq!(joined.state(), Ok(PromiseState::Pending));
        run_until_idle();
        assert_eq!(joined.value(), Ok(Some(slots.identity())));
        assert!(slots.to_vec().is_empty());
    }

    #[test]
    fn test_all_empty_without_sink() {
        init(PromiseConfig::default());
        let joined = all(&[], None).unwrap();
        run_until_idle();
        assert_eq!(joined.value(), Ok(Some(Value::NULL)));
    }

    #[test]
    fn test_all_success() {
        init(PromiseConfig::default());
        let inputs = [Promise::new(), Promise::new(), Promise::new()];
        let slots = ResultSlots::new(3);
        let joined = all(&inputs, sink(&slots)).unwrap();

        inputs[0].fulfill(v(42)).unwrap();
        inputs[1].fulfill(v(1337)).unwrap();
        inputs[2].fulfill(Value::NULL).unwrap();
        drop(inputs);

        run_until_idle();
        assert_eq!(joined.value(), Ok(Some(slots.identity())));
        assert_eq!(slots.to_vec(), vec![v(42), v(1337), Value::NULL]);

        drop(joined);
        assert_eq!(live_handles(), 0);
    }

    #[test]
    fn test_all_first_error_wins() {
        init(PromiseConfig::default());
        let inputs = [Promise::new(), Promise::new(), Promise::new()];
        let slots = ResultSlots::new(3);
        let joined = all(&inputs, sink(&slots)).unwrap();

        inputs[0].fulfill(v(42)).unwrap();
        inputs[1].reject(v(1337)).unwrap();
        inputs[2].reject(v(7)).unwrap();
        drop(inputs);

        run_until_idle();
        assert_eq!(joined.settlement(), Ok(Some(Settlement::Rejected(v(1337)))));

        drop(joined);
        assert_eq!(live_handles(), 0);
    }

    #[test]
    fn test_all_rejection_ignores_late_fulfillment() {
        init(PromiseConfig::default());
        let inputs = [Promise::new(), Promise::new()];
        let joined = all(&inputs, None).unwrap();

        inputs[1].reject(v(1)).unwrap();
        run_until_idle();
        assert_eq!(joined.state(), Ok(PromiseState::Rejected));

        inputs[0].fulfill(v(2)).unwrap();
        run_until_idle();
        assert_eq!(joined.value(), Ok(Some(v(1))));
    }

    #[test]
    fn test_all_dropped_inputs_settled_by_resolvers() {
        init(PromiseConfig::default());
        let a = Promise::new();
        let b = Promise::new();
        let joined = all([&a, &b], None).unwrap();

        let resolver = a.clone();
        drop(a);
        resolver.fulfill(v(1)).unwrap();
        b.fulfill(v(2)).unwrap();
        drop((resolver, b));

        run_until_idle();
        assert_eq!(joined.state(), Ok(PromiseState::Fulfilled));
        drop(joined);
        assert_eq!(live_handles(), 0);
    }

    #[test]
    fn test_abandoned_all_frees_input_and_output() {
        init(PromiseConfig::default());
        let a = Promise::new();
        let joined = all([&a], None).unwrap();
        assert_eq!(live_handles(), 2);

        drop(a);
        drop(joined);
        run_until_idle();
        assert_eq!(live_handles(), 0);
    }

    #[test]
    fn test_all_output_released_once_inputs_are_gone() {
        init(PromiseConfig::default());
        let a = Promise::new();
        let b = Promise::new();
        let joined = all([&a, &b], None).unwrap();

        b.fulfill(v(1)).unwrap();
        drop(a);
        drop(b);
        run_until_idle();

        // Only the caller's handle keeps the output alive now.
        assert_eq!(joined.state(), Ok(PromiseState::Pending));
        assert_eq!(live_handles(), 1);
        drop(joined);
        assert_eq!(live_handles(), 0);
    }

    /// Sink that queries the engine from every callback.
    struct IntrospectingSink {
        slots: RefCell<Vec<Value>>,
    }

    impl ResultSink for IntrospectingSink {
        fn len(&self) -> usize {
            let _ = live_handles();
            self.slots.borrow().len()
        }

        fn store(&self, index: usize, value: Value) {
            let _ = live_handles();
            self.slots.borrow_mut()[index] = value;
        }

        fn identity(&self) -> Value {
            Value::from_usize(live_handles())
        }
    }

    #[test]
    fn test_sink_may_query_engine() {
        init(PromiseConfig::default());
        let a = Promise::new();
        let b = Promise::new();
        let sink = Rc::new(IntrospectingSink {
            slots: RefCell::new(vec![Value::NULL; 2]),
        });
        let joined = all([&a, &b], Some(Rc::clone(&sink) as Rc<dyn ResultSink>)).unwrap();

        a.fulfill(v(3)).unwrap();
        b.fulfill(v(4)).unwrap();
        run_until_idle();

        // Identity was read while only the two inputs existed.
        assert_eq!(joined.value(), Ok(Some(v(2))));
        assert_eq!(*sink.slots.borrow(), vec![v(3), v(4)]);
    }

    #[test]
    fn test_all_of_already_settled_inputs() {
        init(PromiseConfig::default());
        let a = Promise::new();
        let b = Promise::new();
        a.fulfill(v(10)).unwrap();
        b.fulfill(v(20)).unwrap();

        let slots = ResultSlots::new(2);
        let joined = all([&a, &b], sink(&slots)).unwrap();
        assert_eq!(joined.state(), Ok(PromiseState::Pending));

        run_until_idle();
        assert_eq!(slots.get(0), Some(v(10)));
        assert_eq!(slots.get(1), Some(v(20)));
        assert_eq!(joined.value(), Ok(Some(slots.identity())));
    }

    #[test]
    fn test_all_buffer_too_small() {
        init(PromiseConfig::default());
        let inputs = [Promise::new(), Promise::new()];
        let slots = ResultSlots::new(1);
        assert_eq!(
            all(&inputs, sink(&slots)).map(Promise::into_raw),
            Err(PromiseError::ResultBufferTooSmall { needed: 2, len: 1 })
        );
        assert_eq!(live_handles(), 2);
    }

    #[test]
    fn test_all_feeds_continuation() {
        init(PromiseConfig::default());
        let inputs = [Promise::new(), Promise::new()];
        let joined = all(&inputs, None).unwrap();
        let checked = joined.then(
            |_, _| Resolution::Fulfill(v(1)),
            |error, _| Resolution::Fulfill(error),
            Value::NULL,
        );
        drop(joined);

        inputs[0].reject(v(5)).unwrap();
        inputs[1].fulfill(v(6)).unwrap();
        drop(inputs);
        run_until_idle();

        assert_eq!(checked.value(), Ok(Some(v(5))));
        drop(checked);
        assert_eq!(live_handles(), 0);
    }
}
