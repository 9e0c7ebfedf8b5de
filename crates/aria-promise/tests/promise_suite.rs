//! End-to-end promise chain through the Rust API.
//!
//! A single chain runs every scenario in sequence: each step is a handler
//! that starts some promises and hands back a promise for their completion,
//! so the next step only begins once everything before it has settled.

use aria_promise::{
    all, audit, depth, init, run_until_idle, Promise, PromiseConfig, PromiseState, Resolution,
    ResultSink, ResultSlots, Value,
};
use pretty_assertions::assert_eq;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

type HostTask = Box<dyn FnOnce()>;

thread_local! {
    static FAILURES: Cell<usize> = const { Cell::new(0) };
    static EXPECTED_STACK: Cell<usize> = const { Cell::new(0) };
    static HOST_TASKS: RefCell<VecDeque<HostTask>> = RefCell::new(VecDeque::new());
    static LOG: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

fn v(word: usize) -> Value {
    Value::from_usize(word)
}

fn log(line: impl Into<String>) {
    LOG.with(|log| log.borrow_mut().push(line.into()));
}

/// Callback-style API: run `task` after the current turn.
fn host_call(task: impl FnOnce() + 'static) {
    HOST_TASKS.with(|tasks| tasks.borrow_mut().push_back(Box::new(task)));
}

fn reset() {
    FAILURES.with(|failures| failures.set(0));
    EXPECTED_STACK.with(|expected| expected.set(0));
    HOST_TASKS.with(|tasks| tasks.borrow_mut().clear());
    LOG.with(|log| log.borrow_mut().clear());
    init(PromiseConfig::default());
}

/// Alternate between promise callbacks and host callbacks until both are idle.
fn drive() {
    loop {
        let ran = run_until_idle();
        let task = HOST_TASKS.with(|tasks| tasks.borrow_mut().pop_front());
        match task {
            Some(task) => task(),
            None if ran == 0 => break,
            None => {}
        }
    }
}

fn fail(_value: Value, data: Value) -> Resolution {
    FAILURES.with(|failures| failures.set(failures.get() + 1));
    log(format!("error! data: {data}"));
    Resolution::Reject(Value::NULL)
}

fn expect_success(value: Value, _data: Value) -> Resolution {
    log(format!("expected success: {value}"));
    Resolution::Fulfill(Value::NULL)
}

fn expect_error(value: Value, _data: Value) -> Resolution {
    log(format!("expected error: {value}"));
    Resolution::Fulfill(Value::NULL)
}

fn check_stack(_value: Value, _data: Value) -> Resolution {
    assert_eq!(depth(), 1);
    let marker = 0u8;
    let current = std::hint::black_box(&marker) as *const u8 as usize;
    let expected = EXPECTED_STACK.with(|expected| expected.get());
    if expected == 0 {
        EXPECTED_STACK.with(|expected| expected.set(current));
        return Resolution::Fulfill(Value::NULL);
    }
    if current != expected {
        log(format!("stack at {current:#x}, expected {expected:#x}"));
        return Resolution::Reject(Value::NULL);
    }
    Resolution::Fulfill(Value::NULL)
}

fn test_create(_value: Value, data: Value) -> Resolution {
    log("test_create");
    assert_eq!(data, v(1));

    let fulfilled = Promise::new();
    fulfilled.fulfill(v(1)).unwrap();
    drop(fulfilled.then(expect_success, fail, Value::NULL));

    let rejected = Promise::new();
    rejected.reject(v(2)).unwrap();
    drop(rejected.then(fail, expect_error, Value::NULL));

    let match_fulfilled = Promise::new();
    match_fulfilled.adopt(fulfilled.clone()).unwrap();
    let finish1 = match_fulfilled.then(expect_success, fail, Value::NULL);

    let match_rejected = Promise::new();
    match_rejected.adopt(rejected.clone()).unwrap();
    let finish2 = match_rejected.then(fail, expect_error, Value::NULL);

    drop((fulfilled, rejected, match_fulfilled, match_rejected));

    let finished = all([&finish1, &finish2], None).unwrap();
    Resolution::Match(finished)
}

fn test_promisify(_value: Value, data: Value) -> Resolution {
    log("test_promisify");
    assert_eq!(data, v(2));

    let promise = Promise::new();
    let resolver = promise.clone();
    host_call(move || {
        log("Hello from a callback");
        resolver.fulfill(Value::NULL).unwrap();
    });
    Resolution::Match(promise)
}

fn throw_string(_value: Value, _data: Value) -> Resolution {
    let _frame = std::hint::black_box([0u32; 128]);
    panic!("bang!");
}

fn throw_word(_value: Value, _data: Value) -> Resolution {
    let _frame = std::hint::black_box([0u32; 128]);
    std::panic::panic_any(1234usize);
}

fn test_rejection(_value: Value, data: Value) -> Resolution {
    log("test_rejection");
    assert_eq!(data, v(3));

    let start_fulfilled = Promise::new();
    let rejected1 = start_fulfilled.then(throw_string, fail, Value::NULL);
    let recovered1 = rejected1.then(fail, expect_error, Value::NULL);

    let start_rejected = Promise::new();
    let rejected2 = start_rejected.then(fail, throw_word, Value::NULL);
    let recovered2 = rejected2.then(fail, expect_error, Value::NULL);

    let finished = all([&recovered1, &recovered2], None).unwrap();

    start_fulfilled.fulfill(Value::NULL).unwrap();
    start_rejected.reject(Value::NULL).unwrap();
    Resolution::Match(finished)
}

fn check_results(
    slots: Rc<ResultSlots>,
    expected: Vec<Value>,
) -> impl FnOnce(Value, Value) -> Resolution {
    move |value, _| {
        assert_eq!(value, slots.identity());
        log("promise_all results:");
        assert_eq!(slots.to_vec(), expected);
        Resolution::Fulfill(Value::NULL)
    }
}

fn check_error(expected: Value) -> impl FnOnce(Value, Value) -> Resolution {
    move |value, _| {
        log(format!("promise_all error: {value}"));
        assert_eq!(value, expected);
        Resolution::Fulfill(Value::NULL)
    }
}

fn sink(slots: &Rc<ResultSlots>) -> Option<Rc<dyn ResultSink>> {
    Some(Rc::clone(slots) as Rc<dyn ResultSink>)
}

fn test_all(_value: Value, data: Value) -> Resolution {
    log("test_all");
    assert_eq!(data, v(4));

    // No input should result in success.
    let slots = ResultSlots::new(0);
    let empty = all(std::iter::empty(), sink(&slots)).unwrap();
    let empty_checked = empty.then(check_results(Rc::clone(&slots), vec![]), fail, Value::NULL);
    drop(empty);

    // Three fulfilled inputs should result in success.
    let slots = ResultSlots::new(3);
    let inputs = [Promise::new(), Promise::new(), Promise::new()];
    let full = all(&inputs, sink(&slots)).unwrap();
    let full_checked = full.then(
        check_results(Rc::clone(&slots), vec![v(42), v(1337), Value::NULL]),
        fail,
        Value::NULL,
    );
    drop(full);
    inputs[0].fulfill(v(42)).unwrap();
    inputs[1].fulfill(v(1337)).unwrap();
    inputs[2].fulfill(Value::NULL).unwrap();
    drop(inputs);

    // Similar, but now one of the inputs is rejected.
    let slots = ResultSlots::new(3);
    let inputs = [Promise::new(), Promise::new(), Promise::new()];
    let failed = all(&inputs, sink(&slots)).unwrap();
    let err_checked = failed.then(fail, check_error(v(1337)), Value::NULL);
    drop(failed);
    inputs[0].fulfill(v(42)).unwrap();
    inputs[1].reject(v(1337)).unwrap();
    inputs[2].fulfill(Value::NULL).unwrap();
    drop(inputs);

    let finished = all([&empty_checked, &full_checked, &err_checked], None).unwrap();
    Resolution::Match(finished)
}

fn finish(_value: Value, _data: Value) -> Resolution {
    log("finish");
    Resolution::Fulfill(Value::NULL)
}

#[test]
fn test_full_promise_chain() {
    reset();

    let start = Promise::new();
    let measure_stack = start.then(check_stack, fail, Value::NULL);
    let test1 = measure_stack.then(test_create, fail, v(1));
    let test2 = test1.then(test_promisify, fail, v(2));
    let test3 = test2.then(test_rejection, fail, v(3));
    let test4 = test3.then(test_all, fail, v(4));
    let assert_stack = test4.then(check_stack, fail, Value::NULL);
    let end = assert_stack.then(finish, fail, Value::NULL);

    start.fulfill(Value::NULL).unwrap();
    drop((start, measure_stack, test1, test2, test3, test4, assert_stack));

    drive();

    let lines = LOG.with(|log| log.borrow().clone());
    assert_eq!(FAILURES.with(|failures| failures.get()), 0, "log: {lines:?}");
    assert_eq!(end.state(), Ok(PromiseState::Fulfilled));

    for expected in [
        "test_create",
        "expected success: 1",
        "expected error: 2",
        "test_promisify",
        "Hello from a callback",
        "test_rejection",
        "test_all",
        "promise_all results:",
        "promise_all error: 1337",
        "finish",
    ] {
        assert!(lines.iter().any(|line| line == expected), "missing {expected:?} in {lines:?}");
    }
    assert_eq!(lines.last().map(String::as_str), Some("finish"));

    drop(end);
    assert_eq!(audit(), Ok(()));
}

#[test]
fn test_chain_steps_run_in_order() {
    reset();

    let start = Promise::new();
    let first = start.then(test_create, fail, v(1));
    let second = first.then(test_promisify, fail, v(2));

    start.fulfill(Value::NULL).unwrap();
    drop((start, first));
    drive();

    let lines = LOG.with(|log| log.borrow().clone());
    let position = |needle: &str| lines.iter().position(|line| line == needle);
    assert!(position("test_create") < position("test_promisify"));
    assert!(position("test_promisify") < position("Hello from a callback"));
    assert_eq!(second.state(), Ok(PromiseState::Fulfilled));

    drop(second);
    assert_eq!(audit(), Ok(()));
}
