//! Coroutine exception propagation, per spec.md §8 scenario 6: a
//! coroutine's entry panics with a user exception; its resumer catches
//! [`uxk::context::UnhandledException`]; `trigger_cause()` rethrows the
//! original. A chain of resumers that each decline to handle it records one
//! frame of propagation per [`uxk::context::UnhandledException::chain`]
//! call before the original is finally caught by its correct handler.

use std::panic::{self, AssertUnwindSafe};

use uxk::context::{self, Coroutine};

#[derive(Debug)]
struct UserException(&'static str);

#[test]
fn resumer_catches_unhandled_exception_and_rethrows_the_original() {
    let main = Coroutine::wrap_current(Some("main".into()));
    let worker = Coroutine::start(Some("worker".into()), 256 * 1024, move || {
        panic::panic_any(UserException("division by zero"));
    });

    let err = context::resume(&main, &worker).expect_err("worker's panic must surface as an UnhandledException");
    assert_eq!(err.chain_depth, 0);

    let rethrown = panic::catch_unwind(AssertUnwindSafe(|| err.trigger_cause()))
        .expect_err("trigger_cause must rethrow the original panic");
    let original = rethrown
        .downcast_ref::<UserException>()
        .expect("the rethrown payload must still be the original UserException");
    assert_eq!(original.0, "division by zero");
}

#[test]
fn chain_records_one_frame_per_declining_resumer() {
    let main = Coroutine::wrap_current(Some("main".into()));
    let worker = Coroutine::start(Some("worker".into()), 256 * 1024, move || {
        panic::panic_any(UserException("out of range"));
    });

    let err = context::resume(&main, &worker).expect_err("worker's panic must surface as an UnhandledException");
    assert_eq!(err.chain_depth, 0);

    // Two intermediate resumers inspect it, decline to handle it, and pass
    // it further up; each such hop is one `chain()` call.
    let err = err.chain();
    assert_eq!(err.chain_depth, 1);
    let err = err.chain();
    assert_eq!(err.chain_depth, 2);

    let rethrown = panic::catch_unwind(AssertUnwindSafe(|| err.trigger_cause()))
        .expect_err("trigger_cause must still rethrow the original panic after chaining");
    let original = rethrown
        .downcast_ref::<UserException>()
        .expect("chaining must not alter the original payload");
    assert_eq!(original.0, "out of range");
}
