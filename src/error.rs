//! Typed error taxonomy, per spec.md §7.
//!
//! Locally recoverable conditions (`EAGAIN`, timed waits, etc.) are handled
//! inside the runtime; everything else surfaces here. Grounded on
//! `r3_test_runner`'s use of `thiserror` (the only part of the upstream
//! project that targets a hosted `std` environment the way `uxk` does) in
//! place of `r3_kernel`'s no_std hand-written `ResultCode` enum.

use thiserror::Error;

/// The calendar date given to [`crate::time::Time::construct`] does not lie
/// within the representable epoch range.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("instant does not lie within the representable epoch range")]
pub struct InvalidInstant;

/// Failures raised against a task when the monitor it depends on is torn
/// down out from under it, per spec.md §4.7 "Failure semantics at
/// destruction".
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    /// Raised at each caller still queued on a serial's entry queue when
    /// that serial is destroyed.
    #[error("entry queue caller abandoned: serial destroyed while waiting to enter")]
    EntryFailure,
    /// Raised at a task waiting on a condition variable whose owning serial
    /// is destroyed.
    #[error("condition wait abandoned: owning serial destroyed")]
    WaitingFailure,
    /// Raised at an accepted caller when the acceptor exits before
    /// completing the rendezvous.
    #[error("rendezvous abandoned: acceptor exited before completing the call")]
    RendezvousFailure,
    /// Raised at an `_Accept` caller whose `_Timeout` clause's deadline
    /// elapsed before any matching call arrived.
    #[error("accept timed out before a matching call arrived")]
    Timeout,
}

/// I/O operation failures, wrapping the OS errno with a typed operation
/// name, per spec.md §7 "I/O".
#[derive(Debug, Error)]
pub enum IoError {
    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("open timed out")]
    OpenTimeout,
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error type for fallible kernel operations that don't have a
/// more specific error enum of their own.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    InvalidInstant(#[from] InvalidInstant),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Io(#[from] IoError),
    /// The calling task was cancelled while blocked.
    #[error("task was cancelled")]
    Cancelled,
    /// A timed operation's deadline elapsed before it completed.
    #[error("operation timed out")]
    TimedOut,
}

/// Abort the process after logging a diagnostic, matching `r3_kernel`'s
/// "report stack corruption and terminate" posture for programming errors
/// and structural runtime failures that cannot be recovered from (spec.md
/// §7), grounded on `original_source/uCPP/.../uAbortExit.cc` and
/// `r3_kernel::utils::panicking`'s abort-on-inconsistency behavior.
#[cold]
#[inline(never)]
pub fn abort_with_diagnostic(message: &str) -> ! {
    log::error!("uxk: fatal: {message}");
    eprintln!("uxk: fatal: {message}");
    std::process::abort();
}
