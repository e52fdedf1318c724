//! Error taxonomy for the dispatcher.
//!
//! Three domains, matching how errors propagate:
//! - [`LoopError`] is fatal to the current `run_*` invocation.
//! - [`WaitError`] is delivered to the one awaiting coroutine as its wake
//!   outcome and is recoverable locally.
//! - [`ResultError`] is returned by result queries on a handle.

use std::io;
use std::os::unix::io::RawFd;

/// Fatal errors that abort a `run_forever` / `run_until_complete` invocation.
///
/// When a `run_*` call returns one of these, every coroutine keeps its last
/// state for inspection; nothing is cancelled.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// The native poller backend failed. The loop cannot make progress
    /// without it, so the error is surfaced to whoever invoked the run.
    #[error("poller backend failure: {0}")]
    Backend(#[from] io::Error),
}

/// Errors delivered to an awaiting coroutine as its wake outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The backend reported an error condition (e.g. a closed descriptor)
    /// on a watched resource.
    #[error("resource error on fd {fd}: {message}")]
    Resource {
        /// The watched descriptor.
        fd: RawFd,
        /// Backend-provided detail.
        message: String,
    },

    /// Another coroutine already holds an active watch on this
    /// (descriptor, interest) pair. The original watch is untouched.
    #[error("conflicting watch on fd {fd}")]
    Conflict {
        /// The contended descriptor.
        fd: RawFd,
    },

    /// Another coroutine already waits for this signal.
    #[error("conflicting watch for signal {signum}")]
    SignalConflict {
        /// The contended signal number.
        signum: i32,
    },

    /// Installing the signal watch failed.
    #[error("signal watch for {signum} failed: {message}")]
    Signal {
        /// The requested signal number.
        signum: i32,
        /// Underlying failure detail.
        message: String,
    },
}

/// Errors returned when querying a coroutine's result through its handle.
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    /// The coroutine has not reached a terminal state yet.
    #[error("task has not finished")]
    NotDone,

    /// The coroutine was cancelled before producing a result.
    #[error("task was cancelled")]
    Cancelled,

    /// The coroutine panicked while running; the payload message is kept.
    #[error("task failed: {0}")]
    Failed(String),

    /// The handle does not name a live task — either it never existed in
    /// this dispatcher or its result was already consumed.
    #[error("unknown or already consumed handle")]
    Unknown,
}
