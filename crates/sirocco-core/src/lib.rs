//! sirocco-core — an event-driven coroutine dispatcher.
//!
//! Single-threaded cooperative multitasking: coroutines suspend on I/O
//! readiness, timer expiry, or signal delivery, and the [`Dispatcher`]
//! resumes them when the native event backend (epoll on Linux, kqueue on
//! macOS/BSD) reports the awaited condition ready.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use sirocco_core::{Context, Dispatcher, Event, Step, WaitRequest};
//!
//! let mut dispatcher = Dispatcher::new()?;
//! let handle = dispatcher.spawn(|event: Event, _ctx: &mut Context| match event {
//!     Event::Start => Step::Suspend(WaitRequest::sleep(Duration::from_millis(50))),
//!     Event::Elapsed => Step::Complete(Box::new(1i32)),
//!     other => panic!("unexpected wake: {other:?}"),
//! });
//! dispatcher.run_until_complete(&handle)?;
//! let value = dispatcher.result(&handle).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(not(unix))]
compile_error!("sirocco-core requires a Unix event backend (epoll or kqueue)");

pub mod dispatcher;
pub mod error;
pub mod poller;
pub mod ready;
pub mod registry;
mod signal;
pub mod task;
pub mod timer;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{LoopError, ResultError, WaitError};
pub use poller::{Interest, PollEvent, PollWaker, Poller};
pub use ready::RemoteWake;
pub use registry::Registry;
pub use task::{
    Context, Coroutine, Event, Handle, Output, Readiness, Step, TaskId, TaskState, WaitRequest,
};
pub use timer::{DeadlineHeap, TimerId};
