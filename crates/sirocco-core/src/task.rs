//! Coroutine state machine, wait requests, and handles.
//!
//! A coroutine here is an explicit state machine, not a language-level
//! `async` construct: the dispatcher calls [`Coroutine::resume`] with the
//! [`Event`] that woke it, and the coroutine answers with a [`Step`] —
//! either a value that completes it or a [`WaitRequest`] that suspends it
//! again. The dispatcher owns every spawned coroutine; callers keep only a
//! [`Handle`], an id into the dispatcher's task arena.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::WaitError;
use crate::poller::Interest;
use crate::timer::TimerId;

/// Unique identifier for a coroutine managed by a dispatcher.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Allocate the next unique id.
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Lifecycle state of a coroutine.
///
/// Transitions: `Created → Running` on first resume, `Running → Suspended`
/// on await, `Suspended → Running` on delivery, `Running → Completed` on
/// return, `Running → Failed` on panic, and any non-terminal state
/// `→ Cancelled` on explicit cancellation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned but never resumed.
    Created,
    /// Currently executing inside a resume call.
    Running,
    /// Parked on a wait request.
    Suspended,
    /// Finished with a result.
    Completed,
    /// Explicitly cancelled.
    Cancelled,
    /// Panicked during a resume.
    Failed,
}

impl TaskState {
    /// True for states the coroutine can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Which readiness conditions fired for a watched descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// The descriptor is readable.
    pub readable: bool,
    /// The descriptor is writable.
    pub writable: bool,
}

/// The outcome delivered to a coroutine when it is resumed.
///
/// Cancellation and timeout are distinct variants on purpose: a resuming
/// computation can always tell them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// First resume after spawn.
    Start,
    /// The requested sleep elapsed.
    Elapsed,
    /// The watched descriptor became ready.
    Ready {
        /// The descriptor the watch was registered on.
        fd: RawFd,
        /// Which of the watched conditions fired.
        readiness: Readiness,
    },
    /// The timeout of a compound I/O wait fired first; the watch was
    /// cancelled before this delivery.
    TimedOut,
    /// The awaited POSIX signal was delivered; carries the signal number.
    Signal(i32),
    /// A remote wake arrived through the cross-thread handoff.
    Notified,
    /// The coroutine was cancelled. This is its final resume; any wait it
    /// requests from here is ignored.
    Cancelled,
    /// The wait could not be established or the watched resource errored.
    Error(WaitError),
}

/// What a coroutine asks to wait for when it suspends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitRequest {
    /// Resume after approximately `duration` (monotonic clock; drift is
    /// bounded by poll granularity).
    Sleep {
        /// How long to sleep.
        duration: Duration,
    },
    /// Resume when `fd` satisfies `interest`, or when `timeout` expires,
    /// whichever comes first. The loser is cancelled before delivery.
    Io {
        /// Descriptor to watch.
        fd: RawFd,
        /// Readiness conditions of interest. Error conditions are always
        /// watched implicitly, as the native backends report them
        /// unconditionally.
        interest: Interest,
        /// Optional timeout making this a compound wait.
        timeout: Option<Duration>,
    },
    /// Resume when the process receives `signum`.
    Signal {
        /// Signal number to wait for.
        signum: i32,
    },
}

impl WaitRequest {
    /// Wait for a duration to elapse.
    pub fn sleep(duration: Duration) -> Self {
        WaitRequest::Sleep { duration }
    }

    /// Wait for readiness on a descriptor, with no timeout.
    pub fn io(fd: RawFd, interest: Interest) -> Self {
        WaitRequest::Io {
            fd,
            interest,
            timeout: None,
        }
    }

    /// Wait for readiness on a descriptor or a timeout, whichever fires
    /// first.
    pub fn io_timeout(fd: RawFd, interest: Interest, timeout: Duration) -> Self {
        WaitRequest::Io {
            fd,
            interest,
            timeout: Some(timeout),
        }
    }

    /// Wait for a POSIX signal.
    pub fn signal(signum: i32) -> Self {
        WaitRequest::Signal { signum }
    }
}

/// Value a coroutine completes with, retrieved through
/// [`Dispatcher::result`](crate::Dispatcher::result).
pub type Output = Box<dyn Any>;

/// Result of one resume step.
pub enum Step {
    /// Park until the requested condition fires.
    Suspend(WaitRequest),
    /// Finish with a value.
    Complete(Output),
}

/// A suspendable unit of computation driven by the dispatcher.
///
/// `resume` is called once with [`Event::Start`] and then once per
/// delivered wake. It must not block beyond its own work: a long blocking
/// call inside `resume` stalls the whole loop, because scheduling is
/// cooperative and single-threaded.
///
/// Any `FnMut(Event, &mut Context) -> Step` closure is a coroutine.
pub trait Coroutine {
    /// Advance the computation with the delivered `event`.
    fn resume(&mut self, event: Event, ctx: &mut Context) -> Step;
}

impl<F> Coroutine for F
where
    F: FnMut(Event, &mut Context) -> Step,
{
    fn resume(&mut self, event: Event, ctx: &mut Context) -> Step {
        self(event, ctx)
    }
}

impl Coroutine for Box<dyn Coroutine> {
    fn resume(&mut self, event: Event, ctx: &mut Context) -> Step {
        (**self).resume(event, ctx)
    }
}

/// Caller-visible, non-owning reference to a spawned coroutine.
///
/// A handle never extends the coroutine's lifetime; it is an id into the
/// dispatcher's arena and stays valid (as a name) after the task ends.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    id: TaskId,
}

impl Handle {
    pub(crate) fn new(id: TaskId) -> Self {
        Handle { id }
    }

    /// The underlying task id.
    pub fn id(&self) -> TaskId {
        self.id
    }
}

/// Deferred scheduler operation requested from inside a resume.
pub(crate) enum DeferredOp {
    Spawn {
        id: TaskId,
        coroutine: Box<dyn Coroutine>,
    },
    Cancel(TaskId),
    Stop,
}

/// Scheduler access handed to a coroutine while it is being resumed.
///
/// Operations are buffered and applied by the dispatcher after the resume
/// step returns; a coroutine spawned here is first resumed on a later
/// drain, per the fairness rule.
pub struct Context {
    ops: Vec<DeferredOp>,
}

impl Context {
    pub(crate) fn new() -> Self {
        Context { ops: Vec::new() }
    }

    /// Spawn a new coroutine. The returned handle is valid immediately.
    pub fn spawn<C: Coroutine + 'static>(&mut self, coroutine: C) -> Handle {
        let id = TaskId::next();
        self.ops.push(DeferredOp::Spawn {
            id,
            coroutine: Box::new(coroutine),
        });
        Handle::new(id)
    }

    /// Request cancellation of another coroutine (or of the caller itself,
    /// which takes effect at its next suspension point).
    pub fn cancel(&mut self, handle: &Handle) {
        self.ops.push(DeferredOp::Cancel(handle.id()));
    }

    /// Request loop exit after the current iteration.
    pub fn stop(&mut self) {
        self.ops.push(DeferredOp::Stop);
    }

    pub(crate) fn take_ops(&mut self) -> Vec<DeferredOp> {
        std::mem::take(&mut self.ops)
    }
}

/// Terminal outcome kept in the arena until the caller consumes it.
pub(crate) enum TaskOutcome {
    Completed(Output),
    Failed(String),
    Cancelled,
}

/// Dispatcher-internal per-task record.
pub(crate) struct TaskSlot {
    pub(crate) state: TaskState,
    /// Taken out while the coroutine runs; dropped once terminal.
    pub(crate) coroutine: Option<Box<dyn Coroutine>>,
    pub(crate) outcome: Option<TaskOutcome>,
    /// Active I/O watch, if any. At most one per coroutine.
    pub(crate) watch: Option<(RawFd, Interest)>,
    /// Pending timer, if any. At most one per coroutine.
    pub(crate) timer: Option<TimerId>,
    /// Watched signal, if any.
    pub(crate) signal: Option<i32>,
    /// Set while Running when a cancel arrives; applied at the next
    /// suspension point.
    pub(crate) cancel_pending: bool,
}

impl TaskSlot {
    pub(crate) fn new(coroutine: Box<dyn Coroutine>) -> Self {
        TaskSlot {
            state: TaskState::Created,
            coroutine: Some(coroutine),
            outcome: None,
            watch: None,
            timer: None,
            signal: None,
            cancel_pending: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_uniqueness() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Created.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Suspended.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(TaskState::Failed.is_terminal());
    }

    #[test]
    fn test_context_collects_ops() {
        let mut ctx = Context::new();
        let h = ctx.spawn(|_event: Event, _ctx: &mut Context| {
            Step::Complete(Box::new(()))
        });
        ctx.cancel(&h);
        ctx.stop();

        let ops = ctx.take_ops();
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], DeferredOp::Spawn { id, .. } if *id == h.id()));
        assert!(matches!(&ops[1], DeferredOp::Cancel(id) if *id == h.id()));
        assert!(matches!(&ops[2], DeferredOp::Stop));
        assert!(ctx.take_ops().is_empty());
    }

    #[test]
    fn test_wait_request_constructors() {
        assert!(matches!(
            WaitRequest::sleep(Duration::from_millis(5)),
            WaitRequest::Sleep { .. }
        ));
        assert!(matches!(
            WaitRequest::io(3, Interest::READ),
            WaitRequest::Io { fd: 3, timeout: None, .. }
        ));
        assert!(matches!(
            WaitRequest::io_timeout(3, Interest::WRITE, Duration::from_secs(1)),
            WaitRequest::Io { timeout: Some(_), .. }
        ));
        assert!(matches!(WaitRequest::signal(10), WaitRequest::Signal { signum: 10 }));
    }

    #[test]
    fn test_closure_is_coroutine() {
        let mut hits = 0;
        let mut co = |_event: Event, _ctx: &mut Context| {
            hits += 1;
            Step::Complete(Box::new(41i32) as Output)
        };
        let mut ctx = Context::new();
        match co.resume(Event::Start, &mut ctx) {
            Step::Complete(v) => assert_eq!(*v.downcast::<i32>().unwrap(), 41),
            Step::Suspend(_) => panic!("expected completion"),
        }
    }
}
