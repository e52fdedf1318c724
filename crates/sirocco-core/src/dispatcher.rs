//! The dispatcher: a single-threaded poll-then-drain run loop.
//!
//! One tick = clamp the poll timeout to the nearest deadline, block in the
//! native poller, translate fired events and expired timers into ready
//! entries, then resume exactly the entries present at the start of the
//! drain. Entries enqueued while draining wait for the next tick, so a
//! coroutine that keeps re-queuing itself cannot starve timer servicing.
//!
//! There is no process-global loop: a `Dispatcher` is an explicit value,
//! and coroutine code reaches the scheduler only through the [`Context`]
//! passed into each resume.

use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rustc_hash::FxHashMap;

use crate::error::{LoopError, ResultError, WaitError};
use crate::poller::{PollEvent, Poller};
use crate::ready::{ReadyEntry, ReadyQueue, RemoteWake};
use crate::registry::Registry;
use crate::signal;
use crate::task::{
    Context, Coroutine, DeferredOp, Event, Handle, Output, Readiness, Step, TaskId, TaskOutcome,
    TaskSlot, TaskState, WaitRequest,
};
use crate::timer::DeadlineHeap;

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on events translated per poll call.
    pub max_events_per_poll: usize,
    /// Cap on a poll with no pending deadline. `None` blocks until an
    /// event or a remote wake arrives.
    pub idle_poll_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            max_events_per_poll: 64,
            idle_poll_timeout: None,
        }
    }
}

enum Settled {
    Nothing,
    Register(WaitRequest),
    CancelCleanup,
}

/// The event-driven coroutine dispatcher.
///
/// Owns the task arena, the readiness registry, the deadline heap, the
/// ready queue, and the native poller. All of them are mutated only on
/// the loop's thread; the one cross-thread entry point is
/// [`Dispatcher::remote_wake`].
pub struct Dispatcher {
    config: DispatcherConfig,
    poller: Poller,
    registry: Registry,
    timers: DeadlineHeap,
    ready: ReadyQueue,
    tasks: FxHashMap<TaskId, TaskSlot>,
    /// Signal number → waiting task, one waiter per signal.
    signal_watches: FxHashMap<i32, TaskId>,
    /// Read end of the process signal pipe, once watched.
    signal_pipe: Option<RawFd>,
    stop_requested: bool,
}

impl Dispatcher {
    /// Create a dispatcher with default configuration.
    pub fn new() -> Result<Self, LoopError> {
        Self::with_config(DispatcherConfig::default())
    }

    /// Create a dispatcher with explicit configuration.
    pub fn with_config(config: DispatcherConfig) -> Result<Self, LoopError> {
        let poller = Poller::new(config.max_events_per_poll)?;
        Ok(Dispatcher {
            config,
            poller,
            registry: Registry::new(),
            timers: DeadlineHeap::new(),
            ready: ReadyQueue::new(),
            tasks: FxHashMap::default(),
            signal_watches: FxHashMap::default(),
            signal_pipe: None,
            stop_requested: false,
        })
    }

    // ========================================================================
    // Public surface
    // ========================================================================

    /// Register a new coroutine. It is not run here: its first resume,
    /// with [`Event::Start`], happens on the next drain. Absent an earlier
    /// cancellation it runs at least once before the loop exits.
    pub fn spawn<C: Coroutine + 'static>(&mut self, coroutine: C) -> Handle {
        let id = TaskId::next();
        self.insert_task(id, Box::new(coroutine));
        Handle::new(id)
    }

    /// Cancel the coroutine behind `handle`.
    ///
    /// Suspended: its waits are purged and it gets one final resume with
    /// [`Event::Cancelled`] so cleanup logic can run. Created: it ends
    /// Cancelled without ever running. Terminal: no-op. A running
    /// coroutine (cancelling itself through [`Context::cancel`]) is
    /// marked and cancelled at its next suspension point.
    pub fn cancel(&mut self, handle: &Handle) {
        self.cancel_task(handle.id());
    }

    /// True once the coroutine reached a terminal state (or its result
    /// was already consumed).
    pub fn is_done(&self, handle: &Handle) -> bool {
        self.tasks
            .get(&handle.id())
            .map(|slot| slot.state.is_terminal())
            .unwrap_or(true)
    }

    /// Current lifecycle state, if the task is still in the arena.
    pub fn state(&self, handle: &Handle) -> Option<TaskState> {
        self.tasks.get(&handle.id()).map(|slot| slot.state)
    }

    /// Take the coroutine's result. Fails with [`ResultError::NotDone`]
    /// while it is still live; consumes the arena slot on success and on
    /// terminal failure outcomes, so a second call reports `Unknown`.
    pub fn result(&mut self, handle: &Handle) -> Result<Output, ResultError> {
        let id = handle.id();
        match self.tasks.get(&id) {
            None => return Err(ResultError::Unknown),
            Some(slot) if !slot.state.is_terminal() => return Err(ResultError::NotDone),
            Some(_) => {}
        }
        let slot = match self.tasks.remove(&id) {
            Some(slot) => slot,
            None => return Err(ResultError::Unknown),
        };
        match slot.outcome {
            Some(TaskOutcome::Completed(value)) => Ok(value),
            Some(TaskOutcome::Failed(message)) => Err(ResultError::Failed(message)),
            Some(TaskOutcome::Cancelled) | None => Err(ResultError::Cancelled),
        }
    }

    /// Number of tasks currently held in the arena.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// A cloneable handle other threads can use to resume a suspended
    /// coroutine; the only sanctioned cross-thread entry point.
    pub fn remote_wake(&self) -> RemoteWake {
        RemoteWake::new(self.ready.remote_sender(), self.poller.waker())
    }

    /// Request loop exit after the current iteration. Pending coroutines
    /// remain suspended with their watches and timers intact — stop is
    /// not cancel-all.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Drive the loop until [`Dispatcher::stop`] (or [`Context::stop`])
    /// is requested.
    pub fn run_forever(&mut self) -> Result<(), LoopError> {
        debug!("run_forever: {} tasks", self.tasks.len());
        loop {
            self.tick()?;
            if self.stop_requested {
                self.stop_requested = false;
                debug!("loop stopped");
                return Ok(());
            }
        }
    }

    /// Drive the loop until `handle`'s coroutine reaches a terminal
    /// state. Returns early with `Ok` if the loop is stopped first;
    /// callers observe actual progress through [`Dispatcher::is_done`].
    pub fn run_until_complete(&mut self, handle: &Handle) -> Result<(), LoopError> {
        loop {
            if self.is_done(handle) {
                return Ok(());
            }
            self.tick()?;
            if self.stop_requested {
                self.stop_requested = false;
                return Ok(());
            }
        }
    }

    // ========================================================================
    // Tick
    // ========================================================================

    fn tick(&mut self) -> Result<(), LoopError> {
        // Remote wakes enter the loop only here, on the loop's own thread.
        for id in self.ready.absorb_remote() {
            self.wake_suspended(id, Event::Notified);
        }

        let timeout = self.poll_timeout();
        let mut events = Vec::with_capacity(self.config.max_events_per_poll);
        self.poller.poll(timeout, &mut events)?;
        trace!("tick: {} events from poll", events.len());

        // Readiness before expiries: when a descriptor becomes ready in
        // the same batch its compound timeout expires, the I/O outcome is
        // delivered and the timer is cancelled.
        for ev in &events {
            self.dispatch_poll_event(ev);
        }

        let now = Instant::now();
        for (_, task) in self.timers.pop_expired(now) {
            let compound = match self.tasks.get_mut(&task) {
                Some(slot) if slot.state == TaskState::Suspended => {
                    slot.timer = None;
                    slot.watch.is_some()
                }
                _ => continue,
            };
            let event = if compound { Event::TimedOut } else { Event::Elapsed };
            self.wake_suspended(task, event);
        }

        let snapshot = self.ready.drain_snapshot();
        for entry in snapshot {
            self.run_entry(entry);
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Duration> {
        if !self.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        let until_deadline = self
            .timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match (until_deadline, self.config.idle_poll_timeout) {
            (Some(d), Some(idle)) => Some(d.min(idle)),
            (Some(d), None) => Some(d),
            (None, idle) => idle,
        }
    }

    fn dispatch_poll_event(&mut self, ev: &PollEvent) {
        if self.signal_pipe == Some(ev.fd) {
            for signum in signal::drain(ev.fd) {
                match self.signal_watches.get(&signum) {
                    Some(&task) => self.wake_suspended(task, Event::Signal(signum)),
                    None => trace!("signal {} arrived with no waiter", signum),
                }
            }
            return;
        }

        let (read_waiter, write_waiter) = self.registry.waiters(ev.fd);

        if ev.error {
            let resource_error = |fd| {
                Event::Error(WaitError::Resource {
                    fd,
                    message: "error or hangup on watched descriptor".to_string(),
                })
            };
            if let Some(task) = read_waiter {
                self.wake_suspended(task, resource_error(ev.fd));
            }
            if let Some(task) = write_waiter {
                if read_waiter != Some(task) {
                    self.wake_suspended(task, resource_error(ev.fd));
                }
            }
            return;
        }

        // One coroutine watching both conditions gets a single wake.
        if ev.readable && ev.writable && read_waiter.is_some() && read_waiter == write_waiter {
            if let Some(task) = read_waiter {
                self.wake_suspended(
                    task,
                    Event::Ready {
                        fd: ev.fd,
                        readiness: Readiness {
                            readable: true,
                            writable: true,
                        },
                    },
                );
            }
            return;
        }
        if ev.readable {
            match read_waiter {
                Some(task) => self.wake_suspended(
                    task,
                    Event::Ready {
                        fd: ev.fd,
                        readiness: Readiness {
                            readable: true,
                            writable: false,
                        },
                    },
                ),
                None => trace!("readable fd {} has no waiter", ev.fd),
            }
        }
        if ev.writable {
            match write_waiter {
                Some(task) => self.wake_suspended(
                    task,
                    Event::Ready {
                        fd: ev.fd,
                        readiness: Readiness {
                            readable: false,
                            writable: true,
                        },
                    },
                ),
                None => trace!("writable fd {} has no waiter", ev.fd),
            }
        }
    }

    /// Queue a suspended coroutine for resumption with `event`, purging
    /// every wait it still holds first: one outcome is delivered, the
    /// losers are cancelled before the resume.
    fn wake_suspended(&mut self, id: TaskId, event: Event) {
        match self.tasks.get(&id) {
            Some(slot) if slot.state == TaskState::Suspended => {}
            _ => {
                trace!("discarding wake for task {}", id.as_u64());
                return;
            }
        }
        self.purge_waits(id);
        self.ready.enqueue(id, event);
    }

    /// Remove every watch, timer, and signal registration of a task.
    fn purge_waits(&mut self, id: TaskId) {
        let (watch, timer, sig) = match self.tasks.get_mut(&id) {
            Some(slot) => (slot.watch.take(), slot.timer.take(), slot.signal.take()),
            None => return,
        };
        if let Some((fd, interest)) = watch {
            self.registry.unwatch(&self.poller, fd, interest);
        }
        if let Some(timer_id) = timer {
            self.timers.cancel(timer_id);
        }
        if let Some(signum) = sig {
            self.signal_watches.remove(&signum);
            signal::uninstall(signum);
        }
    }

    // ========================================================================
    // Resumption
    // ========================================================================

    fn run_entry(&mut self, entry: ReadyEntry) {
        let id = entry.task;
        let cancel_resume = matches!(entry.event, Event::Cancelled);

        let mut coroutine = {
            let slot = match self.tasks.get_mut(&id) {
                Some(slot) => slot,
                None => {
                    trace!("stale ready entry for task {}", id.as_u64());
                    return;
                }
            };
            let resumable = match slot.state {
                TaskState::Created | TaskState::Suspended => true,
                // The one resume a terminal state still receives: cleanup
                // after cancellation.
                TaskState::Cancelled => cancel_resume,
                _ => false,
            };
            if !resumable {
                trace!(
                    "skipping entry for task {} in state {:?}",
                    id.as_u64(),
                    slot.state
                );
                return;
            }
            let coroutine = match slot.coroutine.take() {
                Some(coroutine) => coroutine,
                None => return,
            };
            if !cancel_resume {
                slot.state = TaskState::Running;
            }
            coroutine
        };

        trace!("resuming task {} with {:?}", id.as_u64(), entry.event);
        let mut ctx = Context::new();
        let event = entry.event;
        let step = panic::catch_unwind(AssertUnwindSafe(|| coroutine.resume(event, &mut ctx)));
        // Deferred ops land before the step is settled: a self-cancel
        // issued during the resume is seen while the task is still
        // Running and takes effect at this suspension point.
        for op in ctx.take_ops() {
            self.apply_op(op);
        }
        self.settle(id, coroutine, step, cancel_resume);
    }

    fn settle(
        &mut self,
        id: TaskId,
        coroutine: Box<dyn Coroutine>,
        step: std::thread::Result<Step>,
        cancel_resume: bool,
    ) {
        let mut coroutine = Some(coroutine);
        let after = {
            let slot = match self.tasks.get_mut(&id) {
                Some(slot) => slot,
                None => return,
            };
            match step {
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!("task {} panicked: {}", id.as_u64(), message);
                    if !cancel_resume {
                        slot.state = TaskState::Failed;
                        slot.outcome = Some(TaskOutcome::Failed(message));
                    }
                    Settled::Nothing
                }
                Ok(Step::Complete(value)) => {
                    if !cancel_resume {
                        slot.state = TaskState::Completed;
                        slot.outcome = Some(TaskOutcome::Completed(value));
                        debug!("task {} completed", id.as_u64());
                    }
                    Settled::Nothing
                }
                Ok(Step::Suspend(request)) => {
                    if cancel_resume {
                        warn!(
                            "cancelled task {} tried to suspend during cleanup",
                            id.as_u64()
                        );
                        Settled::Nothing
                    } else if slot.cancel_pending {
                        slot.cancel_pending = false;
                        slot.state = TaskState::Cancelled;
                        slot.outcome = Some(TaskOutcome::Cancelled);
                        slot.coroutine = coroutine.take();
                        Settled::CancelCleanup
                    } else {
                        slot.state = TaskState::Suspended;
                        slot.coroutine = coroutine.take();
                        Settled::Register(request)
                    }
                }
            }
        };

        match after {
            Settled::Nothing => {}
            Settled::Register(request) => self.register_wait(id, request),
            Settled::CancelCleanup => {
                debug!("task {} cancelled at suspension point", id.as_u64());
                self.ready.enqueue(id, Event::Cancelled);
            }
        }
    }

    /// Establish the wait a coroutine suspended on. Registration failures
    /// are not fatal to the loop: the requester is resumed on the next
    /// tick with the error as its wake outcome.
    fn register_wait(&mut self, id: TaskId, request: WaitRequest) {
        match request {
            WaitRequest::Sleep { duration } => {
                let timer = self.timers.insert(Instant::now() + duration, id);
                if let Some(slot) = self.tasks.get_mut(&id) {
                    slot.timer = Some(timer);
                }
            }
            WaitRequest::Io {
                fd,
                interest,
                timeout,
            } => {
                if interest.is_empty() {
                    self.ready.enqueue(
                        id,
                        Event::Error(WaitError::Resource {
                            fd,
                            message: "empty interest mask".to_string(),
                        }),
                    );
                    return;
                }
                match self.registry.watch(&self.poller, fd, interest, id) {
                    Ok(()) => {
                        let timer =
                            timeout.map(|t| self.timers.insert(Instant::now() + t, id));
                        if let Some(slot) = self.tasks.get_mut(&id) {
                            slot.watch = Some((fd, interest));
                            slot.timer = timer;
                        }
                    }
                    Err(err) => {
                        debug!("watch on fd {} refused: {}", fd, err);
                        self.ready.enqueue(id, Event::Error(err));
                    }
                }
            }
            WaitRequest::Signal { signum } => {
                if let Some(&owner) = self.signal_watches.get(&signum) {
                    if owner != id {
                        self.ready
                            .enqueue(id, Event::Error(WaitError::SignalConflict { signum }));
                        return;
                    }
                }
                let installed = self
                    .ensure_signal_pipe()
                    .and_then(|_| signal::install(signum));
                match installed {
                    Ok(()) => {
                        self.signal_watches.insert(signum, id);
                        if let Some(slot) = self.tasks.get_mut(&id) {
                            slot.signal = Some(signum);
                        }
                    }
                    Err(err) => {
                        self.ready.enqueue(
                            id,
                            Event::Error(WaitError::Signal {
                                signum,
                                message: err.to_string(),
                            }),
                        );
                    }
                }
            }
        }
    }

    fn ensure_signal_pipe(&mut self) -> std::io::Result<()> {
        if self.signal_pipe.is_some() {
            return Ok(());
        }
        let fd = signal::pipe_fd()?;
        self.poller.register(fd, crate::poller::Interest::READ)?;
        self.signal_pipe = Some(fd);
        Ok(())
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    fn insert_task(&mut self, id: TaskId, coroutine: Box<dyn Coroutine>) {
        debug!("spawned task {}", id.as_u64());
        self.tasks.insert(id, TaskSlot::new(coroutine));
        self.ready.enqueue(id, Event::Start);
    }

    fn apply_op(&mut self, op: DeferredOp) {
        match op {
            DeferredOp::Spawn { id, coroutine } => self.insert_task(id, coroutine),
            DeferredOp::Cancel(id) => self.cancel_task(id),
            DeferredOp::Stop => {
                debug!("stop requested");
                self.stop_requested = true;
            }
        }
    }

    fn cancel_task(&mut self, id: TaskId) {
        let state = match self.tasks.get(&id) {
            Some(slot) => slot.state,
            None => return,
        };
        match state {
            TaskState::Created => {
                if let Some(slot) = self.tasks.get_mut(&id) {
                    slot.state = TaskState::Cancelled;
                    slot.outcome = Some(TaskOutcome::Cancelled);
                    slot.coroutine = None;
                }
                debug!("task {} cancelled before first resume", id.as_u64());
            }
            TaskState::Suspended => {
                self.purge_waits(id);
                if let Some(slot) = self.tasks.get_mut(&id) {
                    slot.state = TaskState::Cancelled;
                    slot.outcome = Some(TaskOutcome::Cancelled);
                }
                // One final resume so cleanup logic inside the
                // computation can run.
                self.ready.enqueue(id, Event::Cancelled);
                debug!("task {} cancelled", id.as_u64());
            }
            TaskState::Running => {
                if let Some(slot) = self.tasks.get_mut(&id) {
                    slot.cancel_pending = true;
                }
            }
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed => {}
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let watched: Vec<i32> = self.signal_watches.keys().copied().collect();
        for signum in watched {
            signal::uninstall(signum);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "coroutine panicked".to_string()
    }
}
