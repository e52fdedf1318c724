//! Ready queue: coroutines eligible to resume this tick, plus the one
//! sanctioned cross-thread entry point.
//!
//! Everything else in the dispatcher is single-thread owned; a wake
//! arriving from another thread is marshaled through a channel here and
//! only acted on at the top of a tick, on the loop's own thread.

use std::collections::VecDeque;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::poller::PollWaker;
use crate::task::{Event, Handle, TaskId};

/// A coroutine queued for resumption together with the outcome to
/// deliver.
pub(crate) struct ReadyEntry {
    pub(crate) task: TaskId,
    pub(crate) event: Event,
}

/// FIFO queue of resumable coroutines.
pub(crate) struct ReadyQueue {
    queue: VecDeque<ReadyEntry>,
    remote_tx: Sender<TaskId>,
    remote_rx: Receiver<TaskId>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        let (remote_tx, remote_rx) = unbounded();
        ReadyQueue {
            queue: VecDeque::new(),
            remote_tx,
            remote_rx,
        }
    }

    /// Append an entry. FIFO order within a tick is the resumption order.
    pub(crate) fn enqueue(&mut self, task: TaskId, event: Event) {
        self.queue.push_back(ReadyEntry { task, event });
    }

    /// Atomically take exactly the entries present now. Entries enqueued
    /// while the snapshot is being processed land in the next one — this
    /// is the fairness rule that keeps a re-queuing coroutine from
    /// starving timer servicing.
    pub(crate) fn drain_snapshot(&mut self) -> VecDeque<ReadyEntry> {
        std::mem::take(&mut self.queue)
    }

    /// Collect task ids marshaled in from other threads.
    pub(crate) fn absorb_remote(&mut self) -> Vec<TaskId> {
        self.remote_rx.try_iter().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn remote_sender(&self) -> Sender<TaskId> {
        self.remote_tx.clone()
    }
}

/// Cloneable, thread-safe handle that resumes a suspended coroutine from
/// outside the loop thread.
///
/// The wake is delivered as [`Event::Notified`] on the next tick; any
/// pending watch or timer of the target is cancelled first, exactly as
/// for a native wake.
#[derive(Clone)]
pub struct RemoteWake {
    tx: Sender<TaskId>,
    waker: PollWaker,
}

impl RemoteWake {
    pub(crate) fn new(tx: Sender<TaskId>, waker: PollWaker) -> Self {
        RemoteWake { tx, waker }
    }

    /// Request a wake of `handle`'s coroutine. No-op if the target is not
    /// suspended by the time the loop processes it.
    pub fn wake(&self, handle: &Handle) {
        if self.tx.send(handle.id()).is_ok() {
            self.waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = ReadyQueue::new();
        let a = TaskId::next();
        let b = TaskId::next();
        queue.enqueue(a, Event::Start);
        queue.enqueue(b, Event::Start);

        let snapshot = queue.drain_snapshot();
        let order: Vec<TaskId> = snapshot.iter().map(|e| e.task).collect();
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn test_snapshot_defers_new_entries() {
        let mut queue = ReadyQueue::new();
        let a = TaskId::next();
        let b = TaskId::next();
        queue.enqueue(a, Event::Start);

        let snapshot = queue.drain_snapshot();
        assert_eq!(snapshot.len(), 1);

        // Simulates an enqueue performed while processing the snapshot.
        queue.enqueue(b, Event::Start);
        assert_eq!(queue.drain_snapshot().len(), 1);
    }

    #[test]
    fn test_remote_ids_are_absorbed_in_send_order() {
        let mut queue = ReadyQueue::new();
        let sender = queue.remote_sender();
        let a = TaskId::next();
        let b = TaskId::next();

        sender.send(a).unwrap();
        sender.send(b).unwrap();
        assert_eq!(queue.absorb_remote(), vec![a, b]);
        assert!(queue.absorb_remote().is_empty());
    }
}
