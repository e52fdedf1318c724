//! Readiness registry: which coroutine waits for what on which
//! descriptor.
//!
//! The registry owns the fd → waiter mapping and is the only component
//! that talks to the poller about registration. The invariant it
//! enforces: at most one active watch per (descriptor, interest) pair.
//! A re-registration by the same waiter replaces the previous watch; a
//! registration by a different waiter is a conflict and leaves the
//! original untouched.

use std::os::unix::io::RawFd;

use rustc_hash::FxHashMap;

use crate::error::WaitError;
use crate::poller::{Interest, Poller};
use crate::task::TaskId;

#[derive(Default)]
struct FdWaiters {
    read: Option<TaskId>,
    write: Option<TaskId>,
}

impl FdWaiters {
    fn union(&self) -> Interest {
        Interest {
            read: self.read.is_some(),
            write: self.write.is_some(),
        }
    }
}

/// Maps watched descriptors to their waiting coroutines and mirrors the
/// mapping into the poller backend.
#[derive(Default)]
pub struct Registry {
    fds: FxHashMap<RawFd, FdWaiters>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` as the waiter for `interest` on `fd`.
    ///
    /// Fails with [`WaitError::Conflict`] if a different coroutine already
    /// waits on any of the requested conditions, and with
    /// [`WaitError::Resource`] if the backend refuses the descriptor
    /// (e.g. it is already closed).
    pub fn watch(
        &mut self,
        poller: &Poller,
        fd: RawFd,
        interest: Interest,
        task: TaskId,
    ) -> Result<(), WaitError> {
        debug_assert!(!interest.is_empty());

        let entry = self.fds.entry(fd).or_default();
        if interest.read {
            if let Some(owner) = entry.read {
                if owner != task {
                    return Err(WaitError::Conflict { fd });
                }
            }
        }
        if interest.write {
            if let Some(owner) = entry.write {
                if owner != task {
                    return Err(WaitError::Conflict { fd });
                }
            }
        }

        let was_registered = !entry.union().is_empty();
        let prev_read = entry.read;
        let prev_write = entry.write;
        if interest.read {
            entry.read = Some(task);
        }
        if interest.write {
            entry.write = Some(task);
        }
        let union = entry.union();

        let backend = if was_registered {
            poller.modify(fd, union)
        } else {
            poller.register(fd, union)
        };

        if let Err(err) = backend {
            // Roll back so a refused registration leaves no trace.
            let entry = self.fds.entry(fd).or_default();
            entry.read = prev_read;
            entry.write = prev_write;
            if entry.union().is_empty() {
                self.fds.remove(&fd);
            }
            return Err(WaitError::Resource {
                fd,
                message: err.to_string(),
            });
        }
        Ok(())
    }

    /// Move `task`'s watch on `fd` to a new interest mask.
    ///
    /// The caller must currently hold a watch on `fd`; the new mask is
    /// subject to the same conflict rule as [`Registry::watch`].
    pub fn rewatch(
        &mut self,
        poller: &Poller,
        fd: RawFd,
        interest: Interest,
        task: TaskId,
    ) -> Result<(), WaitError> {
        let entry = match self.fds.get_mut(&fd) {
            Some(entry) if entry.read == Some(task) || entry.write == Some(task) => entry,
            _ => {
                return Err(WaitError::Resource {
                    fd,
                    message: "no active watch to update".to_string(),
                })
            }
        };

        if interest.read && entry.read.is_some() && entry.read != Some(task) {
            return Err(WaitError::Conflict { fd });
        }
        if interest.write && entry.write.is_some() && entry.write != Some(task) {
            return Err(WaitError::Conflict { fd });
        }

        if entry.read == Some(task) {
            entry.read = None;
        }
        if entry.write == Some(task) {
            entry.write = None;
        }
        if interest.read {
            entry.read = Some(task);
        }
        if interest.write {
            entry.write = Some(task);
        }

        let union = entry.union();
        if union.is_empty() {
            self.fds.remove(&fd);
            let _ = poller.unregister(fd);
            return Ok(());
        }
        poller.modify(fd, union).map_err(|err| WaitError::Resource {
            fd,
            message: err.to_string(),
        })
    }

    /// Drop the watch for `interest` on `fd`. Idempotent; a no-op when
    /// nothing matches. Backend errors are ignored here because the
    /// descriptor may legitimately be gone already.
    pub fn unwatch(&mut self, poller: &Poller, fd: RawFd, interest: Interest) {
        let entry = match self.fds.get_mut(&fd) {
            Some(entry) => entry,
            None => return,
        };
        if interest.read {
            entry.read = None;
        }
        if interest.write {
            entry.write = None;
        }

        let union = entry.union();
        if union.is_empty() {
            self.fds.remove(&fd);
            let _ = poller.unregister(fd);
        } else {
            let _ = poller.modify(fd, union);
        }
    }

    /// The current (read waiter, write waiter) pair for `fd`.
    pub fn waiters(&self, fd: RawFd) -> (Option<TaskId>, Option<TaskId>) {
        match self.fds.get(&fd) {
            Some(entry) => (entry.read, entry.write),
            None => (None, None),
        }
    }

    /// Number of descriptors with at least one active watch.
    pub fn watched_fds(&self) -> usize {
        self.fds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_watch_then_conflict() {
        let poller = Poller::new(8).unwrap();
        let mut registry = Registry::new();
        let (read_fd, write_fd) = pipe();
        let first = TaskId::next();
        let second = TaskId::next();

        registry
            .watch(&poller, read_fd, Interest::READ, first)
            .unwrap();
        let err = registry
            .watch(&poller, read_fd, Interest::READ, second)
            .unwrap_err();
        assert_eq!(err, WaitError::Conflict { fd: read_fd });

        // The original watch is untouched.
        assert_eq!(registry.waiters(read_fd), (Some(first), None));

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn test_same_waiter_replaces() {
        let poller = Poller::new(8).unwrap();
        let mut registry = Registry::new();
        let (read_fd, write_fd) = pipe();
        let task = TaskId::next();

        registry
            .watch(&poller, read_fd, Interest::READ, task)
            .unwrap();
        registry
            .watch(&poller, read_fd, Interest::READ, task)
            .unwrap();
        assert_eq!(registry.waiters(read_fd), (Some(task), None));
        assert_eq!(registry.watched_fds(), 1);

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn test_distinct_interests_coexist() {
        let poller = Poller::new(8).unwrap();
        let mut registry = Registry::new();
        let (read_fd, write_fd) = pipe();
        let reader = TaskId::next();
        let writer = TaskId::next();

        registry
            .watch(&poller, write_fd, Interest::WRITE, writer)
            .unwrap();
        registry
            .watch(&poller, read_fd, Interest::READ, reader)
            .unwrap();
        assert_eq!(registry.watched_fds(), 2);

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn test_unwatch_is_idempotent() {
        let poller = Poller::new(8).unwrap();
        let mut registry = Registry::new();
        let (read_fd, write_fd) = pipe();
        let task = TaskId::next();

        registry
            .watch(&poller, read_fd, Interest::READ, task)
            .unwrap();
        registry.unwatch(&poller, read_fd, Interest::READ);
        registry.unwatch(&poller, read_fd, Interest::READ);
        assert_eq!(registry.waiters(read_fd), (None, None));
        assert_eq!(registry.watched_fds(), 0);

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn test_rewatch_moves_interest() {
        let poller = Poller::new(8).unwrap();
        let mut registry = Registry::new();
        let (read_fd, write_fd) = pipe();
        let task = TaskId::next();

        registry
            .watch(&poller, write_fd, Interest::WRITE, task)
            .unwrap();
        registry
            .rewatch(&poller, write_fd, Interest::READ, task)
            .unwrap();
        assert_eq!(registry.waiters(write_fd), (Some(task), None));

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn test_rewatch_without_watch_fails() {
        let poller = Poller::new(8).unwrap();
        let mut registry = Registry::new();
        let (read_fd, write_fd) = pipe();

        let err = registry
            .rewatch(&poller, read_fd, Interest::READ, TaskId::next())
            .unwrap_err();
        assert!(matches!(err, WaitError::Resource { .. }));

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn test_watch_closed_fd_reports_resource_error() {
        let poller = Poller::new(8).unwrap();
        let mut registry = Registry::new();
        let (read_fd, write_fd) = pipe();
        close(read_fd);
        close(write_fd);

        let err = registry
            .watch(&poller, read_fd, Interest::READ, TaskId::next())
            .unwrap_err();
        assert!(matches!(err, WaitError::Resource { .. }));
        assert_eq!(registry.watched_fds(), 0);
    }
}
