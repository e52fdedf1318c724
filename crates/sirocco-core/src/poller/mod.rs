//! Native poller adapter: the thin translation layer to the OS event
//! backend.
//!
//! The dispatcher speaks one contract — register / modify / unregister /
//! poll / wake — and the backend is chosen at compile time: epoll on
//! Linux, kqueue on macOS and the BSDs. Both backends fold an internal
//! wake primitive (eventfd / `EVFILT_USER`) into the same poll call so a
//! cross-thread wake can interrupt a blocking wait.

use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::{EpollPoller as Poller, PollWaker};

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub use kqueue::{KqueuePoller as Poller, PollWaker};

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
compile_error!("no poller backend for this target: epoll or kqueue is required");

/// Readiness conditions a watch is interested in.
///
/// Error conditions are not part of the mask: the native backends report
/// them unconditionally, and the registry routes them to every waiter on
/// the descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interest {
    /// Wake when the descriptor becomes readable.
    pub read: bool,
    /// Wake when the descriptor becomes writable.
    pub write: bool,
}

impl Interest {
    /// Read readiness only.
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };

    /// Write readiness only.
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    /// Both read and write readiness.
    pub const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };

    /// Union of two masks.
    pub fn union(self, other: Interest) -> Interest {
        Interest {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }

    /// True when neither condition is selected.
    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// One translated backend event: a descriptor and what fired on it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PollEvent {
    /// The descriptor the event is for.
    pub fd: RawFd,
    /// Read readiness fired.
    pub readable: bool,
    /// Write readiness fired.
    pub writable: bool,
    /// The backend reported an error or hangup condition.
    pub error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn nonblocking_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe() failed");
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    #[test]
    fn test_interest_union() {
        assert_eq!(Interest::READ.union(Interest::WRITE), Interest::READ_WRITE);
        assert!(!Interest::READ.is_empty());
        assert!(Interest { read: false, write: false }.is_empty());
    }

    #[test]
    fn test_poll_reports_readable_pipe() {
        let mut poller = Poller::new(16).unwrap();
        let (read_fd, write_fd) = nonblocking_pipe();

        poller.register(read_fd, Interest::READ).unwrap();
        let n = unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) };
        assert_eq!(n, 1);

        let mut events = Vec::new();
        poller
            .poll(Some(Duration::from_millis(500)), &mut events)
            .unwrap();

        assert!(events.iter().any(|ev| ev.fd == read_fd && ev.readable));

        poller.unregister(read_fd).unwrap();
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn test_poll_times_out_empty() {
        let mut poller = Poller::new(16).unwrap();
        let (read_fd, write_fd) = nonblocking_pipe();
        poller.register(read_fd, Interest::READ).unwrap();

        let start = Instant::now();
        let mut events = Vec::new();
        poller
            .poll(Some(Duration::from_millis(40)), &mut events)
            .unwrap();

        assert!(events.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(30));

        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn test_waker_interrupts_blocking_poll() {
        let mut poller = Poller::new(16).unwrap();
        let waker = poller.waker();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            waker.wake();
        });

        let start = Instant::now();
        let mut events = Vec::new();
        poller
            .poll(Some(Duration::from_secs(5)), &mut events)
            .unwrap();

        // The wake itself is filtered out of the batch.
        assert!(events.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_modify_switches_interest() {
        let mut poller = Poller::new(16).unwrap();
        let (read_fd, write_fd) = nonblocking_pipe();

        // A fresh pipe's write end is immediately writable.
        poller.register(write_fd, Interest::WRITE).unwrap();
        let mut events = Vec::new();
        poller
            .poll(Some(Duration::from_millis(200)), &mut events)
            .unwrap();
        assert!(events.iter().any(|ev| ev.fd == write_fd && ev.writable));

        // After switching the mask to read-only it stops firing.
        poller.modify(write_fd, Interest::READ).unwrap();
        let mut events = Vec::new();
        poller
            .poll(Some(Duration::from_millis(40)), &mut events)
            .unwrap();
        assert!(!events.iter().any(|ev| ev.fd == write_fd && ev.writable));

        close(read_fd);
        close(write_fd);
    }
}
