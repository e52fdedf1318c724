//! epoll-backed poller (Linux).
//!
//! Watched descriptors are carried in the epoll data word; the wake
//! eventfd uses a reserved token so wakes never surface as user events.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Interest, PollEvent};

/// Reserved data token for the wake eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

/// epoll-backed implementation of the poller contract.
pub struct EpollPoller {
    epfd: RawFd,
    wake_fd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    /// Create the epoll instance and its wake eventfd. `capacity` bounds
    /// the number of events returned per poll.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
            }
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epfd);
            }
            return Err(err);
        }

        Ok(EpollPoller {
            epfd,
            wake_fd,
            events: Vec::with_capacity(capacity.max(1)),
        })
    }

    fn mask(interest: Interest) -> u32 {
        let mut mask = 0u32;
        if interest.read {
            mask |= libc::EPOLLIN as u32;
        }
        if interest.write {
            mask |= libc::EPOLLOUT as u32;
        }
        mask
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: Self::mask(interest),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Start watching `fd` for `interest`.
    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    /// Replace the interest mask of an already watched `fd`.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    /// Stop watching `fd`. The caller may have closed it already; that
    /// surfaces as `EBADF` here and is the caller's to ignore.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block for at most `timeout` (`None` = indefinitely) and append the
    /// translated batch to `out`. An interrupted wait returns an empty
    /// batch rather than an error.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<PollEvent>) -> io::Result<()> {
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a deadline is never serviced early.
                let mut ms = d.as_millis();
                if d.as_nanos() % 1_000_000 != 0 {
                    ms += 1;
                }
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        let capacity = self.events.capacity();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                capacity as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        unsafe {
            self.events.set_len(n as usize);
        }

        for ev in &self.events {
            if ev.u64 == WAKE_TOKEN {
                drain_eventfd(self.wake_fd);
                continue;
            }
            out.push(PollEvent {
                fd: ev.u64 as RawFd,
                readable: ev.events & libc::EPOLLIN as u32 != 0,
                writable: ev.events & libc::EPOLLOUT as u32 != 0,
                error: ev.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0,
            });
        }
        self.events.clear();
        Ok(())
    }

    /// A cloneable, thread-safe handle that interrupts a blocking poll.
    pub fn waker(&self) -> PollWaker {
        PollWaker {
            wake_fd: self.wake_fd,
        }
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epfd);
        }
    }
}

fn drain_eventfd(fd: RawFd) {
    let mut buf = 0u64;
    loop {
        let n = unsafe {
            libc::read(
                fd,
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n <= 0 {
            break;
        }
    }
}

/// Wakes a blocking [`EpollPoller::poll`] from another thread by writing
/// to the poller's eventfd.
#[derive(Debug, Clone)]
pub struct PollWaker {
    wake_fd: RawFd,
}

impl PollWaker {
    /// Interrupt the poll. Best-effort: a failed write is ignored, the
    /// loop will notice pending work on its next natural wake.
    pub fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}
