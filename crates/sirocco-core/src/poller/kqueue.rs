//! kqueue-backed poller (macOS and the BSDs).
//!
//! kqueue tracks read and write filters independently, so an interest
//! mask maps to one kevent change per filter. The wake primitive is an
//! `EVFILT_USER` event triggered with `NOTE_TRIGGER`.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use super::{Interest, PollEvent};

/// Reserved ident for the wake event.
const WAKE_IDENT: usize = usize::MAX;

/// kqueue-backed implementation of the poller contract.
pub struct KqueuePoller {
    kq: RawFd,
    events: Vec<libc::kevent>,
}

impl KqueuePoller {
    /// Create the kqueue and register the wake event. `capacity` bounds
    /// the number of events returned per poll.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake = libc::kevent {
            ident: WAKE_IDENT,
            filter: libc::EVFILT_USER,
            flags: libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let rc = unsafe { libc::kevent(kq, &wake, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(kq);
            }
            return Err(err);
        }

        Ok(KqueuePoller {
            kq,
            events: Vec::with_capacity(capacity.max(1)),
        })
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
        libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        }
    }

    /// Start watching `fd` for `interest`.
    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        if interest.read {
            changes.push(Self::change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE));
        }
        if interest.write {
            changes.push(Self::change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE));
        }
        self.apply(&changes)
    }

    /// Replace the interest mask of an already watched `fd`. Filters are
    /// independent in kqueue, so this adds the wanted ones and drops the
    /// rest (a missing filter on delete is not an error here).
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.read {
            self.apply(&[Self::change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE)])?;
        } else {
            let _ = self.apply(&[Self::change(fd, libc::EVFILT_READ, libc::EV_DELETE)]);
        }
        if interest.write {
            self.apply(&[Self::change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE)])?;
        } else {
            let _ = self.apply(&[Self::change(fd, libc::EVFILT_WRITE, libc::EV_DELETE)]);
        }
        Ok(())
    }

    /// Stop watching `fd` entirely.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let _ = self.apply(&[Self::change(fd, libc::EVFILT_READ, libc::EV_DELETE)]);
        let _ = self.apply(&[Self::change(fd, libc::EVFILT_WRITE, libc::EV_DELETE)]);
        Ok(())
    }

    /// Block for at most `timeout` (`None` = indefinitely) and append the
    /// translated batch to `out`. An interrupted wait returns an empty
    /// batch rather than an error.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<PollEvent>) -> io::Result<()> {
        let ts;
        let ts_ptr = match timeout {
            None => ptr::null(),
            Some(d) => {
                ts = libc::timespec {
                    tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                };
                &ts as *const libc::timespec
            }
        };

        let capacity = self.events.capacity();
        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                capacity as libc::c_int,
                ts_ptr,
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
            if ev.filter == libc::EVFILT_USER && ev.ident == WAKE_IDENT {
                // EV_CLEAR resets the user event; nothing to drain.
                continue;
            }
            let error = ev.flags & (libc::EV_EOF | libc::EV_ERROR) != 0;
            out.push(PollEvent {
                fd: ev.ident as RawFd,
                readable: ev.filter == libc::EVFILT_READ && !error,
                writable: ev.filter == libc::EVFILT_WRITE && !error,
                error,
            });
        }
        self.events.clear();
        Ok(())
    }

    /// A cloneable, thread-safe handle that interrupts a blocking poll.
    pub fn waker(&self) -> PollWaker {
        PollWaker { kq: self.kq }
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

/// Wakes a blocking [`KqueuePoller::poll`] from another thread by
/// triggering the reserved `EVFILT_USER` event.
#[derive(Debug, Clone)]
pub struct PollWaker {
    kq: RawFd,
}

impl PollWaker {
    /// Interrupt the poll. Best-effort: a failed trigger is ignored.
    pub fn wake(&self) {
        let trigger = libc::kevent {
            ident: WAKE_IDENT,
            filter: libc::EVFILT_USER,
            flags: 0,
            fflags: libc::NOTE_TRIGGER,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        unsafe {
            libc::kevent(self.kq, &trigger, 1, std::ptr::null_mut(), 0, std::ptr::null());
        }
    }
}
