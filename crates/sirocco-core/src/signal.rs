//! Process-global signal delivery pipe.
//!
//! Signal handlers can do almost nothing safely, so the handler here only
//! writes the signal number into a non-blocking self-pipe. The dispatcher
//! watches the pipe's read end like any other descriptor and maps drained
//! signal numbers back to waiting coroutines.
//!
//! The pipe and the installed-handler table are process-global because
//! signal disposition is; watching the same signal from two dispatchers
//! in one process is not supported.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Write end of the pipe, readable from the signal handler without locks.
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

struct SignalState {
    read_fd: Option<RawFd>,
    /// Installed handlers, refcounted per signal number.
    installed: FxHashMap<i32, usize>,
}

static STATE: Lazy<Mutex<SignalState>> = Lazy::new(|| {
    Mutex::new(SignalState {
        read_fd: None,
        installed: FxHashMap::default(),
    })
});

extern "C" fn handle_signal(signum: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The pipe's read end, creating the pipe on first use.
pub(crate) fn pipe_fd() -> io::Result<RawFd> {
    let mut state = STATE.lock();
    if let Some(fd) = state.read_fd {
        return Ok(fd);
    }

    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    if let Err(err) = set_nonblocking_cloexec(read_fd).and_then(|_| set_nonblocking_cloexec(write_fd)) {
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        return Err(err);
    }

    WRITE_FD.store(write_fd, Ordering::Relaxed);
    state.read_fd = Some(read_fd);
    Ok(read_fd)
}

/// Route `signum` into the pipe. Refcounted; the handler is installed on
/// the first call for a signal.
pub(crate) fn install(signum: i32) -> io::Result<()> {
    let mut state = STATE.lock();
    if let Some(count) = state.installed.get_mut(&signum) {
        *count += 1;
        return Ok(());
    }

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signum, &sa, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    state.installed.insert(signum, 1);
    Ok(())
}

/// Undo one [`install`]. The default disposition is restored when the
/// last watcher for the signal goes away.
pub(crate) fn uninstall(signum: i32) {
    let mut state = STATE.lock();
    let remove = match state.installed.get_mut(&signum) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => true,
        None => return,
    };
    if remove {
        state.installed.remove(&signum);
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(signum, &sa, std::ptr::null_mut());
        }
    }
}

/// Drain every queued signal number from the pipe.
pub(crate) fn drain(read_fd: RawFd) -> Vec<i32> {
    let mut signums = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe {
            libc::read(
                read_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n <= 0 {
            break;
        }
        for &byte in &buf[..n as usize] {
            signums.push(byte as i32);
        }
    }
    signums
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_is_drained_from_pipe() {
        let read_fd = pipe_fd().unwrap();
        install(libc::SIGUSR2).unwrap();

        unsafe {
            libc::raise(libc::SIGUSR2);
        }
        // The handler writes synchronously during raise(); the byte is
        // already in the pipe.
        let drained = drain(read_fd);
        assert!(drained.contains(&(libc::SIGUSR2 as i32)));

        uninstall(libc::SIGUSR2);
    }

    #[test]
    fn test_install_refcounts() {
        install(libc::SIGUSR1).unwrap();
        install(libc::SIGUSR1).unwrap();
        uninstall(libc::SIGUSR1);
        // Still installed: raising now must not kill the process.
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        uninstall(libc::SIGUSR1);
    }
}
