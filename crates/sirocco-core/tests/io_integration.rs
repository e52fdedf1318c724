//! Integration tests exercising descriptor watches: compound waits,
//! conflicts, error events, and signal delivery, all against real pipes.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use sirocco_core::{
    Context, Dispatcher, Event, Interest, Step, WaitError, WaitRequest,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe() failed");
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let n = unsafe { libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1, "write to pipe failed");
}

fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[test]
fn test_compound_wait_io_wins_when_ready_first() {
    init_logs();
    let mut dispatcher = Dispatcher::new().unwrap();
    let (read_fd, write_fd) = pipe();

    let waiter = dispatcher.spawn(move |event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::io_timeout(
            read_fd,
            Interest::READ,
            Duration::from_millis(400),
        )),
        Event::Ready { fd, readiness } => {
            assert_eq!(fd, read_fd);
            assert!(readiness.readable);
            Step::Complete(Box::new("io"))
        }
        Event::TimedOut => Step::Complete(Box::new("timeout")),
        other => panic!("unexpected wake: {:?}", other),
    });

    // Becomes readable at roughly half the timeout.
    let writer = dispatcher.spawn(move |event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::sleep(Duration::from_millis(50))),
        Event::Elapsed => {
            write_byte(write_fd);
            Step::Complete(Box::new(()))
        }
        other => panic!("unexpected wake: {:?}", other),
    });

    let start = Instant::now();
    dispatcher.run_until_complete(&waiter).unwrap();
    dispatcher.run_until_complete(&writer).unwrap();

    let value = dispatcher.result(&waiter).unwrap();
    assert_eq!(*value.downcast::<&str>().unwrap(), "io");
    assert!(start.elapsed() < Duration::from_millis(350));

    close(read_fd);
    close(write_fd);
}

#[test]
fn test_compound_wait_times_out_when_never_ready() {
    init_logs();
    let mut dispatcher = Dispatcher::new().unwrap();
    let (read_fd, write_fd) = pipe();

    let waiter = dispatcher.spawn(move |event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::io_timeout(
            read_fd,
            Interest::READ,
            Duration::from_millis(80),
        )),
        Event::TimedOut => Step::Complete(Box::new("timeout")),
        other => panic!("unexpected wake: {:?}", other),
    });

    let start = Instant::now();
    dispatcher.run_until_complete(&waiter).unwrap();
    let elapsed = start.elapsed();

    let value = dispatcher.result(&waiter).unwrap();
    assert_eq!(*value.downcast::<&str>().unwrap(), "timeout");
    assert!(elapsed >= Duration::from_millis(60), "fired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "fired late: {:?}", elapsed);

    close(read_fd);
    close(write_fd);
}

#[test]
fn test_second_watch_on_same_interest_conflicts() {
    init_logs();
    let mut dispatcher = Dispatcher::new().unwrap();
    let (read_fd, write_fd) = pipe();

    let first = dispatcher.spawn(move |event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::io(read_fd, Interest::READ)),
        Event::Ready { .. } => Step::Complete(Box::new("io")),
        other => panic!("unexpected wake: {:?}", other),
    });

    let second = dispatcher.spawn(move |event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::io(read_fd, Interest::READ)),
        Event::Error(WaitError::Conflict { fd }) => {
            assert_eq!(fd, read_fd);
            Step::Complete(Box::new("conflict"))
        }
        other => panic!("unexpected wake: {:?}", other),
    });

    dispatcher.run_until_complete(&second).unwrap();
    let value = dispatcher.result(&second).unwrap();
    assert_eq!(*value.downcast::<&str>().unwrap(), "conflict");

    // The original watch still fires once the descriptor is ready.
    write_byte(write_fd);
    dispatcher.run_until_complete(&first).unwrap();
    let value = dispatcher.result(&first).unwrap();
    assert_eq!(*value.downcast::<&str>().unwrap(), "io");

    close(read_fd);
    close(write_fd);
}

#[test]
fn test_io_waiter_resumes_before_later_timer() {
    init_logs();
    let mut dispatcher = Dispatcher::new().unwrap();
    let (read_fd, write_fd) = pipe();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    // A: sleeps 50 ms then returns 1.
    let order_a = Rc::clone(&order);
    let a = dispatcher.spawn(move |event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::sleep(Duration::from_millis(50))),
        Event::Elapsed => {
            order_a.borrow_mut().push("A");
            Step::Complete(Box::new(1i32))
        }
        other => panic!("unexpected wake: {:?}", other),
    });

    // B: waits for read readiness on the pipe.
    let order_b = Rc::clone(&order);
    let b = dispatcher.spawn(move |event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::io(read_fd, Interest::READ)),
        Event::Ready { readiness, .. } => {
            assert!(readiness.readable);
            order_b.borrow_mut().push("B");
            Step::Complete(Box::new("read-ready"))
        }
        other => panic!("unexpected wake: {:?}", other),
    });

    // The pipe becomes readable at 10 ms.
    let writer = dispatcher.spawn(move |event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::sleep(Duration::from_millis(10))),
        Event::Elapsed => {
            write_byte(write_fd);
            Step::Complete(Box::new(()))
        }
        other => panic!("unexpected wake: {:?}", other),
    });

    dispatcher.run_until_complete(&a).unwrap();
    dispatcher.run_until_complete(&b).unwrap();
    dispatcher.run_until_complete(&writer).unwrap();

    assert_eq!(*order.borrow(), vec!["B", "A"]);
    let value = dispatcher.result(&a).unwrap();
    assert_eq!(*value.downcast::<i32>().unwrap(), 1);
    let value = dispatcher.result(&b).unwrap();
    assert_eq!(*value.downcast::<&str>().unwrap(), "read-ready");

    close(read_fd);
    close(write_fd);
}

#[test]
fn test_peer_close_delivers_resource_error() {
    init_logs();
    let mut dispatcher = Dispatcher::new().unwrap();
    let (read_fd, write_fd) = pipe();

    // No writer left: the backend reports hangup instead of letting the
    // wait dangle forever.
    close(write_fd);

    let waiter = dispatcher.spawn(move |event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::io(read_fd, Interest::READ)),
        Event::Error(WaitError::Resource { fd, .. }) => {
            assert_eq!(fd, read_fd);
            Step::Complete(Box::new("resource"))
        }
        other => panic!("unexpected wake: {:?}", other),
    });

    let start = Instant::now();
    dispatcher.run_until_complete(&waiter).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    let value = dispatcher.result(&waiter).unwrap();
    assert_eq!(*value.downcast::<&str>().unwrap(), "resource");

    close(read_fd);
}

#[test]
fn test_signal_wait_resolves_with_signal_number() {
    init_logs();
    let mut dispatcher = Dispatcher::new().unwrap();

    let waiter = dispatcher.spawn(|event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::signal(libc::SIGUSR1)),
        Event::Signal(signum) => Step::Complete(Box::new(signum)),
        other => panic!("unexpected wake: {:?}", other),
    });

    let raiser = dispatcher.spawn(|event: Event, _: &mut Context| match event {
        Event::Start => Step::Suspend(WaitRequest::sleep(Duration::from_millis(20))),
        Event::Elapsed => {
            unsafe {
                libc::raise(libc::SIGUSR1);
            }
            Step::Complete(Box::new(()))
        }
        other => panic!("unexpected wake: {:?}", other),
    });

    dispatcher.run_until_complete(&waiter).unwrap();
    dispatcher.run_until_complete(&raiser).unwrap();

    let value = dispatcher.result(&waiter).unwrap();
    assert_eq!(*value.downcast::<i32>().unwrap(), libc::SIGUSR1);
}
