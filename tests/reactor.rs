use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use corio::fiber;
use corio::reactor::{Event, Reactor};
use corio::Error;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

#[test]
fn read_wait_wakes_on_data() {
    let io = Reactor::new(2, false, "rw").unwrap();
    let (pr, pw) = pipe();

    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let io = Reactor::current().unwrap();
        io.add_event(pr, Event::READ, None).unwrap();
        fiber::yield_now();
        // woken by readiness: the byte must be there
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(pr, buf.as_mut_ptr().cast(), buf.len()) };
        tx.send((n, buf[0])).unwrap();
    });

    io.schedule(move || {
        std::thread::sleep(Duration::from_millis(50));
        let n = unsafe { libc::write(pw, [b'x'].as_ptr().cast(), 1) };
        assert_eq!(n, 1);
    });

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), (1, b'x'));
    io.stop();
    assert_eq!(io.pending_events(), 0);
    close(pr);
    close(pw);
}

#[test]
fn cancel_event_by_timer_resumes_the_waiter() {
    let io = Reactor::new(2, false, "cancel");
    let io = io.unwrap();
    let (pr, pw) = pipe();

    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let io = Reactor::current().unwrap();
        let started = Instant::now();
        io.add_event(pr, Event::READ, None).unwrap();
        io.add_timer(
            200,
            {
                let io = Reactor::current().unwrap();
                move || {
                    io.cancel_event(pr, Event::READ);
                }
            },
            false,
        );
        fiber::yield_now();
        // resumed by the cancellation path, with no data available
        tx.send(started.elapsed()).unwrap();
    });

    let waited = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(waited >= Duration::from_millis(150), "woke too early: {waited:?}");
    assert!(waited < Duration::from_secs(5), "cancellation missed: {waited:?}");
    assert_eq!(io.pending_events(), 0);

    io.stop();
    close(pr);
    close(pw);
}

#[test]
fn wait_times_out_without_data() {
    let io = Reactor::new(1, false, "wait-to").unwrap();
    let (pr, pw) = pipe();

    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let io = Reactor::current().unwrap();
        let started = Instant::now();
        let res = io.wait(pr, Event::READ, Some(Duration::from_millis(200)));
        tx.send((matches!(res, Err(Error::TimedOut)), started.elapsed()))
            .unwrap();
    });

    let (timed_out, waited) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(timed_out);
    assert!(waited >= Duration::from_millis(150));
    assert_eq!(io.pending_events(), 0);
    assert_eq!(io.next_timeout(), None, "the cancellation timer must be gone");

    io.stop();
    close(pr);
    close(pw);
}

#[test]
fn wait_succeeds_when_data_beats_the_timer() {
    let io = Reactor::new(2, false, "wait-ok").unwrap();
    let (pr, pw) = pipe();

    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let io = Reactor::current().unwrap();
        let res = io.wait(pr, Event::READ, Some(Duration::from_secs(5)));
        tx.send(res.is_ok()).unwrap();
    });
    io.schedule(move || {
        std::thread::sleep(Duration::from_millis(30));
        unsafe { libc::write(pw, [b'y'].as_ptr().cast(), 1) };
    });

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    io.stop();
    assert_eq!(io.next_timeout(), None);
    close(pr);
    close(pw);
}

#[test]
fn add_then_cancel_schedules_exactly_once() {
    let io = Reactor::new(1, false, "once").unwrap();
    let (pr, pw) = pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    io.add_event(
        pr,
        Event::READ,
        Some(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert_eq!(io.pending_events(), 1);

    // duplicate registration of the same direction is rejected
    let dup = io.add_event(pr, Event::READ, Some(Box::new(|| {})));
    assert!(matches!(dup, Err(Error::EventExists { .. })));

    assert!(io.cancel_event(pr, Event::READ));
    assert_eq!(io.pending_events(), 0);
    // one-shot: the registration was consumed
    assert!(!io.cancel_event(pr, Event::READ));

    io.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    close(pr);
    close(pw);
}

#[test]
fn del_event_unregisters_without_firing() {
    let io = Reactor::new(1, false, "del").unwrap();
    let (pr, pw) = pipe();

    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    io.add_event(
        pr,
        Event::READ,
        Some(Box::new(move || {
            f.store(true, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert_eq!(io.pending_events(), 1);

    assert!(io.del_event(pr, Event::READ));
    assert_eq!(io.pending_events(), 0);
    assert!(!io.del_event(pr, Event::READ));

    // readiness after deletion must not schedule anything
    unsafe { libc::write(pw, [b'z'].as_ptr().cast(), 1) };
    std::thread::sleep(Duration::from_millis(100));
    io.stop();
    assert!(!fired.load(Ordering::SeqCst));
    close(pr);
    close(pw);
}

#[test]
fn cancel_all_fires_both_directions() {
    let io = Reactor::new(1, false, "all").unwrap();
    let (a, b) = socketpair();

    let fired = Arc::new(AtomicUsize::new(0));
    for events in [Event::READ, Event::WRITE] {
        let f = fired.clone();
        io.add_event(
            a,
            events,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    }
    assert_eq!(io.pending_events(), 2);

    assert!(io.cancel_all(a));
    assert_eq!(io.pending_events(), 0);
    assert!(!io.cancel_all(a));

    io.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    close(a);
    close(b);
}

#[test]
fn fiber_sleep_parks_only_the_fiber() {
    let io = Reactor::new(1, false, "sleep").unwrap();

    let (tx, rx) = mpsc::channel();
    io.schedule(move || {
        let started = Instant::now();
        fiber::sleep(Duration::from_millis(120));
        tx.send(started.elapsed()).unwrap();
    });
    // the single worker stays responsive while the fiber sleeps
    let (tx2, rx2) = mpsc::channel();
    io.schedule(move || {
        tx2.send(()).unwrap();
    });
    rx2.recv_timeout(RECV_TIMEOUT).unwrap();

    let slept = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(slept >= Duration::from_millis(100), "woke after {slept:?}");
    io.stop();
}

#[test]
fn graceful_shutdown_under_load() {
    let io = Reactor::new(4, false, "load").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..10_000 {
        let calls = calls.clone();
        io.schedule(move || {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    let timer_fires = Arc::new(AtomicUsize::new(0));
    for i in 0..50u64 {
        let timer_fires = timer_fires.clone();
        io.add_timer(
            10 + (i * 10) % 491,
            move || {
                timer_fires.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
    }

    io.stop();

    // every callable ran exactly once, and stop waited for every timer
    assert_eq!(calls.load(Ordering::SeqCst), 10_000);
    assert_eq!(timer_fires.load(Ordering::SeqCst), 50);
    assert_eq!(io.pending_events(), 0);
    assert_eq!(io.next_timeout(), None);

    let epfd = io.as_raw_fd();
    drop(io);
    // the epoll fd is closed with the reactor
    let rc = unsafe { libc::fcntl(epfd, libc::F_GETFD) };
    assert_eq!(rc, -1);
}

#[test]
fn use_caller_reactor_runs_events_on_stop() {
    let io = Reactor::new(1, true, "io-caller").unwrap();
    let (pr, pw) = pipe();

    let got = Arc::new(AtomicBool::new(false));
    let g = got.clone();
    io.add_event(
        pr,
        Event::READ,
        Some(Box::new(move || {
            g.store(true, Ordering::SeqCst);
        })),
    )
    .unwrap();
    unsafe { libc::write(pw, [b'!'].as_ptr().cast(), 1) };

    io.stop();
    assert!(got.load(Ordering::SeqCst));
    assert_eq!(io.pending_events(), 0);
    close(pr);
    close(pw);
}
