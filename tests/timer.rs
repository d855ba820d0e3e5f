use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use corio::reactor::Reactor;
use corio::timer::TimerHandle;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn one_shot_and_recurring_firing_times() {
    let io = Reactor::new(1, false, "timers").unwrap();
    let t0 = corio::clock::monotonic_ms();

    let (tx, rx) = mpsc::channel();

    let tx1 = tx.clone();
    io.add_timer(
        500,
        move || {
            tx1.send(("one-shot", corio::clock::monotonic_ms())).unwrap();
        },
        false,
    );

    // the recurring timer cancels itself after its third firing
    let handle: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
    let fires = Arc::new(AtomicUsize::new(0));
    let recurring = {
        let handle = handle.clone();
        io.add_timer(
            1000,
            move || {
                tx.send(("recurring", corio::clock::monotonic_ms())).unwrap();
                if fires.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    handle.lock().unwrap().take().unwrap().cancel();
                }
            },
            true,
        )
    };
    *handle.lock().unwrap() = Some(recurring);

    let mut events = Vec::new();
    for _ in 0..4 {
        events.push(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    }
    io.stop();
    assert_eq!(io.next_timeout(), None, "the recurring timer cancelled itself");

    let offsets: Vec<(&str, u64)> = events.iter().map(|(tag, at)| (*tag, at - t0)).collect();
    let expect = [
        ("one-shot", 500),
        ("recurring", 1000),
        ("recurring", 2000),
        ("recurring", 3000),
    ];
    for ((tag, at), (want_tag, want_at)) in offsets.iter().zip(expect) {
        assert_eq!(*tag, want_tag);
        assert!(
            *at >= want_at && *at < want_at + 250,
            "{tag} fired at +{at} ms, wanted ~{want_at} ms"
        );
    }
}

#[test]
fn cancel_before_the_deadline_wins() {
    let io = Reactor::new(1, false, "cancel-timer").unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    let handle = io.add_timer(
        200,
        move || {
            f.store(true, Ordering::SeqCst);
        },
        false,
    );

    assert!(handle.cancel());
    assert!(!handle.cancel(), "cancel is idempotent");

    std::thread::sleep(Duration::from_millis(400));
    io.stop();
    assert!(!fired.load(Ordering::SeqCst), "a cancelled timer must never fire");
    assert_eq!(io.next_timeout(), None);
}

#[test]
fn conditional_timer_skips_a_dead_condition() {
    let io = Reactor::new(1, false, "cond").unwrap();

    let alive_cond = Arc::new(());
    let alive_fired = Arc::new(AtomicBool::new(false));
    {
        let f = alive_fired.clone();
        io.add_conditional_timer(
            50,
            move || {
                f.store(true, Ordering::SeqCst);
            },
            Arc::downgrade(&alive_cond),
            false,
        );
    }

    let dead_cond = Arc::new(());
    let dead_fired = Arc::new(AtomicBool::new(false));
    {
        let f = dead_fired.clone();
        io.add_conditional_timer(
            50,
            move || {
                f.store(true, Ordering::SeqCst);
            },
            Arc::downgrade(&dead_cond),
            false,
        );
    }
    drop(dead_cond);

    std::thread::sleep(Duration::from_millis(300));
    io.stop();
    assert!(alive_fired.load(Ordering::SeqCst));
    assert!(!dead_fired.load(Ordering::SeqCst));
}

#[test]
fn reset_postpones_a_pending_timer() {
    let io = Reactor::new(1, false, "reset").unwrap();
    let t0 = corio::clock::monotonic_ms();

    let (tx, rx) = mpsc::channel();
    let handle = io.add_timer(
        100,
        move || {
            tx.send(corio::clock::monotonic_ms()).unwrap();
        },
        false,
    );
    assert!(handle.reset(400, true));

    let fired_at = rx.recv_timeout(RECV_TIMEOUT).unwrap() - t0;
    assert!(
        (400..650).contains(&fired_at),
        "reset timer fired at +{fired_at} ms, wanted ~400 ms"
    );
    io.stop();
}

#[test]
fn timers_fire_while_workers_handle_other_load() {
    let io = Reactor::new(2, false, "busy-timers").unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let fired = fired.clone();
        io.add_timer(
            30,
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
    }
    let busy = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let busy = busy.clone();
        io.schedule(move || {
            busy.fetch_add(1, Ordering::SeqCst);
        });
    }

    io.stop();
    assert_eq!(fired.load(Ordering::SeqCst), 20);
    assert_eq!(busy.load(Ordering::SeqCst), 200);
}
