//! Deadline timers: one-shot, recurring and conditional.
//!
//! Timers live in an ordered set keyed by `(deadline, sequence)`, so equal
//! deadlines fire in insertion order. Deadlines are absolute monotonic
//! milliseconds (see [`clock`](crate::clock)); a timer is either pending
//! (in the set) or fired/cancelled (gone from it).
//!
//! The manager does not run callbacks itself: the reactor's idle loop asks
//! for [`next_timeout`](TimerManager::next_timeout) to bound its
//! `epoll_wait`, then drains [`take_expired`](TimerManager::take_expired)
//! and schedules what it got.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::OnceCell;

use crate::clock;

/// Scheduled timer callback. `Arc`ed so a recurring timer can hand out the
/// same callback on every expiry.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// How far the observed clock must move backward before we assume it was
/// adjusted and flush every pending timer instead of stalling on deadlines
/// that may never come.
const CLOCK_JUMP_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Notification a timer-manager owner can subscribe to.
pub(crate) trait TimerHooks: Send + Sync + 'static {
    /// A new timer became the earliest deadline: whoever is waiting with
    /// the previously shortest timeout now waits too long.
    fn on_timer_inserted_at_front(&self);
}

struct TimerData {
    period_ms: u64,
    recurring: bool,
    cb: TimerCallback,
}

#[derive(Default)]
struct TimersInner {
    /// Pending timers, ordered by `(deadline_ms, seq)`.
    timers: BTreeMap<(u64, u64), TimerData>,
    /// Current deadline per live timer, so handles can find their entry.
    deadlines: HashMap<u64, u64>,
    next_seq: u64,
    /// Last observed clock reading, for backward-jump detection.
    last_now: u64,
}

struct Shared {
    inner: Mutex<TimersInner>,
    hooks: OnceCell<Weak<dyn TimerHooks>>,
}

////////////////////////////////////////////////////////////////////////////////
// TimerManager
////////////////////////////////////////////////////////////////////////////////

pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            shared: Arc::new(Shared {
                inner: Mutex::new(TimersInner::default()),
                hooks: OnceCell::new(),
            }),
        }
    }

    pub(crate) fn set_hooks(&self, hooks: Weak<dyn TimerHooks>) {
        if self.shared.hooks.set(hooks).is_err() {
            panic!("timer hooks can only be set once");
        }
    }

    /// Arm a timer firing `ms` milliseconds from now.
    ///
    /// - `ms` - relative timeout, which doubles as the period when
    ///   `recurring`
    /// - `cb` - callback handed out on expiry
    /// - `recurring` - re-arm at `now + ms` after every expiry
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add(ms, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs if
    /// `cond` can still be upgraded when the timer fires.
    pub fn add_conditional_timer<F, T>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        // tested once, at fire time
        let cb = move || {
            if cond.upgrade().is_some() {
                cb()
            }
        };
        self.add(ms, Arc::new(cb), recurring)
    }

    fn add(&self, ms: u64, cb: TimerCallback, recurring: bool) -> TimerHandle {
        let deadline = clock::monotonic_ms() + ms;
        let (seq, at_front) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let at_front = inner
                .timers
                .first_key_value()
                .map_or(true, |((head, _), _)| deadline < *head);
            inner.timers.insert(
                (deadline, seq),
                TimerData {
                    period_ms: ms,
                    recurring,
                    cb,
                },
            );
            inner.deadlines.insert(seq, deadline);
            (seq, at_front)
        };
        if at_front {
            Shared::notify_front(&self.shared);
        }
        TimerHandle {
            shared: Arc::downgrade(&self.shared),
            seq,
        }
    }

    /// Milliseconds until the earliest deadline: `None` when no timer is
    /// pending, `0` when one is already due.
    pub fn next_timeout(&self) -> Option<u64> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .timers
            .first_key_value()
            .map(|((deadline, _), _)| deadline.saturating_sub(clock::monotonic_ms()))
    }

    /// Move every due timer out of the set and return its callback, in
    /// deadline order. Recurring timers are re-armed at `now + period`.
    ///
    /// Monotone: an immediate second call returns nothing.
    pub fn take_expired(&self) -> Vec<TimerCallback> {
        let now = clock::monotonic_ms();
        let mut inner = self.shared.inner.lock().unwrap();

        // A large backward jump means the clock was adjusted; deadlines
        // computed against the old reading could stall forever, so flush
        // everything.
        let jumped = now < inner.last_now.saturating_sub(CLOCK_JUMP_THRESHOLD_MS);
        inner.last_now = now;

        if inner.timers.is_empty() {
            return Vec::new();
        }
        let expired = if jumped {
            log::warn!("clock jumped backward, flushing all {} timers", inner.timers.len());
            mem::take(&mut inner.timers)
        } else {
            // split at the first not-yet-due key
            let pending = inner.timers.split_off(&(now + 1, 0));
            mem::replace(&mut inner.timers, pending)
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for ((_, seq), data) in expired {
            cbs.push(data.cb.clone());
            if data.recurring {
                let deadline = now + data.period_ms;
                inner.deadlines.insert(seq, deadline);
                inner.timers.insert((deadline, seq), data);
            } else {
                inner.deadlines.remove(&seq);
            }
        }
        cbs
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn notify_front(shared: &Arc<Shared>) {
        if let Some(hooks) = shared.hooks.get().and_then(Weak::upgrade) {
            hooks.on_timer_inserted_at_front();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// TimerHandle
////////////////////////////////////////////////////////////////////////////////

/// Handle to a pending timer. Cloneable; all operations are no-ops once the
/// timer fired its last time, was cancelled, or the manager is gone.
#[derive(Clone)]
pub struct TimerHandle {
    shared: Weak<Shared>,
    seq: u64,
}

impl TimerHandle {
    /// Unlink the timer so its callback never runs (again). Idempotent;
    /// `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut inner = shared.inner.lock().unwrap();
        let Some(deadline) = inner.deadlines.remove(&self.seq) else {
            return false;
        };
        inner.timers.remove(&(deadline, self.seq));
        true
    }

    /// Push the deadline of a still-pending timer out to now + period.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let at_front = {
            let mut inner = shared.inner.lock().unwrap();
            let Some(&deadline) = inner.deadlines.get(&self.seq) else {
                return false;
            };
            let data = inner
                .timers
                .remove(&(deadline, self.seq))
                .expect("pending timer must be in the ordered set");
            let deadline = clock::monotonic_ms() + data.period_ms;
            inner.deadlines.insert(self.seq, deadline);
            self.reinsert(&mut inner, deadline, data)
        };
        if at_front {
            Shared::notify_front(&shared);
        }
        true
    }

    /// Re-queue a still-pending timer with a new period.
    ///
    /// The new deadline is `now + ms` when `from_now`, otherwise the
    /// timer's original start (old deadline minus old period) plus `ms`.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let at_front = {
            let mut inner = shared.inner.lock().unwrap();
            let Some(&deadline) = inner.deadlines.get(&self.seq) else {
                return false;
            };
            let mut data = inner
                .timers
                .remove(&(deadline, self.seq))
                .expect("pending timer must be in the ordered set");
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                deadline - data.period_ms
            };
            data.period_ms = ms;
            let deadline = start + ms;
            inner.deadlines.insert(self.seq, deadline);
            self.reinsert(&mut inner, deadline, data)
        };
        if at_front {
            Shared::notify_front(&shared);
        }
        true
    }

    /// Returns whether the re-inserted entry became the new head.
    fn reinsert(&self, inner: &mut TimersInner, deadline: u64, data: TimerData) -> bool {
        inner.timers.insert((deadline, self.seq), data);
        inner
            .timers
            .first_key_value()
            .map_or(false, |((_, head_seq), _)| *head_seq == self.seq)
    }
}
