//! Epoll reactor: the I/O-aware specialization of the
//! [scheduler](crate::scheduler).
//!
//! The reactor owns an epoll descriptor, a wake ("tickle") pipe and a
//! [`TimerManager`]. Fibers register interest in fd readiness with
//! [`add_event`](Reactor::add_event) and yield; when the event fires (or is
//! cancelled) the captured fiber or callback is scheduled again.
//! Registration is **one-shot per direction**: an event is consumed by its
//! first fire and waiting again takes a fresh `add_event`. This matches the
//! wait-once-then-decide loop of a coroutine and is why everything is
//! registered edge-triggered.
//!
//! The workers' idle fibers park in `epoll_wait`, bounded by the nearest
//! timer deadline (capped at 5 s so a distant deadline never delays a stop
//! check). Any thread that schedules the first task, or arms a timer
//! earlier than the current head, writes one byte to the tickle pipe, which
//! epoll is watching, waking some parked worker.

use std::cell::RefCell;
use std::io;
use std::os::raw::c_int;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, State};
use crate::scheduler::{Scheduler, SchedulerHooks};
use crate::timer::{TimerHandle, TimerHooks, TimerManager};

bitflags::bitflags! {
    /// Readiness directions the reactor can watch on an fd.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

/// One epoll_wait can report at most this many events per pass; the rest
/// are picked up on the next pass.
const MAX_EVENTS: usize = 256;
/// Upper bound for a single epoll_wait, so stop requests and far deadlines
/// are re-checked periodically.
const MAX_TIMEOUT_MS: u64 = 5000;

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Weak<Reactor>>> = RefCell::new(None);
    /// Per-worker epoll_wait buffer, reused between idle passes.
    static EVENTS_BUF: RefCell<Vec<libc::epoll_event>> = RefCell::new(Vec::new());
}

////////////////////////////////////////////////////////////////////////////////
// FdContext
////////////////////////////////////////////////////////////////////////////////

/// What to do when a direction fires: resume a captured fiber or run a
/// callback, on the scheduler captured at registration time.
enum EventTarget {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct EventContext {
    sched: Option<Arc<Scheduler>>,
    target: Option<EventTarget>,
}

struct FdInner {
    /// Registered directions. Invariant: a bit is set iff the matching
    /// `EventContext` is populated.
    events: Event,
    read: EventContext,
    write: EventContext,
}

struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: Event::empty(),
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }
}

impl FdInner {
    fn event_context(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Reactor
////////////////////////////////////////////////////////////////////////////////

pub struct Reactor {
    sched: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    /// [read end, write end]; the read end is watched by epoll itself.
    tickle_fds: [RawFd; 2],
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Number of registered `(fd, direction)` pairs awaiting fire.
    pending: AtomicUsize,
    stopped: AtomicBool,
    self_weak: OnceCell<Weak<Reactor>>,
}

impl Reactor {
    /// Create a reactor and start its workers.
    ///
    /// - `threads` - worker count, at least 1
    /// - `use_caller` - count the constructing thread as a worker; the
    ///   queue then drains on it during [`stop`](Self::stop)
    /// - `name` - scheduler name
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<Self>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut tickle_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(tickle_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }

        let io = Arc::new(Reactor {
            sched: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            tickle_fds,
            fd_contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            self_weak: OnceCell::new(),
        });

        // the read end is drained opportunistically, so it must not block,
        // and it is watched edge-triggered like everything else
        let rc = unsafe { libc::fcntl(tickle_fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        io.epoll_ctl(libc::EPOLL_CTL_ADD, tickle_fds[0], Some(Event::READ))?;

        io.grow_contexts(32);
        let weak = Arc::downgrade(&io);
        io.self_weak
            .set(weak.clone())
            .unwrap_or_else(|_| unreachable!());
        io.sched.set_hooks(weak.clone() as Weak<dyn SchedulerHooks>);
        io.timers.set_hooks(weak as Weak<dyn TimerHooks>);
        io.sched.start();
        Ok(io)
    }

    /// The reactor whose worker the current thread is, if any.
    pub fn current() -> Option<Arc<Reactor>> {
        CURRENT_REACTOR.with(|r| r.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// The underlying scheduler.
    #[inline(always)]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Number of registered `(fd, direction)` pairs awaiting fire.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    ////////////////////////////////////////////////////////////////////////
    // scheduling facet
    ////////////////////////////////////////////////////////////////////////

    /// See [`Scheduler::schedule`].
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule(f);
    }

    /// See [`Scheduler::schedule_fiber`].
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.sched.schedule_fiber(fiber);
    }

    /// Signal termination and wait for the workers to drain every task,
    /// registered event and pending timer. Idempotent.
    pub fn stop(&self) {
        self.sched.flag_stop();
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // wake every parked worker directly: the hook path may already
            // be gone when this runs from drop
            for _ in 0..self.sched.thread_count() + 1 {
                unsafe { libc::write(self.tickle_fds[1], [b'T'].as_ptr().cast(), 1) };
            }
        }
        self.sched.stop();
    }

    ////////////////////////////////////////////////////////////////////////
    // timer facet
    ////////////////////////////////////////////////////////////////////////

    /// See [`TimerManager::add_timer`].
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// See [`TimerManager::add_conditional_timer`].
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
        self.timers.add_conditional_timer(ms, cb, cond, recurring)
    }

    /// See [`TimerManager::next_timeout`].
    pub fn next_timeout(&self) -> Option<u64> {
        self.timers.next_timeout()
    }

    ////////////////////////////////////////////////////////////////////////
    // event facet
    ////////////////////////////////////////////////////////////////////////

    /// Register interest in one readiness direction on `fd`.
    ///
    /// With `cb` the callback is scheduled when the event fires; with
    /// `None` the *current fiber* is captured and re-scheduled instead (the
    /// caller is expected to yield right after).
    ///
    /// Fails on duplicate registration of a still-armed direction
    /// ([`Error::EventExists`]) and on `epoll_ctl` errors, in which case no
    /// state is left behind.
    pub fn add_event(
        &self,
        fd: RawFd,
        events: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        debug_assert!(
            events == Event::READ || events == Event::WRITE,
            "register exactly one direction per call"
        );
        let fd_ctx = self.fd_context_grow(fd);
        let mut inner = fd_ctx.inner.lock().unwrap();

        if inner.events.intersects(events) {
            log::error!(
                "add_event: fd={} {:?} already registered (mask {:?})",
                fd,
                events,
                inner.events
            );
            return Err(Error::EventExists { fd, events });
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_ctl(op, fd, Some(inner.events | events))?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events |= events;

        let ctx = inner.event_context(events);
        debug_assert!(ctx.sched.is_none() && ctx.target.is_none());
        // a registration made off-worker still needs somewhere to fire
        ctx.sched = Some(Scheduler::current().unwrap_or_else(|| self.sched.clone()));
        ctx.target = Some(match cb {
            Some(f) => EventTarget::Call(f),
            None => {
                let cur = Fiber::current();
                debug_assert_eq!(cur.state(), State::Running);
                EventTarget::Fiber(cur)
            }
        });
        Ok(())
    }

    /// Unregister a direction without firing it. `false` if it was not
    /// registered.
    pub fn del_event(&self, fd: RawFd, events: Event) -> bool {
        debug_assert!(events == Event::READ || events == Event::WRITE);
        let Some(fd_ctx) = self.fd_context(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if !inner.events.intersects(events) {
            return false;
        }

        let left = inner.events - events;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self
            .epoll_ctl(op, fd, (!left.is_empty()).then_some(left))
            .is_err()
        {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events = left;
        *inner.event_context(events) = EventContext::default();
        true
    }

    /// Unregister a direction and fire it once, as if the event had
    /// arrived. Used to abort in-flight waits (close, timeout). `false` if
    /// it was not registered.
    pub fn cancel_event(&self, fd: RawFd, events: Event) -> bool {
        debug_assert!(events == Event::READ || events == Event::WRITE);
        let Some(fd_ctx) = self.fd_context(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if !inner.events.intersects(events) {
            return false;
        }

        let left = inner.events - events;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self
            .epoll_ctl(op, fd, (!left.is_empty()).then_some(left))
            .is_err()
        {
            return false;
        }

        self.trigger(&mut inner, events);
        true
    }

    /// Fire and clear both directions of `fd`, if any. `false` when
    /// nothing was registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(fd_ctx) = self.fd_context(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }

        if self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, None).is_err() {
            return false;
        }
        if inner.events.contains(Event::READ) {
            self.trigger(&mut inner, Event::READ);
        }
        if inner.events.contains(Event::WRITE) {
            self.trigger(&mut inner, Event::WRITE);
        }
        debug_assert!(inner.events.is_empty());
        true
    }

    /// Park the current fiber until `events` fires on `fd` or the timeout
    /// elapses, whichever comes first. One-shot, like the registration it
    /// wraps.
    ///
    /// Must run inside a scheduled fiber on one of this reactor's workers.
    pub fn wait(&self, fd: RawFd, events: Event, timeout: Option<Duration>) -> Result<()> {
        // register first: a short timeout armed before the registration
        // exists would cancel nothing and the fiber would never wake
        self.add_event(fd, events, None)?;

        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = timeout.map(|t| {
            let flag = timed_out.clone();
            let weak = self.self_weak.get().cloned().expect("set at construction");
            self.add_timer(
                t.as_millis() as u64,
                move || {
                    if let Some(io) = weak.upgrade() {
                        // only report a timeout if we actually beat the event
                        if io.cancel_event(fd, events) {
                            flag.store(true, Ordering::SeqCst);
                        }
                    }
                },
                false,
            )
        });
        fiber::yield_now();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        if timed_out.load(Ordering::SeqCst) {
            return Err(Error::TimedOut);
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // internals
    ////////////////////////////////////////////////////////////////////////

    /// Remove `events` from the registered mask and schedule its target on
    /// the scheduler captured at registration. The per-fd lock is held by
    /// the caller.
    fn trigger(&self, inner: &mut FdInner, events: Event) {
        debug_assert!(inner.events.contains(events));
        inner.events -= events;
        let ctx = inner.event_context(events);
        let sched = ctx.sched.take().expect("a registered event captures a scheduler");
        match ctx.target.take().expect("a registered event has a target") {
            EventTarget::Fiber(fiber) => sched.schedule_fiber(fiber),
            EventTarget::Call(f) => sched.schedule(f),
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn epoll_ctl(&self, op: c_int, fd: RawFd, events: Option<Event>) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: events.map_or(0, |e| e.bits() | libc::EPOLLET as u32),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            let ev_events = ev.events;
            log::error!(
                "epoll_ctl(epfd={}, op={}, fd={}, events={:#x}): {}",
                self.epfd,
                op,
                fd,
                ev_events,
                err
            );
            return Err(err.into());
        }
        Ok(())
    }

    fn fd_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let table = self.fd_contexts.read().unwrap();
        table.get(fd as usize).cloned()
    }

    fn fd_context_grow(&self, fd: RawFd) -> Arc<FdContext> {
        if let Some(ctx) = self.fd_context(fd) {
            return ctx;
        }
        self.grow_contexts(fd as usize + 1);
        self.fd_context(fd).expect("just grown to cover fd")
    }

    fn grow_contexts(&self, len: usize) {
        let mut table = self.fd_contexts.write().unwrap();
        // factor 1.5, so a dense range of fds does not regrow every time
        let target = len.max(table.len() * 3 / 2);
        let mut fd = table.len() as RawFd;
        table.resize_with(target, || {
            let ctx = Arc::new(FdContext::new(fd));
            fd += 1;
            ctx
        });
    }

    /// One pass of the reactor idle loop, run inside a worker's idle fiber.
    fn reactor_idle_pass(&self) {
        let timeout = self
            .timers
            .next_timeout()
            .map_or(MAX_TIMEOUT_MS, |t| t.min(MAX_TIMEOUT_MS));

        EVENTS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();
            buf.resize(MAX_EVENTS, libc::epoll_event { events: 0, u64: 0 });

            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        buf.as_mut_ptr(),
                        MAX_EVENTS as c_int,
                        timeout as c_int,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::error!("epoll_wait(epfd={}): {}", self.epfd, err);
                break 0;
            };

            // deadlines first: an expired timer must not wait for the fd
            // dispatch below
            for cb in self.timers.take_expired() {
                self.sched.schedule(move || cb());
            }

            for ev in &buf[..n] {
                let fd = ev.u64 as RawFd;
                if fd == self.tickle_fds[0] {
                    self.drain_tickle_pipe();
                    continue;
                }
                self.dispatch_event(fd, ev.events);
            }
        });
        // yielding after each pass (instead of looping here) lets the
        // dispatch loop run whatever was just scheduled
    }

    fn dispatch_event(&self, fd: RawFd, mut revents: u32) {
        let Some(fd_ctx) = self.fd_context(fd) else {
            return;
        };
        debug_assert_eq!(fd_ctx.fd, fd);
        let mut inner = fd_ctx.inner.lock().unwrap();

        // An error or hangup must wake both registered directions, or a
        // waiter might never learn about the condition it is supposed to
        // drain.
        if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
        }
        let real = Event::from_bits_truncate(revents) & inner.events;
        if real.is_empty() {
            // stale wake: everything already fired or was cancelled
            return;
        }

        let left = inner.events - real;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self
            .epoll_ctl(op, fd, (!left.is_empty()).then_some(left))
            .is_err()
        {
            return;
        }

        if real.contains(Event::READ) {
            self.trigger(&mut inner, Event::READ);
        }
        if real.contains(Event::WRITE) {
            self.trigger(&mut inner, Event::WRITE);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc = unsafe {
                libc::read(self.tickle_fds[0], buf.as_mut_ptr().cast(), buf.len())
            };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl SchedulerHooks for Reactor {
    /// Wake one parked worker: a single byte on the pipe epoll is watching.
    /// Skipped when nobody is parked, every worker re-checks the queue
    /// before idling anyway.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rc = unsafe { libc::write(self.tickle_fds[1], [b'T'].as_ptr().cast(), 1) };
        if rc != 1 {
            log::error!(
                "tickle: write to pipe fd {} returned {} ({})",
                self.tickle_fds[1],
                rc,
                io::Error::last_os_error()
            );
        }
        // a reactor with a broken wake pipe can neither schedule nor stop
        assert_eq!(rc, 1, "tickle pipe write failed");
    }

    fn idle_pass(&self) {
        self.reactor_idle_pass();
    }

    /// The scheduler may only exit once no fd registration and no timer
    /// could still wake somebody.
    fn stopping(&self) -> bool {
        self.timers.next_timeout().is_none()
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    fn on_thread_start(&self) {
        let weak = self.self_weak.get().cloned().expect("set at construction");
        CURRENT_REACTOR.with(|r| *r.borrow_mut() = Some(weak));
    }

    fn on_thread_stop(&self) {
        CURRENT_REACTOR.with(|r| r.borrow_mut().take());
    }
}

impl TimerHooks for Reactor {
    /// A new earliest deadline invalidates the timeout some worker is
    /// parked with.
    fn on_timer_inserted_at_front(&self) {
        SchedulerHooks::tickle(self);
    }
}

impl AsRawFd for Reactor {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // fire whatever is still registered so parked fibers get to finish
        // (they must tolerate waking without data) before the workers join
        let leftovers: Vec<RawFd> = {
            let table = self.fd_contexts.read().unwrap();
            table
                .iter()
                .filter(|ctx| !ctx.inner.lock().unwrap().events.is_empty())
                .map(|ctx| ctx.fd)
                .collect()
        };
        for fd in leftovers {
            log::warn!("reactor dropped with fd {} still registered", fd);
            self.cancel_all(fd);
        }

        self.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
        log::debug!("reactor {} dropped", self.sched.name());
    }
}
