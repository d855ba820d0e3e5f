//! Cooperative multitasking module.
//!
//! A fiber is a set of instructions which are executed with cooperative
//! multitasking: it owns a stack and a machine context, and control moves
//! between fibers only at explicit [`resume`]/[`yield_now`] points. Fibers
//! are non-symmetric: a fiber always yields back to exactly one parent,
//! either the worker's dispatch fiber (when it takes part in scheduling) or
//! the thread-main fiber that resumed it.
//!
//! A fiber has three possible states: **ready**, **running** or
//! **terminated**. A fiber is ready right after creation or after a yield,
//! running between a resume and the next yield, and terminated once its
//! entry function returns. A terminated fiber with an owned stack can be
//! [`reset`] with a new entry, reusing the stack.
//!
//! The machine context is `ucontext(3)`, via `libc`.
//!
//! [`resume`]: Fiber::resume
//! [`reset`]: Fiber::reset

use std::cell::{Cell, RefCell, UnsafeCell};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::scheduler::Scheduler;

pub mod mutex;
pub use mutex::Mutex;

/// Global counter for fiber id generation.
static NEXT_ID: AtomicU64 = AtomicU64::new(0);
/// Number of currently live fibers, thread-main fibers included.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The fiber currently executing on this thread. Non-owning: the pointee
    /// is kept alive by whoever resumed it (or by `THREAD_MAIN`).
    static CURRENT: Cell<*const Fiber> = Cell::new(ptr::null());
    /// The implicit fiber representing the thread's original stack. Created
    /// lazily on first use, lives as long as the thread.
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// Fiber execution state.
///
/// The only legal walk is `Ready` → (resume) → `Running` → (yield) → `Ready`,
/// until the entry returns and the fiber lands in `Term`; a `reset` brings a
/// terminated fiber back to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Just created, reset, or yielded; can be resumed.
    Ready = 0,
    /// Between a resume and the next yield.
    Running = 1,
    /// The entry function returned.
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Term,
            _ => unreachable!("invalid fiber state"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A stackful coroutine.
///
/// Reference counted: the scheduler's task queue, the reactor's event table
/// and user code all hold strong handles; the stack is released when the
/// last handle drops after the fiber terminated.
pub struct Fiber {
    id: u64,
    name: Option<String>,
    /// Whether yields return to the worker's dispatch fiber rather than to
    /// the thread-main fiber that resumed this one. Fibers created outside
    /// any scheduler set this to `false`.
    run_in_scheduler: bool,
    state: AtomicU8,
    inner: UnsafeCell<Inner>,
}

struct Inner {
    ctx: libc::ucontext_t,
    /// `None` for thread-main fibers, which run on the thread's own stack.
    stack: Option<Box<[u8]>>,
    entry: Option<Box<dyn FnOnce() + Send>>,
}

// The mutable internals are only ever touched by the thread that currently
// runs or resumes the fiber; the cooperative protocol makes that exclusive.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a new ready fiber with its own stack.
    ///
    /// - `entry` - the fiber function
    /// - `stack_size` - stack size in bytes, `0` for the configured default
    /// - `run_in_scheduler` - whether yields go to the worker's dispatch
    ///   fiber (`true` for anything the scheduler runs) or back to the
    ///   thread-main fiber that resumed it
    pub fn new<F>(entry: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Builder::new()
            .stack_size(stack_size)
            .run_in_scheduler(run_in_scheduler)
            .spawn(entry)
    }

    /// The fiber currently executing on this thread.
    ///
    /// On first use this promotes the thread itself to a fiber: the
    /// thread-main fiber, which has no separate stack and starts `Running`.
    pub fn current() -> Arc<Fiber> {
        let p = CURRENT.with(|c| c.get());
        if !p.is_null() {
            unsafe {
                Arc::increment_strong_count(p);
                return Arc::from_raw(p);
            }
        }

        let main = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: None,
            run_in_scheduler: false,
            state: AtomicU8::new(State::Running as u8),
            inner: UnsafeCell::new(Inner {
                ctx: unsafe { mem::zeroed() },
                stack: None,
                entry: None,
            }),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        log::debug!("thread-main fiber {} created", main.id);
        CURRENT.with(|c| c.set(Arc::as_ptr(&main)));
        THREAD_MAIN.with(|t| *t.borrow_mut() = Some(main.clone()));
        main
    }

    /// Id of the currently executing fiber, or `None` outside of any.
    pub fn current_id() -> Option<u64> {
        let p = CURRENT.with(|c| c.get());
        if p.is_null() {
            None
        } else {
            Some(unsafe { (*p).id })
        }
    }

    /// Number of currently live fibers in the process.
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline(always)]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub(crate) fn run_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Switch execution to this fiber.
    ///
    /// The caller's context is saved into the fiber this one will later
    /// yield back to (dispatch or thread-main, see
    /// [`Fiber::new`]); `resume` returns when that yield happens.
    #[inline(never)]
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        debug_assert!(
            state != State::Running && state != State::Term,
            "cannot resume a {state:?} fiber"
        );
        // The swap target must exist before we can swap away.
        Fiber::current();

        let back = self.back_fiber();
        CURRENT.with(|c| c.set(Arc::as_ptr(self)));
        self.set_state(State::Running);
        let rc = unsafe { libc::swapcontext((*back).ctx_ptr(), self.ctx_ptr()) };
        debug_assert_eq!(rc, 0, "swapcontext");
    }

    /// Give up execution: save this fiber's context and switch back to its
    /// parent. The state becomes `Ready` unless the fiber already
    /// terminated (the trampoline's final yield).
    #[inline(never)]
    pub(crate) fn do_yield(&self) {
        let state = self.state();
        debug_assert!(
            state == State::Running || state == State::Term,
            "cannot yield a {state:?} fiber"
        );
        if state != State::Term {
            self.set_state(State::Ready);
        }

        let back = self.back_fiber();
        CURRENT.with(|c| c.set(back));
        let rc = unsafe { libc::swapcontext(self.ctx_ptr(), (*back).ctx_ptr()) };
        debug_assert_eq!(rc, 0, "swapcontext");
    }

    /// Re-arm a terminated fiber with a new entry, reusing its stack.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        debug_assert_eq!(self.state(), State::Term, "only a terminated fiber can be reset");
        let inner = unsafe { &mut *self.inner.get() };
        let stack = inner.stack.as_mut().expect("a thread-main fiber cannot be reset");
        inner.entry = Some(Box::new(entry));
        init_context(&mut inner.ctx, stack);
        self.set_state(State::Ready);
    }

    /// The fiber `self` yields back to: its worker's dispatch fiber when it
    /// runs under a scheduler, the thread-main fiber otherwise. Raw pointer
    /// on purpose: the terminal yield never comes back to drop anything, and
    /// both candidates are pinned by thread-locals anyway.
    fn back_fiber(&self) -> *const Fiber {
        if self.run_in_scheduler {
            Scheduler::dispatch_fiber_ptr()
                .expect("fiber takes part in scheduling but no dispatch fiber is set on this thread")
        } else {
            THREAD_MAIN.with(|t| {
                t.borrow()
                    .as_ref()
                    .map(Arc::as_ptr)
                    .expect("thread-main fiber is not initialized")
            })
        }
    }

    fn ctx_ptr(&self) -> *mut libc::ucontext_t {
        unsafe { &mut (*self.inner.get()).ctx }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let inner = self.inner.get_mut();
        if inner.stack.is_some() {
            debug_assert_eq!(
                self.state(),
                State::Term,
                "stackful fiber {} dropped while not terminated",
                self.id
            );
        } else {
            // Thread-main fiber unwinding together with its thread.
            let this = self as *const Fiber;
            let _ = CURRENT.try_with(|c| {
                if c.get() == this {
                    c.set(ptr::null());
                }
            });
        }
        log::debug!("fiber {} dropped", self.id);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it. The
/// [`Fiber::new`] shorthand uses a `Builder` with default name.
pub struct Builder {
    name: Option<String>,
    stack_size: usize,
    run_in_scheduler: bool,
}

impl Builder {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Builder {
            name: None,
            stack_size: 0,
            run_in_scheduler: true,
        }
    }

    /// Names the fiber-to-be. The name shows up in debug logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber. `0` means
    /// the configured default ([`crate::config::Config::fiber_stack_size`]).
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Whether the fiber yields to its worker's dispatch fiber (default)
    /// or to the thread-main fiber that resumed it.
    pub fn run_in_scheduler(mut self, yesno: bool) -> Self {
        self.run_in_scheduler = yesno;
        self
    }

    /// Allocate the stack and build a `Ready` fiber.
    pub fn spawn<F>(self, entry: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if self.stack_size == 0 {
            config::config().fiber_stack_size
        } else {
            self.stack_size
        };
        let stack = vec![0u8; stack_size].into_boxed_slice();

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "fiber {} ({:?}) created, stack {} bytes",
            id,
            self.name.as_deref().unwrap_or("<fiber>"),
            stack_size
        );
        let fiber = Arc::new(Fiber {
            id,
            name: self.name,
            run_in_scheduler: self.run_in_scheduler,
            state: AtomicU8::new(State::Ready as u8),
            inner: UnsafeCell::new(Inner {
                ctx: unsafe { mem::zeroed() },
                stack: Some(stack),
                entry: Some(Box::new(entry)),
            }),
        });
        // getcontext leaves self-referential pointers inside the ucontext_t
        // (glibc points uc_mcontext.fpregs into the same struct), so the
        // context must be initialized at its final address
        unsafe {
            let inner = &mut *fiber.inner.get();
            let Inner { ctx, stack, .. } = inner;
            init_context(ctx, stack.as_mut().expect("just allocated"));
        }
        fiber
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Yield control from the current fiber back to its parent (dispatch or
/// thread-main fiber).
///
/// The fiber becomes `Ready`. Nothing re-schedules it implicitly: a fiber
/// that wants to run again later must arrange for that (re-schedule itself,
/// register an fd event, arm a timer) *before* yielding.
pub fn yield_now() {
    let p = CURRENT.with(|c| c.get());
    assert!(!p.is_null(), "yield_now() called outside of a fiber");
    unsafe { (*p).do_yield() }
}

/// Whether the calling code runs inside an initialized fiber context.
pub fn in_fiber() -> bool {
    CURRENT.with(|c| !c.get().is_null())
}

/// Put the current fiber to sleep for at least `timeout`.
///
/// On a reactor worker this parks only the fiber: a one-shot timer
/// re-schedules it and the worker keeps running other tasks. Anywhere else
/// it degrades to [`std::thread::sleep`].
pub fn sleep(timeout: Duration) {
    use crate::reactor::Reactor;

    let io = match Reactor::current() {
        Some(io) => io,
        None => return std::thread::sleep(timeout),
    };
    let fiber = Fiber::current();
    if !fiber.run_in_scheduler() {
        // not a scheduled fiber (e.g. the caller thread between start and
        // stop), so there is nothing the timer could re-schedule
        return std::thread::sleep(timeout);
    }
    let sched = Scheduler::current().expect("a reactor worker always has a scheduler");
    debug_assert_eq!(fiber.state(), State::Running);

    let target = fiber.clone();
    io.add_timer(
        timeout.as_millis() as u64,
        move || sched.schedule_fiber(target.clone()),
        false,
    );
    yield_now();
}

////////////////////////////////////////////////////////////////////////////////
// Context plumbing
////////////////////////////////////////////////////////////////////////////////

fn init_context(ctx: &mut libc::ucontext_t, stack: &mut [u8]) {
    let rc = unsafe { libc::getcontext(ctx) };
    assert_eq!(rc, 0, "getcontext failed");
    ctx.uc_link = ptr::null_mut();
    ctx.uc_stack.ss_sp = stack.as_mut_ptr().cast();
    ctx.uc_stack.ss_size = stack.len();
    unsafe { libc::makecontext(ctx, fiber_entry, 0) };
}

/// First frame of every stackful fiber.
extern "C" fn fiber_entry() {
    let cur = Fiber::current();
    let entry = unsafe { (*cur.inner.get()).entry.take() };
    let entry = entry.expect("fiber resumed without an entry");

    // Panics are not caught here: a fiber aborting the process is the
    // caller's problem to prevent, same as an escaped panic on a thread
    // without a handler. Unwinding across swapcontext is not supported.
    entry();

    cur.set_state(State::Term);
    // Give up our strong reference before the final yield, so the owner's
    // handle is the last one and dropping it releases the stack. The owner
    // keeps the fiber alive for as long as it runs.
    let raw = Arc::into_raw(cur);
    unsafe {
        Arc::decrement_strong_count(raw);
        (*raw).do_yield();
    }
    unreachable!("a terminated fiber must not be resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn resume_yield_term_reset() {
        let log = Arc::new(StdMutex::new(Vec::new()));

        let l = log.clone();
        let fiber = Fiber::new(
            move || {
                l.lock().unwrap().push("A");
                yield_now();
                l.lock().unwrap().push("B");
                yield_now();
                l.lock().unwrap().push("C");
            },
            0,
            false,
        );
        assert_eq!(fiber.state(), State::Ready);

        fiber.resume();
        assert_eq!(fiber.state(), State::Ready);
        assert_eq!(*log.lock().unwrap(), ["A"]);

        fiber.resume();
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*log.lock().unwrap(), ["A", "B", "C"]);

        // A terminated fiber can be re-armed on the same stack.
        let l = log.clone();
        fiber.reset(move || l.lock().unwrap().push("D"));
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*log.lock().unwrap(), ["A", "B", "C", "D"]);
    }

    #[test]
    fn current_inside_and_outside() {
        let main = Fiber::current();
        assert_eq!(main.state(), State::Running);
        assert_eq!(Fiber::current_id(), Some(main.id()));

        let seen = Arc::new(StdMutex::new(None));
        let s = seen.clone();
        let fiber = Fiber::new(
            move || {
                *s.lock().unwrap() = Fiber::current_id();
            },
            0,
            false,
        );
        let id = fiber.id();
        fiber.resume();
        assert_eq!(*seen.lock().unwrap(), Some(id));
        // back on the thread-main fiber
        assert_eq!(Fiber::current_id(), Some(main.id()));
    }

    #[test]
    fn ids_are_unique_and_count_tracks_lifetime() {
        let a = Fiber::new(|| {}, 0, false);
        let b = Fiber::new(|| {}, 0, false);
        assert_ne!(a.id(), b.id());
        // both are alive right now, whatever other tests are doing
        assert!(Fiber::total() >= 2);
        a.resume();
        b.resume();
    }

    #[test]
    fn builder_names_and_stack_size() {
        let fiber = Builder::new()
            .name("worker")
            .stack_size(64 * 1024)
            .run_in_scheduler(false)
            .spawn(|| {});
        assert_eq!(fiber.name(), Some("worker"));
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn sleep_without_reactor_blocks_the_thread() {
        let start = std::time::Instant::now();
        sleep(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
