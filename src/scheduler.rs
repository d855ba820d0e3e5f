//! M:N fiber scheduler: a pool of worker threads draining one shared task
//! queue, each through its own dispatch loop.
//!
//! A [`Task`] is either a ready [`Fiber`] or a plain callback (which gets
//! wrapped in a reusable per-worker fiber). Tasks may be pinned to a
//! specific worker by kernel thread id; unpinned tasks run wherever a
//! worker picks them up first. The queue is strictly FIFO under one mutex,
//! and the mutex is never held across a fiber resume.
//!
//! When a worker finds nothing eligible it swaps to its idle fiber. What
//! "idle" means is a customization point: the base scheduler just yields in
//! a loop until it may stop, the [reactor](crate::reactor) parks in
//! `epoll_wait`. The same goes for `tickle`, the advisory wake-up issued
//! when work arrives while workers are idle.
//!
//! In **use-caller** mode the constructing thread is itself a worker: it
//! gets a dedicated dispatch fiber, and [`Scheduler::stop`] drains the
//! queue on the caller before returning.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use once_cell::sync::OnceCell;

use crate::fiber::{self, Fiber, State};
use crate::util;

thread_local! {
    /// The scheduler this worker thread belongs to.
    static CURRENT_SCHED: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
    /// The fiber running this worker's dispatch loop. Scheduled fibers
    /// yield back to it.
    static DISPATCH_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

/// A unit of scheduling: a ready fiber or a plain callback.
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

impl Task {
    /// Wrap a callback into a task (for [`Scheduler::schedule_batch`];
    /// the `schedule*` methods take callbacks and fibers directly).
    pub fn call<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

struct QueuedTask {
    task: Task,
    /// Kernel thread id this task is pinned to; `None` runs anywhere.
    thread: Option<u64>,
}

////////////////////////////////////////////////////////////////////////////////
// Hooks
////////////////////////////////////////////////////////////////////////////////

/// Customization points a scheduler specialization (the reactor) overrides.
///
/// Registered as a weak reference: the specialization owns the scheduler,
/// not the other way around.
pub(crate) trait SchedulerHooks: Send + Sync + 'static {
    /// Advisory wake-up of an idle worker after new work arrived.
    fn tickle(&self);

    /// One pass of the specialized idle behavior: park until work might
    /// exist, then make whatever became runnable schedulable. Runs inside
    /// the worker's idle fiber, which yields between passes so freshly
    /// scheduled tasks run promptly.
    fn idle_pass(&self);

    /// Whether the run loops may exit.
    fn stopping(&self) -> bool;

    /// Called on every worker thread before it enters the run loop, and on
    /// the caller thread in use-caller mode.
    fn on_thread_start(&self);

    /// Symmetric to [`on_thread_start`](Self::on_thread_start).
    fn on_thread_stop(&self);
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

pub struct Scheduler {
    name: String,
    /// Worker threads to spawn; excludes the caller in use-caller mode.
    thread_count: usize,
    use_caller: bool,
    /// Kernel tid of the constructing thread; meaningful in use-caller mode.
    caller_thread: u64,

    tasks: Mutex<VecDeque<QueuedTask>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    worker_ids: Mutex<Vec<u64>>,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stop_flag: AtomicBool,
    started: AtomicBool,
    hooks: OnceCell<Weak<dyn SchedulerHooks>>,
    /// Use-caller mode: the caller thread's dispatch fiber, resumed by
    /// `stop` to drain the queue there.
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// Create a scheduler.
    ///
    /// - `threads` - total worker count, at least 1
    /// - `use_caller` - count the constructing thread as one of the workers
    /// - `name` - used for worker thread names and logs
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Self> {
        assert!(threads > 0, "a scheduler needs at least one thread");

        let (thread_count, caller_thread) = if use_caller {
            (threads - 1, util::thread_id())
        } else {
            (threads, 0)
        };
        let sched = Arc::new(Scheduler {
            name: name.into(),
            thread_count,
            use_caller,
            caller_thread,
            tasks: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            worker_ids: Mutex::new(Vec::new()),
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            stop_flag: AtomicBool::new(false),
            started: AtomicBool::new(false),
            hooks: OnceCell::new(),
            caller_fiber: Mutex::new(None),
        });

        if use_caller {
            // The caller thread becomes a worker. Its dispatch loop runs in
            // a dedicated fiber which `stop` resumes to drain the queue.
            Fiber::current();
            let weak = Arc::downgrade(&sched);
            let root = fiber::Builder::new()
                .name(format!("{name}_dispatch"))
                .run_in_scheduler(false)
                .spawn(move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run();
                    }
                });
            DISPATCH_FIBER.with(|d| *d.borrow_mut() = Some(root.clone()));
            *sched.caller_fiber.lock().unwrap() = Some(root);
            CURRENT_SCHED.with(|s| *s.borrow_mut() = Some(sched.clone()));
        }

        sched
    }

    /// The scheduler bound to the current worker thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHED.with(|s| s.borrow().clone())
    }

    /// The dispatch fiber of the current worker thread, if any.
    pub fn dispatch_fiber() -> Option<Arc<Fiber>> {
        DISPATCH_FIBER.with(|d| d.borrow().clone())
    }

    pub(crate) fn dispatch_fiber_ptr() -> Option<*const Fiber> {
        DISPATCH_FIBER.with(|d| d.borrow().as_ref().map(Arc::as_ptr))
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread ids of the spawned workers (the caller thread is not
    /// listed). Filled by [`start`](Self::start).
    pub fn worker_ids(&self) -> Vec<u64> {
        self.worker_ids.lock().unwrap().clone()
    }

    /// Whether any worker is currently parked in its idle fiber.
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub(crate) fn set_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        if self.hooks.set(hooks).is_err() {
            panic!("scheduler hooks can only be set once");
        }
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.get().and_then(Weak::upgrade)
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("scheduler {}: starting {} workers", self.name, self.thread_count);

        let (tx, rx) = mpsc::channel();
        {
            let mut workers = self.workers.lock().unwrap();
            for i in 0..self.thread_count {
                let sched = Arc::clone(self);
                let tx = tx.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}_{}", self.name, i))
                    .spawn(move || {
                        // report the kernel tid before any task can be
                        // pinned to this worker
                        let _ = tx.send(util::thread_id());
                        sched.run();
                    })
                    .expect("failed to spawn a scheduler worker");
                workers.push(handle);
            }
        }
        drop(tx);
        let mut ids = self.worker_ids.lock().unwrap();
        ids.extend(rx.iter().take(self.thread_count));

        if self.use_caller {
            if let Some(hooks) = self.hooks() {
                hooks.on_thread_start();
            }
        }
    }

    /// Signal termination, wake every worker enough times to drain and
    /// exit, then join them. In use-caller mode the queue is first drained
    /// on the calling thread. Idempotent.
    pub fn stop(self: &Arc<Self>) {
        log::debug!("scheduler {}: stop", self.name);
        self.stop_flag.store(true, Ordering::SeqCst);

        for _ in 0..self.thread_count {
            self.tickle();
        }

        let caller_fiber = self.caller_fiber.lock().unwrap().take();
        if let Some(root) = caller_fiber {
            debug_assert_eq!(
                util::thread_id(),
                self.caller_thread,
                "a use-caller scheduler must be stopped from its constructing thread"
            );
            self.tickle();
            // drain the queue on the caller thread; with nothing left to do
            // the dispatch loop still runs once so the fiber terminates
            root.resume();
        }

        let workers = mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }

        if self.use_caller {
            // run() already cleared the worker thread-locals; do the same
            // for the caller thread so scheduler instances stay isolated
            if let Some(hooks) = self.hooks() {
                hooks.on_thread_stop();
            }
            DISPATCH_FIBER.with(|d| d.borrow_mut().take());
            CURRENT_SCHED.with(|s| s.borrow_mut().take());
        }
    }

    /// Whether the run loops may exit: stop was requested, the queue is
    /// drained and no worker is busy. A specialization widens this through
    /// its hooks (the reactor also requires no pending events or timers).
    pub fn stopping(&self) -> bool {
        match self.hooks() {
            Some(hooks) => hooks.stopping(),
            None => self.base_stopping(),
        }
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
            && self.active_count.load(Ordering::SeqCst) == 0
            && self.tasks.lock().unwrap().is_empty()
    }

    pub(crate) fn flag_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    ////////////////////////////////////////////////////////////////////////
    // scheduling
    ////////////////////////////////////////////////////////////////////////

    /// Queue a callback to run on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Task::call(f), None);
    }

    /// Queue a callback pinned to the worker with kernel thread id
    /// `thread`.
    pub fn schedule_to<F>(&self, f: F, thread: u64)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Task::call(f), Some(thread));
    }

    /// Queue a ready fiber to run on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.push(Task::Fiber(fiber), None);
    }

    /// Queue a ready fiber pinned to the worker with kernel thread id
    /// `thread`.
    pub fn schedule_fiber_to(&self, fiber: Arc<Fiber>, thread: u64) {
        self.push(Task::Fiber(fiber), Some(thread));
    }

    /// Queue a batch of tasks; a single tickle covers all of them.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut queue = self.tasks.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.extend(tasks.into_iter().map(|task| QueuedTask { task, thread: None }));
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn push(&self, task: Task, thread: Option<u64>) {
        let need_tickle = {
            let mut queue = self.tasks.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(QueuedTask { task, thread });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn tickle(&self) {
        if let Some(hooks) = self.hooks() {
            hooks.tickle();
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // worker dispatch loop
    ////////////////////////////////////////////////////////////////////////

    fn run(self: &Arc<Self>) {
        let tid = util::thread_id();
        log::debug!("scheduler {}: worker {} enters the dispatch loop", self.name, tid);

        CURRENT_SCHED.with(|s| *s.borrow_mut() = Some(Arc::clone(self)));
        if let Some(hooks) = self.hooks() {
            hooks.on_thread_start();
        }
        let on_caller = self.use_caller && tid == self.caller_thread;
        if !on_caller {
            // a spawned worker dispatches right on its thread-main fiber;
            // the caller's dedicated dispatch fiber was set up in new()
            DISPATCH_FIBER.with(|d| *d.borrow_mut() = Some(Fiber::current()));
        }

        let idle_fiber = {
            let sched = Arc::downgrade(self);
            fiber::Builder::new()
                .name(format!("{}_idle", self.name))
                .spawn(move || idle_main(sched))
        };
        // reusable wrapper for callback tasks
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task = None;
            let mut need_tickle = false;
            {
                let mut queue = self.tasks.lock().unwrap();
                let mut found = None;
                for i in 0..queue.len() {
                    if let Some(pin) = queue[i].thread {
                        if pin != tid {
                            // eligible for someone else; make sure they hear
                            // about it
                            need_tickle = true;
                            continue;
                        }
                    }
                    if let Task::Fiber(fiber) = &queue[i].task {
                        if fiber.state() == State::Running {
                            // re-scheduled while still running on another
                            // worker; it will become eligible once it yields
                            continue;
                        }
                    }
                    found = Some(i);
                    break;
                }
                if let Some(i) = found {
                    task = queue.remove(i).map(|qt| qt.task);
                    self.active_count.fetch_add(1, Ordering::SeqCst);
                    need_tickle = need_tickle || !queue.is_empty();
                }
            }
            if need_tickle {
                self.tickle();
            }

            match task {
                Some(Task::Fiber(fiber)) => {
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Task::Call(f)) => {
                    match &cb_fiber {
                        Some(wrapper) => wrapper.reset(f),
                        None => cb_fiber = Some(Fiber::new(f, 0, true)),
                    }
                    let wrapper = cb_fiber.as_ref().unwrap();
                    wrapper.resume();
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    if wrapper.state() != State::Term {
                        // the callback yielded mid-flight and now lives on
                        // through whatever re-scheduled it; start fresh
                        cb_fiber = None;
                    }
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        log::debug!("scheduler {}: worker {} exits", self.name, tid);
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_count.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        if let Some(hooks) = self.hooks() {
            hooks.on_thread_stop();
        }
        DISPATCH_FIBER.with(|d| d.borrow_mut().take());
        CURRENT_SCHED.with(|s| s.borrow_mut().take());
    }
}

/// Entry of the per-worker idle fiber.
///
/// Holds the scheduler (and through it the reactor) only weakly, upgrading
/// per pass, so parked workers never keep a dropped specialization alive.
fn idle_main(sched: Weak<Scheduler>) {
    log::debug!("idle fiber running");
    loop {
        let hooks = {
            let sched = match sched.upgrade() {
                Some(sched) => sched,
                None => break,
            };
            if sched.stopping() {
                break;
            }
            sched.hooks()
        };
        if let Some(hooks) = hooks {
            hooks.idle_pass();
        }
        fiber::yield_now();
    }
    log::debug!("idle fiber exits");
}
