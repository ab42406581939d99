//! Processor Kernel: the per-kernel-thread scheduler coroutine, idle
//! policy, and preemption control, per spec.md §4.4.
//!
//! Grounded on `r3_port_std::ums`, which backs each schedulable unit with a
//! `std::thread` and has the thread currently "running" call
//! `unpark_next_thread` directly rather than handing off to a distinct
//! scheduler stage. `uxk` adds the distinct *scheduler coroutine* spec.md
//! names explicitly: each `Processor` owns a dedicated OS thread that never
//! runs task code itself, only selects the next ready task and parks while
//! that task's own thread runs — so "a task yields by switching to the
//! scheduler coroutine" is a literal two-party handoff, not a same-thread
//! tail call.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use crate::cluster::Cluster;
use crate::config::RuntimeConfig;
use crate::context::{self, Coroutine};
use crate::task::{Task, TaskState};
use crate::time::Duration;

thread_local! {
    /// Counted preemption-disable flag, inspected by the signal handler
    /// installed in `crate::io`. Thread-local to whichever OS thread is
    /// currently executing — in this runtime that's always either a task's
    /// own thread or a processor's idle loop, never a thread shared between
    /// two schedulable units, so "per kernel thread" and "per task" coincide.
    static DISABLE_COUNT: Cell<u32> = const { Cell::new(0) };
    /// Set by the signal handler instead of preempting directly, per
    /// spec.md: "when the counter is nonzero, the handler only sets
    /// roll-forward pending and returns." Consulted at the next checkpoint
    /// reached by this thread's own code (`Processor::checkpoint`).
    static PREEMPT_PENDING: Cell<bool> = const { Cell::new(false) };
    static CURRENT_PROCESSOR: std::cell::RefCell<Option<Arc<Processor>>> = const { std::cell::RefCell::new(None) };
}

/// Disable preemption on the calling thread. Counted: must be paired with
/// [`enable_interrupts`].
pub fn disable_interrupts() {
    DISABLE_COUNT.with(|c| c.set(c.get() + 1));
}

pub fn enable_interrupts() {
    DISABLE_COUNT.with(|c| c.set(c.get().saturating_sub(1)));
}

pub fn interrupts_disabled() -> bool {
    DISABLE_COUNT.with(|c| c.get() != 0)
}

/// Called from the signal handler in `crate::io`. Never invokes the
/// scheduler directly — only records the request — since a signal handler
/// interrupting arbitrary task code cannot safely acquire the locks
/// rescheduling needs.
pub fn note_preempt_signal() {
    if interrupts_disabled() {
        return;
    }
    PREEMPT_PENDING.with(|p| p.set(true));
}

/// A cooperative checkpoint: yields this thread's task if a preemption was
/// requested since the last checkpoint. Called from `Serial` entry/exit,
/// `Task::yield_now`, and the processor idle loop, mirroring the points
/// where uC++'s own translator inserts implicit checkpoints.
pub fn checkpoint() {
    let pending = PREEMPT_PENDING.with(|p| p.replace(false));
    if pending {
        if let Some(p) = current() {
            p.yield_current();
        }
    }
}

/// The processor "running" the calling thread. A processor's own scheduler
/// coroutine has `CURRENT_PROCESSOR` set directly on its carrier thread
/// (`Processor::spawn`), but a task runs on its *own* dedicated OS thread
/// (`Coroutine::start`), a different thread the scheduler coroutine only
/// ever `park`/`unpark`s — a thread-local set there cannot be observed here.
/// So when the direct thread-local is unset, fall back to whatever
/// processor the current task was last published onto by `run_one`.
pub fn current() -> Option<Arc<Processor>> {
    if let Some(p) = CURRENT_PROCESSOR.with(|c| c.borrow().clone()) {
        return Some(p);
    }
    current_task().and_then(|t| t.current_processor())
}

static NEXT_PROCESSOR_ID: AtomicU64 = AtomicU64::new(1);

/// A kernel thread hosting a scheduler coroutine and the ready tasks it
/// runs, per spec.md §3's Processor data model.
pub struct Processor {
    id: u64,
    name: String,
    cluster: Weak<Cluster>,
    scheduler_coroutine: OnceLock<Coroutine>,
    preemption: Option<Duration>,
    spin_count: usize,
    idle: AtomicBool,
    is_system: bool,
    shutdown: AtomicBool,
    os_thread: OnceLock<libc::pthread_t>,
}

impl Processor {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub fn is_system(&self) -> bool {
        self.is_system
    }

    pub fn cluster(&self) -> Option<Arc<Cluster>> {
        self.cluster.upgrade()
    }

    /// Wake this processor's idle scheduler coroutine, the `uxk` analogue of
    /// a SIGUSR1 poke: either an actual signal if the target thread is
    /// currently in blocking I/O or parked, or a direct `unpark` otherwise.
    pub fn poke(&self) {
        if let Some(co) = self.scheduler_coroutine.get() {
            let _ = co; // coroutine handle kept for symmetry with `context::resume`
        }
        if let Some(pthread) = self.os_thread.get() {
            // Safety: `pthread` was captured with `pthread_self()` on this
            // processor's own carrier thread and is valid for its lifetime.
            unsafe {
                libc::pthread_kill(*pthread, libc::SIGUSR1);
            }
        }
    }

    /// Spawn a worker processor: a dedicated carrier thread running the
    /// scheduler loop against `cluster`'s ready queue.
    pub fn spawn_worker(cluster: Arc<Cluster>, cfg: RuntimeConfig, index: usize) -> Arc<Self> {
        Self::spawn(cluster, cfg, format!("uxk-processor-{index}"), false)
    }

    /// Spawn the system processor: the one processor additionally running
    /// the event queue's timer and the I/O poll loop (`crate::io`).
    pub fn spawn_system(cluster: Arc<Cluster>, cfg: RuntimeConfig) -> Arc<Self> {
        Self::spawn(cluster, cfg, "uxk-system-processor".to_string(), true)
    }

    fn spawn(cluster: Arc<Cluster>, cfg: RuntimeConfig, name: String, is_system: bool) -> Arc<Self> {
        let processor = Arc::new(Self {
            id: NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed),
            name: name.clone(),
            cluster: Arc::downgrade(&cluster),
            scheduler_coroutine: OnceLock::new(),
            preemption: cfg.preemption.map(|d| Duration::from_nanos(d.as_nanos() as i64)),
            spin_count: cfg.default_spin,
            idle: AtomicBool::new(true),
            is_system,
            shutdown: AtomicBool::new(false),
            os_thread: OnceLock::new(),
        });

        let handle_clone = Arc::clone(&processor);
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                // Safety: `pthread_self` has no preconditions.
                let self_thread = unsafe { libc::pthread_self() };
                let _ = handle_clone.os_thread.set(self_thread);
                let coroutine = Coroutine::wrap_current(Some(handle_clone.name.clone()));
                let _ = handle_clone.scheduler_coroutine.set(coroutine);
                CURRENT_PROCESSOR.with(|c| *c.borrow_mut() = Some(Arc::clone(&handle_clone)));
                if is_system {
                    crate::io::run_system_loop(&handle_clone);
                } else {
                    handle_clone.run_loop();
                }
            })
            .expect("failed to spawn processor thread");

        processor
    }

    /// Resume exactly one ready task until it yields, blocks, or halts. The
    /// single scheduling step both `run_loop` and the system processor's
    /// combined scheduling/event/I/O loop (`crate::io::run_system_loop`) are
    /// built from, so neither has to choose between running ready tasks and
    /// servicing the event queue.
    pub fn run_one(self: &Arc<Self>, task: Arc<Task>) {
        let scheduler_coroutine = self.scheduler_coroutine.get().expect("coroutine not set");
        self.idle.store(false, Ordering::Release);
        task.set_processor_id(Some(self.id));
        task.set_current_processor(Some(Arc::clone(self)));
        task.set_state(TaskState::Running);
        let result = context::resume(scheduler_coroutine, task.coroutine());
        if let Err(exc) = result {
            log::error!(
                "task {:?} halted with an unhandled exception",
                task.name()
            );
            drop(exc);
        }
        // If `task.state() != TaskState::Halt`, it yielded or blocked and
        // some other path (a `Serial`, the event queue, I/O readiness) is
        // already responsible for re-queueing it; nothing further to do.
    }

    /// The scheduler loop: pick a ready task and switch to it, spinning then
    /// parking when the cluster has no ready task, per spec.md §4.4.
    pub fn run_loop(self: &Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let Some(cluster) = self.cluster() else { return };

            if let Some(task) = cluster.ready_drop_head() {
                self.run_one(task);
            } else {
                self.idle_spin_then_park(&cluster);
            }
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn idle_spin_then_park(&self, cluster: &Arc<Cluster>) {
        for _ in 0..self.spin_count {
            if !cluster.ready_empty() {
                return;
            }
            std::hint::spin_loop();
        }
        self.idle.store(true, Ordering::Release);
        thread::park_timeout(std::time::Duration::from_millis(5));
        self.idle.store(false, Ordering::Release);
    }

    /// Suspend the currently running task on this processor, returning
    /// control to the scheduler coroutine. Called by `Task`-level blocking
    /// operations (`Serial` entry, condition wait, sleep).
    pub fn yield_current(&self) {
        if let Some(scheduler_coroutine) = self.scheduler_coroutine.get() {
            if let Some(task) = current_task() {
                context::suspend_to(task.coroutine(), scheduler_coroutine);
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.poke();
    }
}

thread_local! {
    static CURRENT_TASK: std::cell::RefCell<Option<Arc<Task>>> = const { std::cell::RefCell::new(None) };
}

pub fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

pub fn set_current_task(task: Option<Arc<Task>>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = task);
}
