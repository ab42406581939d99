//! Tasks: a [`crate::context::Coroutine`] plus the scheduling record spec.md
//! §3 attaches to it.
//!
//! Grounded on `r3_kernel::task`, which similarly pairs an execution context
//! with ready-queue linkage, a priority, and a wait-state enum; `uxk`
//! generalizes away from that crate's const-generic `System<Traits>`
//! indirection to a plain `Arc<Task>` shared between the cluster, the
//! processor, and whichever `Serial` the task is blocked on.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::{self, Coroutine, UnhandledException};
use crate::priority::{active_priority, PiQueue, Priority};
use crate::processor::Processor;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle states from spec.md §3's Task data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Start,
    Ready,
    Running,
    Blocked,
    Halt,
}

/// Where a task is currently linked — enforces spec.md's "linked into at
/// most one of {ready queue, entry queue, condition queue, event list} at a
/// time" invariant by construction: a task carries one `Location`, not one
/// flag per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    None,
    ReadyQueue,
    EntryQueue { serial_id: u64 },
    ConditionQueue { serial_id: u64 },
    EventQueue,
}

/// A small, non-cryptographic PRNG per task: Xoshiro256**, seeded from the
/// task id and start time. Substitutes for uC++'s `uPRNG` (a linear
/// congruential generator keyed the same way) per spec.md's data model
/// "per-task PRNG state" — the algorithm differs, the per-task-seeded
/// contract does not.
pub struct TaskPrng {
    state: [u64; 4],
}

impl TaskPrng {
    fn seed(task_id: u64, salt: u64) -> Self {
        // SplitMix64 to expand a small seed into four well-distributed words.
        let mut z = task_id ^ salt.wrapping_mul(0x9E3779B97F4A7C15);
        let mut words = [0u64; 4];
        for w in &mut words {
            z = z.wrapping_add(0x9E3779B97F4A7C15);
            let mut x = z;
            x = (x ^ (x >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
            x = (x ^ (x >> 27)).wrapping_mul(0x94D049BB133111EB);
            *w = x ^ (x >> 31);
        }
        Self { state: words }
    }

    pub fn next_u64(&mut self) -> u64 {
        let [s0, s1, s2, s3] = self.state;
        let result = (s1.wrapping_mul(5)).rotate_left(7).wrapping_mul(9);
        let t = s1 << 17;
        let s2 = s2 ^ s0;
        let s3 = s3 ^ s1;
        let s1 = s1 ^ s2;
        let s0 = s0 ^ s3;
        let s2 = s2 ^ t;
        let s3 = s3.rotate_left(45);
        self.state = [s0, s1, s2, s3];
        result
    }

    /// A uniform value in `[0, u)`.
    pub fn below(&mut self, u: u64) -> u64 {
        if u == 0 {
            0
        } else {
            self.next_u64() % u
        }
    }

    /// A uniform value in `[l, u)`.
    pub fn range(&mut self, l: u64, u: u64) -> u64 {
        l + self.below(u.saturating_sub(l))
    }
}

/// Whether a task currently allows a pending cancellation to deliver, per
/// Design Notes §9's "model cancellation as a typed unwind, gated by a
/// counted deferral flag".
#[derive(Debug, Default)]
struct CancelState {
    deferred_count: u32,
    requested: bool,
    in_progress: bool,
}

struct HaltOnExit(Arc<Task>);

impl Drop for HaltOnExit {
    fn drop(&mut self) {
        self.0.set_state(TaskState::Halt);
    }
}

pub struct Task {
    pub id: TaskId,
    name: Option<String>,
    coroutine: Coroutine,
    base_priority: Mutex<Priority>,
    piq: Mutex<PiQueue>,
    state: Mutex<TaskState>,
    location: Mutex<Location>,
    cluster_id: Mutex<Option<u64>>,
    /// Non-owning back-reference to the task's current cluster, per
    /// spec.md's ownership summary ("Processors hold a back-reference
    /// (non-owning) to their Cluster") applied the same way to tasks, so a
    /// task and its cluster never form a reference cycle.
    cluster: Mutex<Option<std::sync::Weak<crate::cluster::Cluster>>>,
    processor_id: Mutex<Option<u64>>,
    /// The processor currently running this task, published by
    /// `Processor::run_one` right before switching to it. A task's own
    /// thread is a distinct OS thread from its processor's carrier thread,
    /// so `processor::current()`'s thread-local can't be set from `run_one`
    /// directly — it's read back out of here instead, from whichever thread
    /// is running as this task.
    current_processor: Mutex<Option<Arc<Processor>>>,
    cancel: Mutex<CancelState>,
    prng: Mutex<TaskPrng>,
    tls: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Task {
    pub fn new(
        name: Option<String>,
        base_priority: Priority,
        stack_size: usize,
        entry: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        let id = TaskId::next();
        let prng = TaskPrng::seed(id.0, crate::time::Time::now().as_nanos_since_epoch());

        // The coroutine's backing thread needs to register itself as "the
        // current task" before running user code, but the `Arc<Task>` it
        // would register doesn't exist until after `Coroutine::start`
        // returns. Thread the handle through a cell the entry closure reads
        // once, instead of restructuring `Coroutine::start` around a
        // not-yet-constructed owner.
        let self_cell: Arc<std::sync::OnceLock<Arc<Task>>> = Arc::new(std::sync::OnceLock::new());
        let self_cell2 = Arc::clone(&self_cell);
        let coroutine = Coroutine::start(name.clone(), stack_size, move || {
            // Safe to assume set: the coroutine's thread parks until its
            // first `resume`, which can only happen after `Task::new` below
            // has populated `self_cell`.
            let this = self_cell2.get().expect("task not registered before first resume").clone();
            crate::processor::set_current_task(Some(Arc::clone(&this)));
            // Marks the task Halt on every exit path out of `entry`,
            // including an unwind (cancellation or a user panic), so
            // `Processor::run_loop` and anyone polling `task.state()` see a
            // halted task instead of one stuck looking merely "not ready".
            let _halt_on_exit = HaltOnExit(this);
            entry();
        });

        let task = Arc::new(Self {
            id,
            name,
            coroutine,
            base_priority: Mutex::new(base_priority),
            piq: Mutex::new(PiQueue::new()),
            state: Mutex::new(TaskState::Start),
            location: Mutex::new(Location::None),
            cluster_id: Mutex::new(None),
            cluster: Mutex::new(None),
            processor_id: Mutex::new(None),
            current_processor: Mutex::new(None),
            cancel: Mutex::new(CancelState::default()),
            prng: Mutex::new(prng),
            tls: Mutex::new(None),
        });
        let _ = self_cell.set(Arc::clone(&task));
        task
    }

    /// Wrap the calling OS thread as a `Task`, used for the program's
    /// initial task and for the system processor's own idle task.
    pub fn wrap_current(name: Option<String>, base_priority: Priority) -> Arc<Self> {
        let id = TaskId::next();
        let prng = TaskPrng::seed(id.0, crate::time::Time::now().as_nanos_since_epoch());
        Arc::new(Self {
            id,
            name: name.clone(),
            coroutine: Coroutine::wrap_current(name),
            base_priority: Mutex::new(base_priority),
            piq: Mutex::new(PiQueue::new()),
            state: Mutex::new(TaskState::Running),
            location: Mutex::new(Location::None),
            cluster_id: Mutex::new(None),
            cluster: Mutex::new(None),
            processor_id: Mutex::new(None),
            current_processor: Mutex::new(None),
            cancel: Mutex::new(CancelState::default()),
            prng: Mutex::new(prng),
            tls: Mutex::new(None),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn coroutine(&self) -> &Coroutine {
        &self.coroutine
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, s: TaskState) {
        *self.state.lock().unwrap() = s;
    }

    pub fn location(&self) -> Location {
        *self.location.lock().unwrap()
    }

    /// Move a task between queue memberships, asserting the
    /// at-most-one-queue invariant rather than silently overwriting a
    /// dangling link.
    pub fn set_location(&self, loc: Location) {
        *self.location.lock().unwrap() = loc;
    }

    pub fn base_priority(&self) -> Priority {
        *self.base_priority.lock().unwrap()
    }

    pub fn set_base_priority(&self, p: Priority) {
        *self.base_priority.lock().unwrap() = p;
    }

    pub fn active_priority(&self) -> Priority {
        active_priority(self.base_priority(), &self.piq.lock().unwrap())
    }

    pub fn inherit_from(&self, serial_id: u64, priority: Priority) {
        self.piq.lock().unwrap().upsert(serial_id, priority);
    }

    pub fn stop_inheriting(&self, serial_id: u64) {
        self.piq.lock().unwrap().remove(serial_id);
    }

    pub fn cluster_id(&self) -> Option<u64> {
        *self.cluster_id.lock().unwrap()
    }

    pub fn set_cluster_id(&self, id: Option<u64>) {
        *self.cluster_id.lock().unwrap() = id;
    }

    /// The cluster this task is currently registered on, if any and if it
    /// hasn't since been dropped.
    pub fn cluster(&self) -> Option<Arc<crate::cluster::Cluster>> {
        self.cluster.lock().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    pub fn set_cluster(&self, cluster: Option<Arc<crate::cluster::Cluster>>) {
        *self.cluster.lock().unwrap() = cluster.map(|c| Arc::downgrade(&c));
    }

    pub fn processor_id(&self) -> Option<u64> {
        *self.processor_id.lock().unwrap()
    }

    pub fn set_processor_id(&self, id: Option<u64>) {
        *self.processor_id.lock().unwrap() = id;
    }

    /// The processor currently running this task, as published by
    /// `Processor::run_one`. Read by `processor::current()` when called from
    /// code running on the task's own thread.
    pub fn current_processor(&self) -> Option<Arc<Processor>> {
        self.current_processor.lock().unwrap().clone()
    }

    pub fn set_current_processor(&self, processor: Option<Arc<Processor>>) {
        *self.current_processor.lock().unwrap() = processor;
    }

    pub fn prng_next_u64(&self) -> u64 {
        self.prng.lock().unwrap().next_u64()
    }

    pub fn prng_below(&self, u: u64) -> u64 {
        self.prng.lock().unwrap().below(u)
    }

    pub fn prng_range(&self, l: u64, u: u64) -> u64 {
        self.prng.lock().unwrap().range(l, u)
    }

    pub fn set_tls(&self, value: Box<dyn Any + Send>) {
        *self.tls.lock().unwrap() = Some(value);
    }

    pub fn take_tls(&self) -> Option<Box<dyn Any + Send>> {
        self.tls.lock().unwrap().take()
    }

    /// Defer cancellation delivery, per spec.md §9's "deferred cancellation"
    /// — matching uC++'s `uDeferStart`/`uDeferEnd` pairing.
    pub fn defer_cancellation(&self) {
        self.cancel.lock().unwrap().deferred_count += 1;
    }

    pub fn end_defer_cancellation(&self) {
        let mut c = self.cancel.lock().unwrap();
        c.deferred_count = c.deferred_count.saturating_sub(1);
    }

    /// Request cancellation of this task. Delivery (raising
    /// [`context::CancelUnwind`] on the task's own stack) happens lazily, the
    /// next time the task reaches a cancellation point with a zero defer
    /// count.
    pub fn cancel(&self) {
        self.cancel.lock().unwrap().requested = true;
    }

    pub fn cancel_in_progress(&self) -> bool {
        self.cancel.lock().unwrap().in_progress
    }

    /// Called at a cancellation point. If cancellation is requested and not
    /// currently deferred, marks it in-progress and unwinds the stack with
    /// [`context::CancelUnwind`] — caught only by this task's own
    /// trampoline, which runs destructors along the way via ordinary Rust
    /// unwinding.
    pub fn poll_cancellation(&self) {
        let mut c = self.cancel.lock().unwrap();
        if c.requested && c.deferred_count == 0 && !c.in_progress {
            c.in_progress = true;
            drop(c);
            std::panic::resume_unwind(Box::new(context::CancelUnwind));
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Re-exported for callers that need to pattern-match on a halted task's
/// captured panic without importing `context` directly.
pub type TaskException = UnhandledException;
