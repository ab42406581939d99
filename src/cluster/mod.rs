//! Clusters and the pluggable ready-queue scheduler, per spec.md §4.5.
//!
//! `Scheduler` mirrors `r3_kernel`'s separation between task bookkeeping and
//! ready-queue policy (there expressed as the `Kernel::Traits` scheduler
//! hooks `task_queue`/`choose_next_task`); `uxk` makes it an object-safe
//! trait so a `Cluster` can swap plugins at construction time instead of at
//! compile time, since spec.md requires several stock plugins
//! simultaneously available, not picked once per build.

mod deadline;
mod fifo;
mod heap;
mod priority;

pub use deadline::DeadlineMonotonicScheduler;
pub use fifo::FifoScheduler;
pub use heap::HeapScheduler;
pub use priority::PriorityScheduler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::RuntimeConfig;
use crate::event::EventQueue;
use crate::processor::Processor;
use crate::task::Task;

pub type TaskRef = Arc<Task>;

/// A pluggable ready-queue policy, per spec.md §4.5's table of required
/// operations. Implementors must provide a stable tie-break for equal
/// priorities (FIFO order among same-priority tasks is the usual choice).
pub trait Scheduler: Send {
    fn empty(&self) -> bool;
    fn head(&self) -> Option<TaskRef>;
    fn add(&mut self, task: TaskRef);
    fn drop_head(&mut self) -> Option<TaskRef>;
    fn remove(&mut self, task: &TaskRef) -> bool;

    /// Hook invoked once, on task creation, before the task is ever added to
    /// the ready queue (e.g. to size a per-priority-level bucket vector).
    fn add_initialize(&mut self, _task: &TaskRef) {}

    /// Hook invoked once, on task destruction.
    fn remove_initialize(&mut self, _task: &TaskRef) {}

    /// Called when a ready task's priority changes (e.g. via priority
    /// inheritance) so the plugin can reposition it.
    fn reschedule_task(&mut self, task: &TaskRef) {
        if self.remove(task) {
            self.add(Arc::clone(task));
        }
    }

    /// Whether `caller` should be allowed to jump ahead of `owner`'s current
    /// position (used by priority-ordered entry queues to decide whether a
    /// higher-priority arrival preempts the queue order).
    fn check_priority(&self, owner: &TaskRef, caller: &TaskRef) -> bool {
        // `Priority`'s `Ord` is inverted (lower number sorts greater), so
        // "caller is better than owner" is `caller > owner`, not `<`.
        caller.active_priority() > owner.active_priority()
    }

    /// Reset any transient priority state after `owner` releases whatever
    /// it inherited from `caller`. No-op for plugins with no such state.
    fn reset_priority(&mut self, _owner: &TaskRef, _caller: &TaskRef) {}
}

static NEXT_CLUSTER_ID: AtomicU64 = AtomicU64::new(1);

/// A group of processors sharing one ready queue, per spec.md §3's Cluster
/// data model.
pub struct Cluster {
    id: u64,
    name: String,
    default_stack_size: usize,
    event_queue: Arc<EventQueue>,
    processors: Mutex<Vec<Arc<Processor>>>,
    tasks: Mutex<Vec<TaskRef>>,
    ready: Mutex<Box<dyn Scheduler>>,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        default_stack_size: usize,
        event_queue: Arc<EventQueue>,
        scheduler: Box<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CLUSTER_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            default_stack_size,
            event_queue,
            processors: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            ready: Mutex::new(scheduler),
        })
    }

    /// Build the system cluster named by `cfg`: a priority-scheduled
    /// cluster with `cfg.default_processors` processors, one of which is
    /// designated the system processor running the event/I/O loop (see
    /// [`crate::processor::Processor::spawn_system`]).
    pub fn new_system(cfg: RuntimeConfig, event_queue: Arc<EventQueue>) -> Arc<Self> {
        let cluster = Self::new(
            "system",
            cfg.default_stack_size,
            event_queue,
            Box::new(PriorityScheduler::new()),
        );

        let mut processors = Vec::with_capacity(cfg.default_processors.max(1));
        processors.push(Processor::spawn_system(Arc::clone(&cluster), cfg.clone()));
        for i in 1..cfg.default_processors.max(1) {
            processors.push(Processor::spawn_worker(Arc::clone(&cluster), cfg.clone(), i));
        }
        *cluster.processors.lock().unwrap() = processors;
        cluster
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_stack_size(&self) -> usize {
        self.default_stack_size
    }

    pub fn event_queue(&self) -> &Arc<EventQueue> {
        &self.event_queue
    }

    pub fn processors(&self) -> Vec<Arc<Processor>> {
        self.processors.lock().unwrap().clone()
    }

    pub fn add_processor(&self, processor: Arc<Processor>) {
        self.processors.lock().unwrap().push(processor);
    }

    /// Register a newly constructed task with this cluster, per spec.md's
    /// Cluster invariant: "every task is listed on exactly one cluster."
    pub fn register_task(self: &Arc<Self>, task: TaskRef) {
        self.ready.lock().unwrap().add_initialize(&task);
        task.set_cluster_id(Some(self.id));
        task.set_cluster(Some(Arc::clone(self)));
        self.tasks.lock().unwrap().push(task);
    }

    pub fn unregister_task(&self, task: &TaskRef) {
        self.ready.lock().unwrap().remove_initialize(task);
        task.set_cluster_id(None);
        task.set_cluster(None);
        self.tasks.lock().unwrap().retain(|t| t.id != task.id);
    }

    pub fn ready_empty(&self) -> bool {
        self.ready.lock().unwrap().empty()
    }

    pub fn ready_add(&self, task: TaskRef) {
        task.set_location(crate::task::Location::ReadyQueue);
        task.set_state(crate::task::TaskState::Ready);
        self.ready.lock().unwrap().add(task);
    }

    pub fn ready_drop_head(&self) -> Option<TaskRef> {
        let task = self.ready.lock().unwrap().drop_head();
        if let Some(t) = &task {
            t.set_location(crate::task::Location::None);
        }
        task
    }

    pub fn ready_remove(&self, task: &TaskRef) -> bool {
        self.ready.lock().unwrap().remove(task)
    }

    pub fn reschedule(&self, task: &TaskRef) {
        self.ready.lock().unwrap().reschedule_task(task);
    }

    /// Move `task` from this cluster to `target`, per spec.md's "unless
    /// explicitly migrated" escape hatch on the single-cluster invariant.
    /// The task must not currently be ready, blocked, or running when
    /// migrated (the caller is expected to migrate only halted or
    /// not-yet-started tasks).
    pub fn migrate(self: &Arc<Self>, task: &TaskRef, target: &Arc<Cluster>) {
        self.unregister_task(task);
        target.register_task(Arc::clone(task));
    }
}
