//! Shared helpers for the end-to-end scenario tests, per spec.md §8.
//!
//! Not a test binary itself (`tests/common/` is the standard Cargo
//! convention for code shared between integration tests without being run
//! as its own suite).

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use uxk::task::{Task, TaskState};
use uxk::{Kernel, RuntimeConfig};

/// Start the kernel with `processor_count` processors in the system
/// cluster. Several scenarios need at least two: one task can hold a
/// monitor and block its own OS thread (e.g. a deliberate `sleep` standing
/// in for "do some work") while another, on a different processor, blocks
/// trying to enter the same monitor.
pub fn start_kernel(processor_count: usize) -> &'static Kernel {
    Kernel::start(RuntimeConfig {
        default_processors: processor_count.max(1),
        ..RuntimeConfig::default()
    })
}

/// Block the calling (test) thread until every task in `tasks` has reached
/// [`TaskState::Halt`], or panic if `timeout` elapses first.
pub fn wait_for_halt(tasks: &[Arc<Task>], timeout: StdDuration) {
    let deadline = Instant::now() + timeout;
    loop {
        if tasks.iter().all(|t| t.state() == TaskState::Halt) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "tasks did not reach Halt within {timeout:?}: {:?}",
            tasks.iter().map(|t| (t.name(), t.state())).collect::<Vec<_>>()
        );
        std::thread::sleep(StdDuration::from_millis(5));
    }
}

/// Spawn `task` onto `cluster` and mark it ready to run, the usual
/// construct-then-schedule pair every scenario performs for every task it
/// creates.
pub fn spawn(cluster: &Arc<uxk::Cluster>, task: Arc<Task>) {
    cluster.register_task(Arc::clone(&task));
    cluster.ready_add(task);
}
