//! Timed `_Accept`, per spec.md §8 scenario 5: two worker tasks never call
//! the gated member. Main accepts with a 1-second timeout and the
//! `_Timeout` branch fires; after it does, a subsequent unconditional
//! accept still works once a real caller arrives.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use uxk::error::MonitorError;
use uxk::task::Task;
use uxk::time::Duration;
use uxk::{Priority, Serial};

const MEMBER_OP: u32 = 1;

struct Gate {
    serial: Arc<Serial>,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            serial: Serial::new(Some("gate".into())),
        })
    }

    /// Stand-in for a mutex member call the main task is waiting to accept.
    fn call(&self, caller: &Arc<Task>) {
        self.serial.enter(caller).unwrap();
        self.serial.exit();
    }
}

#[test]
fn timeout_fires_then_a_later_accept_still_matches_a_real_call() {
    let kernel = common::start_kernel(3);
    let cluster = Arc::clone(kernel.system_cluster());
    let gate = Gate::new();

    let timed_out: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let matched: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let mut tasks = Vec::new();

    let main = {
        let gate = Arc::clone(&gate);
        let timed_out = Arc::clone(&timed_out);
        let matched = Arc::clone(&matched);
        Task::new(Some("main".into()), Priority(10), 64 * 1024, move || {
            let me = uxk::processor::current_task().expect("running as a task");
            gate.serial.enter(&me).unwrap();

            let deadline = uxk::time::Time::now() + Duration::from_secs(1);
            let event_queue = Arc::clone(uxk::Kernel::get().unwrap().event_queue());
            let before = uxk::time::Time::now();
            let result = gate
                .serial
                .accept(&me, &[MEMBER_OP], false, Some((deadline, event_queue)));
            let elapsed = uxk::time::Time::now() - before;
            assert!(
                elapsed >= Duration::from_secs(1),
                "accept returned before its 1s deadline: {elapsed:?}"
            );
            assert!(matches!(result, Err(MonitorError::Timeout)));
            timed_out.store(true, Ordering::Release);

            // The timeout left us without ownership; re-enter before the
            // next accept attempt, the same as any other member call would.
            gate.serial.enter(&me).unwrap();
            let result = gate.serial.accept(&me, &[MEMBER_OP], false, None);
            assert!(result.is_ok(), "unconditional accept after a timeout should still match a real call");
            matched.store(true, Ordering::Release);
            gate.serial.exit();
        })
    };
    common::spawn(&cluster, Arc::clone(&main));
    tasks.push(Arc::clone(&main));

    // Worker tasks that never call the gate; only here to show the timeout
    // isn't an artifact of no other tasks existing on the cluster.
    for i in 0..2 {
        let task = Task::new(Some(format!("idle-worker-{i}")), Priority(20), 64 * 1024, move || {
            std::thread::sleep(StdDuration::from_millis(50));
        });
        common::spawn(&cluster, Arc::clone(&task));
        tasks.push(task);
    }

    // Wait comfortably past main's 1s deadline before calling, so this call
    // lands on main's *second* (untimed) accept rather than racing its
    // first: a fixed real sleep rather than polling `timed_out`, since
    // polling would hold this task's processor for the exact same span
    // anyway (it never actually yields back to the scheduler mid-sleep).
    let caller = {
        let gate = Arc::clone(&gate);
        Task::new(Some("caller".into()), Priority(10), 64 * 1024, move || {
            std::thread::sleep(StdDuration::from_millis(1500));
            let me = uxk::processor::current_task().expect("running as a task");
            gate.call(&me);
        })
    };
    common::spawn(&cluster, Arc::clone(&caller));
    tasks.push(caller);

    common::wait_for_halt(&tasks, StdDuration::from_secs(10));

    assert!(timed_out.load(Ordering::Acquire));
    assert!(matched.load(Ordering::Acquire));
}
