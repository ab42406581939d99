//! Priority inheritance across a chain of blocked callers, per spec.md §8
//! scenario 4: a low-priority holder, a medium-priority caller, and a
//! high-priority caller all contend for one monitor. The holder's active
//! priority must track the best of whoever is currently queued behind it,
//! and that boost must survive the ownership handoff as the monitor is
//! released down the chain, not just hold at the moment each caller first
//! blocks.
//!
//! Needs at least two processors: the holder deliberately calls
//! `std::thread::sleep` while owning the monitor, which blocks its
//! processor's carrier thread for that span (`context::resume` is
//! synchronous), so the other callers need a separate processor to run on
//! while they attempt entry.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration as StdDuration, Instant};

use uxk::task::{Task, TaskState};
use uxk::{Priority, Serial};

// Lower number is higher priority (spec.md §4.8); `LOW` is the least urgent.
const LOW: Priority = Priority(30);
const MEDIUM: Priority = Priority(20);
const HIGH: Priority = Priority(10);

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: StdDuration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(StdDuration::from_millis(2));
    }
}

#[test]
fn holder_inherits_best_priority_of_queued_callers_through_release_chain() {
    let kernel = common::start_kernel(4);
    let cluster = Arc::clone(kernel.system_cluster());
    let monitor = Serial::new(Some("m".into()));

    let holder_owns = Arc::new(AtomicBool::new(false));
    // Recorded by `high`, right after it is granted ownership but before it
    // exits: the holder (by then, `high` itself) should still see `medium`
    // boosting it, per the ownership-handoff fix.
    let high_active_priority_on_entry: Arc<Mutex<Option<Priority>>> = Arc::new(Mutex::new(None));
    // Recorded by `medium`, after it is finally granted ownership with
    // nobody left queued: should be back down to its own base priority.
    let medium_active_priority_on_entry: Arc<Mutex<Option<Priority>>> = Arc::new(Mutex::new(None));

    let mut tasks = Vec::new();

    let holder = {
        let monitor = Arc::clone(&monitor);
        let holder_owns = Arc::clone(&holder_owns);
        Task::new(Some("holder".into()), LOW, 64 * 1024, move || {
            let me = uxk::processor::current_task().expect("running as a task");
            monitor.enter(&me).unwrap();
            holder_owns.store(true, Ordering::Release);
            // Stand-in for "doing work while holding the monitor"; blocks
            // this task's carrier thread for the duration, which is why the
            // test needs a spare processor for the callers to run on.
            thread::sleep(StdDuration::from_millis(400));
            monitor.exit();
        })
    };
    common::spawn(&cluster, Arc::clone(&holder));
    tasks.push(Arc::clone(&holder));

    wait_until(
        || holder_owns.load(Ordering::Acquire),
        StdDuration::from_secs(5),
        "the holder to take the monitor",
    );

    let medium = {
        let monitor = Arc::clone(&monitor);
        let medium_active_priority_on_entry = Arc::clone(&medium_active_priority_on_entry);
        Task::new(Some("medium".into()), MEDIUM, 64 * 1024, move || {
            let me = uxk::processor::current_task().expect("running as a task");
            monitor.enter(&me).unwrap();
            *medium_active_priority_on_entry.lock().unwrap() = Some(me.active_priority());
            monitor.exit();
        })
    };
    common::spawn(&cluster, Arc::clone(&medium));
    tasks.push(Arc::clone(&medium));

    wait_until(
        || medium.state() == TaskState::Blocked,
        StdDuration::from_secs(5),
        "medium to block on the monitor",
    );
    assert_eq!(
        holder.active_priority(),
        MEDIUM,
        "holder should inherit medium's priority as soon as medium blocks"
    );

    let high = {
        let monitor = Arc::clone(&monitor);
        let high_active_priority_on_entry = Arc::clone(&high_active_priority_on_entry);
        Task::new(Some("high".into()), HIGH, 64 * 1024, move || {
            let me = uxk::processor::current_task().expect("running as a task");
            monitor.enter(&me).unwrap();
            *high_active_priority_on_entry.lock().unwrap() = Some(me.active_priority());
            monitor.exit();
        })
    };
    common::spawn(&cluster, Arc::clone(&high));
    tasks.push(Arc::clone(&high));

    wait_until(
        || high.state() == TaskState::Blocked,
        StdDuration::from_secs(5),
        "high to block on the monitor",
    );
    assert_eq!(
        holder.active_priority(),
        HIGH,
        "holder should inherit high's priority once high also blocks"
    );

    common::wait_for_halt(&tasks, StdDuration::from_secs(10));

    // The priority-ordered entry queue grants `high` the monitor first
    // (`medium` still queued behind it), then `medium` last, with nobody
    // left; both should see their own base priority once they own the
    // monitor, since in this particular chain the newly granted owner is
    // always at least as urgent as whoever remains (see serial.rs's
    // `exit_reapplies_inheritance_for_a_stale_queue_position` for a
    // white-box test of the handoff-reapplication fix itself, in a case
    // where that's not true).
    assert_eq!(high_active_priority_on_entry.lock().unwrap().unwrap(), HIGH);
    assert_eq!(medium_active_priority_on_entry.lock().unwrap().unwrap(), MEDIUM);
}
