//! Serial: the monitor core, per spec.md §4.7 — "the heart of the runtime."
//!
//! Grounded on `r3_kernel::wait` (entry-queue-as-plugin-ordered-list plus a
//! per-object owner/recursion pair) enriched with the original uC++
//! monitor examples (`original_source/uCPP/source/CONTRIB/Paper/DatingNew.cc`
//! for signal/accept interplay, `LOOK.cc` for priority-ordered entry with
//! external scheduling). The entry queue reuses
//! [`crate::cluster::Scheduler`] rather than a bespoke ordering, since
//! spec.md's "the Priority plugin orders that queue" names the same
//! plugin abstraction the ready queue uses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::cluster::{PriorityScheduler, Scheduler, TaskRef};
use crate::error::MonitorError;
use crate::event::{EventKind, EventNode, EventQueue, Recur};
use crate::lock::SpinLock;
use crate::processor;
use crate::task::{Location, TaskId, TaskState};
use crate::time::Time;

/// Identifies a mutex member (translator-assigned, per spec.md §6's
/// translator interface); small enough to pack into a bitmask accept mask.
pub type MemberOp = u32;

/// The set of members a `_Accept` statement is prepared to take a call on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptMask(u64);

impl AcceptMask {
    pub fn new(ops: &[MemberOp]) -> Self {
        let mut bits = 0u64;
        for &op in ops {
            assert!(op < 64, "member op id must fit in a 64-bit accept mask");
            bits |= 1 << op;
        }
        Self(bits)
    }

    pub fn contains(&self, op: MemberOp) -> bool {
        op < 64 && (self.0 >> op) & 1 != 0
    }
}

static NEXT_SERIAL_ID: AtomicU64 = AtomicU64::new(1);

struct Acceptor {
    task: TaskRef,
    mask: AcceptMask,
}

/// A caller parked waiting for an accepted rendezvous to complete, per
/// spec.md's "the acceptor... transfers ownership to the caller before
/// executing the statement", generalized here to: the acceptor keeps
/// ownership while running its guarded statement, and the caller blocks
/// until that statement finishes (or the acceptor exits first, which is a
/// `RendezvousFailure`).
struct PendingRendezvous {
    caller: TaskRef,
    done: Mutex<bool>,
    failed: Mutex<bool>,
    condvar: Condvar,
}

struct SerialState {
    owner: Option<TaskRef>,
    recursion: usize,
    entry_queue: Box<dyn Scheduler>,
    acceptor_stack: Vec<Acceptor>,
    rendezvous: Option<Arc<PendingRendezvous>>,
    destroyed: bool,
    /// Member op a blocked entry-queue caller is waiting to call, for
    /// callers that supplied one via `enter_for`. Consulted by
    /// `has_waiting_caller` to answer `_Accept ... _Else`'s "is anyone
    /// already waiting to call one of these members" query; entries are
    /// removed once that caller is granted ownership in `exit`.
    waiting_ops: Vec<(TaskId, MemberOp)>,
}

/// A monitor's entry protocol and scheduling structures, per spec.md §3's
/// Serial data model.
pub struct Serial {
    id: u64,
    name: Option<String>,
    entry_lock: SpinLock,
    state: Mutex<SerialState>,
}

impl Serial {
    pub fn new(name: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SERIAL_ID.fetch_add(1, Ordering::Relaxed),
            name,
            entry_lock: SpinLock::new(),
            state: Mutex::new(SerialState {
                owner: None,
                recursion: 0,
                entry_queue: Box::new(PriorityScheduler::new()),
                acceptor_stack: Vec::new(),
                rendezvous: None,
                destroyed: false,
                waiting_ops: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> Option<TaskRef> {
        self.state.lock().unwrap().owner.clone()
    }

    pub fn recursion(&self) -> usize {
        self.state.lock().unwrap().recursion
    }

    /// Entry protocol for a mutex member call, per spec.md §4.7 steps 1-4.
    /// Blocks (by suspending the calling task) until ownership is granted.
    pub fn enter(self: &Arc<Self>, caller: &TaskRef) -> Result<(), MonitorError> {
        self.enter_for(caller, None)
    }

    /// Same as `enter`, but records which member `caller` is calling, so a
    /// concurrent `_Accept ... _Else` elsewhere can see it via
    /// `has_waiting_caller`. Plain `enter` calls this with `op = None`; such
    /// callers can't satisfy an `_Else` query, since there is no translator
    /// stage assigning them a member id to match against.
    pub fn enter_for(self: &Arc<Self>, caller: &TaskRef, op: Option<MemberOp>) -> Result<(), MonitorError> {
        let _spin = self.entry_lock.acquire();
        let mut state = self.state.lock().unwrap();
        if state.destroyed {
            return Err(MonitorError::EntryFailure);
        }
        if let Some(o) = &state.owner {
            if o.id == caller.id {
                state.recursion += 1;
                return Ok(());
            }
        }
        if state.owner.is_none() {
            if let Some(acceptor) = state.acceptor_stack.pop() {
                // Someone is parked in `_Accept` for this call; it gets
                // ownership first (spec.md §4.7: "the caller... hands
                // control to the acceptor"), and this caller queues up
                // normally behind it rather than taking the free monitor
                // for itself.
                state.owner = Some(Arc::clone(&acceptor.task));
                state.recursion = 1;
                acceptor.task.set_location(Location::None);
                self.apply_inheritance(&mut state, &acceptor.task, caller);
                caller.set_location(Location::EntryQueue { serial_id: self.id });
                caller.set_state(TaskState::Blocked);
                state.entry_queue.add(Arc::clone(caller));
                if let Some(op) = op {
                    state.waiting_ops.push((caller.id, op));
                }
                drop(state);
                drop(_spin);
                wake(&acceptor.task);
                self.suspend_caller();
                let state = self.state.lock().unwrap();
                return if state.destroyed && state.owner.as_ref().map(|o| o.id) != Some(caller.id) {
                    Err(MonitorError::EntryFailure)
                } else {
                    Ok(())
                };
            }
            state.owner = Some(Arc::clone(caller));
            state.recursion = 1;
            return Ok(());
        }

        let owner = state.owner.clone().unwrap();
        self.apply_inheritance(&mut state, &owner, caller);
        caller.set_location(Location::EntryQueue { serial_id: self.id });
        caller.set_state(TaskState::Blocked);
        state.entry_queue.add(Arc::clone(caller));
        if let Some(op) = op {
            state.waiting_ops.push((caller.id, op));
        }
        drop(state);
        drop(_spin);
        self.suspend_caller();
        // Resumed: either granted ownership by the exit protocol, or
        // the Serial was destroyed underneath us.
        let state = self.state.lock().unwrap();
        if state.destroyed && state.owner.as_ref().map(|o| o.id) != Some(caller.id) {
            Err(MonitorError::EntryFailure)
        } else {
            Ok(())
        }
    }

    /// Exit protocol, per spec.md §4.7 steps 1-4. Called after the member
    /// body, including after the body unwound via an exception.
    pub fn exit(self: &Arc<Self>) {
        let _spin = self.entry_lock.acquire();
        let mut state = self.state.lock().unwrap();
        if state.recursion == 0 {
            return;
        }
        state.recursion -= 1;
        if state.recursion > 0 {
            return;
        }

        let old_owner = state.owner.take();
        if let Some(owner) = &old_owner {
            owner.stop_inheriting(self.id);
        }

        let next = if let Some(acceptor) = state.acceptor_stack.pop() {
            Some(acceptor.task)
        } else {
            state.entry_queue.drop_head()
        };

        if let Some(new_owner) = next {
            state.owner = Some(Arc::clone(&new_owner));
            state.recursion = 1;
            new_owner.set_location(Location::None);
            state.waiting_ops.retain(|(id, _)| *id != new_owner.id);
            // Whoever is still queued behind the new owner must keep
            // boosting it, the same way a freshly blocking caller would in
            // `enter` — otherwise a caller that joined the queue while the
            // *previous* owner held the serial stops contributing the
            // moment ownership changes hands, even though it's still
            // waiting on this same serial.
            if let Some(still_waiting) = state.entry_queue.head() {
                self.apply_inheritance(&mut state, &new_owner, &still_waiting);
            }
            drop(state);
            drop(_spin);
            wake(&new_owner);
        }
    }

    /// Priority inheritance, per spec.md §4.8: propagate `caller`'s priority
    /// to `owner`'s PIQ. Transitive propagation (the owner is itself
    /// blocked on some other serial) falls out for free: `active_priority`
    /// recomputes from the PIQ on every read, so the next time the owner's
    /// own blocking `enter` call reaches this same function as *its*
    /// caller, it contributes its now-boosted priority onward. Repositioning
    /// a ready (not blocked) owner on its cluster's ready queue happens the
    /// next time the cluster reschedules it.
    fn apply_inheritance(&self, _state: &mut SerialState, owner: &TaskRef, caller: &TaskRef) {
        owner.inherit_from(self.id, caller.active_priority());
    }

    /// `wait(cond)`: park on `cond`, release the monitor, suspend.
    pub fn wait(self: &Arc<Self>, caller: &TaskRef, cond: &Condition, info: u64) {
        cond.push(caller.clone(), info);
        caller.set_location(Location::ConditionQueue { serial_id: self.id });
        caller.set_state(TaskState::Blocked);
        self.exit();
        self.suspend_caller();
    }

    /// `signal(cond)`: move `cond`'s head to the acceptor/signalled stack.
    /// The signaller keeps running; the signalled task is granted ownership
    /// by a later `exit`.
    pub fn signal(&self, cond: &Condition) {
        if let Some(task) = cond.pop() {
            let mut state = self.state.lock().unwrap();
            task.set_location(Location::None);
            state.acceptor_stack.push(Acceptor {
                task,
                mask: AcceptMask::default(),
            });
        }
    }

    /// `signalBlock(cond)`: the signaller yields the monitor immediately to
    /// the signalled task, and is itself parked on the acceptor/signalled
    /// stack to resume later.
    pub fn signal_block(self: &Arc<Self>, caller: &TaskRef, cond: &Condition) {
        let Some(signalled) = cond.pop() else { return };
        let mut state = self.state.lock().unwrap();
        signalled.set_location(Location::None);
        state.acceptor_stack.push(Acceptor {
            task: Arc::clone(caller),
            mask: AcceptMask::default(),
        });
        state.owner = Some(signalled.clone());
        state.recursion = 1;
        drop(state);
        wake(&signalled);
        self.suspend_caller();
    }

    /// `broadcast(cond)`: move every parked task onto the acceptor/signalled
    /// stack, in FIFO order (so the most recently broadcast waiter is on
    /// top and runs first, mirroring the LIFO stack spec.md names).
    pub fn broadcast(&self, cond: &Condition) {
        let mut state = self.state.lock().unwrap();
        for task in cond.drain() {
            task.set_location(Location::None);
            state.acceptor_stack.push(Acceptor {
                task,
                mask: AcceptMask::default(),
            });
        }
    }

    /// `_Accept(op1, op2, …) S`: park the caller on the acceptor/signalled
    /// stack with an accept mask, suspending until a matching call arrives
    /// (or, when `timeout`/`or_else` is given, until one of those fires
    /// first).
    pub fn accept(
        self: &Arc<Self>,
        caller: &TaskRef,
        ops: &[MemberOp],
        or_else: bool,
        timeout: Option<(Time, Arc<EventQueue>)>,
    ) -> Result<MemberOp, MonitorError> {
        let mask = AcceptMask::new(ops);
        {
            let state = self.state.lock().unwrap();
            if or_else && !Self::has_waiting_caller(&state, mask) {
                // `_Else`: fall through immediately without blocking.
                return Err(MonitorError::WaitingFailure);
            }
        }

        // Release the monitor before pushing our own acceptor entry: `exit`
        // prefers the acceptor/signalled stack over the entry queue, so
        // pushing first would hand ownership straight back to us and the
        // accept would never actually wait for anyone.
        self.exit_if_owner(caller);
        {
            let mut state = self.state.lock().unwrap();
            caller.set_location(Location::EntryQueue { serial_id: self.id });
            caller.set_state(TaskState::Blocked);
            state.acceptor_stack.push(Acceptor {
                task: Arc::clone(caller),
                mask,
            });
        }

        let timeout_node = timeout.map(|(at, queue)| {
            let serial = Arc::clone(self);
            let caller = Arc::clone(caller);
            let node = EventNode::new(at, Recur::Once, EventKind::Timeout, move |_| {
                serial.cancel_accept(&caller);
            });
            queue.add(Arc::clone(&node), false);
            node
        });

        self.suspend_caller();

        if let Some(node) = &timeout_node {
            if let Some(qn) = node_queue(node) {
                qn.remove(node);
            }
        }

        // If we were granted ownership, some matching call (or `signal`)
        // popped our entry off the acceptor stack; if `cancel_accept` pulled
        // it off instead (the `_Timeout` deadline), we're woken but never
        // made owner again.
        let granted = self
            .state
            .lock()
            .unwrap()
            .owner
            .as_ref()
            .map(|o| o.id == caller.id)
            .unwrap_or(false);
        if granted {
            // Whichever op matched is recorded by `exit` transferring
            // ownership back; callers needing the specific op id track it
            // via their own call dispatch (translator-equivalent layer), not
            // this runtime.
            Ok(ops.first().copied().unwrap_or(0))
        } else {
            Err(MonitorError::Timeout)
        }
    }

    /// Whether some caller already blocked in the entry queue supplied (via
    /// `enter_for`) a member op this mask accepts — the query `_Accept ...
    /// _Else` needs to decide whether to accept immediately or fall through.
    fn has_waiting_caller(state: &SerialState, mask: AcceptMask) -> bool {
        state.waiting_ops.iter().any(|(_, op)| mask.contains(*op))
    }

    fn exit_if_owner(self: &Arc<Self>, caller: &TaskRef) {
        let is_owner = self
            .state
            .lock()
            .unwrap()
            .owner
            .as_ref()
            .map(|o| o.id == caller.id)
            .unwrap_or(false);
        if is_owner {
            self.exit();
        }
    }

    fn cancel_accept(&self, caller: &TaskRef) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.acceptor_stack.iter().position(|a| a.task.id == caller.id) {
            state.acceptor_stack.remove(pos);
            drop(state);
            wake(caller);
        }
    }

    /// Suspend the calling task until some exit/signal/accept path grants
    /// it ownership again.
    fn suspend_caller(&self) {
        if let Some(p) = processor::current() {
            p.yield_current();
        }
    }

    /// Destruction failure semantics, per spec.md §4.7: entry-queue callers
    /// get `EntryFailure`, condition waiters get `WaitingFailure`, and any
    /// caller mid-rendezvous gets `RendezvousFailure`.
    pub fn destroy(self: &Arc<Self>) {
        let _spin = self.entry_lock.acquire();
        let mut state = self.state.lock().unwrap();
        state.destroyed = true;
        state.waiting_ops.clear();
        while let Some(task) = state.entry_queue.drop_head() {
            task.set_location(Location::None);
            drop(state);
            wake(&task);
            state = self.state.lock().unwrap();
        }
        for acceptor in state.acceptor_stack.drain(..) {
            acceptor.task.set_location(Location::None);
            wake(&acceptor.task);
        }
        if let Some(rendezvous) = state.rendezvous.take() {
            *rendezvous.failed.lock().unwrap() = true;
            rendezvous.condvar.notify_all();
        }
    }
}

/// Resume a blocked task by handing it back to its cluster's ready queue,
/// matching spec.md's §5 scheduling model: a woken task becomes Ready, not
/// immediately Running.
fn wake(task: &TaskRef) {
    task.set_state(TaskState::Ready);
    let cluster = task
        .cluster()
        .or_else(|| crate::Kernel::get().map(|k| Arc::clone(k.system_cluster())));
    if let Some(cluster) = cluster {
        cluster.ready_add(Arc::clone(task));
        if let Some(p) = cluster.processors().into_iter().find(|p| p.is_idle()) {
            p.poke();
        }
    }
}

fn node_queue(_node: &Arc<EventNode>) -> Option<Arc<EventQueue>> {
    crate::Kernel::get().map(|k| Arc::clone(k.event_queue()))
}

/// A condition variable associated with a `Serial`, per spec.md §3: a FIFO
/// queue of parked tasks, each carrying a user-supplied info word.
pub struct Condition {
    queue: Mutex<Vec<(TaskRef, u64)>>,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, task: TaskRef, info: u64) {
        self.queue.lock().unwrap().push((task, info));
    }

    fn pop(&self) -> Option<TaskRef> {
        let mut q = self.queue.lock().unwrap();
        if q.is_empty() {
            None
        } else {
            Some(q.remove(0).0)
        }
    }

    fn drain(&self) -> Vec<TaskRef> {
        self.queue.lock().unwrap().drain(..).map(|(t, _)| t).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use crate::task::Task;

    #[test]
    fn reentrant_entry_increments_recursion() {
        let serial = Serial::new(Some("m".into()));
        let task = Task::wrap_current(Some("t".into()), Priority(5));
        serial.enter(&task).unwrap();
        serial.enter(&task).unwrap();
        assert_eq!(serial.recursion(), 2);
        serial.exit();
        assert_eq!(serial.recursion(), 1);
        serial.exit();
        assert_eq!(serial.recursion(), 0);
        assert!(serial.owner().is_none());
    }

    #[test]
    fn condition_fifo_ordering() {
        let cond = Condition::new();
        let a = Task::wrap_current(Some("a".into()), Priority(0));
        let b = Task::wrap_current(Some("b".into()), Priority(0));
        cond.push(a.clone(), 1);
        cond.push(b.clone(), 2);
        assert_eq!(cond.pop().unwrap().id, a.id);
        assert_eq!(cond.pop().unwrap().id, b.id);
        assert!(cond.is_empty());
    }

    #[test]
    fn exit_reapplies_inheritance_for_a_stale_queue_position() {
        // The entry queue buckets by priority at insertion time and doesn't
        // reorder when a queued task is later boosted from elsewhere, so
        // the next owner `exit` grants isn't always the globally best
        // active priority left waiting. `exit` must still reapply
        // inheritance from whoever's left at the head, or that remaining
        // task's boost is lost the moment ownership changes hands.
        let serial = Serial::new(Some("m".into()));
        let low = Task::wrap_current(Some("low".into()), Priority(30));
        let candidate_a = Task::wrap_current(Some("a".into()), Priority(25));
        let candidate_b = Task::wrap_current(Some("b".into()), Priority(20));

        serial.enter(&low).unwrap();
        {
            let mut state = serial.state.lock().unwrap();
            serial.apply_inheritance(&mut state, &low, &candidate_a);
            state.entry_queue.add(candidate_a.clone());
            serial.apply_inheritance(&mut state, &low, &candidate_b);
            state.entry_queue.add(candidate_b.clone());
        }

        // `candidate_a` gets boosted from some unrelated serial, well past
        // `candidate_b`'s priority, after it already queued on this one.
        candidate_a.inherit_from(9999, Priority(5));
        assert_eq!(candidate_a.active_priority(), Priority(5));

        // `low` releases: the entry queue's stale bucket still hands
        // ownership to `candidate_b` (queued at a better raw priority than
        // `candidate_a`), even though `candidate_a` is now the more urgent
        // task.
        serial.exit();
        assert_eq!(serial.owner().map(|o| o.id), Some(candidate_b.id));

        // `candidate_a` is still queued behind the new owner; `exit` must
        // have reapplied its (boosted) priority onto `candidate_b`.
        assert_eq!(candidate_b.active_priority(), Priority(5));
    }

    #[test]
    fn destroy_fails_entry_queue_waiters() {
        let serial = Serial::new(Some("m".into()));
        let owner = Task::wrap_current(Some("owner".into()), Priority(5));
        serial.enter(&owner).unwrap();
        // Can't easily block a second real task without the full runtime
        // wired up; exercise the destroy path directly on an empty queue.
        serial.destroy();
        assert!(serial.enter(&owner).is_err());
    }
}
