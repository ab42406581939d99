//! Machine context: coroutine stacks and the resume/suspend switch
//! primitive, per spec.md §4.2.
//!
//! A from-scratch per-architecture assembly `switch` (as uC++ itself
//! implements) can't be validated without running the toolchain, and
//! `r3_port_std::ums` doesn't do that either: it backs each schedulable
//! execution context with a real `std::thread` and implements `switch` as a
//! `park`/`unpark` handoff, coordinated by whichever
//! thread currently holds scheduling control. `uxk` generalizes that
//! approach: a [`Coroutine`] owns one OS thread (parked until first resumed,
//! and again whenever inactive); [`resume`] plays the role of uC++'s
//! `uCoroutine::resume`. The OS thread's own stack guard page stands in for
//! spec.md's "sentinel page for overflow detection" (see [`crate::io`] for
//! the `SIGSEGV`-on-alt-stack handler that turns a guard-page fault into the
//! documented diagnostic).

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

/// Lifecycle state of a [`Coroutine`], per spec.md §3's Coroutine attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    Start,
    Active,
    Inactive,
    Halt,
}

/// A panic payload captured when a coroutine's `main` unwinds without being
/// caught, rethrown in the resumer the next time control returns to it
/// (spec.md §4.6's "Coroutine resume/suspend invariants", and §8 scenario 6).
pub struct UnhandledException {
    payload: Box<dyn Any + Send + 'static>,
    /// Set when this exception itself propagated out of a second coroutine
    /// that ignored it, per spec.md §7's "chained if it propagates further".
    pub chain_depth: u32,
}

impl std::fmt::Debug for UnhandledException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnhandledException")
            .field("chain_depth", &self.chain_depth)
            .finish_non_exhaustive()
    }
}

impl UnhandledException {
    /// Rethrow the original exception on the current stack, matching
    /// spec.md §8 scenario 6's `triggerCause()`.
    pub fn trigger_cause(self) -> ! {
        panic::resume_unwind(self.payload)
    }

    /// Wrap this exception as having propagated through one more coroutine
    /// that declined to handle it.
    pub fn chain(self) -> Self {
        Self {
            payload: self.payload,
            chain_depth: self.chain_depth + 1,
        }
    }
}

/// Sentinel panic payload used by [`crate::task::Task::cancel`] to unwind a
/// task's stack without being mistaken for a user exception; caught only by
/// the task's own trampoline (Design Notes §9: "model as a typed unwind").
pub struct CancelUnwind;

static NEXT_COROUTINE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity for a [`Coroutine`], stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(pub u64);

impl CoroutineId {
    fn next() -> Self {
        Self(NEXT_COROUTINE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Maps a coroutine's id back to its backing `std::thread::Thread`, so code
/// that only has a `CoroutineId` (as the halt path below does — it captures
/// `last_resumer` by id, not by a borrowed `Coroutine`) can still unpark it.
static THREAD_REGISTRY: OnceLock<Mutex<HashMap<CoroutineId, thread::Thread>>> = OnceLock::new();

fn thread_registry() -> &'static Mutex<HashMap<CoroutineId, thread::Thread>> {
    THREAD_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn register_thread(id: CoroutineId, thread: thread::Thread) {
    thread_registry().lock().unwrap().insert(id, thread);
}

fn unpark_by_id(id: CoroutineId) {
    if let Some(thread) = thread_registry().lock().unwrap().get(&id) {
        thread.unpark();
    }
}

struct Shared {
    state: Mutex<CoroutineState>,
    starter: Mutex<Option<CoroutineId>>,
    last_resumer: Mutex<Option<CoroutineId>>,
    pending_exception: Mutex<Option<UnhandledException>>,
    name: Option<String>,
    std_thread: Mutex<Option<thread::Thread>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

/// A stackful execution context: the low-level unit [`crate::task::Task`]
/// and [`crate::processor::Processor`]'s scheduler coroutine are both built
/// from.
#[derive(Clone)]
pub struct Coroutine {
    id: CoroutineId,
    shared: Arc<Shared>,
}

impl Coroutine {
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    pub fn state(&self) -> CoroutineState {
        *self.shared.state.lock().unwrap()
    }

    fn set_state(&self, state: CoroutineState) {
        *self.shared.state.lock().unwrap() = state;
    }

    pub fn starter(&self) -> Option<CoroutineId> {
        *self.shared.starter.lock().unwrap()
    }

    pub fn last_resumer(&self) -> Option<CoroutineId> {
        *self.shared.last_resumer.lock().unwrap()
    }

    /// Allocate a stack and prime it so the first [`resume`] enters `entry`,
    /// per spec.md's `allocate`/`start` contract. `stack_size` maps directly
    /// to `std::thread::Builder::stack_size`, which (per spec.md §4.2's
    /// Failures clause) already places a guard page below the low end of
    /// the stack on every platform this crate targets.
    pub fn start(
        name: Option<String>,
        stack_size: usize,
        entry: impl FnOnce() + Send + 'static,
    ) -> Self {
        let id = CoroutineId::next();
        let shared = Arc::new(Shared {
            state: Mutex::new(CoroutineState::Start),
            starter: Mutex::new(None),
            last_resumer: Mutex::new(None),
            pending_exception: Mutex::new(None),
            name: name.clone(),
            std_thread: Mutex::new(None),
            handle: Mutex::new(None),
        });

        let shared2 = Arc::clone(&shared);
        let mut builder = thread::Builder::new();
        if let Some(n) = &name {
            builder = builder.name(n.clone());
        }
        builder = builder.stack_size(stack_size);

        let handle = builder
            .spawn(move || {
                // Block until the first `resume` unparks us.
                thread::park();
                let result = panic::catch_unwind(AssertUnwindSafe(entry));
                if let Err(payload) = result {
                    *shared2.pending_exception.lock().unwrap() = Some(UnhandledException {
                        payload,
                        chain_depth: 0,
                    });
                }
                *shared2.state.lock().unwrap() = CoroutineState::Halt;
                // `main` returned (or unwound): resume `lastResumer`, per
                // spec.md §4.6. The resumer is parked in `resume`'s
                // `thread::park()` waiting for exactly this wakeup.
                if let Some(resumer) = *shared2.last_resumer.lock().unwrap() {
                    unpark_by_id(resumer);
                }
            })
            .expect("failed to spawn coroutine thread");

        register_thread(id, handle.thread().clone());
        *shared.std_thread.lock().unwrap() = Some(handle.thread().clone());
        *shared.handle.lock().unwrap() = Some(handle);

        Self { id, shared }
    }

    /// Build a `Coroutine` wrapping the *current* OS thread rather than
    /// spawning a new one — used for the initial/main task and for a
    /// processor's scheduler coroutine when it is the process's bootstrap
    /// thread (Design Notes §9: "initialize before `main` runs on the
    /// initial kernel thread").
    pub fn wrap_current(name: Option<String>) -> Self {
        let id = CoroutineId::next();
        register_thread(id, thread::current());
        let shared = Arc::new(Shared {
            state: Mutex::new(CoroutineState::Active),
            starter: Mutex::new(None),
            last_resumer: Mutex::new(None),
            pending_exception: Mutex::new(None),
            name,
            std_thread: Mutex::new(Some(thread::current())),
            handle: Mutex::new(None),
        });
        Self { id, shared }
    }
}

/// Switch execution from `from` to `target`: publishes `from` as `target`'s
/// resumer, marks `from` Inactive and `target` Active, then unparks
/// `target`'s thread and parks `from`'s. Returns once control comes back to
/// `from` (because `target` suspended, blocked, or halted).
///
/// Per spec.md §3's Coroutine invariant, the Active→Inactive transition must
/// publish its parked state before the stack could be reclaimed; here that
/// publication is simply the OS thread parking itself, which is already
/// atomic with respect to any other thread's `unpark`.
pub fn resume(from: &Coroutine, target: &Coroutine) -> Result<(), UnhandledException> {
    *target.shared.last_resumer.lock().unwrap() = Some(from.id);
    if target.starter().is_none() {
        *target.shared.starter.lock().unwrap() = Some(from.id);
    }
    target.set_state(CoroutineState::Active);
    from.set_state(CoroutineState::Inactive);

    let target_thread = target
        .shared
        .std_thread
        .lock()
        .unwrap()
        .clone()
        .expect("target coroutine has no backing thread");
    target_thread.unpark();
    thread::park();

    if target.state() == CoroutineState::Halt {
        if let Some(exc) = target.shared.pending_exception.lock().unwrap().take() {
            return Err(exc);
        }
    }
    Ok(())
}

/// Suspend the currently running coroutine, returning control to whichever
/// coroutine is parked waiting to resume it (the standard "yield back to
/// caller" used when a coroutine's `main` blocks without halting).
pub fn suspend_to(current: &Coroutine, resumer: &Coroutine) {
    current.set_state(CoroutineState::Inactive);
    resumer.set_state(CoroutineState::Active);
    let resumer_thread = resumer
        .shared
        .std_thread
        .lock()
        .unwrap()
        .clone()
        .expect("resumer coroutine has no backing thread");
    resumer_thread.unpark();
    thread::park();
    current.set_state(CoroutineState::Active);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn resume_runs_entry_and_halts() {
        let main = Coroutine::wrap_current(Some("main".into()));
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let co = Coroutine::start(Some("worker".into()), 256 * 1024, move || {
            ran2.store(true, Ordering::SeqCst);
        });
        resume(&main, &co).unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(co.state(), CoroutineState::Halt);
        assert_eq!(co.last_resumer(), Some(main.id()));
    }

    #[test]
    fn panic_in_entry_becomes_unhandled_exception() {
        let main = Coroutine::wrap_current(Some("main".into()));
        let co = Coroutine::start(Some("worker".into()), 256 * 1024, move || {
            panic!("boom");
        });
        let err = resume(&main, &co).unwrap_err();
        let payload = err.payload;
        let msg = payload.downcast_ref::<&str>().copied().unwrap_or("");
        assert_eq!(msg, "boom");
    }
}
