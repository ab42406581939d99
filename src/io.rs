//! Async I/O and signal handling, per spec.md §4.9.
//!
//! Grounded on `r3_port_std::threading_unix`, which installs the same class
//! of POSIX signal handlers (`sigaction` with `SA_SIGINFO`/`SA_ONSTACK`) for
//! a hosted port running on real kernel threads. Descriptor readiness is
//! polled with `libc::poll` rather than `select`, since `poll` doesn't need
//! an `FD_SETSIZE`-bounded bitmask and both appear as equally idiomatic
//! choices across the example pack.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::cluster::TaskRef;
use crate::event::{EventKind, EventQueue};
use crate::processor::{self, Processor};
use crate::time::Time;

/// Whether a descriptor is always switched to non-blocking (pipes, sockets)
/// or left blocking until an `EAGAIN` is actually observed (ttys), per
/// spec.md §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDiscipline {
    AlwaysPoll,
    OnDemand,
}

struct Registration {
    events: libc::c_short,
    waiter: TaskRef,
}

struct IoReactorInner {
    discipline: Mutex<HashMap<RawFd, PollDiscipline>>,
    registrations: Mutex<HashMap<RawFd, Registration>>,
}

/// The system processor's readiness-poll loop state, per spec.md's "a
/// dedicated system processor runs the event handler and the I/O poll
/// loop."
pub struct IoReactor {
    inner: Arc<IoReactorInner>,
}

impl Default for IoReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl IoReactor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(IoReactorInner {
                discipline: Mutex::new(HashMap::new()),
                registrations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn set_discipline(&self, fd: RawFd, discipline: PollDiscipline) {
        if let PollDiscipline::AlwaysPoll = discipline {
            set_nonblocking(fd);
        }
        self.inner.discipline.lock().unwrap().insert(fd, discipline);
    }

    /// Register interest in `fd` becoming ready for `events`
    /// (`libc::POLLIN`/`POLLOUT`), parking `waiter` until it is. Called only
    /// after an on-demand descriptor's direct syscall attempt returned
    /// `EAGAIN`, per spec.md §4.9.
    pub fn register(&self, fd: RawFd, events: libc::c_short, waiter: TaskRef) {
        set_nonblocking(fd);
        self.inner
            .registrations
            .lock()
            .unwrap()
            .insert(fd, Registration { events, waiter });
        if let Some(p) = processor::current() {
            p.yield_current();
        }
    }

    /// One pass of the poll loop: block (bounded by `timeout_ms`) until any
    /// registered descriptor is ready, then wake its waiter.
    fn poll_once(&self, timeout_ms: i32) {
        let regs: Vec<(RawFd, libc::c_short)> = {
            let registrations = self.inner.registrations.lock().unwrap();
            registrations.iter().map(|(fd, r)| (*fd, r.events)).collect()
        };
        if regs.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms.max(0) as u64));
            return;
        }

        let mut pollfds: Vec<libc::pollfd> = regs
            .iter()
            .map(|(fd, events)| libc::pollfd {
                fd: *fd,
                events: *events,
                revents: 0,
            })
            .collect();

        // Safety: `pollfds` is a valid array of the length passed, and
        // `poll` only reads/writes within it.
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc <= 0 {
            return;
        }

        let mut registrations = self.inner.registrations.lock().unwrap();
        for pfd in pollfds {
            if pfd.revents != 0 {
                if let Some(reg) = registrations.remove(&pfd.fd) {
                    wake_task(reg.waiter);
                }
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) {
    // Safety: `fd` is caller-supplied and assumed open; `fcntl` with
    // `F_GETFL`/`F_SETFL` is safe to call on any valid descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

fn wake_task(task: TaskRef) {
    task.set_state(crate::task::TaskState::Ready);
    let cluster = task
        .cluster()
        .or_else(|| crate::Kernel::get().map(|k| Arc::clone(k.system_cluster())));
    if let Some(cluster) = cluster {
        cluster.ready_add(task);
    }
}

static TERMINATION_HANDLED: AtomicBool = AtomicBool::new(false);
static SIGNAL_STACK: OnceLock<()> = OnceLock::new();

/// Install the signal set spec.md §4.9 names: `SIGALRM`/`SIGUSR1` for
/// preemption, `SIGSEGV`/`SIGBUS`/`SIGILL`/`SIGFPE` for catastrophic
/// aborts, and a one-shot handler for `SIGTERM`/`SIGINT`/`SIGHUP`/
/// `SIGQUIT`/`SIGABRT`. Idempotent; safe to call once per process.
pub fn install_signal_handlers() {
    SIGNAL_STACK.get_or_init(|| {
        install_alt_stack();
        install_handler(libc::SIGALRM, preempt_signal as usize, true);
        install_handler(libc::SIGUSR1, preempt_signal as usize, true);
        for sig in [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE] {
            install_handler(sig, catastrophic_signal as usize, true);
        }
        for sig in [
            libc::SIGTERM,
            libc::SIGINT,
            libc::SIGHUP,
            libc::SIGQUIT,
            libc::SIGABRT,
        ] {
            install_handler(sig, termination_signal as usize, true);
        }
    });
}

fn install_alt_stack() {
    const ALT_STACK_SIZE: usize = 64 * 1024;
    let stack = vec![0u8; ALT_STACK_SIZE].leak();
    let ss = libc::stack_t {
        ss_sp: stack.as_mut_ptr().cast(),
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    // Safety: `ss` describes a valid, leaked (process-lifetime) buffer.
    unsafe {
        libc::sigaltstack(&ss, std::ptr::null_mut());
    }
}

fn install_handler(signum: libc::c_int, handler: usize, on_alt_stack: bool) {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_SIGINFO | if on_alt_stack { libc::SA_ONSTACK } else { 0 };
    // Safety: `action` is fully initialized above; `sigemptyset` only
    // touches `action.sa_mask`.
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, std::ptr::null_mut());
    }
}

extern "C" fn preempt_signal(_sig: libc::c_int) {
    processor::note_preempt_signal();
}

extern "C" fn catastrophic_signal(sig: libc::c_int) {
    // Async-signal-safety: avoid the logging/formatting machinery used
    // elsewhere in the crate and write directly, matching
    // `original_source`'s own minimal-handler posture for fatal signals.
    let msg = b"uxk: fatal signal, terminating\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
    }
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

extern "C" fn termination_signal(sig: libc::c_int) {
    if !TERMINATION_HANDLED.swap(true, Ordering::SeqCst) {
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
        return;
    }
    unsafe {
        libc::raise(sig);
    }
}

/// The system processor's loop: on every iteration, run one ready task (if
/// any), then service the event queue's timer and the I/O reactor, per
/// spec.md's "a dedicated system processor runs the event handler and the
/// I/O poll loop" — interleaved with, rather than preempted permanently by,
/// that processor's share of ordinary scheduling. A task becoming ready must
/// never stop timers and I/O readiness from being serviced for the rest of
/// the process.
pub fn run_system_loop(processor: &Arc<Processor>) {
    install_signal_handlers();
    let reactor = IoReactor::new();
    loop {
        if processor.shutdown_requested() {
            return;
        }
        let Some(cluster) = processor.cluster() else { return };
        let queue: Arc<EventQueue> = Arc::clone(cluster.event_queue());

        if let Some(task) = cluster.ready_drop_head() {
            processor.run_one(task);
        }

        let now = Time::now();
        let due = queue.roll_forward_pending() || queue.next_deadline().map(|d| d <= now).unwrap_or(false);
        if due {
            queue.pop_all(now);
        }
        // Don't block in `poll` while there's scheduling work waiting —
        // only wait out the full interval when the cluster is otherwise
        // idle, matching `Processor::idle_spin_then_park`'s same tradeoff.
        reactor.poll_once(if cluster.ready_empty() { 1 } else { 0 });
    }
}

/// Fire the context-switch/preemption tick for `kind`, invoked from the
/// event queue handler for a `ProcessorTick` node, per spec.md §4.4: the
/// handler, on finding a context-switch event for a processor, causes that
/// processor to yield.
pub fn deliver_tick(kind: EventKind) {
    if let EventKind::ProcessorTick(_processor_id) = kind {
        processor::checkpoint();
    }
}
