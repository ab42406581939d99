//! `uxk` — a uC++-style concurrency runtime.
//!
//! User-level tasks and stackful semi-coroutines are multiplexed over a
//! small number of kernel threads ("processors"), grouped into clusters that
//! share a pluggable scheduler. Mutual exclusion is provided by monitor
//! objects ("serials") supporting nested entry, internal scheduling
//! (condition variables) and external scheduling (`_Accept`-style
//! rendezvous) with automatic priority inheritance.
//!
//! See `SPEC_FULL.md` in the repository root for the full design.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod io;
pub mod lock;
pub mod priority;
pub mod processor;
pub mod serial;
pub mod task;
pub mod time;
pub mod utils;

pub mod cluster;

pub use cluster::Cluster;
pub use config::RuntimeConfig;
pub use error::{KernelError, MonitorError};
pub use priority::Priority;
pub use processor::Processor;
pub use serial::{Condition, Serial};
pub use task::{Task, TaskId};
pub use time::{Duration, Time};

use std::sync::OnceLock;

/// Process-wide kernel state: the system cluster, the system processor, and
/// the global event queue. Mirrors `r3_kernel`'s "kernel module" notion of a
/// single process-wide singleton initialized before `main` and torn down
/// after it returns (Design Notes §9).
pub struct Kernel {
    system_cluster: std::sync::Arc<Cluster>,
    event_queue: std::sync::Arc<event::EventQueue>,
}

static KERNEL: OnceLock<Kernel> = OnceLock::new();

impl Kernel {
    /// Start the runtime with the given configuration. Idempotent: the first
    /// caller wins, matching `r3_kernel`'s "initialize before `main` runs on
    /// the initial kernel thread" contract, but exposed as an explicit call
    /// since `uxk` has no build-time code generation step to hook into.
    pub fn start(cfg: RuntimeConfig) -> &'static Kernel {
        KERNEL.get_or_init(|| {
            let _ = env_logger_init();
            let event_queue = std::sync::Arc::new(event::EventQueue::new());
            let system_cluster = Cluster::new_system(cfg, std::sync::Arc::clone(&event_queue));
            log::info!("uxk kernel started");
            Kernel {
                system_cluster,
                event_queue,
            }
        })
    }

    /// Access the already-started kernel singleton.
    pub fn get() -> Option<&'static Kernel> {
        KERNEL.get()
    }

    pub fn system_cluster(&self) -> &std::sync::Arc<Cluster> {
        &self.system_cluster
    }

    pub fn event_queue(&self) -> &std::sync::Arc<event::EventQueue> {
        &self.event_queue
    }
}

// `env_logger` is a dev/test convenience, not a hard dependency of the
// kernel; initialization failures (e.g. already initialized by the host
// application) are not fatal.
fn env_logger_init() -> Result<(), log::SetLoggerError> {
    #[cfg(test)]
    {
        let _ = env_logger::builder().is_test(true).try_init();
    }
    Ok(())
}
