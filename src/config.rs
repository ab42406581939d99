//! Runtime configuration, per spec.md §6's external interface surface.
//!
//! uC++ exposes these as command-line switches and `u*` environment
//! variables read once at program startup (`uDefaultPreemption`,
//! `uDefaultSpin`, `uDefaultStackSize`, `uMainStackSize`,
//! `uDefaultProcessors`, `uDefaultBlockingIOProcessors`). `uxk` keeps the
//! same knobs but reads them from `UXK_*` environment variables, following
//! `r3_test_runner`'s pattern of a plain config struct
//! populated from `std::env` rather than a CLI-parsing crate, since nothing
//! here needs subcommands or positional arguments.

use std::env;
use std::time::Duration as StdDuration;

/// Kernel-wide configuration, fixed for the lifetime of one [`crate::Kernel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Preemption tick period; `None` disables preemption entirely.
    pub preemption: Option<StdDuration>,
    /// Spin iterations an [`crate::lock::AdaptiveLock`] attempts before
    /// parking.
    pub default_spin: usize,
    /// Stack size for task coroutines started without an explicit override.
    pub default_stack_size: usize,
    /// Stack size reserved for the program's initial task.
    pub main_stack_size: usize,
    /// Number of processors in the system cluster at startup.
    pub default_processors: usize,
    /// Number of processors dedicated to blocking I/O tasks, per spec.md
    /// §4.9's "processors that may block in the kernel for I/O are exempt
    /// from the non-blocking I/O substitution".
    pub default_blocking_io_processors: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            preemption: Some(StdDuration::from_millis(10)),
            default_spin: 100,
            default_stack_size: 256 * 1024,
            main_stack_size: 1024 * 1024,
            default_processors: 1,
            default_blocking_io_processors: 1,
        }
    }
}

impl RuntimeConfig {
    /// Overlay environment variables on top of [`RuntimeConfig::default`].
    /// Unset or unparsable variables are left at their default value; a
    /// malformed but present value is logged and ignored rather than
    /// aborting startup, matching spec.md §7's "malformed configuration is
    /// a recoverable condition, not a programming error".
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_usize("UXK_PROCESSORS") {
            cfg.default_processors = v.max(1);
        }
        if let Some(v) = env_usize("UXK_BLOCKING_IO_PROCESSORS") {
            cfg.default_blocking_io_processors = v;
        }
        if let Some(v) = env_usize("UXK_SPIN") {
            cfg.default_spin = v;
        }
        if let Some(v) = env_usize("UXK_STACK_SIZE") {
            cfg.default_stack_size = v;
        }
        if let Some(v) = env_usize("UXK_MAIN_STACK_SIZE") {
            cfg.main_stack_size = v;
        }
        match env::var("UXK_PREEMPTION_MS") {
            Ok(raw) => match raw.parse::<u64>() {
                Ok(0) => cfg.preemption = None,
                Ok(ms) => cfg.preemption = Some(StdDuration::from_millis(ms)),
                Err(_) => log::warn!("UXK_PREEMPTION_MS={raw:?} is not a valid integer, ignoring"),
            },
            Err(env::VarError::NotPresent) => {}
            Err(env::VarError::NotUnicode(_)) => {
                log::warn!("UXK_PREEMPTION_MS is not valid unicode, ignoring");
            }
        }

        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    match env::var(key) {
        Ok(raw) => match raw.parse::<usize>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("{key}={raw:?} is not a valid non-negative integer, ignoring");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_uc_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.preemption, Some(StdDuration::from_millis(10)));
        assert_eq!(cfg.default_stack_size, 256 * 1024);
        assert_eq!(cfg.main_stack_size, 1024 * 1024);
        assert_eq!(cfg.default_processors, 1);
        assert_eq!(cfg.default_blocking_io_processors, 1);
    }
}
