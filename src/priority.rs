//! Priority values and the per-task priority-inheritance queue (PIQ), per
//! spec.md §4.8.
//!
//! Grounded on `original_source/uCPP/source/src/scheduler/uPIHeap.cc`
//! (a small heap of inherited priorities per task) and
//! `r3_kernel::utils::binary_heap`. The PIQ here uses a linear-scan `Vec`
//! rather than a heap: the number of monitors simultaneously held by one
//! task is small in practice (bounded by nesting depth), so the asymptotic
//! win of a heap isn't worth the extra bookkeeping — noted as a deliberate
//! simplification in `DESIGN.md`, not a silent behavior change.

use std::cmp::Ordering;

use crate::task::TaskId;

/// A total-ordered scheduling priority. Lower numeric value means higher
/// priority, matching `r3_kernel`'s and the original uC++ convention (and
/// `ffs`-style bitmaps, where bit 0 is scanned first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Priority used for non-real-time tasks under the deadline-monotonic
    /// plugin, which places all non-real-time tasks above (i.e. numerically
    /// below) all real-time tasks, per spec.md §4.8.
    pub const NON_REALTIME_DEFAULT: Priority = Priority(0);
    /// Sentinel used to seed "lowest priority seen so far" folds.
    pub const MIN: Priority = Priority(i32::MAX);
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower numeric value sorts as "greater" priority, i.e. earlier.
        other.0.cmp(&self.0).then(Ordering::Equal)
    }
}

/// One entry in a task's priority-inheritance queue: the identity of the
/// mutex (serial) contributing it, and the highest active priority among
/// tasks waiting on that mutex.
#[derive(Debug, Clone, Copy)]
struct PiqEntry {
    serial_id: u64,
    priority: Priority,
}

/// Per-task multiset of priorities inherited from mutexes the task holds,
/// per spec.md's glossary entry for PIQ. A task's active priority is the
/// better (numerically lower) of its base priority and the PIQ's best
/// entry.
#[derive(Debug, Clone, Default)]
pub struct PiQueue {
    entries: Vec<PiqEntry>,
}

impl PiQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert or replace this serial's contribution.
    pub fn upsert(&mut self, serial_id: u64, priority: Priority) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.serial_id == serial_id) {
            e.priority = priority;
        } else {
            self.entries.push(PiqEntry {
                serial_id,
                priority,
            });
        }
    }

    /// Remove this serial's contribution, e.g. on release.
    pub fn remove(&mut self, serial_id: u64) {
        self.entries.retain(|e| e.serial_id != serial_id);
    }

    /// The best (numerically lowest) priority contributed by any held
    /// mutex, or `None` if the task holds none. `Priority`'s `Ord` is
    /// inverted (lower number sorts greater, matching "lower number is
    /// higher priority"), so the best priority is the `Ord`-maximum, not
    /// the minimum.
    pub fn best(&self) -> Option<Priority> {
        self.entries.iter().map(|e| e.priority).max()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compute a task's active priority from its base priority and its PIQ,
/// per spec.md §4.8: the better of the task's base priority and the PIQ's
/// best contribution. `Priority`'s `Ord` is inverted (lower number sorts
/// greater), so "the better of the two" is the `Ord`-maximum, which is the
/// numerically lower of the two raw values.
pub fn active_priority(base: Priority, piq: &PiQueue) -> Priority {
    match piq.best() {
        Some(inherited) => std::cmp::max(base, inherited),
        None => base,
    }
}

/// A blocked-on edge used by the iterative (non-recursive) transitive
/// propagation walk described in Design Notes §9.
#[derive(Debug, Clone, Copy)]
pub struct BlockedOn {
    pub task: TaskId,
    pub serial_id: u64,
}
