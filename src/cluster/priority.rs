//! Priority ready-queue plugin: a 32-level bitmap of non-empty levels plus
//! one FIFO bucket per level, per spec.md §4.5 ("priority (bitmask of 32
//! levels, `ffs` for head)").
//!
//! Grounded on [`crate::utils::prio_bitmap`], itself grounded on
//! `r3_kernel::utils::prio_bitmap`.

use std::collections::VecDeque;

use crate::priority::Priority;
use crate::utils::prio_bitmap::{PrioBitmap32, PRIO_LEVELS};

use super::{Scheduler, TaskRef};

/// Map a task's active priority onto one of the 32 bitmap levels. Priorities
/// outside `[0, PRIO_LEVELS)` clamp to the nearest end, so a pathological
/// caller degrades to "lowest/highest bucket" rather than panicking.
fn level_for(priority: Priority) -> usize {
    priority.0.clamp(0, PRIO_LEVELS as i32 - 1) as usize
}

pub struct PriorityScheduler {
    bitmap: PrioBitmap32,
    buckets: Vec<VecDeque<TaskRef>>,
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self {
            bitmap: PrioBitmap32::new(),
            buckets: (0..PRIO_LEVELS).map(|_| VecDeque::new()).collect(),
        }
    }
}

impl Scheduler for PriorityScheduler {
    fn empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    fn head(&self) -> Option<TaskRef> {
        let level = self.bitmap.find_set()?;
        self.buckets[level].front().cloned()
    }

    fn add(&mut self, task: TaskRef) {
        let level = level_for(task.active_priority());
        self.buckets[level].push_back(task);
        self.bitmap.set(level);
    }

    fn drop_head(&mut self) -> Option<TaskRef> {
        let level = self.bitmap.find_set()?;
        let task = self.buckets[level].pop_front();
        if self.buckets[level].is_empty() {
            self.bitmap.clear(level);
        }
        task
    }

    fn remove(&mut self, task: &TaskRef) -> bool {
        let level = level_for(task.active_priority());
        if let Some(pos) = self.buckets[level].iter().position(|t| t.id == task.id) {
            self.buckets[level].remove(pos);
            if self.buckets[level].is_empty() {
                self.bitmap.clear(level);
            }
            return true;
        }
        // The task's priority may have changed since it was enqueued; fall
        // back to a full scan rather than miss the removal.
        for (level, bucket) in self.buckets.iter_mut().enumerate() {
            if let Some(pos) = bucket.iter().position(|t| t.id == task.id) {
                bucket.remove(pos);
                if bucket.is_empty() {
                    self.bitmap.clear(level);
                }
                return true;
            }
        }
        false
    }

    fn check_priority(&self, owner: &TaskRef, caller: &TaskRef) -> bool {
        // `Priority`'s `Ord` is inverted, so "caller is better than owner"
        // is `caller > owner`, not `<`.
        caller.active_priority() > owner.active_priority()
    }
}
