//! FIFO ready-queue plugin, the simplest of spec.md §4.5's stock schedulers.

use std::collections::VecDeque;

use super::{Scheduler, TaskRef};

#[derive(Default)]
pub struct FifoScheduler {
    queue: VecDeque<TaskRef>,
}

impl FifoScheduler {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl Scheduler for FifoScheduler {
    fn empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn head(&self) -> Option<TaskRef> {
        self.queue.front().cloned()
    }

    fn add(&mut self, task: TaskRef) {
        self.queue.push_back(task);
    }

    fn drop_head(&mut self) -> Option<TaskRef> {
        self.queue.pop_front()
    }

    fn remove(&mut self, task: &TaskRef) -> bool {
        if let Some(pos) = self.queue.iter().position(|t| t.id == task.id) {
            self.queue.remove(pos);
            true
        } else {
            false
        }
    }
}
