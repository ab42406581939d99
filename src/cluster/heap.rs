//! Generic heap-ordered ready-queue plugin, per spec.md §4.5: orders tasks
//! by an arbitrary caller-supplied key rather than a built-in notion of
//! priority or deadline, for clusters whose scheduling policy doesn't fit
//! either of the other stock plugins.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::binary_heap::{BinaryHeap, HeapCtx};

use super::{Scheduler, TaskRef};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

struct Entry<K> {
    task: TaskRef,
    key: K,
    seq: u64,
}

struct ByKey<'a, F> {
    key_of: &'a F,
}

impl<K: Ord, F: Fn(&TaskRef) -> K> HeapCtx<Entry<K>> for ByKey<'_, F> {
    fn lt(&mut self, x: &Entry<K>, y: &Entry<K>) -> bool {
        (&x.key, x.seq) < (&y.key, y.seq)
    }
}

/// A heap-ordered scheduler parameterised by a key function `K: Ord`
/// extracted from each task, with arrival order breaking ties, per spec.md's
/// "implementers must provide a stable tie-break for equal priorities."
pub struct HeapScheduler<K, F> {
    heap: BinaryHeap<Entry<K>>,
    key_of: F,
}

impl<K, F> HeapScheduler<K, F>
where
    K: Ord,
    F: Fn(&TaskRef) -> K,
{
    pub fn new(key_of: F) -> Self {
        Self {
            heap: BinaryHeap::new(),
            key_of,
        }
    }
}

impl<K, F> Scheduler for HeapScheduler<K, F>
where
    K: Ord + Send,
    F: Fn(&TaskRef) -> K + Send,
{
    fn empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn head(&self) -> Option<TaskRef> {
        self.heap.peek().map(|e| e.task.clone())
    }

    fn add(&mut self, task: TaskRef) {
        let key = (self.key_of)(&task);
        self.heap.push(
            Entry {
                task,
                key,
                seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            },
            ByKey { key_of: &self.key_of },
        );
    }

    fn drop_head(&mut self) -> Option<TaskRef> {
        self.heap.pop(ByKey { key_of: &self.key_of }).map(|e| e.task)
    }

    fn remove(&mut self, task: &TaskRef) -> bool {
        if let Some(idx) = self.heap.position(|e| e.task.id == task.id) {
            self.heap.remove(idx, ByKey { key_of: &self.key_of });
            true
        } else {
            false
        }
    }
}
