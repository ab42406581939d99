//! Time and the process-wide timed event queue, per spec.md §4.1.
//!
//! Grounded on `r3_kernel`'s timeout/event-heap handling (`r3_kernel`'s
//! kernel owns a single sorted structure of pending timeouts driven by one
//! hardware timer) combined with `r3_port_std::ums`'s approach to arming a
//! wakeup: rather than an intrusive list embedded in callers' stack frames
//! (uC++'s own zero-allocation trick, unavailable without raw stack access),
//! `uxk` keeps nodes in a [`crate::utils::binary_heap::BinaryHeap`] ordered
//! by instant, each wrapped in an `Arc` so a node can be removed by identity
//! before it fires.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};

use crate::time::{Duration, Time};
use crate::utils::binary_heap::{BinaryHeap, HeapCtx};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity for an [`EventNode`], stable across re-insertion (periodic
/// nodes keep the same id on every period).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventNodeId(pub u64);

/// What happens to a node once its handler has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recur {
    /// The node is dropped from the queue.
    Once,
    /// The node is reinserted at `fire_instant + period`.
    Periodic(Duration),
}

/// Why a handler ran: natural expiry, or a context-switch tick directed at a
/// specific processor (deferred to end-of-iteration per spec.md §4.1, so
/// the handler never re-enters scheduling mid-`popAll`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Timeout,
    ProcessorTick(u64),
}

/// A single entry in the event queue: an instant, a handler, and the
/// recurrence discipline for its next insertion.
pub struct EventNode {
    id: EventNodeId,
    instant: Mutex<Time>,
    recur: Recur,
    kind: EventKind,
    fired: AtomicBool,
    handler: Box<dyn Fn(EventKind) + Send + Sync>,
}

impl EventNode {
    pub fn new(
        instant: Time,
        recur: Recur,
        kind: EventKind,
        handler: impl Fn(EventKind) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: EventNodeId(NEXT_NODE_ID.fetch_add(1, AtomicOrdering::Relaxed)),
            instant: Mutex::new(instant),
            recur,
            kind,
            fired: AtomicBool::new(false),
            handler: Box::new(handler),
        })
    }

    pub fn id(&self) -> EventNodeId {
        self.id
    }

    pub fn instant(&self) -> Time {
        *self.instant.lock().unwrap()
    }

    /// True once this node's handler has been invoked and it has left the
    /// queue for good (a `Once` node) — used to make [`EventList::remove`]
    /// idempotent per spec.md's contract.
    pub fn has_fired(&self) -> bool {
        self.fired.load(AtomicOrdering::Acquire)
    }
}

struct ByInstant;

impl HeapCtx<Arc<EventNode>> for ByInstant {
    fn lt(&mut self, x: &Arc<EventNode>, y: &Arc<EventNode>) -> bool {
        // Stable FIFO for equal instants: break ties by insertion id.
        match x.instant().cmp(&y.instant()) {
            Ordering::Equal => x.id.0 < y.id.0,
            other => other == Ordering::Less,
        }
    }
}

struct Inner {
    heap: Mutex<BinaryHeap<Arc<EventNode>>>,
    /// Set when the head's deadline was already ≤ now at arm time, so the
    /// next `popAll` should run immediately rather than wait on the timer.
    roll_forward_pending: AtomicBool,
    blocked: Condvar,
    blocked_lock: Mutex<()>,
}

/// The process-wide timed event list, owned by the system processor, per
/// spec.md: "The Event Queue is process-wide, owned by the system
/// Processor."
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                heap: Mutex::new(BinaryHeap::new()),
                roll_forward_pending: AtomicBool::new(false),
                blocked: Condvar::new(),
                blocked_lock: Mutex::new(()),
            }),
        }
    }

    /// Insert `node` in instant order. If `block` is true, park the calling
    /// thread until `popAll` fires this node's handler (used by
    /// `_Timeout`/`sleep` to wait without spinning).
    pub fn add(&self, node: Arc<EventNode>, block: bool) {
        let became_head = {
            let mut heap = self.inner.heap.lock().unwrap();
            heap.push(node.clone(), ByInstant);
            heap.peek().map(|h| Arc::ptr_eq(h, &node)).unwrap_or(false)
        };
        if became_head {
            self.rearm(node.instant());
        }
        if block {
            let guard = self.inner.blocked_lock.lock().unwrap();
            let _unused = self
                .inner
                .blocked
                .wait_while(guard, |_| !node.has_fired())
                .unwrap();
        }
    }

    /// Remove `node` before it fires. Idempotent: if it already fired (and
    /// so already left the heap), this is a no-op.
    pub fn remove(&self, node: &Arc<EventNode>) {
        let mut heap = self.inner.heap.lock().unwrap();
        if let Some(idx) = heap.position(|n| n.id == node.id) {
            heap.remove(idx, ByInstant);
        }
    }

    /// Extract and invoke every node due at or before `now`. Periodic nodes
    /// are reinserted at `fire_instant + period` before their handler runs
    /// again on a later call. Returns the instant of the new head, if any,
    /// so the caller can rearm the OS timer.
    pub fn pop_all(&self, now: Time) -> Option<Time> {
        let mut due = Vec::new();
        {
            let mut heap = self.inner.heap.lock().unwrap();
            while let Some(top) = heap.peek() {
                if top.instant() > now {
                    break;
                }
                due.push(heap.pop(ByInstant).unwrap());
            }
        }

        // Deferred per spec.md: processor-tick events run after all other
        // due handlers in this batch, so a tick handler never re-enters
        // `pop_all` mid-iteration.
        due.sort_by_key(|n| matches!(n.kind, EventKind::ProcessorTick(_)));

        for node in &due {
            node.fired.store(true, AtomicOrdering::Release);
            (node.handler)(node.kind);
            if let Recur::Periodic(period) = node.recur {
                let next = node.instant() + period;
                *node.instant.lock().unwrap() = next;
                node.fired.store(false, AtomicOrdering::Release);
                let mut heap = self.inner.heap.lock().unwrap();
                heap.push(node.clone(), ByInstant);
            }
        }

        if !due.is_empty() {
            let _guard = self.inner.blocked_lock.lock().unwrap();
            self.inner.blocked.notify_all();
        }

        let next_head = self.inner.heap.lock().unwrap().peek().map(|n| n.instant());
        if let Some(instant) = next_head {
            self.rearm(instant);
        }
        next_head
    }

    /// Arm the one-shot timer for `instant`. If `instant` is already ≤ now,
    /// set the roll-forward flag instead of trying to deliver a signal with
    /// a non-positive delay.
    fn rearm(&self, instant: Time) {
        if instant <= Time::now() {
            self.inner
                .roll_forward_pending
                .store(true, AtomicOrdering::Release);
        } else {
            self.inner
                .roll_forward_pending
                .store(false, AtomicOrdering::Release);
            // Arming the real `libc` interval timer is the system
            // processor's job (see `crate::io`); the queue only tracks
            // the deadline so callers (tests, and `io`) can read it back.
        }
    }

    /// Whether `pop_all` should be invoked immediately rather than waiting
    /// for the OS timer to fire, per spec.md's "roll-forward pending" flag.
    pub fn roll_forward_pending(&self) -> bool {
        self.inner.roll_forward_pending.load(AtomicOrdering::Acquire)
    }

    pub fn next_deadline(&self) -> Option<Time> {
        self.inner.heap.lock().unwrap().peek().map(|n| n.instant())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.heap.lock().unwrap().is_empty()
    }
}
