//! The per-task serial event queue.
//!
//! An [`EventQueue`] is a FIFO executor backed by one lazily-spawned worker
//! thread. All user-visible callbacks of a task funnel through its queue,
//! which is what makes observer callbacks totally ordered per task.
//!
//! Three dispatch flavors exist:
//!
//! - [`dispatch`](EventQueue::dispatch): append and return.
//! - [`dispatch_sync`](EventQueue::dispatch_sync): append and block the
//!   caller until the block ran. Calling this from the queue's own worker
//!   is a deadlock and panics.
//! - [`dispatch_synchronized_with`](EventQueue::dispatch_synchronized_with):
//!   run a block *on another queue* while keeping this queue's serialization
//!   guarantee; no subsequent block on this queue starts until it returns.
//!
//! Reentrancy is allowed: a block running on the queue may `dispatch`
//! further work onto it.

use crate::event::group::CompletionGroup;
use crate::tracing_compat::trace;
use crate::types::Qos;
use core::fmt;
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

static QUEUE_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_QUEUE: Cell<u64> = const { Cell::new(0) };
}

/// How long an idle worker parks before re-checking whether its queue has
/// been abandoned.
const IDLE_POLL: Duration = Duration::from_millis(50);

type Block = Box<dyn FnOnce() + Send + 'static>;

/// A serial FIFO executor with a QoS hint.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    id: u64,
    label: String,
    /// Latched maximum of the base QoS and every block's minimum QoS.
    qos: AtomicU8,
    state: Mutex<QueueState>,
    condvar: Condvar,
}

struct QueueState {
    blocks: VecDeque<Block>,
    worker_running: bool,
}

impl EventQueue {
    /// Creates a new queue. The worker thread is spawned on first dispatch.
    #[must_use]
    pub fn new(label: impl Into<String>, qos: Qos) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: QUEUE_COUNTER.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                qos: AtomicU8::new(qos.rank()),
                state: Mutex::new(QueueState {
                    blocks: VecDeque::new(),
                    worker_running: false,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Returns the queue's label (also the worker thread name).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Returns the queue's current QoS hint.
    #[must_use]
    pub fn qos(&self) -> Qos {
        Qos::from_rank(self.inner.qos.load(Ordering::Relaxed))
    }

    /// Raises the QoS hint to at least `min`. The hint never lowers.
    pub fn raise_qos(&self, min: Qos) {
        self.inner.qos.fetch_max(min.rank(), Ordering::Relaxed);
    }

    /// Returns true if `self` and `other` are the same queue.
    #[must_use]
    pub fn same_queue(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }

    /// Returns true if the calling thread is this queue's worker.
    #[must_use]
    pub fn is_on_queue(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get() == self.inner.id)
    }

    /// Asserts that the calling thread is this queue's worker.
    pub fn assert_on_queue(&self) {
        debug_assert!(
            self.is_on_queue(),
            "expected to be on event queue '{}'",
            self.inner.label
        );
    }

    /// Appends `block` to the queue. Blocks run in FIFO order.
    pub fn dispatch<F>(&self, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch_boxed(Box::new(block));
    }

    /// Appends `block`, raising the queue's QoS hint to at least `min_qos`.
    pub fn dispatch_with_qos<F>(&self, min_qos: Qos, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.raise_qos(min_qos);
        self.dispatch_boxed(Box::new(block));
    }

    pub(crate) fn dispatch_boxed(&self, block: Block) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.blocks.push_back(block);
            if !state.worker_running {
                state.worker_running = true;
                spawn_worker(&self.inner);
            }
        }
        self.inner.condvar.notify_one();
    }

    /// Appends `block` and parks the caller until it has run.
    ///
    /// # Panics
    ///
    /// Panics when called from this queue's own worker thread; that would
    /// deadlock.
    pub fn dispatch_sync<F>(&self, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            !self.is_on_queue(),
            "dispatch_sync onto the current event queue '{}' would deadlock",
            self.inner.label
        );
        let latch = Arc::new(SyncLatch::new());
        let signal = Arc::clone(&latch);
        self.dispatch(move || {
            block();
            signal.signal();
        });
        latch.wait();
    }

    /// Runs `block` on `other`, keeping this queue's serialization: no
    /// subsequent block on this queue starts until `block` returns.
    ///
    /// When called from this queue's worker the block runs immediately
    /// (the worker blocks on `other`); otherwise a wrapper block is
    /// appended to this queue.
    pub fn dispatch_synchronized_with<F>(&self, other: &Self, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_on_queue() {
            other.dispatch_sync(block);
        } else {
            let other = other.clone();
            self.dispatch(move || other.dispatch_sync(block));
        }
    }

    /// Runs `block` on this queue once `group` drains; immediately if it
    /// already has.
    pub fn dispatch_notify<F>(&self, group: &CompletionGroup, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        group.notify(self, block);
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("EventQueue")
            .field("label", &self.inner.label)
            .field("qos", &self.qos())
            .field("depth", &state.blocks.len())
            .field("worker_running", &state.worker_running)
            .finish()
    }
}

/// Completion latch for `dispatch_sync`.
struct SyncLatch {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl SyncLatch {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.condvar.wait(done).unwrap();
        }
    }
}

fn spawn_worker(inner: &Arc<QueueInner>) {
    let id = inner.id;
    let weak = Arc::downgrade(inner);
    thread::Builder::new()
        .name(inner.label.clone())
        .spawn(move || worker_loop(id, &weak))
        .expect("failed to spawn event queue worker");
}

/// The worker drains blocks FIFO, parking when idle. It holds only a weak
/// reference between iterations so an abandoned queue lets the thread exit.
fn worker_loop(id: u64, weak: &Weak<QueueInner>) {
    CURRENT_QUEUE.with(|current| current.set(id));
    loop {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let mut state = inner.state.lock().unwrap();
        if let Some(block) = state.blocks.pop_front() {
            drop(state);
            block();
            continue;
        }
        let (state, _timeout) = inner.condvar.wait_timeout(state, IDLE_POLL).unwrap();
        drop(state);
        drop(inner);
    }
    trace!(queue_id = id, "event queue worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn queue(label: &str) -> EventQueue {
        EventQueue::new(label, Qos::Default)
    }

    #[test]
    fn blocks_run_in_fifo_order() {
        let q = queue("fifo");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = Arc::clone(&order);
            q.dispatch(move || order.lock().unwrap().push(i));
        }
        q.dispatch_sync(|| {});
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn dispatch_sync_observes_prior_blocks() {
        let q = queue("sync");
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        q.dispatch(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        q.dispatch_sync(|| {});
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn is_on_queue_is_true_inside_blocks_only() {
        let q = queue("onq");
        assert!(!q.is_on_queue());
        let q2 = q.clone();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        q.dispatch(move || {
            *s.lock().unwrap() = Some(q2.is_on_queue());
        });
        q.dispatch_sync(|| {});
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn reentrant_dispatch_is_allowed() {
        let q = queue("reentrant");
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let q2 = q.clone();
        q.dispatch(move || {
            let c2 = Arc::clone(&c);
            q2.dispatch(move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });
        q.dispatch_sync(|| {});
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn synchronized_dispatch_runs_on_other_queue_and_blocks_self() {
        let a = queue("sync-a");
        let b = queue("sync-b");
        let order = Arc::new(Mutex::new(Vec::new()));

        let b2 = b.clone();
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        a.dispatch_synchronized_with(&b, move || {
            o1.lock().unwrap().push(("on-b", b2.is_on_queue()));
        });
        a.dispatch(move || {
            o2.lock().unwrap().push(("after", false));
        });
        a.dispatch_sync(|| {});
        b.dispatch_sync(|| {});

        let order = order.lock().unwrap();
        assert_eq!(order[0], ("on-b", true));
        assert_eq!(order[1], ("after", false));
    }

    #[test]
    fn qos_only_raises() {
        let q = EventQueue::new("qos", Qos::Utility);
        assert_eq!(q.qos(), Qos::Utility);
        q.dispatch_with_qos(Qos::Background, || {});
        assert_eq!(q.qos(), Qos::Utility);
        q.dispatch_with_qos(Qos::UserInitiated, || {});
        assert_eq!(q.qos(), Qos::UserInitiated);
        q.dispatch_sync(|| {});
    }

    #[test]
    fn same_queue_compares_identity() {
        let a = queue("id-a");
        let b = queue("id-b");
        assert!(a.same_queue(&a.clone()));
        assert!(!a.same_queue(&b));
    }
}
