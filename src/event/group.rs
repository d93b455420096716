//! Completion groups and pending events.
//!
//! A [`CompletionGroup`] is an enter/leave counter with a notification list.
//! Work registered with [`notify`](CompletionGroup::notify) runs once the
//! count reaches zero; if the group is already drained the block is
//! dispatched immediately, avoiding a second thread hop.
//!
//! A [`PendingEvent`] pairs a group with the name of the observer chain it
//! represents. Observer callbacks receive the event and may extend it
//! (enter/leave) to delay follow-up work, which is how `produce(op, before:)`
//! guarantees its ordering.

use crate::event::queue::EventQueue;
use crate::tracing_compat::trace;
use core::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type Block = Box<dyn FnOnce() + Send + 'static>;

/// An enter/leave counter that fires notifications when it drains.
#[derive(Clone)]
pub struct CompletionGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    state: Mutex<GroupState>,
    condvar: Condvar,
}

struct GroupState {
    pending: usize,
    notifications: Vec<(EventQueue, Block)>,
}

impl CompletionGroup {
    /// Creates a new, drained group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                state: Mutex::new(GroupState {
                    pending: 0,
                    notifications: Vec::new(),
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Increments the outstanding-work count.
    pub fn enter(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.pending += 1;
    }

    /// Decrements the outstanding-work count.
    ///
    /// When the count reaches zero, all registered notifications are
    /// dispatched onto their queues in registration order.
    ///
    /// # Panics
    ///
    /// Panics if the group is already drained (unbalanced `leave`).
    pub fn leave(&self) {
        let fired = {
            let mut state = self.inner.state.lock().unwrap();
            assert!(state.pending > 0, "unbalanced CompletionGroup::leave");
            state.pending -= 1;
            if state.pending == 0 {
                std::mem::take(&mut state.notifications)
            } else {
                Vec::new()
            }
        };
        if !fired.is_empty() {
            trace!(count = fired.len(), "completion group drained");
        }
        for (queue, block) in fired {
            queue.dispatch_boxed(block);
        }
        self.inner.condvar.notify_all();
    }

    /// Registers `block` to run on `queue` once the group drains.
    ///
    /// Short-circuits to an immediate dispatch when the group is already
    /// drained.
    pub fn notify<F>(&self, queue: &EventQueue, block: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let boxed: Box<dyn FnOnce() + Send + 'static> = Box::new(block);
        let immediate = {
            let mut state = self.inner.state.lock().unwrap();
            if state.pending == 0 {
                Some(boxed)
            } else {
                state.notifications.push((queue.clone(), boxed));
                None
            }
        };
        if let Some(boxed) = immediate {
            queue.dispatch_boxed(boxed);
        }
    }

    /// Returns true if no work is outstanding.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.inner.state.lock().unwrap().pending == 0
    }

    /// Blocks until the group drains or the timeout elapses.
    ///
    /// Returns `true` if the group drained.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        while state.pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (next, _) = self.inner.condvar.wait_timeout(state, remaining).unwrap();
            state = next;
        }
        true
    }
}

impl Default for CompletionGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("CompletionGroup")
            .field("pending", &state.pending)
            .field("notifications", &state.notifications.len())
            .finish()
    }
}

/// A named barrier representing an observer chain's completion.
#[derive(Clone, Debug)]
pub struct PendingEvent {
    name: &'static str,
    group: CompletionGroup,
}

impl PendingEvent {
    /// Creates a pending event with a fresh, drained group.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            group: CompletionGroup::new(),
        }
    }

    /// Returns the event's name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the completion group backing this event.
    #[must_use]
    pub const fn group(&self) -> &CompletionGroup {
        &self.group
    }

    /// Holds the event open. Pair with [`leave`](Self::leave).
    pub fn enter(&self) {
        self.group.enter();
    }

    /// Releases a hold taken with [`enter`](Self::enter).
    pub fn leave(&self) {
        self.group.leave();
    }
}
