//! The exclusivity registry.
//!
//! A process-wide map from category name to a FIFO chain of waiters. A
//! request names a set of categories and a completion; the completion runs
//! once the request sits at the head of *every* named category's chain:
//! an ordered barrier across named mutexes.
//!
//! A multi-category request is appended to all of its chains under a single
//! lock acquisition, so two tasks requesting overlapping sets in different
//! orders cannot deadlock.
//!
//! The registry is the only inter-task shared state in the crate. Use
//! [`ExclusivityRegistry::global`] for production behavior or inject a
//! private instance per task for isolated tests.

use crate::tracing_compat::{debug, trace};
use core::fmt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

type Completion = Box<dyn FnOnce() + Send + 'static>;

/// Process-wide mutual exclusion by category name.
pub struct ExclusivityRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    /// FIFO of request ids per category. The head holds (or is about to
    /// hold) the category.
    chains: HashMap<String, VecDeque<u64>>,
    /// Requests still waiting on one or more categories.
    waiting: HashMap<u64, PendingRequest>,
    next_request: u64,
}

struct PendingRequest {
    /// Number of requested categories this request is not yet at the head of.
    remaining: usize,
    completion: Option<Completion>,
}

impl ExclusivityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Returns the shared process-wide registry.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<ExclusivityRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Requests the given categories; `completion` runs once the request is
    /// at the head of every one of them.
    ///
    /// Duplicate category names are collapsed. An empty set completes
    /// immediately. The completion may run on the calling thread (when the
    /// lock is free) or on the thread of a later [`unlock`](Self::unlock).
    pub fn request<F>(&self, categories: &[String], completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut unique: Vec<&String> = categories.iter().collect();
        unique.sort();
        unique.dedup();

        if unique.is_empty() {
            completion();
            return;
        }

        let immediate = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_request;
            state.next_request += 1;

            let mut at_head = 0;
            for category in &unique {
                let chain = state.chains.entry((*category).clone()).or_default();
                chain.push_back(id);
                if chain.front() == Some(&id) {
                    at_head += 1;
                }
            }
            let remaining = unique.len() - at_head;
            trace!(
                request = id,
                categories = unique.len(),
                remaining,
                "exclusivity request"
            );
            if remaining == 0 {
                true
            } else {
                state.waiting.insert(
                    id,
                    PendingRequest {
                        remaining,
                        completion: Some(Box::new(completion)),
                    },
                );
                return;
            }
        };
        if immediate {
            completion();
        }
    }

    /// Releases the given categories, promoting the next waiter of each.
    ///
    /// The caller must hold the head position of every named category
    /// (guaranteed when it was granted through [`request`](Self::request)
    /// and releases exactly once).
    pub fn unlock(&self, categories: &[String]) {
        let mut unique: Vec<&String> = categories.iter().collect();
        unique.sort();
        unique.dedup();
        if unique.is_empty() {
            return;
        }

        let granted = {
            let mut state = self.state.lock().unwrap();
            let mut granted: Vec<Completion> = Vec::new();
            for category in &unique {
                let next = {
                    let Some(chain) = state.chains.get_mut(*category) else {
                        debug_assert!(false, "unlock of unknown category {category}");
                        continue;
                    };
                    chain.pop_front();
                    chain.front().copied()
                };
                if next.is_none() {
                    state.chains.remove(*category);
                }
                if let Some(next_id) = next {
                    let now_head_everywhere =
                        if let Some(pending) = state.waiting.get_mut(&next_id) {
                            pending.remaining -= 1;
                            pending.remaining == 0
                        } else {
                            false
                        };
                    if now_head_everywhere {
                        if let Some(mut pending) = state.waiting.remove(&next_id) {
                            if let Some(completion) = pending.completion.take() {
                                granted.push(completion);
                            }
                        }
                    }
                }
            }
            granted
        };

        if !granted.is_empty() {
            debug!(promoted = granted.len(), "exclusivity lock promoted");
        }
        for completion in granted {
            completion();
        }
    }

    /// Returns the number of requests queued on `category` (including the
    /// current holder).
    #[must_use]
    pub fn waiter_count(&self, category: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(category)
            .map_or(0, VecDeque::len)
    }
}

impl Default for ExclusivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExclusivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("ExclusivityRegistry")
            .field("categories", &state.chains.len())
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cats(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn empty_request_completes_immediately() {
        let registry = ExclusivityRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        registry.request(&[], move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn uncontended_request_is_granted_inline() {
        let registry = ExclusivityRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        registry.request(&cats(&["disk"]), move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(registry.waiter_count("disk"), 1);
    }

    #[test]
    fn contended_request_waits_for_unlock() {
        let registry = ExclusivityRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        registry.request(&cats(&["disk"]), move || {
            o.lock().unwrap().push(1);
        });
        let o = Arc::clone(&order);
        registry.request(&cats(&["disk"]), move || {
            o.lock().unwrap().push(2);
        });

        assert_eq!(*order.lock().unwrap(), vec![1]);
        registry.unlock(&cats(&["disk"]));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        registry.unlock(&cats(&["disk"]));
        assert_eq!(registry.waiter_count("disk"), 0);
    }

    #[test]
    fn multi_category_barrier_requires_all_heads() {
        let registry = ExclusivityRegistry::new();
        let granted = Arc::new(AtomicUsize::new(0));

        registry.request(&cats(&["a"]), || {});
        let g = Arc::clone(&granted);
        registry.request(&cats(&["a", "b"]), move || {
            g.fetch_add(1, Ordering::SeqCst);
        });

        // Head of "b" but not of "a".
        assert_eq!(granted.load(Ordering::SeqCst), 0);
        registry.unlock(&cats(&["a"]));
        assert_eq!(granted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlapping_sets_in_opposite_order_do_not_deadlock() {
        let registry = ExclusivityRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        registry.request(&cats(&["a", "b"]), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        registry.request(&cats(&["b", "a"]), move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        registry.unlock(&cats(&["a", "b"]));
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_categories_collapse() {
        let registry = ExclusivityRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        registry.request(&cats(&["x", "x"]), move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        registry.unlock(&cats(&["x", "x"]));
        assert_eq!(registry.waiter_count("x"), 0);
    }

    #[test]
    fn global_registry_is_shared() {
        let a = ExclusivityRegistry::global();
        let b = ExclusivityRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
