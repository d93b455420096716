//! Shared worker pool.
//!
//! A small lazily-scaling pool of OS threads. Condition evaluators are
//! dispatched here so that task event queues never block on predicate work.
//! Threads are spawned on demand up to `max_threads` and retire after an
//! idle timeout.

use crate::tracing_compat::trace;
use core::fmt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Idle timeout before a pool thread retires.
const IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default thread cap for the global pool.
const DEFAULT_MAX_THREADS: usize = 64;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A lazily-scaling worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    max_threads: usize,
    active: AtomicUsize,
    busy: AtomicUsize,
    queue: Mutex<VecDeque<Job>>,
    condvar: Condvar,
    name_prefix: String,
}

impl WorkerPool {
    /// Creates a pool that scales up to `max_threads` threads.
    ///
    /// # Panics
    ///
    /// Panics if `max_threads` is 0.
    #[must_use]
    pub fn new(max_threads: usize, name_prefix: impl Into<String>) -> Self {
        assert!(max_threads > 0, "max_threads must be at least 1");
        Self {
            inner: Arc::new(PoolInner {
                max_threads,
                active: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                queue: Mutex::new(VecDeque::new()),
                condvar: Condvar::new(),
                name_prefix: name_prefix.into(),
            }),
        }
    }

    /// Returns the process-wide shared pool.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<WorkerPool> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(DEFAULT_MAX_THREADS, "opkit-pool"))
    }

    /// Submits a job. Spawns a thread when all active ones are busy and the
    /// cap allows it.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.push_back(Box::new(job));
        }
        let active = self.inner.active.load(Ordering::Relaxed);
        let busy = self.inner.busy.load(Ordering::Relaxed);
        if active < self.inner.max_threads && busy >= active {
            self.spawn_thread();
        }
        self.inner.condvar.notify_one();
    }

    /// Returns the number of live pool threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    fn spawn_thread(&self) {
        let inner = Arc::clone(&self.inner);
        let index = inner.active.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", inner.name_prefix, index);
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                worker_loop(&inner);
                inner.active.fetch_sub(1, Ordering::Relaxed);
            })
            .expect("failed to spawn pool thread");
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_threads", &self.inner.max_threads)
            .field("active", &self.inner.active.load(Ordering::Relaxed))
            .field("busy", &self.inner.busy.load(Ordering::Relaxed))
            .finish()
    }
}

fn worker_loop(inner: &Arc<PoolInner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                let (next, result) = inner.condvar.wait_timeout(queue, IDLE_TIMEOUT).unwrap();
                queue = next;
                if result.timed_out() && queue.is_empty() {
                    break None;
                }
            }
        };
        let Some(job) = job else {
            trace!("pool thread retiring");
            return;
        };
        inner.busy.fetch_add(1, Ordering::Relaxed);
        job();
        inner.busy.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn jobs_all_run() {
        let pool = WorkerPool::new(4, "test-pool");
        let done = Arc::new((Mutex::new(0usize), Condvar::new()));
        for _ in 0..32 {
            let done = Arc::clone(&done);
            pool.spawn(move || {
                let (count, condvar) = &*done;
                *count.lock().unwrap() += 1;
                condvar.notify_all();
            });
        }
        let (count, condvar) = &*done;
        let mut count = count.lock().unwrap();
        while *count < 32 {
            let (next, result) = condvar
                .wait_timeout(count, Duration::from_secs(5))
                .unwrap();
            count = next;
            assert!(!result.timed_out(), "jobs did not all run");
        }
    }

    #[test]
    fn scales_within_cap() {
        let pool = WorkerPool::new(2, "cap-pool");
        let barrier = Arc::new(Barrier::new(3));
        for _ in 0..2 {
            let b = Arc::clone(&barrier);
            pool.spawn(move || {
                b.wait();
            });
        }
        barrier.wait();
        assert!(pool.active_threads() <= 2);
    }

    #[test]
    fn global_pool_is_shared() {
        let a = WorkerPool::global();
        let b = WorkerPool::global();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }
}
