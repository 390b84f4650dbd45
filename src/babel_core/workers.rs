//! Translation worker pool handed to the pipeline for sentence-level
//! parallelism. Pools are expensive to build relative to per-job
//! orchestration, so the tuner caches and reuses them across jobs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::sync_ext::{CondvarExt, MutexExt};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Task>>,
    cv: Condvar,
    shutting_down: AtomicBool,
}

/// Fixed-size pool of named worker threads draining a shared task queue.
pub struct ThreadWorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    max_workers: usize,
}

impl fmt::Debug for ThreadWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWorkerPool")
            .field("max_workers", &self.max_workers)
            .field(
                "shutting_down",
                &self.shared.shutting_down.load(Ordering::SeqCst),
            )
            .finish()
    }
}

impl ThreadWorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(max_workers);
        for index in 0..max_workers {
            let shared_clone = shared.clone();
            let result = std::thread::Builder::new()
                .name(format!("babelbook-translate-{index}"))
                .spawn(move || worker_loop(&shared_clone));
            match result {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    debug!(error = %err, "failed to spawn translation worker thread");
                    break;
                }
            }
        }

        Self {
            shared,
            handles: Mutex::new(handles),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Queue `task` for execution. Tasks submitted after shutdown are
    /// dropped silently; the pool is already being torn down.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.shared.queue.lock_unpoisoned().push_back(Box::new(task));
        self.shared.cv.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop the workers. With `wait` the calling thread joins them,
    /// letting in-flight tasks run to completion; without it the workers
    /// exit as soon as they next check the flag.
    pub fn shutdown(&self, wait: bool) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.cv.notify_all();
        if !wait {
            return;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock_unpoisoned();
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock_unpoisoned();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                queue = shared.cv.wait_unpoisoned(queue);
            }
        };
        task();
    }
}

impl Drop for ThreadWorkerPool {
    fn drop(&mut self) {
        self.shutdown(false);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn executes_queued_tasks_on_worker_threads() {
        let pool = ThreadWorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..8 {
            let counter_clone = counter.clone();
            let tx_clone = tx.clone();
            pool.execute(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                let _ = tx_clone.send(());
            });
        }

        for _ in 0..8 {
            rx.recv_timeout(Duration::from_secs(5)).expect("task ran");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        pool.shutdown(true);
    }

    #[test]
    fn tasks_after_shutdown_are_dropped() {
        let pool = ThreadWorkerPool::new(1);
        pool.shutdown(true);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        pool.execute(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(pool.is_shut_down());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn worker_count_is_clamped_to_at_least_one() {
        let pool = ThreadWorkerPool::new(0);
        assert_eq!(pool.max_workers(), 1);
        pool.shutdown(true);
    }
}
