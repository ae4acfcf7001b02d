//! Fixed-size thread pool for background compaction jobs.
//!
//! Workers pull closures off a shared queue guarded by a mutex and a
//! condition variable. Dropping the pool signals shutdown and joins every
//! worker; jobs already queued still run to completion.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cv: Condvar,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ThreadPool {
    /// Starts a pool with `num_threads` workers (at least one).
    pub fn new(num_threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let workers = (0..num_threads.max(1))
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || Self::worker_loop(shared))
            })
            .collect();

        Self { shared, workers }
    }

    /// Enqueues a job. Panics if called after shutdown began, which
    /// cannot happen through the public API since shutdown runs on drop.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        assert!(!state.shutdown, "schedule on a shut down pool");
        state.jobs.push_back(Box::new(job));
        self.shared.cv.notify_one();
    }

    fn worker_loop(shared: Arc<PoolShared>) {
        loop {
            let job = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break job;
                    }
                    if state.shutdown {
                        return;
                    }
                    state = shared.cv.wait(state).unwrap();
                }
            };
            job();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
