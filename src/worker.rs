// SPDX-License-Identifier: MPL-2.0

//! Worker thread pool (component C7, spec.md §4.7).
//!
//! A fixed-size pool, each thread owning its own work list of completion
//! targets. A descq without a dedicated interrupt is assigned to the
//! least-loaded thread at add-time; in interrupt mode, a queue's
//! completion servicing instead runs from the bottom half and never
//! touches a thread's work list (the caller simply never calls
//! [`WorkerPool::assign`] for that queue).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::QdmaResult;

/// Whatever a worker thread calls to service one descq's completions.
/// The embedder supplies this — typically a closure over a `DescQ` plus
/// the doorbell/context handles it needs (spec.md §4.3.5/§4.3.6).
pub trait CompletionTarget: Send + Sync {
    fn service(&self) -> QdmaResult<()>;
}

impl<F: Fn() -> QdmaResult<()> + Send + Sync> CompletionTarget for F {
    fn service(&self) -> QdmaResult<()> {
        self()
    }
}

struct ThreadState {
    work: Mutex<Vec<Arc<dyn CompletionTarget>>>,
    cv: Condvar,
    stop: AtomicBool,
}

struct WorkerThread {
    state: Arc<ThreadState>,
    handle: Option<JoinHandle<()>>,
}

/// N worker threads, each with its own work list (spec.md §4.7).
pub struct WorkerPool {
    threads: Vec<WorkerThread>,
    poll_interval: Duration,
}

impl WorkerPool {
    /// Spawns `count` threads (the caller picks `count`, typically one per
    /// online CPU). Each thread sleeps until signalled or `poll_interval`
    /// elapses, walks its work list under its own lock, and calls
    /// `service()` on every target.
    pub fn new(count: usize, poll_interval: Duration) -> Self {
        let threads = (0..count)
            .map(|_| {
                let state = Arc::new(ThreadState {
                    work: Mutex::new(Vec::new()),
                    cv: Condvar::new(),
                    stop: AtomicBool::new(false),
                });
                let thread_state = state.clone();
                let handle = std::thread::spawn(move || Self::run(thread_state, poll_interval));
                WorkerThread {
                    state,
                    handle: Some(handle),
                }
            })
            .collect();
        Self {
            threads,
            poll_interval,
        }
    }

    fn run(state: Arc<ThreadState>, poll_interval: Duration) {
        loop {
            let guard = state.work.lock().unwrap();
            let (guard, _) = state
                .cv
                .wait_timeout_while(guard, poll_interval, |_| {
                    !state.stop.load(Ordering::Acquire)
                })
                .unwrap();
            if state.stop.load(Ordering::Acquire) {
                return;
            }
            for target in guard.iter() {
                let _ = target.service();
            }
            drop(guard);
            std::thread::yield_now();
        }
    }

    fn load(&self, idx: usize) -> usize {
        self.threads[idx].state.work.lock().unwrap().len()
    }

    /// Assigns `target` to the least-loaded thread and wakes it. Returns
    /// the chosen thread's index (also used for CPU-affinity bookkeeping
    /// by the caller).
    pub fn assign(&self, target: Arc<dyn CompletionTarget>) -> usize {
        let idx = (0..self.threads.len())
            .min_by_key(|&i| self.load(i))
            .expect("pool has at least one thread");
        let thread = &self.threads[idx];
        thread.state.work.lock().unwrap().push(target);
        thread.state.cv.notify_one();
        idx
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn queue_count(&self, idx: usize) -> usize {
        self.load(idx)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for t in &self.threads {
            t.state.stop.store(true, Ordering::Release);
            t.state.cv.notify_all();
        }
        for t in &mut self.threads {
            if let Some(h) = t.handle.take() {
                let _ = h.join();
            }
        }
    }
}
