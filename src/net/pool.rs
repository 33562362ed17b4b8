//! Bounded FIFO worker pool: a fixed cohort of threads pulling from one
//! shared task queue guarded by a mutex and condvar (spec §4.7 — this is
//! the "one mutex + one condvar" queue, not a channel).

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::error::PoolError;

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Set once, at the top of [`worker_loop`]. `0` is reserved for the
    /// master thread (spec §6: "Thread id 0 reserved for master"); worker
    /// threads read this to stamp their own audit-log rows.
    static WORKER_ID: Cell<u32> = const { Cell::new(0) };
}

/// The calling thread's worker id, or `0` if called from the master
/// thread (or any thread that isn't one of the pool's workers).
pub fn current_worker_id() -> u32 {
    WORKER_ID.with(|id| id.get())
}

struct State {
    queue: VecDeque<Task>,
    shutting_down: bool,
}

/// Outcome of a non-blocking submission attempt (spec §4.7: "enqueue
/// returns one of {accepted, rejected-full, error}"). Used by the master
/// loop, which must never block on a full queue — a rejected task is
/// handled synchronously by the master itself instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    RejectedFull,
    Closed,
}

struct Shared {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: Option<usize>,
}

/// A bounded (optionally unbounded) FIFO pool of `n_workers` OS threads.
/// `submit` blocks the caller when the queue is at capacity, applying
/// backpressure all the way back to the master event loop rather than
/// growing memory unboundedly.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(n_workers: usize, capacity: Option<usize>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State { queue: VecDeque::new(), shutting_down: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        });

        let workers = (0..n_workers.max(1))
            .map(|id| {
                let shared = Arc::clone(&shared);
                // Worker ids start at 1 so 0 stays reserved for the master.
                let worker_id = id as u32 + 1;
                thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || {
                        WORKER_ID.with(|cell| cell.set(worker_id));
                        worker_loop(shared)
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    /// Non-blocking submission for the master event loop: never parks the
    /// calling thread. A full bounded queue yields `RejectedFull` so the
    /// master can handle that one request synchronously instead of
    /// stalling every other connection behind it.
    pub fn try_submit(&self, task: impl FnOnce() + Send + 'static) -> SubmitOutcome {
        let mut guard = self.shared.state.lock();
        if guard.shutting_down {
            return SubmitOutcome::Closed;
        }
        if let Some(cap) = self.shared.capacity {
            if guard.queue.len() >= cap {
                return SubmitOutcome::RejectedFull;
            }
        }
        guard.queue.push_back(Box::new(task));
        drop(guard);
        self.shared.not_empty.notify_one();
        SubmitOutcome::Accepted
    }

    /// Enqueues `task`, blocking while the queue is at capacity. Returns
    /// [`PoolError::ShuttingDown`] once [`ThreadPool::shutdown`] has been
    /// called, instead of silently dropping work.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), PoolError> {
        let mut guard = self.shared.state.lock();
        loop {
            if guard.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            match self.shared.capacity {
                Some(cap) if guard.queue.len() >= cap => self.shared.not_full.wait(&mut guard),
                _ => break,
            }
        }
        guard.queue.push_back(Box::new(task));
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Marks the pool as shutting down (no further `submit` succeeds),
    /// wakes every worker so they can drain the remaining queue and exit,
    /// and joins them. Already-queued tasks still run.
    pub fn shutdown(mut self) {
        {
            let mut guard = self.shared.state.lock();
            guard.shutting_down = true;
        }
        self.shared.not_empty.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut guard = shared.state.lock();
            loop {
                if let Some(task) = guard.queue.pop_front() {
                    break Some(task);
                }
                if guard.shutting_down {
                    break None;
                }
                shared.not_empty.wait(&mut guard);
            }
        };
        shared.not_full.notify_one();
        match task {
            Some(task) => task(),
            None => return,
        }
    }
}
