// src/pool.rs
//! Fixed-size worker pool draining a bounded FIFO.
//!
//! Producers never block: [`ThreadPool::enqueue`] refuses work once the queue
//! holds `capacity` items. Workers sleep on a counting semaphore whose permits
//! track the queue length.

use crate::error::{EtudeError, EtudeResult};
use crate::sync::{Locker, Semaphore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

struct Shared<T> {
    queue: Locker<VecDeque<T>>,
    capacity: usize,
    pending: Semaphore,
    stop: AtomicBool,
}

pub struct ThreadPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Starts `workers` threads, each calling `handler` for every item it pops.
    pub fn new<F>(workers: usize, capacity: usize, handler: F) -> EtudeResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if workers == 0 {
            return Err(EtudeError::InvalidConfig("worker count must be positive".into()));
        }
        if capacity == 0 {
            return Err(EtudeError::InvalidConfig("queue capacity must be positive".into()));
        }

        let shared = Arc::new(Shared {
            queue: Locker::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            pending: Semaphore::new(0),
            stop: AtomicBool::new(false),
        });
        let handler = Arc::new(handler);

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(workers),
        };
        for id in 0..workers {
            let shared = pool.shared.clone();
            let handler = handler.clone();
            let spawned = thread::Builder::new()
                .name(format!("etude-worker-{id}"))
                .spawn(move || worker_loop(id, &shared, &*handler));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    // Dropping the pool stops the threads already running.
                    error!(worker = id, error = %e, "failed to spawn worker");
                    return Err(e.into());
                }
            }
        }
        Ok(pool)
    }

    /// Appends `item` unless the queue is full or the pool is stopping.
    pub fn enqueue(&self, item: T) -> EtudeResult<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(EtudeError::ShuttingDown);
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                return Err(EtudeError::QueueFull);
            }
            queue.push_back(item);
        }
        self.shared.pending.post();
        Ok(())
    }

    /// Items waiting for a worker.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops and joins every worker. Items still queued are dropped.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pending.post_many(self.workers.len());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread terminated abnormally");
            }
        }
        let dropped = {
            let mut queue = self.shared.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        debug!(dropped, "thread pool stopped");
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T, F: Fn(T)>(id: usize, shared: &Shared<T>, handler: &F) {
    loop {
        shared.pending.wait();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let Some(item) = shared.queue.lock().pop_front() else {
            continue;
        };
        run(id, handler, item);
    }
}

#[cfg(feature = "catch-panic")]
fn run<T, F: Fn(T)>(id: usize, handler: &F, item: T) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(item)));
    if result.is_err() {
        error!(worker = id, "request handler panicked");
    }
}

#[cfg(not(feature = "catch-panic"))]
fn run<T, F: Fn(T)>(_id: usize, handler: &F, item: T) {
    handler(item);
}
