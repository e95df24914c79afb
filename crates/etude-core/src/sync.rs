// src/sync.rs
//! Thin scoped wrappers over the std primitives used by the pool and the
//! connection table.
//!
//! Lock poisoning is recovered rather than propagated: a worker that panics
//! while holding a connection must not wedge the reactor.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Mutex wrapper whose `lock` never fails.
#[derive(Debug, Default)]
pub struct Locker<T> {
    inner: Mutex<T>,
}

impl<T> Locker<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Condition variable paired with a [`Locker`] guard.
#[derive(Debug, Default)]
pub struct Cond {
    inner: Condvar,
}

impl Cond {
    pub fn new() -> Self {
        Self {
            inner: Condvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.inner.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub fn signal(&self) {
        self.inner.notify_one();
    }

    pub fn broadcast(&self) {
        self.inner.notify_all();
    }
}

/// Counting semaphore.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Locker<usize>,
    cond: Cond,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Locker::new(permits),
            cond: Cond::new(),
        }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            permits = self.cond.wait(permits);
        }
        *permits -= 1;
    }

    pub fn post(&self) {
        *self.permits.lock() += 1;
        self.cond.signal();
    }

    /// Releases `n` permits at once, waking every waiter.
    pub fn post_many(&self, n: usize) {
        *self.permits.lock() += n;
        self.cond.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn spawn_waiter(sem: &Arc<Semaphore>) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel();
        let sem = sem.clone();
        thread::spawn(move || {
            sem.wait();
            let _ = tx.send(());
        });
        rx
    }

    #[test]
    fn semaphore_counts_permits() {
        let sem = Arc::new(Semaphore::new(2));
        sem.wait();
        sem.wait();

        let waiter = spawn_waiter(&sem);
        assert!(waiter.recv_timeout(Duration::from_millis(30)).is_err());
        sem.post();
        waiter.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn post_many_wakes_every_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiters: Vec<_> = (0..3).map(|_| spawn_waiter(&sem)).collect();
        thread::sleep(Duration::from_millis(20));
        sem.post_many(3);
        for waiter in waiters {
            waiter.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn locker_recovers_from_poison() {
        let lock = Arc::new(Locker::new(5));
        let poisoner = lock.clone();
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("poison");
        })
        .join();
        assert_eq!(*lock.lock(), 5);
    }
}
