// src/slab.rs
use crate::conn::Conn;
use crate::error::{EtudeError, EtudeResult};
use crate::sync::Locker;
use libc::c_int;
use std::net::SocketAddr;
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct Slot {
    // Allocated on first use and recycled afterwards.
    conn: Locker<Option<Conn>>,
    queued: AtomicBool,
}

/// Connection table indexed directly by socket descriptor.
///
/// The reactor opens and closes entries; workers only borrow a connection
/// while its slot is marked queued. The one-shot epoll registration keeps
/// those two from overlapping, so the slot mutex is uncontended in practice.
pub struct ConnTable {
    slots: Box<[Slot]>,
    read_capacity: usize,
    write_capacity: usize,
    active_count: AtomicUsize,
}

impl ConnTable {
    pub fn new(capacity: usize, read_capacity: usize, write_capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                conn: Locker::new(None),
                queued: AtomicBool::new(false),
            })
            .collect();
        Self {
            slots,
            read_capacity,
            write_capacity,
            active_count: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn slot(&self, fd: c_int) -> Option<&Slot> {
        usize::try_from(fd).ok().and_then(|i| self.slots.get(i))
    }

    /// Binds slot `fd` to a newly accepted socket.
    pub fn open(&self, fd: c_int, peer: Option<SocketAddr>) -> EtudeResult<()> {
        let slot = self.slot(fd).ok_or(EtudeError::TableFull)?;
        let mut guard = slot.conn.lock();
        let conn = guard.get_or_insert_with(|| Conn::new(self.read_capacity, self.write_capacity));
        if conn.fd() == fd {
            // The kernel never hands out a descriptor that is still open.
            return Err(EtudeError::TableFull);
        }
        conn.init(fd, peer);
        slot.queued.store(false, Ordering::Release);
        self.active_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Releases the entry for `fd`. Returns false if it was not open.
    pub fn close(&self, fd: c_int) -> bool {
        let Some(slot) = self.slot(fd) else {
            return false;
        };
        let mut guard = slot.conn.lock();
        match guard.as_mut() {
            Some(conn) if conn.fd() == fd => {
                conn.release();
                slot.queued.store(false, Ordering::Release);
                self.active_count.fetch_sub(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Runs `f` on the open connection for `fd`.
    pub fn with<R>(&self, fd: c_int, f: impl FnOnce(&mut Conn) -> R) -> Option<R> {
        let mut guard = self.lock(fd)?;
        match guard.as_mut() {
            Some(conn) if conn.fd() == fd => Some(f(conn)),
            _ => None,
        }
    }

    /// Raw access to the slot, open or not.
    pub fn lock(&self, fd: c_int) -> Option<MutexGuard<'_, Option<Conn>>> {
        self.slot(fd).map(|slot| slot.conn.lock())
    }

    pub fn is_open(&self, fd: c_int) -> bool {
        self.with(fd, |_| ()).is_some()
    }

    /// Claims the connection for the worker pool. False if it is already
    /// claimed.
    pub fn mark_queued(&self, fd: c_int) -> bool {
        self.slot(fd).is_some_and(|slot| {
            slot.queued
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    pub fn clear_queued(&self, fd: c_int) {
        if let Some(slot) = self.slot(fd) {
            slot.queued.store(false, Ordering::Release);
        }
    }

    pub fn is_queued(&self, fd: c_int) -> bool {
        self.slot(fd)
            .is_some_and(|slot| slot.queued.load(Ordering::Acquire))
    }

    /// Descriptors of every open connection.
    pub fn open_fds(&self) -> Vec<c_int> {
        (0..self.slots.len())
            .filter_map(|i| c_int::try_from(i).ok())
            .filter(|&fd| self.is_open(fd))
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_and_reuse() {
        let table = ConnTable::new(10, 64, 64);
        assert_eq!(table.capacity(), 10);
        assert!(table.is_empty());

        table.open(5, None).unwrap();
        assert!(table.is_open(5));
        assert_eq!(table.with(5, |c| c.fd()), Some(5));
        assert_eq!(table.len(), 1);

        assert!(table.close(5));
        assert!(!table.close(5), "double close is ignored");
        assert!(!table.is_open(5));
        assert_eq!(table.len(), 0);

        table.open(5, None).unwrap();
        assert_eq!(table.open_fds(), vec![5]);
    }

    #[test]
    fn out_of_range_descriptors_are_rejected() {
        let table = ConnTable::new(4, 64, 64);
        assert!(matches!(table.open(4, None), Err(EtudeError::TableFull)));
        assert!(matches!(table.open(-1, None), Err(EtudeError::TableFull)));
        assert!(!table.mark_queued(9));
        assert!(table.with(9, |_| ()).is_none());
    }

    #[test]
    fn queued_flag_admits_one_owner() {
        let table = ConnTable::new(4, 64, 64);
        table.open(2, None).unwrap();
        assert!(table.mark_queued(2));
        assert!(!table.mark_queued(2));
        assert!(table.is_queued(2));
        table.clear_queued(2);
        assert!(table.mark_queued(2));

        // Closing clears the claim so the next socket starts fresh.
        table.close(2);
        table.open(2, None).unwrap();
        assert!(!table.is_queued(2));
    }
}
