// src/timer.rs
//! Ascending idle-timer list.
//!
//! Records are kept in an index-addressed arena (the same free-list layout the
//! connection table uses) and linked into a doubly linked list ordered by
//! absolute expiry. The reactor only ever pushes deadlines forward, so
//! [`TimerList::reposition`] scans from the record's old successor instead of
//! from the head.

use libc::c_int;
use std::time::Instant;

/// What to do with a connection once its record expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    CloseIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub expire: Instant,
    pub fd: c_int,
    pub action: TimerAction,
}

impl TimerEntry {
    pub fn close_idle(fd: c_int, expire: Instant) -> Self {
        Self {
            expire,
            fd,
            action: TimerAction::CloseIdle,
        }
    }
}

/// Handle to a record in a [`TimerList`]. Invalid once the record is removed
/// or expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

#[derive(Debug)]
struct Node {
    entry: TimerEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub struct TimerList {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `entry` in deadline order. A deadline at or after the tail, the
    /// usual case for a fresh connection, is appended without a scan.
    pub fn insert(&mut self, entry: TimerEntry) -> TimerId {
        let idx = self.alloc(entry);
        self.len += 1;

        let (Some(head), Some(tail)) = (self.head, self.tail) else {
            self.head = Some(idx);
            self.tail = Some(idx);
            return TimerId(idx);
        };

        if entry.expire >= self.node(tail).entry.expire {
            self.node_mut(tail).next = Some(idx);
            self.node_mut(idx).prev = Some(tail);
            self.tail = Some(idx);
            return TimerId(idx);
        }

        if entry.expire < self.node(head).entry.expire {
            self.node_mut(idx).next = Some(head);
            self.node_mut(head).prev = Some(idx);
            self.head = Some(idx);
            return TimerId(idx);
        }

        self.link_after(idx, head);
        TimerId(idx)
    }

    /// Moves `id` to `expire`. Deadlines normally only grow; an earlier
    /// deadline falls back to a scan from the head.
    pub fn reposition(&mut self, id: TimerId, expire: Instant) -> bool {
        let idx = id.0;
        if !self.contains(idx) {
            return false;
        }

        let old = self.node(idx).entry.expire;
        self.node_mut(idx).entry.expire = expire;

        if expire < old {
            let entry = self.node(idx).entry;
            self.unlink(idx);
            self.release(idx);
            self.len -= 1;
            // Same slot is handed back by `alloc`, so the id stays valid.
            let again = self.insert(entry);
            debug_assert_eq!(again.0, idx);
            return true;
        }

        let Some(next) = self.node(idx).next else {
            return true;
        };
        if expire < self.node(next).entry.expire {
            return true;
        }

        self.unlink(idx);
        self.link_after(idx, next);
        true
    }

    /// Detaches `id` without running its action.
    pub fn remove(&mut self, id: TimerId) -> Option<TimerEntry> {
        let idx = id.0;
        if !self.contains(idx) {
            return None;
        }
        self.unlink(idx);
        self.len -= 1;
        self.release(idx)
    }

    /// Pops every record whose deadline is at or before `now`, in order,
    /// handing each to `on_expire`. Stops at the first live record.
    pub fn expire_due<F>(&mut self, now: Instant, mut on_expire: F) -> usize
    where
        F: FnMut(TimerEntry),
    {
        let mut expired = 0;
        while let Some(head) = self.head {
            if now < self.node(head).entry.expire {
                break;
            }
            self.unlink(head);
            self.len -= 1;
            if let Some(entry) = self.release(head) {
                on_expire(entry);
                expired += 1;
            }
        }
        expired
    }

    /// Records from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &TimerEntry> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = self.node(idx);
            cursor = node.next;
            Some(&node.entry)
        })
    }

    // Inserts `idx` somewhere after `start`, before the first strictly later record.
    fn link_after(&mut self, idx: usize, start: usize) {
        let expire = self.node(idx).entry.expire;
        let mut prev = start;
        let mut cur = self.node(start).next;

        while let Some(c) = cur {
            if expire < self.node(c).entry.expire {
                self.node_mut(prev).next = Some(idx);
                self.node_mut(idx).prev = Some(prev);
                self.node_mut(idx).next = Some(c);
                self.node_mut(c).prev = Some(idx);
                return;
            }
            prev = c;
            cur = self.node(c).next;
        }

        self.node_mut(prev).next = Some(idx);
        self.node_mut(idx).prev = Some(prev);
        self.node_mut(idx).next = None;
        self.tail = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let n = self.node(idx);
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let n = self.node_mut(idx);
        n.prev = None;
        n.next = None;
    }

    fn alloc(&mut self, entry: TimerEntry) -> usize {
        let node = Node {
            entry,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Option<TimerEntry> {
        let node = self.nodes.get_mut(idx)?.take()?;
        self.free.push(idx);
        Some(node.entry)
    }

    fn contains(&self, idx: usize) -> bool {
        matches!(self.nodes.get(idx), Some(Some(_)))
    }

    #[inline]
    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("linked timer slot is vacant")
    }

    #[inline]
    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("linked timer slot is vacant")
    }
}
