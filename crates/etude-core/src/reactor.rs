// src/reactor.rs
use crate::conn::{Interest, WriteStatus};
use crate::error::EtudeResult;
use crate::metrics::ServerStats;
use crate::pool::ThreadPool;
use crate::signals::{self, Control};
use crate::slab::ConnTable;
use crate::static_files::DocRoot;
use crate::syscalls::{
    self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, Listener, epoll_event,
};
use crate::timer::{TimerAction, TimerEntry, TimerId, TimerList};
use libc::c_int;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub(crate) const LISTENER_TOKEN: u64 = u64::MAX;
pub(crate) const PIPE_TOKEN: u64 = u64::MAX - 1;

/// State reachable from both the reactor and the workers.
pub(crate) struct Shared {
    pub epoll: Epoll,
    pub table: ConnTable,
    pub root: DocRoot,
    pub stats: Arc<ServerStats>,
}

impl Shared {
    fn rearm(&self, fd: c_int, interest: i32) {
        if let Err(e) = self.epoll.modify(fd, fd as u64, interest, true) {
            // The idle timer reclaims the connection.
            warn!(fd, error = %e, "failed to re-arm connection");
        }
    }
}

/// Worker side: parse what the reactor read and build the response.
///
/// The slot stays locked until the socket is re-armed, so the reactor can
/// never close the descriptor between the two.
pub(crate) fn process_queued(shared: &Shared, fd: c_int) {
    let handled = shared.table.with(fd, |conn| {
        let interest = conn.process(&shared.root);
        shared.table.clear_queued(fd);
        match interest {
            Interest::Read => shared.rearm(fd, EPOLLIN),
            Interest::Write => {
                shared.stats.inc_req();
                shared.rearm(fd, EPOLLOUT);
            }
            Interest::Close => {
                // Workers never close; the reactor will see the hangup.
                syscalls::shutdown_socket(fd);
                shared.rearm(fd, EPOLLIN);
            }
        }
    });
    if handled.is_none() {
        shared.table.clear_queued(fd);
        debug!(fd, "queued connection vanished before processing");
    }
}

/// Tunables the reactor needs from the server configuration.
pub(crate) struct ReactorOptions {
    pub max_events: usize,
    pub idle_timeout: Duration,
    /// Seconds between alarms when ticks are signal driven.
    pub alarm_secs: Option<u32>,
}

pub(crate) struct Reactor {
    shared: Arc<Shared>,
    listener: Listener,
    pipe_rx: OwnedFd,
    pool: ThreadPool<c_int>,
    timers: TimerList,
    timer_ids: Vec<Option<TimerId>>,
    events: Vec<epoll_event>,
    options: ReactorOptions,
}

impl Reactor {
    pub fn new(
        shared: Arc<Shared>,
        listener: Listener,
        pipe_rx: OwnedFd,
        pool: ThreadPool<c_int>,
        options: ReactorOptions,
    ) -> Self {
        let capacity = shared.table.capacity();
        Self {
            shared,
            listener,
            pipe_rx,
            pool,
            timers: TimerList::new(),
            timer_ids: vec![None; capacity],
            events: vec![epoll_event { events: 0, u64: 0 }; options.max_events],
            options,
        }
    }

    /// Runs until a stop is requested, then tears every connection down.
    pub fn run(&mut self) -> EtudeResult<()> {
        if let Some(secs) = self.options.alarm_secs {
            signals::arm_alarm(secs);
        }

        let result = self.event_loop();

        self.pool.shutdown();
        for fd in self.shared.table.open_fds() {
            self.close_conn(fd);
        }
        result
    }

    fn event_loop(&mut self) -> EtudeResult<()> {
        let mut tick = false;
        let mut stop = false;

        while !stop {
            let n = match self.shared.epoll.wait(&mut self.events, -1) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll_wait failed");
                    return Err(e);
                }
            };

            for i in 0..n {
                // Copy out of the packed struct.
                let token = self.events[i].u64;
                let flags = self.events[i].events as i32;

                match token {
                    LISTENER_TOKEN => self.accept_all(),
                    PIPE_TOKEN => self.drain_pipe(&mut tick, &mut stop),
                    _ => self.conn_event(token as c_int, flags),
                }
            }

            if tick {
                self.expire_idle(Instant::now());
                if let Some(secs) = self.options.alarm_secs {
                    signals::arm_alarm(secs);
                }
                tick = false;
            }
        }

        info!("reactor stopping");
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            let (fd, peer) = match self.listener.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return;
                }
            };

            if let Err(e) = self.shared.table.open(fd, peer) {
                warn!(fd, ?peer, error = %e, "rejecting connection");
                syscalls::close_fd(fd);
                self.shared.stats.inc_rejected();
                continue;
            }
            if let Err(e) = self.shared.epoll.add(fd, fd as u64, EPOLLIN, true) {
                warn!(fd, error = %e, "failed to register connection");
                self.shared.table.close(fd);
                syscalls::close_fd(fd);
                self.shared.stats.inc_rejected();
                continue;
            }

            let expire = Instant::now() + self.options.idle_timeout;
            self.timer_ids[fd as usize] = Some(self.timers.insert(TimerEntry::close_idle(fd, expire)));
            self.shared.stats.inc_conn();
            debug!(fd, ?peer, "accepted");
        }
    }

    fn drain_pipe(&mut self, tick: &mut bool, stop: &mut bool) {
        let mut buf = [0u8; 1024];
        loop {
            match syscalls::read_nonblocking(self.pipe_rx.as_raw_fd(), &mut buf) {
                Ok(Some(n)) if n > 0 => {
                    for &byte in &buf[..n] {
                        match Control::from_byte(byte) {
                            Some(Control::Tick) => *tick = true,
                            Some(Control::Stop) => *stop = true,
                            None => debug!(byte, "ignoring unknown control byte"),
                        }
                    }
                }
                Ok(_) => return,
                Err(e) => {
                    error!(error = %e, "control pipe read failed");
                    return;
                }
            }
        }
    }

    fn conn_event(&mut self, fd: c_int, flags: i32) {
        if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
            debug!(fd, flags, "peer hung up");
            self.close_conn(fd);
        } else if flags & EPOLLIN != 0 {
            self.on_readable(fd);
        } else if flags & EPOLLOUT != 0 {
            self.on_writable(fd);
        }
    }

    fn on_readable(&mut self, fd: c_int) {
        let Some(read) = self.shared.table.with(fd, |conn| conn.read()) else {
            return;
        };
        if let Err(e) = read {
            if e.is_transport() {
                debug!(fd, error = %e, "read failed");
            } else {
                warn!(fd, error = %e, "closing connection");
            }
            self.close_conn(fd);
            return;
        }
        self.touch(fd);

        if !self.shared.table.mark_queued(fd) {
            error!(fd, "connection is already owned by a worker");
            return;
        }
        if let Err(e) = self.pool.enqueue(fd) {
            warn!(fd, error = %e, "dropping connection");
            self.shared.table.clear_queued(fd);
            self.shared.stats.inc_rejected();
            self.close_conn(fd);
        }
    }

    fn on_writable(&mut self, fd: c_int) {
        let Some(written) = self.shared.table.with(fd, |conn| conn.write()) else {
            return;
        };
        match written {
            Ok((status, n)) => {
                self.shared.stats.add_bytes(n);
                match status {
                    WriteStatus::Pending => {
                        // A peer still draining the response is not idle.
                        if n > 0 {
                            self.touch(fd);
                        }
                        self.shared.rearm(fd, EPOLLOUT);
                    }
                    WriteStatus::KeepAlive => {
                        self.touch(fd);
                        self.shared.rearm(fd, EPOLLIN);
                    }
                    WriteStatus::Close => self.close_conn(fd),
                }
            }
            Err(e) if e.is_transport() => {
                debug!(fd, error = %e, "write failed");
                self.close_conn(fd);
            }
            Err(e) => {
                warn!(fd, error = %e, "write failed");
                self.close_conn(fd);
            }
        }
    }

    /// Pushes the idle deadline of `fd` out by a full timeout.
    fn touch(&mut self, fd: c_int) {
        let expire = Instant::now() + self.options.idle_timeout;
        if let Some(id) = self.timer_ids.get(fd as usize).copied().flatten() {
            self.timers.reposition(id, expire);
        }
    }

    fn expire_idle(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.timers.expire_due(now, |entry| due.push(entry));

        for entry in due {
            let fd = entry.fd;
            self.timer_ids[fd as usize] = None;
            match entry.action {
                TimerAction::CloseIdle if self.shared.table.is_queued(fd) => {
                    // A worker owns it right now; look again next time.
                    let expire = now + self.options.idle_timeout;
                    self.timer_ids[fd as usize] =
                        Some(self.timers.insert(TimerEntry::close_idle(fd, expire)));
                }
                TimerAction::CloseIdle => {
                    debug!(fd, "closing idle connection");
                    self.shared.stats.inc_timed_out();
                    self.close_conn(fd);
                }
            }
        }
    }

    fn close_conn(&mut self, fd: c_int) {
        if let Some(id) = self.timer_ids.get_mut(fd as usize).and_then(Option::take) {
            self.timers.remove(id);
        }
        // Releasing the slot waits for any worker still re-arming it.
        if !self.shared.table.close(fd) {
            return;
        }
        if let Err(e) = self.shared.epoll.delete(fd) {
            debug!(fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(fd);
        self.shared.stats.dec_conn();
    }
}
