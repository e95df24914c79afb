// src/server.rs
use crate::config::ServerConfig;
use crate::error::{EtudeError, EtudeResult};
use crate::metrics::ServerStats;
use crate::pool::ThreadPool;
use crate::reactor::{LISTENER_TOKEN, PIPE_TOKEN, Reactor, ReactorOptions, Shared, process_queued};
use crate::signals::{self, STOP_BYTE, TICK_BYTE};
use crate::slab::ConnTable;
use crate::static_files::DocRoot;
use crate::syscalls::{self, EPOLLIN, Epoll, Listener};
use libc::c_int;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Bound, not yet running, server.
///
/// ```rust,no_run
/// use etude_core::{Server, ServerConfig};
///
/// let config = ServerConfig { port: 8080, doc_root: "./public".into(), ..Default::default() };
/// Server::bind(config)?.run()?;
/// # Ok::<(), etude_core::EtudeError>(())
/// ```
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    listener: Listener,
    local_addr: SocketAddr,
    pipe_rx: OwnedFd,
    pipe_tx: Arc<OwnedFd>,
    signal_handlers: bool,
}

/// Cloneable remote control for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    pipe_tx: Arc<OwnedFd>,
}

impl ServerHandle {
    /// Asks the reactor to exit after its current batch.
    pub fn stop(&self) {
        syscalls::write_byte(self.pipe_tx.as_raw_fd(), STOP_BYTE);
    }

    /// Runs one idle-timer pass, as if the alarm had fired.
    pub fn tick(&self) {
        syscalls::write_byte(self.pipe_tx.as_raw_fd(), TICK_BYTE);
    }
}

impl Server {
    /// Validates `config`, opens the document root, binds the listener and
    /// sets up epoll and the control pipe.
    pub fn bind(config: ServerConfig) -> EtudeResult<Self> {
        config.validate()?;
        let root = DocRoot::new(&config.doc_root)?;

        let listener = Listener::bind(&config.host, config.port)?;
        let local_addr = listener.local_addr()?;
        let epoll = Epoll::new()?;
        let (pipe_rx, pipe_tx) = syscalls::create_pipe()?;

        epoll.add(listener.fd, LISTENER_TOKEN, EPOLLIN, false)?;
        epoll.add(pipe_rx.as_raw_fd(), PIPE_TOKEN, EPOLLIN, false)?;

        let table = ConnTable::new(
            config.max_connections,
            config.read_buffer_size,
            config.write_buffer_size,
        );
        let shared = Arc::new(Shared {
            epoll,
            table,
            root,
            stats: Arc::new(ServerStats::new()),
        });

        Ok(Self {
            config,
            shared,
            listener,
            local_addr,
            pipe_rx,
            pipe_tx: Arc::new(pipe_tx),
            signal_handlers: true,
        })
    }

    /// Whether `run` installs the SIGALRM/SIGTERM/SIGINT handlers. Without
    /// them, ticks and stops only come through [`ServerHandle`].
    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.signal_handlers = enabled;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            pipe_tx: self.pipe_tx.clone(),
        }
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.shared.stats.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serves until stopped, then closes every connection and joins the
    /// workers.
    pub fn run(self) -> EtudeResult<()> {
        self.run_with(process_queued)
    }

    /// `run` with a different worker-side handler for queued descriptors.
    pub(crate) fn run_with<H>(self, handler: H) -> EtudeResult<()>
    where
        H: Fn(&Shared, c_int) + Send + Sync + 'static,
    {
        signals::ignore_sigpipe()?;
        let alarm_secs = if self.signal_handlers {
            signals::install(self.pipe_tx.as_raw_fd())?;
            let secs = u32::try_from(self.config.timeslot_secs)
                .map_err(|_| EtudeError::InvalidConfig("timeslot_secs is too large".into()))?;
            Some(secs)
        } else {
            None
        };

        let pool = {
            let shared = self.shared.clone();
            ThreadPool::new(self.config.workers, self.config.max_requests, move |fd| {
                handler(&shared, fd)
            })?
        };

        info!(
            addr = %self.local_addr,
            root = %self.shared.root.path().display(),
            workers = self.config.workers,
            "etude listening"
        );

        let mut reactor = Reactor::new(
            self.shared.clone(),
            self.listener,
            self.pipe_rx,
            pool,
            ReactorOptions {
                max_events: self.config.max_events,
                idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
                alarm_secs,
            },
        );
        let result = reactor.run();
        drop(reactor);

        if alarm_secs.is_some() {
            signals::uninstall();
        }

        let stats = self.shared.stats.snapshot();
        info!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            timed_out = stats.timed_out,
            requests = stats.req_count,
            bytes_sent = stats.bytes_sent,
            "etude shut down"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Semaphore;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread::{self, JoinHandle};
    use std::time::Instant;

    const INDEX: &str = "<p>index</p>";

    struct Running {
        addr: SocketAddr,
        handle: ServerHandle,
        stats: Arc<ServerStats>,
        thread: Option<JoinHandle<EtudeResult<()>>>,
        _root: tempfile::TempDir,
    }

    impl Running {
        fn start<H>(workers: usize, max_requests: usize, handler: H) -> Self
        where
            H: Fn(&Shared, c_int) + Send + Sync + 'static,
        {
            let root = tempfile::tempdir().unwrap();
            std::fs::write(root.path().join("index.html"), INDEX).unwrap();
            let config = ServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                doc_root: root.path().to_path_buf(),
                workers,
                max_requests,
                max_connections: 4096,
                ..ServerConfig::default()
            };
            let server = Server::bind(config).unwrap().with_signal_handlers(false);
            let addr = server.local_addr();
            let handle = server.handle();
            let stats = server.stats();
            let thread = thread::spawn(move || server.run_with(handler));
            Self {
                addr,
                handle,
                stats,
                thread: Some(thread),
                _root: root,
            }
        }

        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            stream
        }
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.handle.stop();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn read_response(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            assert_eq!(stream.read(&mut byte).unwrap(), 1, "connection closed mid-response");
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        let len: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        head + &String::from_utf8(body).unwrap()
    }

    #[test]
    fn full_queue_drops_the_extra_connection() {
        let gate = Arc::new(Semaphore::new(0));
        let (started_tx, started) = mpsc::channel();
        let server = {
            let gate = gate.clone();
            Running::start(1, 1, move |shared: &Shared, fd| {
                let _ = started_tx.send(fd);
                gate.wait();
                process_queued(shared, fd);
            })
        };
        let request = b"GET /index.html HTTP/1.1\r\n\r\n";

        // The only worker blocks on the first request.
        let mut busy = server.connect();
        busy.write_all(request).unwrap();
        started.recv_timeout(Duration::from_secs(5)).unwrap();

        // The second request fills the one-slot queue.
        let mut waiting = server.connect();
        waiting.write_all(request).unwrap();
        thread::sleep(Duration::from_millis(100));

        // The third has nowhere to go.
        let mut dropped = server.connect();
        dropped.write_all(request).unwrap();
        wait_until("rejection", || server.stats.snapshot().rejected == 1);
        let mut buf = [0u8; 16];
        assert!(matches!(dropped.read(&mut buf), Ok(0) | Err(_)));

        gate.post_many(16);
        for stream in [&mut busy, &mut waiting] {
            let mut res = String::new();
            stream.read_to_string(&mut res).unwrap();
            assert!(res.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(res.ends_with(INDEX));
        }
        assert_eq!(server.stats.snapshot().accepted, 3);
    }

    #[test]
    fn queued_connection_has_exactly_one_owner() {
        const CLIENTS: usize = 16;
        const REQUESTS: usize = 50;

        let unowned = Arc::new(AtomicUsize::new(0));
        let server = {
            let unowned = unowned.clone();
            Running::start(4, 10_000, move |shared: &Shared, fd| {
                // The reactor's claim must be held, and no second claim may succeed.
                if !shared.table.is_queued(fd) || shared.table.mark_queued(fd) {
                    unowned.fetch_add(1, Ordering::Relaxed);
                }
                process_queued(shared, fd);
            })
        };

        let clients: Vec<_> = (0..CLIENTS)
            .map(|_| {
                let mut stream = server.connect();
                thread::spawn(move || {
                    for _ in 0..REQUESTS {
                        stream
                            .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                            .unwrap();
                        let res = read_response(&mut stream);
                        assert!(res.contains("Connection: keep-alive\r\n"));
                        assert!(res.ends_with(INDEX));
                    }
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        assert_eq!(unowned.load(Ordering::Relaxed), 0);
        let stats = server.stats.snapshot();
        assert_eq!(stats.accepted, CLIENTS);
        assert_eq!(stats.rejected, 0);
        wait_until("request count", || {
            server.stats.snapshot().req_count == CLIENTS * REQUESTS
        });
    }
}
