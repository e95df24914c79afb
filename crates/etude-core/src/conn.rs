// src/conn.rs
use crate::error::{EtudeError, EtudeResult};
use crate::http::Status;
use crate::parser::{ParseError, Progress, RequestParser};
use crate::response::{write_canned, write_head};
use crate::static_files::{DocRoot, MappedFile, Resolved};
use crate::syscalls::{read_nonblocking, writev_nonblocking};
use libc::c_int;
use std::net::SocketAddr;
use tracing::{debug, warn};

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;

/// What the socket should be re-armed for after `process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    /// No response could be built; the connection must go.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The kernel buffer filled up; wait for write readiness.
    Pending,
    /// Response fully sent, state reset for the next request.
    KeepAlive,
    Close,
}

/// One client socket and its request/response state.
pub struct Conn {
    fd: c_int,
    peer: Option<SocketAddr>,
    parser: RequestParser,
    write_buf: Box<[u8]>,
    write_len: usize,
    bytes_to_send: usize,
    bytes_sent: usize,
    file: Option<MappedFile>,
    keep_alive: bool,
}

impl Conn {
    pub fn new(read_capacity: usize, write_capacity: usize) -> Self {
        Self {
            fd: -1,
            peer: None,
            parser: RequestParser::new(read_capacity),
            write_buf: vec![0; write_capacity].into_boxed_slice(),
            write_len: 0,
            bytes_to_send: 0,
            bytes_sent: 0,
            file: None,
            keep_alive: false,
        }
    }

    /// Binds the slot to a freshly accepted socket.
    pub fn init(&mut self, fd: c_int, peer: Option<SocketAddr>) {
        self.fd = fd;
        self.peer = peer;
        self.reset();
    }

    // Also used between keep-alive requests. Pipelined leftovers are dropped.
    fn reset(&mut self) {
        self.parser.reset();
        self.write_len = 0;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.file = None;
        self.keep_alive = false;
    }

    /// Detaches from the socket. The caller closes the descriptor.
    pub fn release(&mut self) {
        self.file = None;
        self.fd = -1;
        self.peer = None;
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    /// Drains the socket into the read buffer until it would block or the
    /// buffer is full.
    pub fn read(&mut self) -> EtudeResult<usize> {
        if self.parser.is_full() {
            return Err(EtudeError::ReadBufferFull);
        }
        let mut total = 0;
        while !self.parser.is_full() {
            match read_nonblocking(self.fd, self.parser.spare_mut())? {
                None => break,
                Some(0) => return Err(EtudeError::PeerClosed),
                Some(n) => {
                    self.parser.advance(n);
                    total += n;
                }
            }
        }
        Ok(total)
    }

    /// Parses what has been read and, once a request is complete, prepares
    /// the response.
    pub fn process(&mut self, root: &DocRoot) -> Interest {
        let status = match self.parser.parse() {
            Ok(Progress::Incomplete) => return Interest::Read,
            Ok(Progress::Complete) => {
                debug!(
                    fd = self.fd,
                    method = ?self.parser.method(),
                    target = self.parser.target(),
                    query = self.parser.query(),
                    host = self.parser.host(),
                    port = self.parser.port(),
                    "request"
                );
                self.keep_alive = self.parser.keep_alive();
                self.resolve(root)
            }
            Err(err) => {
                debug!(fd = self.fd, peer = ?self.peer, %err, "malformed request");
                // A request that overflowed the buffer cannot be resynchronized.
                self.keep_alive = err != ParseError::TooLarge && self.parser.keep_alive();
                Status::BadRequest
            }
        };

        let built = if status == Status::Ok && self.file.is_some() {
            self.prepare_file_head()
        } else {
            self.prepare_canned(status)
        };

        if let Err(err) = built {
            warn!(fd = self.fd, %err, "response did not fit, answering 500");
            self.file = None;
            self.keep_alive = false;
            if let Err(err) = self.prepare_canned(Status::InternalError) {
                warn!(fd = self.fd, %err, "no response could be built");
                return Interest::Close;
            }
        }

        Interest::Write
    }

    // Maps the target on success; every other outcome is a canned body.
    fn resolve(&mut self, root: &DocRoot) -> Status {
        let path = self.parser.path().unwrap_or("/");
        match root.resolve(path) {
            Resolved::File { path, len } => match MappedFile::open(&path, len) {
                Ok(map) => {
                    self.file = Some(map);
                    Status::Ok
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "mapping failed");
                    Status::InternalError
                }
            },
            Resolved::Empty => Status::Ok,
            Resolved::NotFound => Status::NotFound,
            Resolved::Forbidden => Status::Forbidden,
            Resolved::Directory => Status::BadRequest,
        }
    }

    fn prepare_file_head(&mut self) -> EtudeResult<()> {
        let body_len = self.file.as_ref().map_or(0, MappedFile::len);
        self.write_len = write_head(&mut self.write_buf, Status::Ok, body_len, self.keep_alive)?;
        self.bytes_to_send = self.write_len + body_len;
        self.bytes_sent = 0;
        Ok(())
    }

    fn prepare_canned(&mut self, status: Status) -> EtudeResult<()> {
        self.write_len = write_canned(&mut self.write_buf, status, self.keep_alive)?;
        self.bytes_to_send = self.write_len;
        self.bytes_sent = 0;
        Ok(())
    }

    /// Unsent header bytes and unsent body bytes.
    fn pending(&self) -> (&[u8], &[u8]) {
        let body = self.file.as_ref().map_or(&[][..], MappedFile::as_slice);
        if self.bytes_sent < self.write_len {
            (&self.write_buf[self.bytes_sent..self.write_len], body)
        } else {
            (&[], &body[self.bytes_sent - self.write_len..])
        }
    }

    /// Sends as much of the response as the socket takes. Returns the status
    /// and the number of bytes written by this call.
    pub fn write(&mut self) -> EtudeResult<(WriteStatus, usize)> {
        let mut written = 0;
        while self.bytes_sent < self.bytes_to_send {
            let (head, body) = self.pending();
            let n = match writev_nonblocking(self.fd, [head, body]) {
                Ok(n) => n,
                Err(err) => {
                    self.file = None;
                    return Err(err);
                }
            };
            if n == 0 {
                return Ok((WriteStatus::Pending, written));
            }
            self.bytes_sent += n;
            written += n;
        }

        self.file = None;
        if self.keep_alive {
            self.reset();
            Ok((WriteStatus::KeepAlive, written))
        } else {
            Ok((WriteStatus::Close, written))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::EMPTY_PAGE;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    struct Harness {
        conn: Conn,
        _server: UnixStream,
        client: UnixStream,
        root: DocRoot,
        _dir: tempfile::TempDir,
    }

    fn harness(read_cap: usize, write_cap: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>index</p>").unwrap();
        std::fs::write(dir.path().join("empty.html"), "").unwrap();
        let root = DocRoot::new(dir.path()).unwrap();
        let (server, client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let mut conn = Conn::new(read_cap, write_cap);
        conn.init(server.as_raw_fd(), None);
        Harness {
            conn,
            _server: server,
            client,
            root,
            _dir: dir,
        }
    }

    impl Harness {
        fn send(&mut self, bytes: &[u8]) {
            self.client.write_all(bytes).unwrap();
        }

        fn recv(&mut self, n: usize) -> String {
            let mut buf = vec![0u8; n];
            self.client.read_exact(&mut buf).unwrap();
            String::from_utf8(buf).unwrap()
        }

        /// Reads one response whose total length is `written`.
        fn exchange(&mut self, request: &[u8]) -> (WriteStatus, String) {
            self.send(request);
            self.conn.read().unwrap();
            assert_eq!(self.conn.process(&self.root), Interest::Write);
            let (status, written) = self.conn.write().unwrap();
            (status, self.recv(written))
        }
    }

    fn content_length(response: &str) -> usize {
        response
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap()
    }

    fn body(response: &str) -> &str {
        response.split_once("\r\n\r\n").unwrap().1
    }

    #[test]
    fn keep_alive_request_is_served_and_reset() {
        let mut h = harness(READ_BUF_SIZE, WRITE_BUF_SIZE);
        let (status, resp) = h.exchange(
            b"GET /index.html HTTP/1.1\r\nHost: a.com\r\nConnection: keep-alive\r\n\r\n",
        );
        assert_eq!(status, WriteStatus::KeepAlive);
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.contains("Connection: keep-alive\r\n"));
        assert_eq!(body(&resp), "<p>index</p>");
        assert!(!h.conn.keep_alive(), "reset clears the previous request");
        assert_eq!(h.conn.parser().read_len(), 0);

        let (status, resp) = h.exchange(b"GET /index.html HTTP/1.1\r\n\r\n");
        assert_eq!(status, WriteStatus::Close);
        assert!(resp.contains("Connection: close\r\n"));
    }

    #[test]
    fn http_1_0_gets_400() {
        let mut h = harness(READ_BUF_SIZE, WRITE_BUF_SIZE);
        let (status, resp) = h.exchange(b"GET /x HTTP/1.0\r\n\r\n");
        assert_eq!(status, WriteStatus::Close);
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(body(&resp), Status::BadRequest.canned_body());
    }

    #[test]
    fn split_request_line_waits_for_more() {
        let mut h = harness(READ_BUF_SIZE, WRITE_BUF_SIZE);
        h.send(b"GET /a");
        assert_eq!(h.conn.read().unwrap(), 6);
        assert_eq!(h.conn.process(&h.root), Interest::Read);
        h.send(b" HTTP/1.1\r\n\r\n");
        h.conn.read().unwrap();
        assert_eq!(h.conn.process(&h.root), Interest::Write);
        let (_, written) = h.conn.write().unwrap();
        assert!(h.recv(written).starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn missing_file_length_matches_canned_body() {
        let mut h = harness(READ_BUF_SIZE, WRITE_BUF_SIZE);
        let (_, resp) = h.exchange(b"GET /missing.html HTTP/1.1\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(
            content_length(&resp),
            Status::NotFound.canned_body().len()
        );
        assert_eq!(body(&resp).len(), content_length(&resp));
    }

    #[test]
    fn empty_file_gets_placeholder_page() {
        let mut h = harness(READ_BUF_SIZE, WRITE_BUF_SIZE);
        let (_, resp) = h.exchange(b"GET /empty.html HTTP/1.1\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body(&resp), EMPTY_PAGE);
    }

    #[test]
    fn traversal_and_directories_are_refused() {
        let mut h = harness(READ_BUF_SIZE, WRITE_BUF_SIZE);
        let (_, resp) = h.exchange(b"GET /../secret HTTP/1.1\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 403 Forbidden\r\n"));

        let mut h = harness(READ_BUF_SIZE, WRITE_BUF_SIZE);
        let (_, resp) = h.exchange(b"GET / HTTP/1.1\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn full_buffer_without_request_gets_400_and_close() {
        let mut h = harness(16, WRITE_BUF_SIZE);
        h.send(b"GET /a-very-long-path.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(h.conn.read().unwrap(), 16);
        assert!(matches!(h.conn.read(), Err(EtudeError::ReadBufferFull)));
        assert_eq!(h.conn.process(&h.root), Interest::Write);
        assert!(!h.conn.keep_alive());
        let (status, written) = h.conn.write().unwrap();
        assert_eq!(status, WriteStatus::Close);
        assert!(h.recv(written).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn peer_close_is_reported() {
        let mut h = harness(READ_BUF_SIZE, WRITE_BUF_SIZE);
        h.client.shutdown(std::net::Shutdown::Write).unwrap();
        assert!(matches!(h.conn.read(), Err(EtudeError::PeerClosed)));
    }

    #[test]
    fn tiny_write_buffer_cannot_respond() {
        let mut h = harness(READ_BUF_SIZE, 32);
        h.send(b"GET /index.html HTTP/1.1\r\n\r\n");
        h.conn.read().unwrap();
        assert_eq!(h.conn.process(&h.root), Interest::Close);
    }

    #[test]
    fn large_file_survives_partial_writes() {
        let mut h = harness(READ_BUF_SIZE, WRITE_BUF_SIZE);
        let payload: Vec<u8> = (0..512 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
        std::fs::write(h.root.path().join("big.html"), &payload).unwrap();

        h.send(b"GET /big.html HTTP/1.1\r\n\r\n");
        h.conn.read().unwrap();
        assert_eq!(h.conn.process(&h.root), Interest::Write);

        let mut client = h.client.try_clone().unwrap();
        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            client.read_to_end(&mut out).unwrap();
            out
        });

        loop {
            match h.conn.write().unwrap() {
                (WriteStatus::Pending, _) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                (status, _) => {
                    assert_eq!(status, WriteStatus::Close);
                    break;
                }
            }
        }
        drop(h._server);
        let out = reader.join().unwrap();
        let split = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&out[split..], &payload[..]);
    }
}
