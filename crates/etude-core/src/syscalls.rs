// src/syscalls.rs
use crate::error::EtudeResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr;

// ---- Socket Operations ----

/// Non-blocking TCP listener. Closed on drop.
#[derive(Debug)]
pub struct Listener {
    pub fd: c_int,
}

impl Listener {
    /// Create, bind and listen with SO_REUSEADDR set.
    pub fn bind(host: &str, port: u16) -> EtudeResult<Self> {
        let addr = resolve(host, port)?;
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };

        unsafe {
            let fd = libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            // Owned from here on so every early return closes it.
            let listener = Listener { fd };

            let optval: c_int = 1;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &optval as *const _ as *const c_void,
                mem::size_of_val(&optval) as socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error().into());
            }

            let (storage, len) = sockaddr_from_std(&addr);
            if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) < 0 {
                return Err(io::Error::last_os_error().into());
            }

            if libc::listen(fd, libc::SOMAXCONN) < 0 {
                return Err(io::Error::last_os_error().into());
            }

            Ok(listener)
        }
    }

    /// Address the kernel actually bound (resolves port 0).
    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        unsafe {
            if libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            ) < 0
            {
                return Err(io::Error::last_os_error().into());
            }
        }
        sockaddr_to_std(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family").into())
    }

    /// Accept one non-blocking connection. `None` once the backlog is drained.
    pub fn accept(&self) -> EtudeResult<Option<(c_int, Option<SocketAddr>)>> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                return Ok(Some((fd, sockaddr_to_std(&storage))));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(None),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err.into()),
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {host}"))
    })
}

fn sockaddr_from_std(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Half-close both directions so the reactor sees a hangup on the next wait.
pub fn shutdown_socket(fd: c_int) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll Operations ----

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event};

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register `fd` edge-triggered. Connections pass `one_shot` so that only
    /// one thread sees each readiness edge until the socket is re-armed.
    pub fn add(&self, fd: c_int, token: u64, interests: i32, one_shot: bool) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests, one_shot)
    }

    /// Re-arm a one-shot registration with fresh interests.
    pub fn modify(&self, fd: c_int, token: u64, interests: i32, one_shot: bool) -> EtudeResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests, one_shot)
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32, one_shot: bool) -> EtudeResult<()> {
        let mut flags = interests | libc::EPOLLET | libc::EPOLLRDHUP;
        if one_shot {
            flags |= libc::EPOLLONESHOT;
        }
        let mut event = epoll_event {
            events: flags as u32,
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> EtudeResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Interrupted waits report zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}

// ---- Data Transfer ----

/// One non-blocking read. `None` means the socket would block; `Some(0)` is EOF.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> EtudeResult<Option<usize>> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Gathered write of a response head and body in one syscall. Returns `Ok(0)`
/// on would-block.
pub fn writev_nonblocking(fd: c_int, bufs: [&[u8]; 2]) -> EtudeResult<usize> {
    let iovecs = bufs.map(|buf| libc::iovec {
        iov_base: buf.as_ptr() as *mut c_void,
        iov_len: buf.len(),
    });

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iovecs.len() as c_int) };
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(0),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

// ---- Control Pipe ----

/// Non-blocking, close-on-exec pipe. Returns (read end, write end).
pub fn create_pipe() -> EtudeResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])))
    }
}

/// Best-effort single byte write; a full pipe already carries a wake-up.
pub fn write_byte(fd: c_int, byte: u8) -> bool {
    let res = unsafe { libc::write(fd, &byte as *const u8 as *const c_void, 1) };
    res == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn listener_accepts_with_peer_address() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(listener.accept().unwrap().is_none());

        let client = TcpStream::connect(addr).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(conn) = listener.accept().unwrap() {
                accepted = Some(conn);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (fd, peer) = accepted.expect("connection was not accepted");
        assert_eq!(peer, Some(client.local_addr().unwrap()));
        close_fd(fd);
    }

    #[test]
    fn read_distinguishes_would_block_from_eof() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(read_nonblocking(a.as_raw_fd(), &mut buf).unwrap(), None);

        b.write_all(b"hi").unwrap();
        assert_eq!(read_nonblocking(a.as_raw_fd(), &mut buf).unwrap(), Some(2));
        drop(b);
        assert_eq!(read_nonblocking(a.as_raw_fd(), &mut buf).unwrap(), Some(0));
    }

    #[test]
    fn writev_gathers_segments() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let n = writev_nonblocking(a.as_raw_fd(), [b"head ", b"body"]).unwrap();
        assert_eq!(n, 9);
        let mut out = [0u8; 9];
        b.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"head body");

        let n = writev_nonblocking(a.as_raw_fd(), [&[], b"tail"]).unwrap();
        assert_eq!(n, 4, "an empty head segment is skipped");
        let mut out = [0u8; 4];
        b.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"tail");
    }

    #[test]
    fn pipe_is_non_blocking() {
        let (rx, tx) = create_pipe().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(read_nonblocking(rx.as_raw_fd(), &mut buf).unwrap(), None);
        assert!(write_byte(tx.as_raw_fd(), 14));
        assert_eq!(read_nonblocking(rx.as_raw_fd(), &mut buf).unwrap(), Some(1));
        assert_eq!(buf[0], 14);
    }

    #[test]
    fn one_shot_registration_fires_once_until_rearmed() {
        let epoll = Epoll::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        epoll.add(a.as_raw_fd(), 7, EPOLLIN, true).unwrap();

        let mut events = [epoll_event { events: 0, u64: 0 }; 4];
        b.write_all(b"x").unwrap();
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
        let token = events[0].u64;
        assert_eq!(token, 7);

        b.write_all(b"y").unwrap();
        assert_eq!(epoll.wait(&mut events, 20).unwrap(), 0);

        epoll.modify(a.as_raw_fd(), 7, EPOLLIN, true).unwrap();
        assert_eq!(epoll.wait(&mut events, 100).unwrap(), 1);
        epoll.delete(a.as_raw_fd()).unwrap();
        epoll.delete(a.as_raw_fd()).unwrap();
    }
}
