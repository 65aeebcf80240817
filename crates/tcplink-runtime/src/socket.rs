//! Sockets: listener setup and the per-connection stream wrapper
//!
//! The listener is created with raw `libc` calls so the backlog and the
//! reuse options are under our control, then handed to `std` as a
//! `TcpListener`. Readiness waits use `poll(2)` through `nix`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

const READ_BUFFER_SIZE: usize = 8 * 1024;

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

// ============================================================================
// Listener
// ============================================================================

/// socket + SO_REUSEADDR + bind + listen(backlog)
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(last_os_error());
    }

    // From here on the listener owns the fd and closes it on error
    let listener = unsafe { TcpListener::from_raw_fd(fd) };

    let opt: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of_val(&opt) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(last_os_error());
    }

    let ret = match addr {
        SocketAddr::V4(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            unsafe {
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    std::mem::size_of_val(&sin) as libc::socklen_t,
                )
            }
        }
        SocketAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            unsafe {
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    std::mem::size_of_val(&sin6) as libc::socklen_t,
                )
            }
        }
    };
    if ret != 0 {
        return Err(last_os_error());
    }

    set_backlog(&listener, backlog)?;
    Ok(listener)
}

/// Re-issue listen(2). A backlog of 0 stops queueing new connections.
pub fn set_backlog(listener: &TcpListener, backlog: i32) -> io::Result<()> {
    let ret = unsafe { libc::listen(listener.as_raw_fd(), backlog) };
    if ret != 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Wake every thread blocked in accept(2) on this listener
pub fn shutdown_listener(listener: &TcpListener) {
    unsafe {
        libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR);
    }
}

// ============================================================================
// Readiness
// ============================================================================

pub(crate) fn poll_slice(remaining: Duration) -> PollTimeout {
    let ms = (remaining.as_micros() + 999) / 1000;
    PollTimeout::from(ms.min(u16::MAX as u128) as u16)
}

/// Wait until `fd` is readable (or hung up). False on timeout.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];

        match poll(&mut fds, poll_slice(remaining)) {
            Ok(0) => {
                if remaining.is_zero() || Instant::now() >= deadline {
                    return Ok(false);
                }
            }
            Ok(_) => {
                let ready = fds[0].revents().unwrap_or(PollFlags::empty());
                return Ok(ready.intersects(
                    PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                ));
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

/// Non-blocking check whether the peer has closed its side
pub fn is_read_eof(stream: &TcpStream) -> bool {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];

    match poll(&mut fds, PollTimeout::from(0u16)) {
        Ok(0) => false,
        Ok(_) => {
            let ready = fds[0].revents().unwrap_or(PollFlags::empty());
            if ready.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                return true;
            }
            let mut probe = [0u8; 1];
            matches!(stream.peek(&mut probe), Ok(0) | Err(_))
        }
        Err(_) => false,
    }
}

// ============================================================================
// LinkSocket
// ============================================================================

/// TLS session details supplied by an outer TLS layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub cipher_suite: String,
    pub key_size: u32,
}

/// Accepted connection with a read-ahead buffer and byte counters
#[derive(Debug)]
pub struct LinkSocket {
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    read_total: u64,
    consumed_total: u64,
    write_total: u64,
    tls: Option<TlsInfo>,
}

impl LinkSocket {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> io::Result<Self> {
        let local = stream.local_addr()?;
        Ok(Self {
            stream,
            peer,
            local,
            buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
            read_total: 0,
            consumed_total: 0,
            write_total: 0,
            tls: None,
        })
    }

    /// Apply per-connection options
    pub fn configure(&self, timeout: Duration, nodelay: bool) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))?;
        self.stream.set_nodelay(nodelay)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub fn cipher_suite(&self) -> Option<&str> {
        self.tls.as_ref().map(|t| t.cipher_suite.as_str())
    }

    pub fn cipher_key_size(&self) -> Option<u32> {
        self.tls.as_ref().map(|t| t.key_size)
    }

    pub fn set_tls_info(&mut self, tls: TlsInfo) {
        self.tls = Some(tls);
    }

    /// Bytes buffered and not yet consumed
    #[inline]
    pub fn available(&self) -> usize {
        self.end - self.start
    }

    /// Buffered bytes
    #[inline]
    pub fn buffer(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Mark `n` buffered bytes as consumed
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.available());
        self.start += n;
        self.consumed_total += n as u64;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Total bytes consumed by the reader. Stall detection compares this
    /// across read cycles.
    #[inline]
    pub fn position(&self) -> u64 {
        self.consumed_total
    }

    pub fn read_total(&self) -> u64 {
        self.read_total
    }

    pub fn write_total(&self) -> u64 {
        self.write_total
    }

    /// One blocking read into the buffer. `Ok(0)` is end of stream.
    pub fn fill(&mut self) -> io::Result<usize> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "read buffer full"));
        }

        loop {
            match self.stream.read(&mut self.buf[self.end..]) {
                Ok(n) => {
                    self.end += n;
                    self.read_total += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait up to `timeout` for data. Returns the bytes available, `Ok(0)` at
    /// end of stream, or a `TimedOut` error.
    pub fn fill_with_timeout(&mut self, timeout: Duration) -> io::Result<usize> {
        if self.available() > 0 {
            return Ok(self.available());
        }

        if !wait_readable(self.stream.as_fd(), timeout)? {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }

        match self.fill() {
            Ok(0) => Ok(0),
            Ok(_) => Ok(self.available()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(io::Error::from(io::ErrorKind::TimedOut))
            }
            Err(e) => Err(e),
        }
    }

    /// Read one `\n`-terminated line (terminator stripped). `None` at end of
    /// stream with nothing buffered.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buffer().iter().position(|&b| b == b'\n') {
                let line = String::from_utf8_lossy(&self.buffer()[..pos])
                    .trim_end_matches('\r')
                    .to_string();
                self.consume(pos + 1);
                return Ok(Some(line));
            }

            if self.fill()? == 0 {
                if self.available() == 0 {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
        }
    }

    pub(crate) fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Read for LinkSocket {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.available() == 0 && self.fill()? == 0 {
            return Ok(0);
        }
        let n = out.len().min(self.available());
        out[..n].copy_from_slice(&self.buffer()[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl Write for LinkSocket {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.stream.write(data)?;
        self.write_total += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn pair() -> (LinkSocket, TcpStream) {
        let listener =
            bind_listener(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), 16).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        (LinkSocket::new(stream, peer).unwrap(), client)
    }

    #[test]
    fn test_bind_ephemeral() {
        let listener =
            bind_listener(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), 16).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_fill_with_timeout() {
        let (mut socket, mut client) = pair();

        let err = socket.fill_with_timeout(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        client.write_all(b"ping\n").unwrap();
        let n = socket.fill_with_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(n, 5);
        assert_eq!(socket.read_line().unwrap().as_deref(), Some("ping"));
        assert_eq!(socket.position(), 5);

        drop(client);
        assert_eq!(socket.fill_with_timeout(Duration::from_secs(2)).unwrap(), 0);
    }

    #[test]
    fn test_read_eof_probe() {
        let (socket, client) = pair();
        let control = socket.try_clone_stream().unwrap();
        assert!(!is_read_eof(&control));

        drop(client);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !is_read_eof(&control) {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_counters() {
        let (mut socket, mut client) = pair();
        socket.write_all(b"hello").unwrap();
        assert_eq!(socket.write_total(), 5);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(!socket.is_secure());
        assert_eq!(socket.cipher_suite(), None);
    }
}
