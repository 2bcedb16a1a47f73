//! Nonblocking TCP plumbing over raw descriptors
//!
//! Everything here is created nonblocking and close-on-exec so a
//! descriptor can go straight into the poller. [`Listener`] and
//! [`Stream`] own their fd and close it on drop; the reactor never
//! closes descriptors itself. [`Acceptor`] adapts a listener to the
//! readiness-handle contract and spawns one handle per connection
//! through a caller-supplied factory.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use netplex_core::error::{ReactorError, ReactorResult};
use netplex_core::handle::{Disposition, EventScope, ReadinessHandle, RemoveDisposition, RemoveReason};
use netplex_core::{kdebug, kerror, ktrace, kwarn};

fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn os_last() -> ReactorError {
    ReactorError::Os(last_errno())
}

/// Result of one nonblocking read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes transferred
    Done(usize),
    /// The operation would block; wait for the next readiness report
    WouldBlock,
    /// The peer closed the stream (reads only)
    Closed,
}

/// A listening TCP socket
pub struct Listener {
    fd: RawFd,
}

impl Listener {
    /// Bind and listen on `addr:port`; port 0 picks an ephemeral port
    pub fn bind(addr: Ipv4Addr, port: u16, backlog: i32) -> ReactorResult<Listener> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(os_last());
        }
        // Owns the fd from here on; early returns close it.
        let listener = Listener { fd };

        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(os_last());
        }

        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = port.to_be();
        sin.sin_addr.s_addr = u32::from(addr).to_be();

        let rc = unsafe {
            libc::bind(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(os_last());
        }

        let rc = unsafe { libc::listen(fd, backlog) };
        if rc < 0 {
            return Err(os_last());
        }

        Ok(listener)
    }

    /// Accept one pending connection; `None` when the backlog is empty
    pub fn accept(&self) -> ReactorResult<Option<Stream>> {
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                return Ok(Some(Stream { fd }));
            }
            match last_errno() {
                libc::EINTR => continue,
                // The connection died in the backlog; try the next one.
                libc::ECONNABORTED => continue,
                libc::EAGAIN => return Ok(None),
                errno => return Err(ReactorError::Os(errno)),
            }
        }
    }

    /// Port actually bound, for ephemeral binds
    pub fn local_port(&self) -> ReactorResult<u16> {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(os_last());
        }
        Ok(u16::from_be(sin.sin_port))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A connected (or connecting) TCP stream
pub struct Stream {
    fd: RawFd,
}

impl Stream {
    /// Adopt an already-open descriptor; the stream closes it on drop
    pub fn from_raw(fd: RawFd) -> Stream {
        Stream { fd }
    }

    /// Start a nonblocking connect to `addr:port`
    ///
    /// Resolution arrives through the poller as writability; check
    /// [`socket_error`] there.
    pub fn connect(addr: Ipv4Addr, port: u16) -> ReactorResult<Stream> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(os_last());
        }
        let stream = Stream { fd };

        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = port.to_be();
        sin.sin_addr.s_addr = u32::from(addr).to_be();

        let rc = unsafe {
            libc::connect(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            match last_errno() {
                libc::EINPROGRESS => {}
                errno => return Err(ReactorError::Os(errno)),
            }
        }
        Ok(stream)
    }

    pub fn read(&self, buf: &mut [u8]) -> ReactorResult<IoOutcome> {
        loop {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                return Ok(IoOutcome::Done(n as usize));
            }
            if n == 0 {
                return Ok(IoOutcome::Closed);
            }
            match last_errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(IoOutcome::WouldBlock),
                errno => return Err(ReactorError::Os(errno)),
            }
        }
    }

    pub fn write(&self, buf: &[u8]) -> ReactorResult<IoOutcome> {
        loop {
            let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(IoOutcome::Done(n as usize));
            }
            match last_errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(IoOutcome::WouldBlock),
                errno => return Err(ReactorError::Os(errno)),
            }
        }
    }

    pub fn set_nodelay(&self, on: bool) -> ReactorResult<()> {
        let flag: libc::c_int = if on { 1 } else { 0 };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &flag as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(os_last());
        }
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Pending error on a socket, consumed from SO_ERROR
pub fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return last_errno();
    }
    err
}

/// Bytes queued for reading, from FIONREAD
pub fn bytes_readable(fd: RawFd) -> ReactorResult<usize> {
    let mut count: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count) };
    if rc < 0 {
        return Err(os_last());
    }
    Ok(count.max(0) as usize)
}

/// Builds one readiness handle per accepted connection
pub type ConnectionFactory = Box<dyn FnMut(Stream) -> Box<dyn ReadinessHandle> + Send>;

/// Permanent accept-mode handle wrapping a [`Listener`]
///
/// Each readiness report drains the whole backlog, deferring the new
/// connection handles through the scope. The factory decides what a
/// connection becomes.
pub struct Acceptor {
    name: String,
    listener: Listener,
    factory: ConnectionFactory,
    accepted: u64,
}

impl Acceptor {
    pub fn new(name: impl Into<String>, listener: Listener, factory: ConnectionFactory) -> Acceptor {
        Acceptor {
            name: name.into(),
            listener,
            factory,
            accepted: 0,
        }
    }

    /// Connections accepted over the acceptor's lifetime
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn local_port(&self) -> ReactorResult<u16> {
        self.listener.local_port()
    }
}

impl ReadinessHandle for Acceptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.listener.fd()
    }

    fn want_accept(&self) -> bool {
        true
    }

    fn is_permanent(&self) -> bool {
        true
    }

    fn on_accept(&mut self, scope: &mut EventScope) -> Disposition {
        loop {
            match self.listener.accept() {
                Ok(Some(stream)) => {
                    self.accepted += 1;
                    ktrace!("{}: accepted fd {}", self.name, stream.fd());
                    let handle = (self.factory)(stream);
                    scope.add(handle);
                }
                Ok(None) => break,
                Err(e) => {
                    kwarn!("{}: accept failed: {}", self.name, e);
                    break;
                }
            }
        }
        Disposition::Keep
    }

    fn on_error(&mut self, errno: i32, _scope: &mut EventScope) -> Disposition {
        kerror!("{}: listener error: errno {}", self.name, errno);
        Disposition::Remove
    }

    fn on_remove(&mut self, reason: RemoveReason, _scope: &mut EventScope) -> RemoveDisposition {
        kdebug!(
            "{}: removed ({}) after {} connections",
            self.name,
            reason,
            self.accepted
        );
        RemoveDisposition::Destroy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netplex_core::clock::MonotonicTime;
    use std::io::{Read as _, Write as _};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    fn retry<T>(mut f: impl FnMut() -> Option<T>) -> T {
        for _ in 0..2_000 {
            if let Some(v) = f() {
                return v;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for socket state");
    }

    fn pair() -> (Listener, TcpStream, Stream) {
        let listener = Listener::bind(Ipv4Addr::LOCALHOST, 0, 128).unwrap();
        let port = listener.local_port().unwrap();
        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let server = retry(|| listener.accept().unwrap());
        (listener, client, server)
    }

    #[test]
    fn test_bind_ephemeral_and_accept() {
        let listener = Listener::bind(Ipv4Addr::LOCALHOST, 0, 128).unwrap();
        let port = listener.local_port().unwrap();
        assert!(port > 0);

        // Nothing pending yet.
        assert!(listener.accept().unwrap().is_none());

        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let stream = retry(|| listener.accept().unwrap());
        assert!(stream.fd() >= 0);

        // Backlog drained again.
        assert!(listener.accept().unwrap().is_none());
    }

    #[test]
    fn test_stream_read_write() {
        let (_listener, mut client, server) = pair();

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = retry(|| match server.read(&mut buf).unwrap() {
            IoOutcome::Done(n) => Some(n),
            IoOutcome::WouldBlock => None,
            IoOutcome::Closed => panic!("unexpected close"),
        });
        assert_eq!(&buf[..n], b"ping");

        assert_eq!(server.write(b"pong").unwrap(), IoOutcome::Done(4));
        let mut echo = [0u8; 4];
        client.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"pong");
    }

    #[test]
    fn test_read_reports_peer_close() {
        let (_listener, client, server) = pair();
        drop(client);

        let mut buf = [0u8; 16];
        let outcome = retry(|| match server.read(&mut buf).unwrap() {
            IoOutcome::WouldBlock => None,
            other => Some(other),
        });
        assert_eq!(outcome, IoOutcome::Closed);
    }

    #[test]
    fn test_socket_error_is_clean_after_connect() {
        let (_listener, _client, server) = pair();
        assert_eq!(socket_error(server.fd()), 0);
    }

    #[test]
    fn test_bytes_readable_counts_queued_data() {
        let (_listener, mut client, server) = pair();
        assert_eq!(bytes_readable(server.fd()).unwrap(), 0);

        client.write_all(b"hello").unwrap();
        let queued = retry(|| {
            let n = bytes_readable(server.fd()).unwrap();
            if n > 0 {
                Some(n)
            } else {
                None
            }
        });
        assert_eq!(queued, 5);
    }

    #[test]
    fn test_nonblocking_connect_resolves() {
        let listener = Listener::bind(Ipv4Addr::LOCALHOST, 0, 128).unwrap();
        let port = listener.local_port().unwrap();

        let stream = Stream::connect(Ipv4Addr::LOCALHOST, port).unwrap();
        let _server = retry(|| listener.accept().unwrap());
        retry(|| {
            if socket_error(stream.fd()) == 0 {
                Some(())
            } else {
                None
            }
        });
        stream.set_nodelay(true).unwrap();
    }

    #[test]
    fn test_acceptor_spawns_handles_through_scope() {
        struct Stub {
            stream: Stream,
        }

        impl ReadinessHandle for Stub {
            fn name(&self) -> &str {
                "stub"
            }
            fn raw_fd(&self) -> RawFd {
                self.stream.fd()
            }
            fn want_read(&self) -> bool {
                true
            }
        }

        let listener = Listener::bind(Ipv4Addr::LOCALHOST, 0, 128).unwrap();
        let port = listener.local_port().unwrap();
        let factory: ConnectionFactory =
            Box::new(|stream| Box::new(Stub { stream }) as Box<dyn ReadinessHandle>);
        let mut acceptor = Acceptor::new("test-acceptor", listener, factory);

        let _c1 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let _c2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Let both connections land in the backlog.
        thread::sleep(Duration::from_millis(50));

        let mut scope = EventScope::new(MonotonicTime::ZERO);
        assert_eq!(acceptor.on_accept(&mut scope), Disposition::Keep);
        assert_eq!(acceptor.accepted(), 2);
        assert_eq!(scope.take_adds().len(), 2);
    }
}
