//! Blocking-style TCP types for fiber code
//!
//! Thin wrappers that route every descriptor operation through the hook
//! layer, so fibers get a Go-flavored blocking API while the worker threads
//! stay free. Errors are raw errno values, matching the POSIX surface
//! underneath.

use crate::hook;

use libc::{c_int, c_void, socklen_t};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn sockaddr_from(addr: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sin
}

fn sockaddr_to(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    )
}

fn set_timeout(fd: c_int, optname: c_int, timeout: Option<Duration>) -> Result<(), i32> {
    let tv = match timeout {
        Some(d) => libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        },
        None => libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
    };
    let rt = hook::setsockopt(
        fd,
        libc::SOL_SOCKET,
        optname,
        &tv as *const libc::timeval as *const c_void,
        std::mem::size_of::<libc::timeval>() as socklen_t,
    );
    if rt != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// A listening TCP socket.
pub struct TcpListener {
    fd: c_int,
}

unsafe impl Send for TcpListener {}
unsafe impl Sync for TcpListener {}

impl TcpListener {
    /// Bind and listen; SO_REUSEADDR is set.
    pub fn bind(addr: SocketAddrV4) -> Result<Self, i32> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(last_errno());
        }

        let opt: c_int = 1;
        hook::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const c_int as *const c_void,
            std::mem::size_of::<c_int>() as socklen_t,
        );

        let sin = sockaddr_from(&addr);
        let rt = unsafe {
            libc::bind(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as socklen_t,
            )
        };
        if rt != 0 {
            let e = last_errno();
            hook::close(fd);
            return Err(e);
        }

        let rt = unsafe { libc::listen(fd, 1024) };
        if rt != 0 {
            let e = last_errno();
            hook::close(fd);
            return Err(e);
        }
        Ok(Self { fd })
    }

    /// The bound address (resolves the port of a `:0` bind).
    pub fn local_addr(&self) -> Result<SocketAddrV4, i32> {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let rt = unsafe {
            libc::getsockname(
                self.fd,
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rt != 0 {
            return Err(last_errno());
        }
        Ok(sockaddr_to(&sin))
    }

    /// Accept one connection, parking the calling fiber until a client
    /// arrives.
    pub fn accept(&self) -> Result<(TcpStream, SocketAddrV4), i32> {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = hook::accept(
            self.fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        );
        if fd < 0 {
            return Err(last_errno());
        }
        Ok((TcpStream { fd }, sockaddr_to(&sin)))
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

/// A connected TCP stream.
pub struct TcpStream {
    fd: c_int,
}

unsafe impl Send for TcpStream {}
unsafe impl Sync for TcpStream {}

impl TcpStream {
    /// Connect with the configured default timeout (`tcp.connect.timeout`).
    pub fn connect(addr: SocketAddrV4) -> Result<Self, i32> {
        Self::connect_inner(addr, None)
    }

    /// Connect with an explicit timeout.
    pub fn connect_timeout(addr: SocketAddrV4, timeout: Duration) -> Result<Self, i32> {
        Self::connect_inner(addr, Some(timeout))
    }

    fn connect_inner(addr: SocketAddrV4, timeout: Option<Duration>) -> Result<Self, i32> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(last_errno());
        }
        let sin = sockaddr_from(&addr);
        let sa = &sin as *const libc::sockaddr_in as *const libc::sockaddr;
        let salen = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;

        let rt = match timeout {
            Some(d) => hook::connect_with_timeout(fd, sa, salen, d.as_millis() as u64),
            None => hook::connect(fd, sa, salen),
        };
        if rt != 0 {
            let e = last_errno();
            hook::close(fd);
            return Err(e);
        }
        Ok(Self { fd })
    }

    /// Adopt an already-connected descriptor.
    pub fn from_raw(fd: c_int) -> Self {
        Self { fd }
    }

    /// Read once; `Ok(0)` is EOF.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, i32> {
        let n = hook::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if n < 0 {
            return Err(last_errno());
        }
        Ok(n as usize)
    }

    /// Write once; short writes are possible.
    pub fn write(&self, buf: &[u8]) -> Result<usize, i32> {
        let n = hook::write(self.fd, buf.as_ptr() as *const c_void, buf.len());
        if n < 0 {
            return Err(last_errno());
        }
        Ok(n as usize)
    }

    /// Write the whole buffer.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<(), i32> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(libc::EPIPE);
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Set (or clear) the receive deadline used by reads.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), i32> {
        set_timeout(self.fd, libc::SO_RCVTIMEO, timeout)
    }

    /// Set (or clear) the send deadline used by writes.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<(), i32> {
        set_timeout(self.fd, libc::SO_SNDTIMEO, timeout)
    }

    pub fn set_nodelay(&self, on: bool) -> Result<(), i32> {
        let opt: c_int = on as c_int;
        let rt = hook::setsockopt(
            self.fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const c_int as *const c_void,
            std::mem::size_of::<c_int>() as socklen_t,
        );
        if rt != 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    /// The remote peer's address.
    pub fn peer_addr(&self) -> Result<SocketAddrV4, i32> {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let rt = unsafe {
            libc::getpeername(
                self.fd,
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rt != 0 {
            return Err(last_errno());
        }
        Ok(sockaddr_to(&sin))
    }

    #[inline]
    pub fn fd(&self) -> c_int {
        self.fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}
