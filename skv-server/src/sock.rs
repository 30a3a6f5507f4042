//! # Suspending Socket I/O
//!
//! Coroutine-aware variants of `read`, `write` and `accept`. Each tries
//! the non-blocking syscall first; on `EAGAIN` it registers the socket
//! with the reactor, parks the calling fiber, and deregisters on resume.
//! To the worker the call looks blocking, while the thread keeps running
//! other fibers.
//!
//! Errors are explicit: `Ok(0)` from [`co_read`] is a clean peer close,
//! and a cleared `running` flag surfaces as `ConnectionAborted` so the
//! worker's outer loop can classify shutdown separately from real
//! failures.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use skv_fiber::Engine;

use crate::conn::Conn;
use crate::reactor::{
    cvt, cvt_size, Reactor, HANGUP_EVENTS, READ_EVENTS, WRITE_ERROR_EVENTS, WRITE_EVENTS,
};

/// Error returned by the wrappers when the server is stopping.
pub(crate) fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "server stopping")
}

/// Registers interest, parks the fiber, and deregisters on resume.
///
/// The readiness mask the reactor delivered while we were parked is left
/// in `conn.events` for the caller to inspect.
fn block_on(
    engine: &Engine,
    reactor: &Reactor,
    conn: &Conn,
    fd: RawFd,
    events: u32,
) -> io::Result<()> {
    reactor.register(fd, events, conn.token)?;
    conn.events.set(0);
    engine.block();
    reactor.deregister(fd)?;
    Ok(())
}

/// Reads into `buf`, parking the fiber until the socket is readable.
///
/// Returns `Ok(0)` on clean peer close. After a hangup notification one
/// final read drains whatever the kernel still buffers.
pub fn co_read(
    engine: &Engine,
    reactor: &Reactor,
    conn: &Conn,
    buf: &mut [u8],
) -> io::Result<usize> {
    while conn.running() {
        match nb_read(conn.fd, buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                block_on(engine, reactor, conn, conn.fd, READ_EVENTS)?;
                if conn.events.get() & HANGUP_EVENTS != 0 {
                    return nb_read(conn.fd, buf);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Err(stopped())
}

/// Writes all of `buf`, parking the fiber whenever the socket is full.
///
/// Partial writes accumulate; the call returns only once every byte is
/// out or the peer is gone.
pub fn co_write(engine: &Engine, reactor: &Reactor, conn: &Conn, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while conn.running() {
        match nb_write(conn.fd, &buf[written..]) {
            Ok(n) => {
                written += n;
                if written == buf.len() {
                    return Ok(written);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }

        block_on(engine, reactor, conn, conn.fd, WRITE_EVENTS)?;
        if conn.events.get() & WRITE_ERROR_EVENTS != 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer hung up mid-write",
            ));
        }
    }
    Err(stopped())
}

/// Accepts one connection, parking the fiber until the listener is ready.
///
/// Accepted sockets come back non-blocking and close-on-exec.
pub fn co_accept(
    engine: &Engine,
    reactor: &Reactor,
    conn: &Conn,
    listen_fd: RawFd,
) -> io::Result<(RawFd, SocketAddr)> {
    while conn.running() {
        match nb_accept(listen_fd) {
            Ok(accepted) => return Ok(accepted),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                block_on(engine, reactor, conn, listen_fd, READ_EVENTS)?;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            // The peer gave up between SYN and accept; not our problem.
            Err(err) if err.raw_os_error() == Some(libc::ECONNABORTED) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(stopped())
}

fn nb_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
}

fn nb_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
}

fn nb_accept(listen_fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = cvt(unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    Ok((fd, sockaddr_to_addr(&storage)))
}

/// Enables TCP keepalive on an accepted socket.
pub fn set_keepalive(fd: RawFd) -> io::Result<()> {
    let opt: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &opt as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Closes a descriptor, swallowing errors; used on cleanup paths only.
pub fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// Blocks SIGPIPE for the calling thread (inherited by threads it spawns),
/// so a write to a dead peer fails with EPIPE instead of killing the
/// process.
pub fn mask_sigpipe() -> io::Result<()> {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        cvt(libc::sigemptyset(&mut mask))?;
        cvt(libc::sigaddset(&mut mask, libc::SIGPIPE))?;
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

/// Creates the non-blocking listening socket: bind, keepalive, reuseaddr,
/// and the configured backlog. Returns the descriptor and the actual
/// bound address (port 0 resolves here).
pub fn bind_listener(addr: &SocketAddr, backlog: i32) -> io::Result<(RawFd, SocketAddr)> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = cvt(unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;

    let result = (|| -> io::Result<SocketAddr> {
        let opt: libc::c_int = 1;
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        set_keepalive(fd)?;

        let (storage, len) = addr_to_sockaddr(addr);
        cvt(unsafe {
            libc::bind(
                fd,
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        })?;
        cvt(unsafe { libc::listen(fd, backlog) })?;

        let mut bound: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut bound_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockname(
                fd,
                &mut bound as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut bound_len,
            )
        })?;
        Ok(sockaddr_to_addr(&bound))
    })();

    match result {
        Ok(bound) => Ok((fd, bound)),
        Err(err) => {
            close_fd(fd);
            Err(err)
        }
    }
}

fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> SocketAddr {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // Safety: family says the storage holds a sockaddr_in.
            let sin: &libc::sockaddr_in =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 => {
            // Safety: family says the storage holds a sockaddr_in6.
            let sin6: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            ))
        }
        _ => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
    }
}
