//! # Epoll Reactor
//!
//! One edge-triggered epoll instance plus an eventfd used as the stop
//! signal. The reactor itself never decides anything: the engine's idle
//! hook calls [`Reactor::wait`] and translates readiness into fiber
//! wake-ups.

use std::io;
use std::os::unix::io::RawFd;

/// Token reserved for the stop eventfd.
pub const STOP_TOKEN: u64 = u64::MAX;

/// Interest mask for reads: data, peer half-close, and errors.
pub const READ_EVENTS: u32 = libc::EPOLLIN as u32
    | libc::EPOLLRDHUP as u32
    | libc::EPOLLERR as u32
    | libc::EPOLLHUP as u32
    | libc::EPOLLET as u32;

/// Interest mask for writes.
pub const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32
    | libc::EPOLLRDHUP as u32
    | libc::EPOLLERR as u32
    | libc::EPOLLHUP as u32
    | libc::EPOLLET as u32;

/// Readiness bits meaning "the peer is gone"; a reader makes one final
/// syscall when any of these arrive.
pub const HANGUP_EVENTS: u32 =
    libc::EPOLLRDHUP as u32 | libc::EPOLLERR as u32 | libc::EPOLLHUP as u32;

/// Readiness bits that abort an in-flight write.
pub const WRITE_ERROR_EVENTS: u32 = libc::EPOLLERR as u32 | libc::EPOLLHUP as u32;

pub(crate) fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

pub(crate) fn cvt_size(res: libc::ssize_t) -> io::Result<usize> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

/// Epoll instance and stop eventfd.
///
/// `wait` runs only on the server thread; `notify_stop` may be called from
/// any thread, which is why the type is shared behind an `Arc`.
#[derive(Debug)]
pub struct Reactor {
    epoll_fd: RawFd,
    event_fd: RawFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let event_fd = match cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })
        {
            Ok(fd) => fd,
            Err(err) => {
                unsafe { libc::close(epoll_fd) };
                return Err(err);
            }
        };

        let reactor = Reactor { epoll_fd, event_fd };
        // Level-triggered and never drained: once signalled, every later
        // wait returns immediately.
        reactor.register(event_fd, libc::EPOLLIN as u32, STOP_TOKEN)?;
        Ok(reactor)
    }

    /// Adds `fd` to the interest set under `token`.
    pub fn register(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        cvt(unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) })?;
        Ok(())
    }

    /// Removes `fd` from the interest set.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe {
            libc::epoll_ctl(
                self.epoll_fd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        })?;
        Ok(())
    }

    /// Blocks until readiness arrives; retries on EINTR.
    pub fn wait<'a>(
        &self,
        events: &'a mut [libc::epoll_event],
    ) -> io::Result<&'a [libc::epoll_event]> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    -1,
                )
            };
            if n >= 0 {
                return Ok(&events[..n as usize]);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Signals the stop token. Safe to call from any thread.
    pub fn notify_stop(&self) -> io::Result<()> {
        let value = 1u64.to_ne_bytes();
        cvt_size(unsafe {
            libc::write(
                self.event_fd,
                value.as_ptr() as *const libc::c_void,
                value.len(),
            )
        })?;
        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.event_fd);
            libc::close(self.epoll_fd);
        }
    }
}
