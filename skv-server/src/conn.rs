//! # Connection State
//!
//! Two views of a connection, split by thread:
//!
//! - [`Conn`] is the server-thread side: fd, owning fiber, and the last
//!   readiness mask the reactor delivered. Lives in a [`ConnTable`] slot
//!   whose index doubles as the epoll token.
//! - [`Registry`] is the cross-thread side: one mutex over the set of
//!   running flags and tracked sockets, so `stop()` can unwind workers
//!   from any thread. The lock is never held across a suspension point.

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use skv_fiber::FiberId;

/// Per-connection record owned by the server thread.
#[derive(Debug)]
pub struct Conn {
    /// The socket this connection reads and writes. For the acceptor's
    /// record this is the listening socket.
    pub fd: RawFd,
    /// Slot index in the [`ConnTable`]; also the epoll user datum.
    pub token: u64,
    /// Fiber that owns this connection; woken by the idle hook.
    pub fiber: Cell<Option<FiberId>>,
    /// Most recent readiness mask delivered by the reactor.
    pub events: Cell<u32>,
    /// Cleared by `stop()`, possibly from another thread.
    running: Arc<AtomicBool>,
}

impl Conn {
    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Server-thread table of live connections, indexed by token.
#[derive(Debug, Default)]
pub struct ConnTable {
    slots: Vec<Option<Rc<Conn>>>,
    free: Vec<usize>,
}

impl ConnTable {
    /// Allocates a slot and returns the new record.
    pub fn insert(&mut self, fd: RawFd, running: Arc<AtomicBool>) -> Rc<Conn> {
        let idx = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });

        let conn = Rc::new(Conn {
            fd,
            token: idx as u64,
            fiber: Cell::new(None),
            events: Cell::new(0),
            running,
        });
        self.slots[idx] = Some(Rc::clone(&conn));
        conn
    }

    pub fn get(&self, token: u64) -> Option<Rc<Conn>> {
        self.slots.get(token as usize).and_then(|slot| slot.clone())
    }

    pub fn remove(&mut self, token: u64) {
        let idx = token as usize;
        if idx < self.slots.len() && self.slots[idx].take().is_some() {
            self.free.push(idx);
        }
    }
}

/// Cross-thread entry: what `stop()` needs to unwind one connection.
#[derive(Debug)]
struct RegEntry {
    /// Socket to half-close on stop; `None` for the acceptor's record,
    /// whose listening socket stays open until the engine exits.
    fd: Option<RawFd>,
    running: Arc<AtomicBool>,
}

/// Process-wide connection registry guarded by one mutex.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<HashMap<u64, RegEntry>>,
}

impl Registry {
    /// Tracks a connection. `shutdown_on_stop` selects whether `stop_all`
    /// half-closes the socket.
    pub fn insert(&self, token: u64, fd: RawFd, shutdown_on_stop: bool, running: Arc<AtomicBool>) {
        let entry = RegEntry {
            fd: shutdown_on_stop.then_some(fd),
            running,
        };
        self.entries.lock().insert(token, entry);
    }

    pub fn remove(&self, token: u64) {
        self.entries.lock().remove(&token);
    }

    /// Clears every running flag and half-closes every tracked socket.
    ///
    /// Workers blocked in the reactor observe the flag on their next loop
    /// iteration; the shutdown makes their pending reads return.
    pub fn stop_all(&self) {
        let entries = self.entries.lock();
        for entry in entries.values() {
            entry.running.store(false, Ordering::Release);
            if let Some(fd) = entry.fd {
                unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
