//! # Coroutine Server
//!
//! One dedicated OS thread runs the fiber engine: an acceptor fiber, one
//! worker fiber per connection, and an idle hook that performs the
//! `epoll_wait` round whenever every fiber is parked. The thread never
//! blocks anywhere else.
//!
//! Shutdown is cooperative: `stop()` clears the server and per-connection
//! running flags, half-closes every tracked client socket, and signals the
//! reactor's eventfd. Each fiber observes the flag on its next iteration
//! and unwinds; the engine exits once the last fiber returns.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::BytesMut;
use tracing::{debug, error, info, warn};

use skv_common::{ServerConfig, SkvError, SkvResult};
use skv_fiber::Engine;
use skv_store::Storage;

use crate::conn::{Conn, ConnTable, Registry};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::protocol::Parser;
use crate::reactor::{Reactor, STOP_TOKEN};
use crate::sock;

/// Worker read buffer size.
const READ_BUF: usize = 4096;

/// Events drained per `epoll_wait` round.
const MAX_EVENTS: usize = 64;

/// State shared between the server handle and the server thread.
struct Shared {
    running: AtomicBool,
    registry: Registry,
    reactor: Reactor,
    metrics: Metrics,
}

/// Server-thread state reachable from every fiber.
struct Inner<S> {
    engine: Engine,
    shared: Arc<Shared>,
    conns: RefCell<ConnTable>,
    store: RefCell<S>,
    listen_fd: RawFd,
}

impl<S> Inner<S> {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Creates the calling fiber's connection record and tracks it in the
    /// cross-thread registry.
    fn register_conn(&self, fd: RawFd, shutdown_on_stop: bool) -> Rc<Conn> {
        let running = Arc::new(AtomicBool::new(true));
        let conn = self.conns.borrow_mut().insert(fd, Arc::clone(&running));
        conn.fiber.set(Some(self.engine.current()));
        self.shared
            .registry
            .insert(conn.token, fd, shutdown_on_stop, running);
        conn
    }

    fn unregister_conn(&self, conn: &Conn) {
        self.shared.registry.remove(conn.token);
        self.conns.borrow_mut().remove(conn.token);
    }
}

/// Running server handle.
///
/// Dropping the handle stops the server and joins its thread.
pub struct Server {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds, installs the SIGPIPE mask, creates the reactor, and spawns
    /// the server thread. Setup failures surface synchronously.
    pub fn start<S>(config: ServerConfig, store: S) -> SkvResult<Server>
    where
        S: Storage + Send + 'static,
    {
        let addr: SocketAddr = config
            .addr
            .parse()
            .map_err(|_| SkvError::Config(format!("invalid listen address: {}", config.addr)))?;
        if config.stack_size < 16 * 1024 {
            return Err(SkvError::Config(
                "stack_size must be at least 16 KiB".to_string(),
            ));
        }
        if config.acceptors != 1 || config.workers != 1 {
            info!(
                acceptors = config.acceptors,
                workers = config.workers,
                "acceptor/worker counts are advisory; this server runs one \
                 acceptor and one fiber per connection"
            );
        }

        sock::mask_sigpipe()?;
        let (listen_fd, local_addr) = sock::bind_listener(&addr, config.backlog)?;
        let reactor = match Reactor::new() {
            Ok(reactor) => reactor,
            Err(err) => {
                sock::close_fd(listen_fd);
                return Err(err.into());
            }
        };

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            registry: Registry::default(),
            reactor,
            metrics: Metrics::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let stack_size = config.stack_size;
        let thread = std::thread::Builder::new()
            .name("skv-server".to_string())
            .spawn(move || run_engine(thread_shared, store, listen_fd, stack_size))
            .map_err(SkvError::Io)?;

        info!(addr = %local_addr, "server started");
        Ok(Server {
            shared,
            thread: Some(thread),
            local_addr,
        })
    }

    /// Actual bound address; resolves port 0 for tests.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the traffic counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Begins shutdown. Idempotent; safe to call from any thread.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!("stopping server");
            self.shared.registry.stop_all();
            if let Err(err) = self.shared.reactor.notify_stop() {
                error!(error = %err, "failed to signal the stop event");
            }
        }
    }

    /// Waits for the server thread. A fiber panic or reactor fatal becomes
    /// `SkvError::Engine`.
    pub fn join(&mut self) -> SkvResult<()> {
        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "server thread panicked".to_string());
                SkvError::Engine(message)
            })?;

            let snap = self.shared.metrics.snapshot();
            info!(
                connections = snap.connections_opened,
                commands = snap.commands_total,
                errors = snap.errors_total,
                "server stopped"
            );
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        let _ = self.join();
    }
}

/// Server thread body: build the engine, run acceptor + workers until the
/// engine drains, then release the listener.
fn run_engine<S>(shared: Arc<Shared>, store: S, listen_fd: RawFd, stack_size: usize)
where
    S: Storage + 'static,
{
    let engine = Engine::with_stack_size(stack_size);
    let inner = Rc::new(Inner {
        engine: engine.clone(),
        shared,
        conns: RefCell::new(ConnTable::default()),
        store: RefCell::new(store),
        listen_fd,
    });

    let accept_inner = Rc::clone(&inner);
    let idle_inner = Rc::clone(&inner);
    engine.start(
        move || accept_loop(accept_inner),
        move || idle_round(&idle_inner),
    );

    sock::close_fd(inner.listen_fd);
    debug!("server thread exiting");
}

/// One reactor round: wait for readiness and translate it into wake-ups.
///
/// The stop token wakes everything; every other token names a connection
/// slot whose fiber gets the event mask and a wake.
fn idle_round<S>(inner: &Inner<S>) {
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
    let ready = inner
        .shared
        .reactor
        .wait(&mut events)
        .expect("epoll_wait failed");

    for event in ready {
        let token = event.u64;
        let mask = event.events;
        if token == STOP_TOKEN {
            inner.engine.wake_all();
            continue;
        }
        let conn = inner.conns.borrow().get(token);
        if let Some(conn) = conn {
            conn.events.set(mask);
            if let Some(fiber) = conn.fiber.get() {
                inner.engine.wake(fiber);
            }
        }
    }
}

/// Accept fiber: one per server. Spawns a worker fiber per connection.
fn accept_loop<S>(inner: Rc<Inner<S>>)
where
    S: Storage + 'static,
{
    let conn = inner.register_conn(inner.listen_fd, false);
    debug!("acceptor ready");

    loop {
        match sock::co_accept(&inner.engine, &inner.shared.reactor, &conn, inner.listen_fd) {
            Ok((fd, peer)) => {
                if let Err(err) = sock::set_keepalive(fd) {
                    warn!(fd, error = %err, "failed to enable keepalive");
                }
                info!(fd, peer = %peer, "accepted connection");
                inner.shared.metrics.record_connection_opened();

                let worker = Rc::clone(&inner);
                inner.engine.spawn(move || worker_loop(worker, fd));
            }
            Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {
                debug!("acceptor unwinding for shutdown");
                break;
            }
            Err(err) => {
                error!(error = %err, "accept failed");
                break;
            }
        }
    }

    inner.unregister_conn(&conn);
}

/// Worker fiber: owns one client socket from accept to close.
fn worker_loop<S>(inner: Rc<Inner<S>>, fd: RawFd)
where
    S: Storage + 'static,
{
    let conn = inner.register_conn(fd, true);

    match serve_connection(&inner, &conn) {
        Ok(()) => debug!(fd, "connection closed"),
        Err(SkvError::Io(err)) if err.kind() == io::ErrorKind::ConnectionAborted => {
            debug!(fd, "connection unwound for shutdown");
        }
        Err(SkvError::Io(err)) => {
            warn!(fd, error = %err, "connection io error");
        }
        Err(err) => {
            // Parser or executor fault: answer SERVER_ERROR, then drop the
            // connection. The server itself keeps running.
            warn!(fd, error = %err, "terminating connection");
            inner.shared.metrics.record_error();
            let line = format!("{}\r\n", err.server_error_line());
            let _ = sock::co_write(&inner.engine, &inner.shared.reactor, &conn, line.as_bytes());
        }
    }

    inner.unregister_conn(&conn);
    sock::close_fd(fd);
    inner.shared.metrics.record_connection_closed();
}

/// Serial read → parse → execute → respond loop for one connection.
///
/// A single read can complete several commands; a command can span several
/// reads. The parser tracks the command line, `argument` accumulates the
/// declared payload plus its two-byte terminator.
fn serve_connection<S>(inner: &Inner<S>, conn: &Conn) -> SkvResult<()>
where
    S: Storage,
{
    let engine = &inner.engine;
    let reactor = &inner.shared.reactor;

    let mut parser = Parser::new();
    let mut pending: Option<(crate::execute::Command, usize)> = None;
    let mut argument = BytesMut::new();
    let mut buf = [0u8; READ_BUF];

    while inner.running() {
        let read = sock::co_read(engine, reactor, conn, &mut buf)?;
        if read == 0 {
            debug!(fd = conn.fd, "peer closed connection");
            return Ok(());
        }
        debug!(fd = conn.fd, bytes = read, "read from socket");
        inner.shared.metrics.add_bytes_read(read);

        let mut chunk = &buf[..read];
        while !chunk.is_empty() {
            if pending.is_none() {
                let (complete, consumed) = parser.parse(chunk)?;
                if complete {
                    let (command, arg_len) = parser.build()?;
                    debug!(fd = conn.fd, command = command.name(), "parsed command");
                    // Payload commands carry the declared bytes plus the
                    // trailing CRLF.
                    let needed = if arg_len > 0 { arg_len + 2 } else { 0 };
                    pending = Some((command, needed));
                    argument.clear();
                } else if consumed == 0 {
                    // No forward progress; wait for more bytes.
                    break;
                }
                chunk = &chunk[consumed..];
            }

            if let Some((_, needed)) = &pending {
                let needed = *needed;
                if argument.len() < needed {
                    let take = (needed - argument.len()).min(chunk.len());
                    argument.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                }
                if argument.len() == needed {
                    let (command, _) = pending.take().expect("pending command");
                    let arg = payload(&argument, needed)?;
                    let result = command.execute(&mut *inner.store.borrow_mut(), arg)?;
                    inner.shared.metrics.record_command();

                    let mut response = BytesMut::with_capacity(result.len() + 2);
                    response.extend_from_slice(&result);
                    response.extend_from_slice(b"\r\n");
                    sock::co_write(engine, reactor, conn, &response)?;
                    inner.shared.metrics.add_bytes_written(response.len());

                    argument.clear();
                    parser.reset();
                }
            }
        }
    }

    Ok(())
}

/// Strips and verifies the payload's CRLF terminator.
fn payload(argument: &[u8], needed: usize) -> SkvResult<&[u8]> {
    if needed == 0 {
        return Ok(&[]);
    }
    if &argument[needed - 2..] != b"\r\n" {
        return Err(SkvError::Protocol(
            "payload missing CRLF terminator".to_string(),
        ));
    }
    Ok(&argument[..needed - 2])
}
