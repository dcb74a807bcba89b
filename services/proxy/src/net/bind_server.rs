//! Listening sockets.
//!
//! A `BindServer` owns one bound, non-blocking listening socket for its whole
//! open lifetime. It is attached to at most one reactor at a time and, once
//! closed, stays closed.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::IntoRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use relaygate_networking::addr_id;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::event_loop::NetEventLoop;
use super::flow::{FlowStats, NetFlowRecorder};
use crate::error::{ProxyError, Result};

/// Listen backlog for created servers.
pub const DEFAULT_BACKLOG: i32 = 1024;

struct ServerState {
    socket: Option<TcpListener>,
    event_loop: Option<NetEventLoop>,
    closed: bool,
}

/// A bound listening socket with traffic counters.
pub struct BindServer {
    bind: SocketAddr,
    id: String,
    stats: FlowStats,
    // Written only by the owning reactor thread.
    history_accepted: AtomicU64,
    state: Mutex<ServerState>,
}

impl BindServer {
    /// Check that `addr` can be bound right now.
    ///
    /// Binds a throwaway socket and releases it immediately.
    pub fn check_bind(addr: SocketAddr) -> Result<()> {
        let bind_err = |source| ProxyError::Bind { addr, source };
        let probe = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        probe.bind(&addr.into()).map_err(bind_err)?;
        Ok(())
    }

    /// Open, bind and start listening on `addr`.
    ///
    /// Address and port reuse are enabled when the platform supports them.
    /// The socket is closed if any step after opening it fails.
    pub fn create(addr: SocketAddr) -> Result<Self> {
        let bind_err = |source| ProxyError::Bind { addr, source };
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;

        socket.set_nonblocking(true)?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!(bind_addr = %addr, error = %e, "SO_REUSEADDR not supported");
        }
        if let Err(e) = enable_reuse_port(&socket) {
            warn!(
                bind_addr = %addr,
                error = %e,
                "SO_REUSEPORT not supported, continuing in no-reuse mode"
            );
        }
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(DEFAULT_BACKLOG).map_err(bind_err)?;

        Self::from_listener(socket.into())
    }

    fn from_listener(socket: TcpListener) -> Result<Self> {
        let bind = socket.local_addr()?;
        let id = addr_id(&bind);
        debug!(server = %id, "server created");
        Ok(Self {
            bind,
            id,
            stats: FlowStats::new(),
            history_accepted: AtomicU64::new(0),
            state: Mutex::new(ServerState {
                socket: Some(socket),
                event_loop: None,
                closed: false,
            }),
        })
    }

    /// Listener id: `ip:port` of the bound address.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.bind
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// The reactor this server is attached to, if any.
    pub fn event_loop(&self) -> Option<NetEventLoop> {
        self.lock_state().event_loop.clone()
    }

    // --- statistics ---

    pub fn from_remote_bytes(&self) -> u64 {
        self.stats.from_remote_bytes()
    }

    pub fn to_remote_bytes(&self) -> u64 {
        self.stats.to_remote_bytes()
    }

    pub fn history_accepted_connection_count(&self) -> u64 {
        self.history_accepted.load(Ordering::Relaxed)
    }

    /// Only the owning reactor thread calls this; a plain load/store is enough.
    pub(crate) fn inc_history_accepted_connection_count(&self) {
        let n = self.history_accepted.load(Ordering::Relaxed);
        self.history_accepted.store(n + 1, Ordering::Relaxed);
    }

    // --- lifecycle ---

    /// Bind this server to `event_loop` and hand it a handle to the socket.
    pub(crate) fn attach(&self, event_loop: &NetEventLoop) -> Result<TcpListener> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(ProxyError::Closed(format!("BindServer({})", self.id)));
        }
        if let Some(current) = &state.event_loop {
            return Err(ProxyError::Config(format!(
                "BindServer({}) is already attached to event loop {}",
                self.id,
                current.name()
            )));
        }
        let socket = state
            .socket
            .as_ref()
            .ok_or_else(|| ProxyError::Closed(format!("BindServer({})", self.id)))?
            .try_clone()?;
        state.event_loop = Some(event_loop.clone());
        Ok(socket)
    }

    /// Forget the owning reactor if it is `event_loop`.
    pub(crate) fn detach(&self, event_loop: &NetEventLoop) -> bool {
        let mut state = self.lock_state();
        match &state.event_loop {
            Some(current) if current == event_loop => {
                state.event_loop = None;
                true
            }
            _ => false,
        }
    }

    /// Close the server. Idempotent and callable from any thread.
    ///
    /// The server is detached from its reactor before the socket is closed;
    /// the reactor releases its own handle on its thread.
    pub fn close(&self) {
        let (event_loop, socket) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.event_loop.take(), state.socket.take())
        };

        if let Some(event_loop) = event_loop {
            event_loop.release_server(&self.id);
        }
        if let Some(socket) = socket {
            close_socket(&self.id, socket);
        }
        debug!(server = %self.id, "server closed");
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NetFlowRecorder for BindServer {
    fn inc_from_remote_bytes(&self, bytes: u64) {
        self.stats.inc_from_remote_bytes(bytes);
    }

    fn inc_to_remote_bytes(&self, bytes: u64) {
        self.stats.inc_to_remote_bytes(bytes);
    }
}

impl Drop for BindServer {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for BindServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_closed() { "closed" } else { "open" };
        write!(f, "BindServer({})[{}]", self.id, state)
    }
}

impl fmt::Debug for BindServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(unix)]
fn enable_reuse_port(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(unix))]
fn enable_reuse_port(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

fn close_socket(id: &str, socket: TcpListener) {
    if let Err(e) = nix::unistd::close(socket.into_raw_fd()) {
        warn!(server = %id, error = %e, "error closing server socket");
    }
}
