//! Reactor threads.
//!
//! Each `NetEventLoop` is one OS thread driving a single-threaded tokio
//! runtime with a `LocalSet`. Every listener and connection it owns is
//! polled only from that thread, so callbacks for one connection never run
//! concurrently. Other threads talk to a loop through its command channel.
//!
//! ```text
//! acceptor loop: accept -> ServerHandler::accepted -> worker.adopt(conn)
//! worker loop:   Adopt -> register socket -> ConnectionHandler::serve
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn, Instrument};

use super::bind_server::BindServer;
use super::connection::{Connection, PendingConnection};
use crate::error::{ProxyError, Result};

/// Receives connections accepted on a listener.
///
/// Called on the reactor thread that owns the listener.
pub trait ServerHandler: Send + Sync + 'static {
    fn accepted(&self, event_loop: &NetEventLoop, conn: Connection);

    fn accept_failed(&self, server: &BindServer, err: &io::Error) {
        warn!(server = %server.id(), error = %err, "accept error");
    }
}

/// Drives one connection on the reactor that adopted it.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn serve(
        self: Arc<Self>,
        event_loop: NetEventLoop,
        conn: Connection,
    ) -> LocalBoxFuture<'static, ()>;
}

enum Command {
    AddServer {
        server: Arc<BindServer>,
        socket: std::net::TcpListener,
        handler: Arc<dyn ServerHandler>,
    },
    RemoveServer {
        id: String,
    },
    Adopt {
        conn: PendingConnection,
        handler: Arc<dyn ConnectionHandler>,
    },
    Close,
}

struct LoopInner {
    name: String,
    tx: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
    active_connections: AtomicUsize,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a reactor thread. Clones refer to the same reactor.
#[derive(Clone)]
pub struct NetEventLoop {
    inner: Arc<LoopInner>,
}

impl NetEventLoop {
    /// Start a new reactor thread.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        // The thread only learns its own handle after spawning.
        let (handle_tx, handle_rx) = std::sync::mpsc::channel::<Weak<LoopInner>>();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let Ok(weak) = handle_rx.recv() else {
                    return;
                };
                let local = LocalSet::new();
                local.block_on(&runtime, run(rx, weak));
            })?;

        let inner = Arc::new(LoopInner {
            name,
            tx,
            closed: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        });
        let _ = handle_tx.send(Arc::downgrade(&inner));

        debug!(event_loop = %inner.name, "event loop started");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Connections currently being served on this reactor.
    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    /// Start accepting on `server`; accepted connections go to `handler`.
    pub fn add_server(
        &self,
        server: Arc<BindServer>,
        handler: Arc<dyn ServerHandler>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let socket = server.attach(self)?;
        let command = Command::AddServer {
            server: Arc::clone(&server),
            socket,
            handler,
        };
        if let Err(e) = self.send(command) {
            server.detach(self);
            return Err(e);
        }
        Ok(())
    }

    /// Stop accepting on `server` without closing it or this reactor.
    pub fn remove_server(&self, server: &BindServer) {
        if server.detach(self) {
            self.release_server(server.id());
        }
    }

    /// Ask the reactor thread to drop its handle to a listener.
    pub(crate) fn release_server(&self, id: &str) {
        let _ = self.inner.tx.send(Command::RemoveServer { id: id.to_string() });
    }

    /// Transfer ownership of `conn` to this reactor and serve it with `handler`.
    pub fn adopt(&self, conn: Connection, handler: Arc<dyn ConnectionHandler>) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let conn = conn.into_pending()?;
        self.send(Command::Adopt { conn, handler })
    }

    /// Stop the reactor. Idempotent.
    ///
    /// Connections still owned by the reactor are torn down. Joins the thread
    /// unless called from the reactor itself.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.tx.send(Command::Close);
        if std::thread::current().id() == self.inner.thread_id {
            return;
        }
        let thread = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(event_loop = %self.inner.name, "event loop thread panicked");
            }
        }
        info!(event_loop = %self.inner.name, "event loop closed");
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner
            .tx
            .send(command)
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> ProxyError {
        ProxyError::Closed(format!("event loop {}", self.inner.name))
    }

    fn spawn_connection(&self, conn: Connection, handler: Arc<dyn ConnectionHandler>) {
        let inner = Arc::clone(&self.inner);
        inner.active_connections.fetch_add(1, Ordering::Relaxed);
        let serve = handler.serve(self.clone(), conn);
        tokio::task::spawn_local(async move {
            serve.await;
            inner.active_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

impl PartialEq for NetEventLoop {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for NetEventLoop {}

impl fmt::Debug for NetEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetEventLoop")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, weak: Weak<LoopInner>) {
    let mut servers: HashMap<String, (Arc<BindServer>, Arc<Notify>)> = HashMap::new();

    while let Some(command) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let this = NetEventLoop { inner };

        match command {
            Command::AddServer {
                server,
                socket,
                handler,
            } => match TcpListener::from_std(socket) {
                Ok(listener) => {
                    let stop = Arc::new(Notify::new());
                    let id = server.id().to_string();
                    if let Some((_, previous)) =
                        servers.insert(id.clone(), (Arc::clone(&server), Arc::clone(&stop)))
                    {
                        previous.notify_one();
                    }
                    debug!(event_loop = %this.name(), server = %id, "server added");
                    tokio::task::spawn_local(
                        accept_loop(this.clone(), server, listener, handler, stop)
                            .instrument(tracing::debug_span!("server", id = %id)),
                    );
                }
                Err(e) => {
                    error!(server = %server.id(), error = %e, "failed to register server");
                    server.detach(&this);
                }
            },
            Command::RemoveServer { id } => {
                if let Some((_, stop)) = servers.remove(&id) {
                    stop.notify_one();
                    debug!(event_loop = %this.name(), server = %id, "server removed");
                }
            }
            Command::Adopt { conn, handler } => {
                let id = conn.id().to_string();
                match conn.register() {
                    Ok(conn) => this.spawn_connection(conn, handler),
                    Err(e) => warn!(connection = %id, error = %e, "failed to adopt connection"),
                }
            }
            Command::Close => {
                for (_, (server, stop)) in servers.drain() {
                    server.detach(&this);
                    stop.notify_one();
                }
                break;
            }
        }
    }

    debug!("event loop stopped");
}

async fn accept_loop(
    event_loop: NetEventLoop,
    server: Arc<BindServer>,
    listener: TcpListener,
    handler: Arc<dyn ServerHandler>,
    stop: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = stop.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    if server.is_closed() {
                        break;
                    }
                    server.inc_history_accepted_connection_count();
                    match Connection::accepted(stream, peer_addr, Arc::clone(&server)) {
                        Ok(conn) => {
                            debug!(connection = %conn.id(), "connection accepted");
                            handler.accepted(&event_loop, conn);
                        }
                        Err(e) => debug!(peer_addr = %peer_addr, error = %e, "dropping accepted connection"),
                    }
                }
                Err(e) => {
                    handler.accept_failed(&server, &e);
                    if server.is_closed() {
                        break;
                    }
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

/// A set of reactors with round-robin placement.
pub struct EventLoopGroup {
    alias: String,
    loops: Vec<NetEventLoop>,
    cursor: AtomicUsize,
}

impl EventLoopGroup {
    /// Start `threads` reactors named `{alias}-{n}`.
    pub fn new(alias: impl Into<String>, threads: usize) -> Result<Self> {
        let alias = alias.into();
        if threads == 0 {
            return Err(ProxyError::Config(format!(
                "event loop group {} needs at least one thread",
                alias
            )));
        }

        let mut loops = Vec::with_capacity(threads);
        for i in 0..threads {
            match NetEventLoop::spawn(format!("{}-{}", alias, i)) {
                Ok(event_loop) => loops.push(event_loop),
                Err(e) => {
                    for started in &loops {
                        started.close();
                    }
                    return Err(e.into());
                }
            }
        }

        info!(group = %alias, threads, "event loop group started");
        Ok(Self {
            alias,
            loops,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn loops(&self) -> &[NetEventLoop] {
        &self.loops
    }

    /// Pick the reactor for the next connection, skipping closed ones.
    pub fn next(&self) -> Result<NetEventLoop> {
        let n = self.loops.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..n)
            .map(|i| &self.loops[(start + i) % n])
            .find(|l| !l.is_closed())
            .cloned()
            .ok_or_else(|| ProxyError::Closed(format!("event loop group {}", self.alias)))
    }

    /// Close every reactor in the group.
    pub fn close(&self) {
        for event_loop in &self.loops {
            event_loop.close();
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("alias", &self.alias)
            .field("loops", &self.loops.len())
            .finish()
    }
}
