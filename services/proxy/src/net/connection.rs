//! Accepted client connections and their ownership transfer between reactors.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use super::bind_server::BindServer;
use super::flow::{FlowStats, NetFlowRecorder};

/// Identity and counters of a connection, detached from its socket.
///
/// Cloning is cheap; clones share the same counters.
#[derive(Clone)]
pub struct ConnectionInfo {
    id: Arc<str>,
    remote: SocketAddr,
    local: SocketAddr,
    stats: Arc<FlowStats>,
    server: Option<Arc<BindServer>>,
}

impl ConnectionInfo {
    pub fn new(remote: SocketAddr, local: SocketAddr, server: Option<Arc<BindServer>>) -> Self {
        Self {
            id: format!("{}/{}", remote, local).into(),
            remote,
            local,
            stats: Arc::new(FlowStats::new()),
            server,
        }
    }

    /// Stable id of the form `remote/local`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    /// The listener that accepted this connection, if any.
    pub fn server(&self) -> Option<&Arc<BindServer>> {
        self.server.as_ref()
    }
}

impl NetFlowRecorder for ConnectionInfo {
    fn inc_from_remote_bytes(&self, bytes: u64) {
        self.stats.inc_from_remote_bytes(bytes);
        if let Some(server) = &self.server {
            server.inc_from_remote_bytes(bytes);
        }
    }

    fn inc_to_remote_bytes(&self, bytes: u64) {
        self.stats.inc_to_remote_bytes(bytes);
        if let Some(server) = &self.server {
            server.inc_to_remote_bytes(bytes);
        }
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("id", &self.id)
            .field("server", &self.server.as_ref().map(|s| s.id()))
            .finish()
    }
}

/// A connection registered with the reactor that currently owns it.
pub struct Connection {
    info: ConnectionInfo,
    stream: TcpStream,
}

impl Connection {
    pub(crate) fn accepted(
        stream: TcpStream,
        remote: SocketAddr,
        server: Arc<BindServer>,
    ) -> io::Result<Self> {
        let local = stream.local_addr()?;
        Ok(Self {
            info: ConnectionInfo::new(remote, local, Some(server)),
            stream,
        })
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        self.info.id()
    }

    pub fn into_parts(self) -> (ConnectionInfo, TcpStream) {
        (self.info, self.stream)
    }

    /// Deregister from the current reactor so another one can adopt the socket.
    pub(crate) fn into_pending(self) -> io::Result<PendingConnection> {
        let stream = self.stream.into_std()?;
        Ok(PendingConnection {
            info: self.info,
            stream,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.info.id).finish()
    }
}

/// A connection in flight between two reactors; owned by neither.
pub(crate) struct PendingConnection {
    info: ConnectionInfo,
    stream: std::net::TcpStream,
}

impl PendingConnection {
    /// Register with the reactor running on the current thread.
    pub(crate) fn register(self) -> io::Result<Connection> {
        let stream = TcpStream::from_std(self.stream)?;
        Ok(Connection {
            info: self.info,
            stream,
        })
    }

    pub(crate) fn id(&self) -> &str {
        self.info.id()
    }
}
