//! HTTP CONNECT proxy: listener, handshake, backend provisioning and relay.
//!
//! ```text
//! acceptor loop: BindServer accept -> workers.next().adopt(conn)
//! worker loop:   ProtocolDriver<HttpConnectProtocolHandler>
//!                  -> ConnectorOutcome -> detach -> relay
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn, Instrument};

use super::connector::ConnectorProvider;
use super::relay::relay;
use crate::error::Result;
use crate::net::{
    BindServer, Connection, ConnectionHandler, EventLoopGroup, NetEventLoop, ServerHandler,
};
use crate::protocol::http_connect::HttpConnectProtocolHandler;
use crate::protocol::{Detached, DriverEvent, ProtocolDriver};

/// Tunables for a running proxy.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    /// Close a tunnel when neither side sends anything for this long.
    pub idle_timeout: Option<Duration>,
}

struct AcceptHandler {
    workers: Arc<EventLoopGroup>,
    tunnel: Arc<TunnelHandler>,
}

impl ServerHandler for AcceptHandler {
    fn accepted(&self, _event_loop: &NetEventLoop, conn: Connection) {
        let id = conn.id().to_string();
        let worker = match self.workers.next() {
            Ok(worker) => worker,
            Err(e) => {
                warn!(connection = %id, error = %e, "no worker to adopt connection");
                return;
            }
        };
        if let Err(e) = worker.adopt(conn, Arc::clone(&self.tunnel) as Arc<dyn ConnectionHandler>) {
            warn!(connection = %id, worker = %worker.name(), error = %e, "failed to hand off connection");
        }
    }
}

struct TunnelHandler {
    handshake: Arc<HttpConnectProtocolHandler>,
    options: ProxyOptions,
}

impl ConnectionHandler for TunnelHandler {
    fn serve(
        self: Arc<Self>,
        event_loop: NetEventLoop,
        conn: Connection,
    ) -> LocalBoxFuture<'static, ()> {
        let span = tracing::info_span!("connection", id = %conn.id());
        async move { run_tunnel(&self, event_loop, conn).await }
            .instrument(span)
            .boxed_local()
    }
}

async fn run_tunnel(tunnel: &TunnelHandler, event_loop: NetEventLoop, conn: Connection) {
    let mut driver =
        match ProtocolDriver::attach(Arc::clone(&tunnel.handshake), conn, event_loop).await {
            Ok(driver) => driver,
            Err(e) => {
                debug!(error = %e, "connection failed during init");
                return;
            }
        };
    let Some(mut outcome) = driver
        .context_mut()
        .data
        .as_mut()
        .and_then(|data| data.take_outcome())
    else {
        return;
    };

    let result = loop {
        tokio::select! {
            result = &mut outcome => break result,
            event = driver.step() => match event {
                DriverEvent::Readable => continue,
                DriverEvent::End | DriverEvent::Exception => return,
            },
        }
    };

    let connector = match result {
        Ok(Ok(connector)) => connector,
        Ok(Err(e)) => {
            warn!(reason = e.reason_code(), error = %e, "tunnel setup failed");
            close(driver.detach().await).await;
            return;
        }
        Err(_) => {
            warn!("connector provider dropped the request");
            close(driver.detach().await).await;
            return;
        }
    };

    let target = driver
        .context()
        .data
        .as_ref()
        .and_then(|data| data.target())
        .map(|(host, port)| format!("{}:{}", host, port))
        .unwrap_or_default();

    match driver.detach().await {
        Detached::Closed => debug!("connection closed before relay"),
        Detached::Handover {
            connection,
            stream,
            leftover,
        } => {
            let backend = connector.remote();
            let idle_timeout = tunnel.options.idle_timeout;
            match relay(stream, &connection, leftover, connector, idle_timeout).await {
                Ok(stats) => debug!(
                    target = %target,
                    backend_addr = %backend,
                    bytes_to_backend = stats.bytes_to_backend,
                    bytes_from_backend = stats.bytes_from_backend,
                    "tunnel closed"
                ),
                Err(e) => debug!(target = %target, backend_addr = %backend, error = %e, "tunnel error"),
            }
        }
    }
}

async fn close(detached: Detached) {
    if let Detached::Handover { mut stream, .. } = detached {
        let _ = stream.shutdown().await;
    }
}

/// A running HTTP CONNECT proxy on one listener.
pub struct ConnectProxy {
    server: Arc<BindServer>,
    acceptor: NetEventLoop,
}

impl ConnectProxy {
    /// Attach `server` to a reactor of `acceptor`; accepted connections are
    /// served on `workers`.
    pub fn start(
        acceptor: &EventLoopGroup,
        workers: Arc<EventLoopGroup>,
        server: Arc<BindServer>,
        provider: Arc<dyn ConnectorProvider>,
        options: ProxyOptions,
    ) -> Result<Self> {
        let tunnel = Arc::new(TunnelHandler {
            handshake: Arc::new(HttpConnectProtocolHandler::new(provider)),
            options,
        });
        let event_loop = acceptor.next()?;
        event_loop.add_server(Arc::clone(&server), Arc::new(AcceptHandler { workers, tunnel }))?;

        info!(
            bind_addr = %server.local_addr(),
            acceptor = %event_loop.name(),
            "connect proxy started"
        );
        Ok(Self {
            server,
            acceptor: event_loop,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Arc<BindServer> {
        &self.server
    }

    /// Stop accepting without closing the listener.
    pub fn pause(&self) {
        self.acceptor.remove_server(&self.server);
    }

    /// Close the listener. Tunnels already established keep running.
    pub fn close(&self) {
        self.server.close();
    }
}
