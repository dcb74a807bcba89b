//! Outbound connections to backends and the providers that create them.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::{ActiveGuard, GroupManager, ServerGroup, ServerHandle};
use crate::error::{ProxyError, Result};
use crate::net::{ConnectionInfo, FlowStats, NetFlowRecorder};

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Completion handle passed to a provider. Consumed when it fires.
pub type ConnectorCallback = oneshot::Sender<Result<Connector>>;

/// Receiving side of a `ConnectorCallback`.
pub type ConnectorOutcome = oneshot::Receiver<Result<Connector>>;

/// Supplies backend connections for negotiated tunnels.
///
/// `provide` must return immediately and eventually send exactly one result
/// on `on_ready`.
pub trait ConnectorProvider: Send + Sync + 'static {
    fn provide(
        &self,
        connection: &ConnectionInfo,
        host: &str,
        port: u16,
        on_ready: ConnectorCallback,
    );
}

/// Traffic accounting for the backend side of a tunnel.
///
/// Holds the selected server's active-connection slot until dropped.
pub struct ConnectorLink {
    stats: Arc<FlowStats>,
    server: Option<Arc<ServerHandle>>,
    _active: Option<ActiveGuard>,
}

impl ConnectorLink {
    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    pub fn server(&self) -> Option<&Arc<ServerHandle>> {
        self.server.as_ref()
    }
}

impl NetFlowRecorder for ConnectorLink {
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

/// An established connection to a backend.
pub struct Connector {
    remote: SocketAddr,
    stream: TcpStream,
    link: ConnectorLink,
}

impl Connector {
    /// Connect to `addr` within `connect_timeout`.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self> {
        let stream = connect_with_timeout(addr, connect_timeout).await?;
        Ok(Self {
            remote: addr,
            stream,
            link: ConnectorLink {
                stats: Arc::new(FlowStats::new()),
                server: None,
                _active: None,
            },
        })
    }

    /// Connect to a group member, counting the connection against it.
    pub async fn connect_server(
        server: &Arc<ServerHandle>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let active = server.acquire();
        let stream = connect_with_timeout(server.addr(), connect_timeout).await?;
        Ok(Self {
            remote: server.addr(),
            stream,
            link: ConnectorLink {
                stats: Arc::new(FlowStats::new()),
                server: Some(Arc::clone(server)),
                _active: Some(active),
            },
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn stats(&self) -> &FlowStats {
        self.link.stats()
    }

    /// The group member this connector was selected from, if any.
    pub fn server(&self) -> Option<&Arc<ServerHandle>> {
        self.link.server()
    }

    pub fn into_parts(self) -> (TcpStream, ConnectorLink) {
        (self.stream, self.link)
    }
}

impl NetFlowRecorder for Connector {
    fn inc_from_remote_bytes(&self, bytes: u64) {
        self.link.inc_from_remote_bytes(bytes);
    }

    fn inc_to_remote_bytes(&self, bytes: u64) {
        self.link.inc_to_remote_bytes(bytes);
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("remote", &self.remote)
            .field("server", &self.link.server.as_ref().map(|s| s.alias()))
            .finish()
    }
}

async fn connect_with_timeout(addr: SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    debug!(backend_addr = %addr, "connecting to backend");
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(backend_addr = %addr, error = %e, "failed to set TCP_NODELAY");
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(ProxyError::ConnectorFailure {
            target: addr.to_string(),
            detail: e.to_string(),
        }),
        Err(_) => Err(ProxyError::ConnectorFailure {
            target: addr.to_string(),
            detail: "connect timeout".to_string(),
        }),
    }
}

/// Run `provision` on the current runtime and deliver its result.
fn dispatch<F>(on_ready: ConnectorCallback, provision: F)
where
    F: Future<Output = Result<Connector>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = on_ready.send(provision.await);
            });
        }
        Err(_) => {
            let _ = on_ready.send(Err(ProxyError::Closed("connector runtime".to_string())));
        }
    }
}

/// Selects a healthy member of the backend group registered for the target.
pub struct GroupConnectorProvider {
    groups: Arc<GroupManager>,
    connect_timeout: Duration,
}

impl GroupConnectorProvider {
    pub fn new(groups: Arc<GroupManager>) -> Self {
        Self::with_timeout(groups, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(groups: Arc<GroupManager>, connect_timeout: Duration) -> Self {
        Self {
            groups,
            connect_timeout,
        }
    }
}

impl ConnectorProvider for GroupConnectorProvider {
    fn provide(
        &self,
        connection: &ConnectionInfo,
        host: &str,
        port: u16,
        on_ready: ConnectorCallback,
    ) {
        let groups = Arc::clone(&self.groups);
        let connect_timeout = self.connect_timeout;
        let host = host.to_string();
        let source = connection.remote().ip();

        dispatch(on_ready, async move {
            let service = format!("{}:{}", host, port);
            let group = match groups.group(&service).await {
                Some(group) => group,
                None => groups
                    .group(&host)
                    .await
                    .ok_or(ProxyError::NoHealthyBackend { group: service })?,
            };
            connect_group(&group, source, connect_timeout).await
        });
    }
}

/// Connect to the member chosen by the group's method, failing over to the
/// remaining healthy members in order.
pub async fn connect_group(
    group: &ServerGroup,
    source: IpAddr,
    connect_timeout: Duration,
) -> Result<Connector> {
    let first = group.next(Some(source))?;
    let mut candidates = vec![Arc::clone(&first)];
    candidates.extend(
        group
            .healthy_servers()
            .into_iter()
            .filter(|s| !Arc::ptr_eq(s, &first)),
    );

    let mut last_error = None;
    for server in candidates {
        match Connector::connect_server(&server, connect_timeout).await {
            Ok(connector) => {
                debug!(group = %group.alias(), server = %server.alias(), "backend connected");
                return Ok(connector);
            }
            Err(e) => {
                warn!(
                    group = %group.alias(),
                    server = %server.alias(),
                    backend_addr = %server.addr(),
                    error = %e,
                    "backend connection failed"
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or(ProxyError::NoHealthyBackend {
        group: group.alias().to_string(),
    }))
}

/// Resolves the target itself and connects to it directly.
pub struct DirectConnectorProvider {
    connect_timeout: Duration,
}

impl DirectConnectorProvider {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DirectConnectorProvider {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl ConnectorProvider for DirectConnectorProvider {
    fn provide(
        &self,
        _connection: &ConnectionInfo,
        host: &str,
        port: u16,
        on_ready: ConnectorCallback,
    ) {
        let connect_timeout = self.connect_timeout;
        // Bracketed IPv6 literals arrive with their brackets.
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        dispatch(on_ready, async move {
            let target = format!("{}:{}", host, port);
            let addrs = tokio::net::lookup_host((host.as_str(), port))
                .await
                .map_err(|e| ProxyError::ConnectorFailure {
                    target: target.clone(),
                    detail: e.to_string(),
                })?;

            let mut last_error = None;
            for addr in addrs {
                match Connector::connect(addr, connect_timeout).await {
                    Ok(connector) => return Ok(connector),
                    Err(e) => last_error = Some(e),
                }
            }
            Err(last_error.unwrap_or(ProxyError::ConnectorFailure {
                target,
                detail: "no address resolved".to_string(),
            }))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HealthCheckConfig, Method};
    use tokio::net::TcpListener;

    fn client_info() -> ConnectionInfo {
        ConnectionInfo::new(
            "127.0.0.1:45000".parse().unwrap(),
            "127.0.0.1:18080".parse().unwrap(),
            None,
        )
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_connect_timeout_maps_to_connector_failure() {
        let addr = closed_port().await;
        let err = Connector::connect(addr, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "connector_failure");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_direct_provider_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, rx) = oneshot::channel();
        DirectConnectorProvider::default().provide(&client_info(), "127.0.0.1", port, tx);

        let connector = rx.await.unwrap().unwrap();
        assert_eq!(connector.remote().port(), port);
        assert!(connector.server().is_none());
    }

    #[test]
    fn test_provider_without_runtime_reports_error() {
        let (tx, mut rx) = oneshot::channel();
        DirectConnectorProvider::default().provide(&client_info(), "127.0.0.1", 1, tx);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::Closed(_)));
    }

    #[tokio::test]
    async fn test_group_failover_and_active_accounting() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = closed_port().await;

        let group = ServerGroup::new("svc", Method::RoundRobin, HealthCheckConfig::none());
        group.add("dead", dead, 10).unwrap();
        let alive = group.add("live", live.local_addr().unwrap(), 10).unwrap();

        for _ in 0..2 {
            let source = "10.0.0.1".parse().unwrap();
            let connector = connect_group(&group, source, Duration::from_millis(500))
                .await
                .unwrap();
            assert_eq!(connector.server().unwrap().alias(), "live");
            assert_eq!(alive.active_connections(), 1);
            drop(connector);
            assert_eq!(alive.active_connections(), 0);
        }
        group.close();
    }

    #[tokio::test]
    async fn test_group_without_healthy_servers() {
        let group = ServerGroup::new("empty", Method::RoundRobin, HealthCheckConfig::none());
        let err = connect_group(&group, "10.0.0.1".parse().unwrap(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoHealthyBackend { .. }));
    }

    #[tokio::test]
    async fn test_group_provider_unknown_service() {
        let groups = Arc::new(GroupManager::new(Method::RoundRobin, HealthCheckConfig::none()));
        let (tx, rx) = oneshot::channel();
        let provider = GroupConnectorProvider::new(Arc::clone(&groups));
        provider.provide(&client_info(), "nowhere", 443, tx);
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "no healthy backend in group nowhere:443");
        groups.close().await;
    }
}
