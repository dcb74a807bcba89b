//! Interface-bound proxy assembly.
//!
//! `AutoConfig` resolves the bind address of a network interface once and
//! carries everything needed to run backend groups and CONNECT listeners on
//! it.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use relaygate_networking::{nic_address, IpType};
use tracing::info;

use crate::backend::{Discovery, GroupManager, HealthCheckConfig, Method};
use crate::error::Result;
use crate::net::{BindServer, EventLoopGroup};
use crate::proxy::{ConnectProxy, GroupConnectorProvider, ProxyOptions};

/// Immutable proxy configuration for one interface.
pub struct AutoConfig {
    acceptor: Arc<EventLoopGroup>,
    worker: Arc<EventLoopGroup>,
    discovery: Arc<dyn Discovery>,
    nic: String,
    ip_type: IpType,
    health_check: HealthCheckConfig,
    method: Method,
    bind_ip: IpAddr,
}

impl AutoConfig {
    /// Resolve the address of `nic` for `ip_type`.
    ///
    /// Fails with `InvalidInterface` when the interface has no such address.
    pub fn new(
        acceptor: Arc<EventLoopGroup>,
        worker: Arc<EventLoopGroup>,
        discovery: Arc<dyn Discovery>,
        nic: impl Into<String>,
        ip_type: IpType,
        health_check: HealthCheckConfig,
        method: Method,
    ) -> Result<Self> {
        let nic = nic.into();
        let bind_ip = nic_address(&nic, ip_type)?;
        info!(nic = %nic, ip_type = %ip_type, bind_ip = %bind_ip, "interface address resolved");

        Ok(Self {
            acceptor,
            worker,
            discovery,
            nic,
            ip_type,
            health_check,
            method,
            bind_ip,
        })
    }

    pub fn acceptor(&self) -> &Arc<EventLoopGroup> {
        &self.acceptor
    }

    pub fn worker(&self) -> &Arc<EventLoopGroup> {
        &self.worker
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    pub fn nic(&self) -> &str {
        &self.nic
    }

    pub fn ip_type(&self) -> IpType {
        self.ip_type
    }

    pub fn health_check(&self) -> &HealthCheckConfig {
        &self.health_check
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }

    pub fn bind_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_ip, port)
    }

    /// Create the group manager and subscribe it to discovery.
    pub async fn start_groups(&self) -> Result<Arc<GroupManager>> {
        let groups = Arc::new(GroupManager::new(self.method, self.health_check.clone()));
        groups.start(self.discovery.as_ref()).await?;
        Ok(groups)
    }

    /// Bind `port` on the interface and serve CONNECT tunnels to `groups`.
    pub fn start_proxy(
        &self,
        port: u16,
        groups: Arc<GroupManager>,
        connect_timeout: Duration,
        options: ProxyOptions,
    ) -> Result<ConnectProxy> {
        let server = Arc::new(BindServer::create(self.bind_addr(port))?);
        let provider = Arc::new(GroupConnectorProvider::with_timeout(groups, connect_timeout));
        ConnectProxy::start(
            &self.acceptor,
            Arc::clone(&self.worker),
            server,
            provider,
            options,
        )
    }
}

impl fmt::Debug for AutoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoConfig")
            .field("acceptor", &self.acceptor.alias())
            .field("worker", &self.worker.alias())
            .field("nic", &self.nic)
            .field("ip_type", &self.ip_type)
            .field("bind_ip", &self.bind_ip)
            .field("method", &self.method)
            .field("health_check", &self.health_check)
            .finish()
    }
}
