//! Backend groups: members, health state and selection.
//!
//! The member list is an immutable snapshot behind an `ArcSwap`, so selection
//! never takes a lock shared with membership updates.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::discovery::BackendEndpoint;
use super::health::{prober_for, run_checker, HealthCheckConfig, Prober, TcpProber};
use super::method::{Method, Selector};
use crate::error::{ProxyError, Result};
use crate::net::{FlowStats, NetFlowRecorder};

/// Weight used when discovery does not provide one.
pub const DEFAULT_WEIGHT: u32 = 10;

/// One backend endpoint inside a group.
pub struct ServerHandle {
    alias: String,
    addr: SocketAddr,
    weight: u32,
    healthy: AtomicBool,
    active: AtomicUsize,
    stats: FlowStats,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    /// A new, unhealthy server.
    pub fn new(alias: impl Into<String>, addr: SocketAddr, weight: u32) -> Self {
        Self {
            alias: alias.into(),
            addr,
            weight,
            healthy: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            stats: FlowStats::new(),
            checker: Mutex::new(None),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Connections currently open to this server.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    /// Count one connection against this server until the guard drops.
    pub fn acquire(self: &Arc<Self>) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            server: Arc::clone(self),
        }
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    fn same_endpoint(&self, endpoint: &BackendEndpoint) -> bool {
        self.alias == endpoint.alias && self.addr == endpoint.addr && self.weight == endpoint.weight
    }

    fn start_checker(
        self: &Arc<Self>,
        group: &str,
        prober: Arc<dyn Prober>,
        config: HealthCheckConfig,
    ) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(group = %group, server = %self.alias, "no runtime for health checks; server stays down");
                return;
            }
        };
        let task = handle.spawn(run_checker(
            group.to_string(),
            Arc::downgrade(self),
            prober,
            config,
        ));
        if let Some(previous) = self.lock_checker().replace(task) {
            previous.abort();
        }
    }

    fn stop_checker(&self) {
        if let Some(task) = self.lock_checker().take() {
            task.abort();
        }
    }

    fn lock_checker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.checker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NetFlowRecorder for ServerHandle {
    fn inc_from_remote_bytes(&self, bytes: u64) {
        self.stats.inc_from_remote_bytes(bytes);
    }

    fn inc_to_remote_bytes(&self, bytes: u64) {
        self.stats.inc_to_remote_bytes(bytes);
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("alias", &self.alias)
            .field("addr", &self.addr)
            .field("weight", &self.weight)
            .field("healthy", &self.is_healthy())
            .field("active", &self.active_connections())
            .finish()
    }
}

/// Releases an active-connection slot on drop.
pub struct ActiveGuard {
    server: Arc<ServerHandle>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.server.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A named set of servers with a health-check policy and a selection method.
pub struct ServerGroup {
    alias: String,
    selector: Selector,
    health_check: HealthCheckConfig,
    prober: Option<Arc<dyn Prober>>,
    servers: ArcSwap<Vec<Arc<ServerHandle>>>,
    /// Serializes membership changes.
    update: Mutex<()>,
    closed: AtomicBool,
}

impl ServerGroup {
    pub fn new(alias: impl Into<String>, method: Method, health_check: HealthCheckConfig) -> Self {
        let alias = alias.into();
        let prober = prober_for(&health_check.protocol).unwrap_or_else(|e| {
            error!(group = %alias, error = %e, "health check client unavailable; using tcp checks");
            Some(Arc::new(TcpProber) as Arc<dyn Prober>)
        });
        Self {
            alias,
            selector: Selector::new(method),
            health_check,
            prober,
            servers: ArcSwap::from_pointee(Vec::new()),
            update: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn method(&self) -> Method {
        self.selector.method()
    }

    pub fn health_check(&self) -> &HealthCheckConfig {
        &self.health_check
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Add a server and start checking it.
    pub fn add(&self, alias: &str, addr: SocketAddr, weight: u32) -> Result<Arc<ServerHandle>> {
        if weight == 0 {
            return Err(ProxyError::Config(format!(
                "server {} in group {} has weight 0",
                alias, self.alias
            )));
        }
        let _update = self.lock_update();
        if self.is_closed() {
            return Err(ProxyError::Closed(format!("server group {}", self.alias)));
        }

        let current = self.servers.load();
        if current.iter().any(|s| s.alias() == alias) {
            return Err(ProxyError::Config(format!(
                "server {} already exists in group {}",
                alias, self.alias
            )));
        }

        let server = self.spawn_server(alias, addr, weight);
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&server));
        self.servers.store(Arc::new(next));

        info!(group = %self.alias, server = %alias, backend_addr = %addr, weight, "server added");
        Ok(server)
    }

    /// Remove a server by alias and stop its checker.
    pub fn remove(&self, alias: &str) -> bool {
        let _update = self.lock_update();
        let current = self.servers.load_full();
        let Some(removed) = current.iter().find(|s| s.alias() == alias).cloned() else {
            return false;
        };

        let next: Vec<_> = current
            .iter()
            .filter(|s| !Arc::ptr_eq(s, &removed))
            .cloned()
            .collect();
        self.servers.store(Arc::new(next));
        removed.stop_checker();
        self.selector.forget(alias);

        info!(group = %self.alias, server = %alias, "server removed");
        true
    }

    /// Make the member list match `endpoints`.
    ///
    /// Servers whose alias, address and weight are unchanged keep their
    /// health state and checker. Endpoints with weight 0 are skipped.
    pub fn replace(&self, endpoints: &[BackendEndpoint]) {
        let _update = self.lock_update();
        if self.is_closed() {
            return;
        }

        let current = self.servers.load_full();
        let mut existing: HashMap<&str, &Arc<ServerHandle>> =
            current.iter().map(|s| (s.alias(), s)).collect();

        let mut next = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if endpoint.weight == 0 {
                warn!(group = %self.alias, server = %endpoint.alias, "skipping server with weight 0");
                continue;
            }
            if next.iter().any(|s: &Arc<ServerHandle>| s.alias() == endpoint.alias) {
                warn!(group = %self.alias, server = %endpoint.alias, "duplicate server alias");
                continue;
            }
            match existing.remove(endpoint.alias.as_str()) {
                Some(server) if server.same_endpoint(endpoint) => next.push(Arc::clone(server)),
                stale => {
                    if let Some(server) = stale {
                        server.stop_checker();
                        self.selector.forget(server.alias());
                    }
                    next.push(self.spawn_server(&endpoint.alias, endpoint.addr, endpoint.weight));
                }
            }
        }

        for server in existing.values() {
            server.stop_checker();
            self.selector.forget(server.alias());
        }

        debug!(
            group = %self.alias,
            server_count = next.len(),
            removed = existing.len(),
            "replaced server list"
        );
        self.servers.store(Arc::new(next));
    }

    /// Snapshot of all members.
    pub fn servers(&self) -> Vec<Arc<ServerHandle>> {
        self.servers.load().iter().cloned().collect()
    }

    /// Snapshot of the members currently passing health checks.
    pub fn healthy_servers(&self) -> Vec<Arc<ServerHandle>> {
        self.servers
            .load()
            .iter()
            .filter(|s| s.is_healthy())
            .cloned()
            .collect()
    }

    /// Pick a healthy server for a connection from `source`.
    pub fn next(&self, source: Option<IpAddr>) -> Result<Arc<ServerHandle>> {
        let healthy = self.healthy_servers();
        self.selector
            .select(&healthy, source)
            .ok_or_else(|| ProxyError::NoHealthyBackend {
                group: self.alias.clone(),
            })
    }

    /// Stop all checkers and drop all members. Idempotent.
    pub fn close(&self) {
        let _update = self.lock_update();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let current = self.servers.swap(Arc::new(Vec::new()));
        for server in current.iter() {
            server.stop_checker();
        }
        debug!(group = %self.alias, "server group closed");
    }

    fn spawn_server(&self, alias: &str, addr: SocketAddr, weight: u32) -> Arc<ServerHandle> {
        let server = Arc::new(ServerHandle::new(alias, addr, weight));
        match &self.prober {
            Some(prober) => {
                server.start_checker(&self.alias, Arc::clone(prober), self.health_check.clone())
            }
            None => server.set_healthy(true),
        }
        server
    }

    fn lock_update(&self) -> std::sync::MutexGuard<'_, ()> {
        self.update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ServerGroup {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ServerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerGroup")
            .field("alias", &self.alias)
            .field("method", &self.method())
            .field("servers", &self.servers.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn endpoint(alias: &str, port: u16, weight: u32) -> BackendEndpoint {
        BackendEndpoint {
            service: "svc".to_string(),
            alias: alias.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            weight,
        }
    }

    #[test]
    fn test_add_remove() {
        let group = ServerGroup::new("svc", Method::RoundRobin, HealthCheckConfig::none());
        let a = group.add("a", "127.0.0.1:9001".parse().unwrap(), 10).unwrap();
        assert!(a.is_healthy());
        assert!(group.add("a", "127.0.0.1:9002".parse().unwrap(), 10).is_err());
        assert!(group.add("zero", "127.0.0.1:9003".parse().unwrap(), 0).is_err());

        assert_eq!(group.servers().len(), 1);
        assert!(group.remove("a"));
        assert!(!group.remove("a"));
        assert!(group.servers().is_empty());
    }

    #[test]
    fn test_next_without_healthy_servers() {
        let group = ServerGroup::new("svc", Method::WeightedRoundRobin, HealthCheckConfig::none());
        let err = group.next(None).unwrap_err();
        assert!(matches!(err, ProxyError::NoHealthyBackend { ref group } if group == "svc"));
    }

    #[test]
    fn test_selection_skips_unhealthy() {
        let group = ServerGroup::new("svc", Method::RoundRobin, HealthCheckConfig::none());
        let a = group.add("a", "127.0.0.1:9001".parse().unwrap(), 10).unwrap();
        group.add("b", "127.0.0.1:9002".parse().unwrap(), 10).unwrap();

        a.set_healthy(false);
        for _ in 0..4 {
            assert_eq!(group.next(None).unwrap().alias(), "b");
        }
        assert_eq!(group.healthy_servers().len(), 1);
    }

    #[test]
    fn test_replace_preserves_unchanged_servers() {
        let group = ServerGroup::new("svc", Method::RoundRobin, HealthCheckConfig::none());
        group.replace(&[endpoint("a", 9001, 10), endpoint("b", 9002, 10)]);
        let a = group
            .servers()
            .into_iter()
            .find(|s| s.alias() == "a")
            .unwrap();
        a.set_healthy(false);

        group.replace(&[
            endpoint("a", 9001, 10),
            endpoint("b", 9002, 20),
            endpoint("c", 9003, 0),
            endpoint("d", 9004, 10),
        ]);

        let servers = group.servers();
        let aliases: Vec<_> = servers.iter().map(|s| s.alias()).collect();
        assert_eq!(aliases, ["a", "b", "d"]);
        assert!(Arc::ptr_eq(&servers[0], &a));
        assert!(!servers[0].is_healthy());
        assert_eq!(servers[1].weight(), 20);
    }

    #[test]
    fn test_closed_group_rejects_servers() {
        let group = ServerGroup::new("svc", Method::RoundRobin, HealthCheckConfig::none());
        group.add("a", "127.0.0.1:9001".parse().unwrap(), 10).unwrap();
        group.close();
        group.close();
        assert!(group.servers().is_empty());
        assert!(matches!(
            group.add("b", "127.0.0.1:9002".parse().unwrap(), 10),
            Err(ProxyError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_checker_brings_server_up_and_down() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hc = HealthCheckConfig {
            period: Duration::from_millis(20),
            timeout: Duration::from_millis(200),
            up: 2,
            down: 2,
            ..HealthCheckConfig::default()
        };
        let group = ServerGroup::new("svc", Method::RoundRobin, hc);
        let server = group.add("a", addr, 10).unwrap();
        assert!(!server.is_healthy());

        wait_for(|| server.is_healthy()).await;
        drop(listener);
        wait_for(|| !server.is_healthy()).await;
        group.close();
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }
}
