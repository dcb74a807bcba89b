//! One `ServerGroup` per discovered service, kept in sync with discovery.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::discovery::{BackendEndpoint, Discovery};
use super::group::ServerGroup;
use super::health::HealthCheckConfig;
use super::method::Method;
use crate::error::{ProxyError, Result};

/// Groups keyed by service name.
pub struct GroupManager {
    method: Method,
    health_check: HealthCheckConfig,
    groups: RwLock<HashMap<String, Arc<ServerGroup>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GroupManager {
    pub fn new(method: Method, health_check: HealthCheckConfig) -> Self {
        Self {
            method,
            health_check,
            groups: RwLock::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    /// Follow `discovery` until `close`. Applies the current set first.
    pub async fn start(self: &Arc<Self>, discovery: &dyn Discovery) -> Result<()> {
        let mut rx = discovery.subscribe();
        let initial = rx.borrow_and_update().clone();
        self.apply(&initial).await;

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            ProxyError::Config(format!("group manager needs a tokio runtime: {}", e))
        })?;
        let weak = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            while rx.changed().await.is_ok() {
                let endpoints = rx.borrow_and_update().clone();
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.apply(&endpoints).await;
            }
            debug!("discovery subscription ended");
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Reconcile groups against a full endpoint set.
    ///
    /// Services that disappear have their groups closed and removed.
    pub async fn apply(&self, endpoints: &[BackendEndpoint]) {
        let mut by_service: BTreeMap<&str, Vec<BackendEndpoint>> = BTreeMap::new();
        for endpoint in endpoints {
            by_service
                .entry(endpoint.service.as_str())
                .or_default()
                .push(endpoint.clone());
        }

        let mut groups = self.groups.write().await;
        groups.retain(|service, group| {
            let keep = by_service.contains_key(service.as_str());
            if !keep {
                group.close();
                info!(service = %service, "server group removed");
            }
            keep
        });

        for (service, members) in by_service {
            let group = groups.entry(service.to_string()).or_insert_with(|| {
                info!(service = %service, method = %self.method, "server group created");
                Arc::new(ServerGroup::new(service, self.method, self.health_check.clone()))
            });
            group.replace(&members);
        }
    }

    /// Group for `service`, if discovery reported one.
    pub async fn group(&self, service: &str) -> Option<Arc<ServerGroup>> {
        self.groups.read().await.get(service).cloned()
    }

    pub async fn services(&self) -> Vec<String> {
        let mut services: Vec<_> = self.groups.read().await.keys().cloned().collect();
        services.sort();
        services
    }

    /// Stop following discovery and close every group.
    pub async fn close(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        for (_, group) in self.groups.write().await.drain() {
            group.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StaticDiscovery;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn endpoint(service: &str, alias: &str, port: u16) -> BackendEndpoint {
        BackendEndpoint {
            service: service.to_string(),
            alias: alias.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            weight: 10,
        }
    }

    #[tokio::test]
    async fn test_apply_creates_and_removes_groups() {
        let manager = GroupManager::new(Method::RoundRobin, HealthCheckConfig::none());
        manager
            .apply(&[
                endpoint("web:80", "w1", 9001),
                endpoint("web:80", "w2", 9002),
                endpoint("db", "d1", 9003),
            ])
            .await;
        assert_eq!(manager.services().await, ["db", "web:80"]);
        let web = manager.group("web:80").await.unwrap();
        assert_eq!(web.servers().len(), 2);

        manager.apply(&[endpoint("web:80", "w1", 9001)]).await;
        assert_eq!(manager.services().await, ["web:80"]);
        assert!(Arc::ptr_eq(&web, &manager.group("web:80").await.unwrap()));
        assert_eq!(web.servers().len(), 1);
        manager.close().await;
        assert!(web.is_closed());
    }

    #[tokio::test]
    async fn test_follows_discovery() {
        let discovery = StaticDiscovery::new(vec![endpoint("svc", "a", 9001)]);
        let manager = Arc::new(GroupManager::new(Method::RoundRobin, HealthCheckConfig::none()));
        manager.start(&discovery).await.unwrap();
        assert!(manager.group("svc").await.is_some());

        discovery.publish(vec![endpoint("other", "b", 9002)]);
        for _ in 0..100 {
            if manager.group("other").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.group("other").await.is_some());
        assert!(manager.group("svc").await.is_none());
        manager.close().await;
    }
}
