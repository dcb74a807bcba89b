//! Backend discovery.
//!
//! A `Discovery` publishes the full current endpoint set on a watch channel.
//! Consumers reconcile against each new snapshot.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::group::DEFAULT_WEIGHT;

/// Minimum interval between discovery polls.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One backend as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEndpoint {
    /// Service the backend belongs to; CONNECT targets are matched against
    /// it as `host:port` or `host`.
    pub service: String,
    /// Unique name of the backend within its service.
    pub alias: String,
    pub addr: SocketAddr,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

/// Source of backend endpoint sets.
pub trait Discovery: Send + Sync {
    /// Receiver of the current endpoint set; marked changed on every update.
    fn subscribe(&self) -> watch::Receiver<Vec<BackendEndpoint>>;
}

/// Endpoints pushed by the embedding application.
pub struct StaticDiscovery {
    tx: watch::Sender<Vec<BackendEndpoint>>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<BackendEndpoint>) -> Self {
        let (tx, _) = watch::channel(endpoints);
        Self { tx }
    }

    /// Replace the endpoint set. Subscribers are notified only on change.
    pub fn publish(&self, endpoints: Vec<BackendEndpoint>) {
        publish_if_changed(&self.tx, endpoints);
    }
}

impl Discovery for StaticDiscovery {
    fn subscribe(&self) -> watch::Receiver<Vec<BackendEndpoint>> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Deserialize)]
struct EndpointsResponse {
    endpoints: Vec<BackendEndpoint>,
}

/// Polls a JSON endpoint of the form `{"endpoints": [...]}`.
pub struct HttpDiscovery {
    url: String,
    tx: watch::Sender<Vec<BackendEndpoint>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpDiscovery {
    /// Start polling `url` every `poll_interval` on the current runtime.
    pub fn start(url: impl Into<String>, poll_interval: Duration) -> Result<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(poll_interval.max(Duration::from_secs(1)))
            .build()
            .context("failed to build discovery HTTP client")?;
        let runtime = tokio::runtime::Handle::try_current()
            .context("discovery polling needs a tokio runtime")?;

        let (tx, _) = watch::channel(Vec::new());
        let task = runtime.spawn(poll_loop(
            client,
            url.clone(),
            poll_interval.max(MIN_POLL_INTERVAL),
            tx.clone(),
        ));

        info!(url = %url, poll_interval_ms = poll_interval.as_millis() as u64, "discovery polling started");
        Ok(Self {
            url,
            tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop polling. The last published set stays visible to subscribers.
    pub fn close(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            debug!(url = %self.url, "discovery polling stopped");
        }
    }
}

impl Discovery for HttpDiscovery {
    fn subscribe(&self) -> watch::Receiver<Vec<BackendEndpoint>> {
        self.tx.subscribe()
    }
}

impl Drop for HttpDiscovery {
    fn drop(&mut self) {
        self.close();
    }
}

async fn fetch_endpoints(client: &reqwest::Client, url: &str) -> Result<Vec<BackendEndpoint>> {
    let resp = client.get(url).send().await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!(
            "discovery query failed (status={}): {}",
            status,
            body
        ));
    }

    let body = resp
        .json::<EndpointsResponse>()
        .await
        .context("invalid discovery response JSON")?;
    Ok(body.endpoints)
}

async fn poll_loop(
    client: reqwest::Client,
    url: String,
    poll_interval: Duration,
    tx: watch::Sender<Vec<BackendEndpoint>>,
) {
    loop {
        match fetch_endpoints(&client, &url).await {
            Ok(endpoints) => {
                let count = endpoints.len();
                if publish_if_changed(&tx, endpoints) {
                    info!(url = %url, endpoint_count = count, "discovered endpoints changed");
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "failed to fetch endpoints; retrying");
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}

fn publish_if_changed(
    tx: &watch::Sender<Vec<BackendEndpoint>>,
    endpoints: Vec<BackendEndpoint>,
) -> bool {
    tx.send_if_modified(|current| {
        if *current == endpoints {
            false
        } else {
            *current = endpoints;
            true
        }
    })
}
