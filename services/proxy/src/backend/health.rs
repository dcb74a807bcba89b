//! Active health checks for group members.
//!
//! One checker task per server probes it every `period` and flips its
//! healthy flag after `up` consecutive successes or `down` consecutive
//! failures.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::group::ServerHandle;
use crate::error::{ProxyError, Result};

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The server answered the check.
    Healthy,
    /// The check failed, timed out or got a non-2xx answer.
    Unhealthy,
}

/// What a health check does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckProtocol {
    /// A TCP connect succeeds.
    Tcp,
    /// `GET path` answers with a 2xx status.
    Http { path: String },
    /// No probing; servers are healthy as soon as they join.
    None,
}

impl fmt::Display for CheckProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckProtocol::Tcp => f.write_str("tcp"),
            CheckProtocol::Http { path } => write!(f, "http:{}", path),
            CheckProtocol::None => f.write_str("none"),
        }
    }
}

impl FromStr for CheckProtocol {
    type Err = ProxyError;

    /// `tcp`, `none`, `http` (probes `/`) or `http:/some/path`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "tcp" => return Ok(CheckProtocol::Tcp),
            "none" => return Ok(CheckProtocol::None),
            "http" => {
                return Ok(CheckProtocol::Http {
                    path: "/".to_string(),
                })
            }
            _ => {}
        }
        match s.split_once(':') {
            Some((scheme, path))
                if scheme.eq_ignore_ascii_case("http") && path.starts_with('/') =>
            {
                Ok(CheckProtocol::Http {
                    path: path.to_string(),
                })
            }
            _ => Err(ProxyError::Config(format!(
                "unknown health check protocol: {}",
                s
            ))),
        }
    }
}

/// Health-check policy shared by every member of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckConfig {
    pub protocol: CheckProtocol,
    /// Limit for one probe.
    pub timeout: Duration,
    /// Delay between probes.
    pub period: Duration,
    /// Consecutive successes before a server turns healthy.
    pub up: u32,
    /// Consecutive failures before a server turns unhealthy.
    pub down: u32,
}

impl HealthCheckConfig {
    pub fn new(
        protocol: CheckProtocol,
        timeout: Duration,
        period: Duration,
        up: u32,
        down: u32,
    ) -> Result<Self> {
        if timeout.is_zero() || period.is_zero() {
            return Err(ProxyError::Config(
                "health check timeout and period must be positive".to_string(),
            ));
        }
        if up == 0 || down == 0 {
            return Err(ProxyError::Config(
                "health check up and down thresholds must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            protocol,
            timeout,
            period,
            up,
            down,
        })
    }

    /// Checks disabled: every server counts as healthy.
    pub fn none() -> Self {
        Self {
            protocol: CheckProtocol::None,
            ..Self::default()
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            protocol: CheckProtocol::Tcp,
            timeout: Duration::from_millis(1000),
            period: Duration::from_millis(5000),
            up: 2,
            down: 3,
        }
    }
}

/// Probes one server once.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, addr: SocketAddr, check_timeout: Duration) -> HealthStatus;
}

pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, addr: SocketAddr, check_timeout: Duration) -> HealthStatus {
        match timeout(check_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => {
                debug!(backend_addr = %addr, "tcp health check succeeded");
                HealthStatus::Healthy
            }
            Ok(Err(e)) => {
                debug!(backend_addr = %addr, error = %e, "tcp health check failed: connection error");
                HealthStatus::Unhealthy
            }
            Err(_) => {
                debug!(backend_addr = %addr, "tcp health check failed: timeout");
                HealthStatus::Unhealthy
            }
        }
    }
}

/// `GET http://{addr}{path}` must answer with a 2xx status.
pub struct HttpProber {
    path: String,
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        // Fresh connection per probe, never through an environment proxy.
        let client = reqwest::Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .user_agent("relaygate-health/0.1.0")
            .build()
            .map_err(|e| {
                ProxyError::Config(format!("failed to build health check client: {}", e))
            })?;
        Ok(Self {
            path: path.into(),
            client,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, addr: SocketAddr, check_timeout: Duration) -> HealthStatus {
        let path = self.path.as_str();
        let url = format!("http://{}{}", addr, path);
        match self.client.get(&url).timeout(check_timeout).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(backend_addr = %addr, path, status = resp.status().as_u16(), "http health check succeeded");
                HealthStatus::Healthy
            }
            Ok(resp) => {
                debug!(backend_addr = %addr, path, status = resp.status().as_u16(), "http health check failed: non-2xx status");
                HealthStatus::Unhealthy
            }
            Err(e) if e.is_timeout() => {
                debug!(backend_addr = %addr, path, "http health check failed: timeout");
                HealthStatus::Unhealthy
            }
            Err(e) => {
                debug!(backend_addr = %addr, path, error = %e, "http health check failed: request error");
                HealthStatus::Unhealthy
            }
        }
    }
}

/// Prober for a protocol; `None` when checks are disabled.
pub fn prober_for(protocol: &CheckProtocol) -> Result<Option<Arc<dyn Prober>>> {
    let prober: Arc<dyn Prober> = match protocol {
        CheckProtocol::Tcp => Arc::new(TcpProber),
        CheckProtocol::Http { path } => Arc::new(HttpProber::new(path.clone())?),
        CheckProtocol::None => return Ok(None),
    };
    Ok(Some(prober))
}

/// Consecutive-result counter with hysteresis.
#[derive(Debug, Default)]
pub(crate) struct Thresholds {
    successes: u32,
    failures: u32,
}

impl Thresholds {
    /// Record a probe result; returns the new health if it should flip.
    pub(crate) fn record(
        &mut self,
        status: HealthStatus,
        healthy: bool,
        config: &HealthCheckConfig,
    ) -> Option<bool> {
        match status {
            HealthStatus::Healthy => {
                self.successes = self.successes.saturating_add(1);
                self.failures = 0;
                (!healthy && self.successes >= config.up).then_some(true)
            }
            HealthStatus::Unhealthy => {
                self.failures = self.failures.saturating_add(1);
                self.successes = 0;
                (healthy && self.failures >= config.down).then_some(false)
            }
        }
    }
}

/// Probe `server` until it is dropped or the task is aborted.
pub(crate) async fn run_checker(
    group: String,
    server: Weak<ServerHandle>,
    prober: Arc<dyn Prober>,
    config: HealthCheckConfig,
) {
    let mut thresholds = Thresholds::default();

    loop {
        let Some(handle) = server.upgrade() else {
            break;
        };
        let status = prober.probe(handle.addr(), config.timeout).await;

        if let Some(healthy) = thresholds.record(status, handle.is_healthy(), &config) {
            handle.set_healthy(healthy);
            if healthy {
                info!(group = %group, server = %handle.alias(), backend_addr = %handle.addr(), "server is up");
            } else {
                warn!(group = %group, server = %handle.alias(), backend_addr = %handle.addr(), "server is down");
            }
        }
        drop(handle);

        tokio::time::sleep(config.period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one connection per entry: read the request, then write each
    /// chunk with a short pause in between.
    async fn http_server(responses: Vec<Vec<&'static str>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for chunks in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                for chunk in chunks {
                    let _ = stream.write_all(chunk.as_bytes()).await;
                    let _ = stream.flush().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        });
        addr
    }

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn test_parse_protocol() {
        assert_eq!("tcp".parse::<CheckProtocol>().unwrap(), CheckProtocol::Tcp);
        assert_eq!("NONE".parse::<CheckProtocol>().unwrap(), CheckProtocol::None);
        assert_eq!(
            "http".parse::<CheckProtocol>().unwrap(),
            CheckProtocol::Http {
                path: "/".to_string()
            }
        );
        assert_eq!(
            "http:/healthz".parse::<CheckProtocol>().unwrap(),
            CheckProtocol::Http {
                path: "/healthz".to_string()
            }
        );
        assert!("udp".parse::<CheckProtocol>().is_err());
        assert!("http:healthz".parse::<CheckProtocol>().is_err());
    }

    #[test]
    fn test_config_validation() {
        let ms = Duration::from_millis;
        assert!(HealthCheckConfig::new(CheckProtocol::Tcp, ms(100), ms(100), 1, 1).is_ok());
        assert!(HealthCheckConfig::new(CheckProtocol::Tcp, ms(0), ms(100), 1, 1).is_err());
        assert!(HealthCheckConfig::new(CheckProtocol::Tcp, ms(100), ms(100), 0, 1).is_err());
        assert!(HealthCheckConfig::new(CheckProtocol::Tcp, ms(100), ms(100), 1, 0).is_err());
    }

    #[test]
    fn test_thresholds_hysteresis() {
        let config = HealthCheckConfig::default();
        let mut t = Thresholds::default();

        assert_eq!(t.record(HealthStatus::Healthy, false, &config), None);
        assert_eq!(t.record(HealthStatus::Healthy, false, &config), Some(true));
        // Already healthy: further successes don't flip.
        assert_eq!(t.record(HealthStatus::Healthy, true, &config), None);

        assert_eq!(t.record(HealthStatus::Unhealthy, true, &config), None);
        assert_eq!(t.record(HealthStatus::Unhealthy, true, &config), None);
        // A success in between resets the failure streak.
        assert_eq!(t.record(HealthStatus::Healthy, true, &config), None);
        assert_eq!(t.record(HealthStatus::Unhealthy, true, &config), None);
        assert_eq!(t.record(HealthStatus::Unhealthy, true, &config), None);
        assert_eq!(t.record(HealthStatus::Unhealthy, true, &config), Some(false));
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let status = TcpProber
            .probe(listener.local_addr().unwrap(), Duration::from_millis(500))
            .await;
        assert_eq!(status, HealthStatus::Healthy);

        let status = TcpProber
            .probe(unused_addr().await, Duration::from_millis(500))
            .await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_http_probe() {
        let addr = http_server(vec![
            vec!["HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"],
            vec!["HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"],
        ])
        .await;

        let prober = HttpProber::new("/health").unwrap();
        assert_eq!(
            prober.probe(addr, Duration::from_millis(500)).await,
            HealthStatus::Healthy
        );
        assert_eq!(
            prober.probe(addr, Duration::from_millis(500)).await,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_http_probe_status_line_split_across_writes() {
        let addr = http_server(vec![vec![
            "HTTP/1.1 2",
            "00 OK\r\nContent-Length: 2\r\n",
            "Connection: close\r\n\r\nok",
        ]])
        .await;

        let status = HttpProber::new("/")
            .unwrap()
            .probe(addr, Duration::from_millis(500))
            .await;
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_http_probe_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let started = std::time::Instant::now();
        let status = HttpProber::new("/")
            .unwrap()
            .probe(addr, Duration::from_millis(100))
            .await;
        assert_eq!(status, HealthStatus::Unhealthy);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_http_probe_no_listener() {
        let status = HttpProber::new("/")
            .unwrap()
            .probe(unused_addr().await, Duration::from_millis(100))
            .await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }
}
