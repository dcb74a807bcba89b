//! Proxy configuration (env-driven).

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use relaygate_networking::IpType;

use crate::backend::{CheckProtocol, HealthCheckConfig, Method, MIN_POLL_INTERVAL};

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind on (example: eth0).
    pub nic: String,

    /// Address family of the interface address.
    pub ip_type: IpType,

    /// CONNECT listener port.
    pub port: u16,

    /// Reactors accepting connections.
    pub acceptor_threads: usize,

    /// Reactors serving connections.
    pub worker_threads: usize,

    /// Backend selection method.
    pub method: Method,

    /// Health-check policy for discovered backends.
    pub health_check: HealthCheckConfig,

    /// Discovery endpoint. Without one, CONNECT targets are dialed directly.
    pub discovery_url: Option<String>,

    /// Interval between discovery polls.
    pub discovery_poll_interval: Duration,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// Tunnel idle timeout.
    pub idle_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from `RELAYGATE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let nic = var("RELAYGATE_NIC").unwrap_or_else(|| "lo".to_string());

        let ip_type: IpType = var("RELAYGATE_IP_TYPE")
            .map(|v| v.parse())
            .transpose()
            .context("RELAYGATE_IP_TYPE must be v4 or v6.")?
            .unwrap_or(IpType::V4);

        let port: u16 = parse(&var, "RELAYGATE_PORT", "a port number")?.unwrap_or(18080);

        let acceptor_threads: usize =
            parse(&var, "RELAYGATE_ACCEPTOR_THREADS", "an integer")?.unwrap_or(1);
        let worker_threads: usize = parse(&var, "RELAYGATE_WORKER_THREADS", "an integer")?
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });
        if acceptor_threads == 0 || worker_threads == 0 {
            anyhow::bail!("RELAYGATE_ACCEPTOR_THREADS and RELAYGATE_WORKER_THREADS must be at least 1.");
        }

        let method: Method = var("RELAYGATE_METHOD")
            .map(|v| v.parse())
            .transpose()
            .context("RELAYGATE_METHOD must be one of rr, wrr, wlc, source.")?
            .unwrap_or(Method::WeightedRoundRobin);

        let protocol: CheckProtocol = var("RELAYGATE_HC_PROTOCOL")
            .map(|v| v.parse())
            .transpose()
            .context("RELAYGATE_HC_PROTOCOL must be tcp, http, http:/path or none.")?
            .unwrap_or(CheckProtocol::Tcp);
        let hc_timeout =
            millis(&var, "RELAYGATE_HC_TIMEOUT_MS")?.unwrap_or(Duration::from_millis(1000));
        let hc_period =
            millis(&var, "RELAYGATE_HC_PERIOD_MS")?.unwrap_or(Duration::from_millis(5000));
        let hc_up: u32 = parse(&var, "RELAYGATE_HC_UP", "an integer")?.unwrap_or(2);
        let hc_down: u32 = parse(&var, "RELAYGATE_HC_DOWN", "an integer")?.unwrap_or(3);
        let health_check = HealthCheckConfig::new(protocol, hc_timeout, hc_period, hc_up, hc_down)
            .context("Invalid health check configuration.")?;

        let discovery_url = var("RELAYGATE_DISCOVERY_URL");
        let discovery_poll_interval = millis(&var, "RELAYGATE_DISCOVERY_POLL_MS")?
            .unwrap_or(Duration::from_millis(2000))
            .max(MIN_POLL_INTERVAL);

        let connect_timeout =
            millis(&var, "RELAYGATE_CONNECT_TIMEOUT_MS")?.unwrap_or(Duration::from_millis(2000));
        let idle_timeout = millis(&var, "RELAYGATE_IDLE_TIMEOUT_MS")?;

        let log_level = var("RELAYGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            nic,
            ip_type,
            port,
            acceptor_threads,
            worker_threads,
            method,
            health_check,
            discovery_url,
            discovery_poll_interval,
            connect_timeout,
            idle_timeout,
            log_level,
        })
    }
}

fn parse<T>(var: impl Fn(&str) -> Option<String>, name: &str, expected: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{} must be {}.", name, expected))
}

fn millis(var: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<Duration>> {
    let ms: Option<u64> = parse(var, name, "an integer (milliseconds)")?;
    match ms {
        Some(0) => anyhow::bail!("{} must be positive.", name),
        other => Ok(other.map(Duration::from_millis)),
    }
}
