//! Selection policies over the healthy members of a group.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::group::ServerHandle;
use crate::error::ProxyError;

/// How a group picks a server for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `rr`: each healthy server in turn.
    RoundRobin,
    /// `wrr`: smooth weighted round-robin.
    WeightedRoundRobin,
    /// `wlc`: fewest active connections relative to weight.
    WeightedLeastConnections,
    /// `source`: hash of the client address.
    Source,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::RoundRobin => "rr",
            Method::WeightedRoundRobin => "wrr",
            Method::WeightedLeastConnections => "wlc",
            Method::Source => "source",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rr" => Ok(Method::RoundRobin),
            "wrr" => Ok(Method::WeightedRoundRobin),
            "wlc" => Ok(Method::WeightedLeastConnections),
            "source" => Ok(Method::Source),
            other => Err(ProxyError::Config(format!("unknown method: {}", other))),
        }
    }
}

/// Per-group selection state.
pub(crate) struct Selector {
    method: Method,
    cursor: AtomicUsize,
    /// Smooth WRR current weights by server alias.
    current: Mutex<HashMap<String, i64>>,
}

impl Selector {
    pub(crate) fn new(method: Method) -> Self {
        Self {
            method,
            cursor: AtomicUsize::new(0),
            current: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn method(&self) -> Method {
        self.method
    }

    /// Pick one of `healthy`. `None` only when `healthy` is empty.
    pub(crate) fn select(
        &self,
        healthy: &[Arc<ServerHandle>],
        source: Option<IpAddr>,
    ) -> Option<Arc<ServerHandle>> {
        if healthy.is_empty() {
            return None;
        }
        let idx = match (self.method, source) {
            (Method::RoundRobin, _) | (Method::Source, None) => self.round_robin(healthy.len()),
            (Method::WeightedRoundRobin, _) => self.smooth_weighted(healthy),
            (Method::WeightedLeastConnections, _) => least_connections(healthy),
            (Method::Source, Some(ip)) => source_hash(ip, healthy.len()),
        };
        healthy.get(idx).cloned()
    }

    /// Drop WRR state for servers that left the group.
    pub(crate) fn forget(&self, alias: &str) {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(alias);
    }

    fn round_robin(&self, n: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % n
    }

    fn smooth_weighted(&self, healthy: &[Arc<ServerHandle>]) -> usize {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut total = 0i64;
        let mut best: Option<(usize, i64)> = None;
        for (i, server) in healthy.iter().enumerate() {
            let weight = i64::from(server.weight());
            total += weight;
            let value = current.entry(server.alias().to_string()).or_insert(0);
            *value += weight;
            if best.is_none_or(|(_, b)| *value > b) {
                best = Some((i, *value));
            }
        }

        let (idx, _) = best.unwrap_or((0, 0));
        if let Some(value) = current.get_mut(healthy[idx].alias()) {
            *value -= total;
        }
        idx
    }
}

fn least_connections(healthy: &[Arc<ServerHandle>]) -> usize {
    // a/wa < b/wb  <=>  a*wb < b*wa
    let mut best = 0;
    for (i, server) in healthy.iter().enumerate().skip(1) {
        let candidate = server.active_connections() as u128 * u128::from(healthy[best].weight());
        let incumbent = healthy[best].active_connections() as u128 * u128::from(server.weight());
        if candidate < incumbent {
            best = i;
        }
    }
    best
}

fn source_hash(ip: IpAddr, n: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    ip.hash(&mut hasher);
    (hasher.finish() % n as u64) as usize
}
