//! Networking utilities for relaygate.
//!
//! This library provides helpers for:
//! - Resolving the local address of a network interface by IP family
//! - Formatting addresses the way listener ids expect them
//! - Enumerating interface addresses for diagnostics

use std::fmt;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use nix::ifaddrs::getifaddrs;
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP family identifier.
    #[error("invalid IP family: {0} (expected v4 or v6)")]
    InvalidIpType(String),

    /// The interface does not exist or carries no address of the requested family.
    #[error("no {ip_type} address found on interface {nic}")]
    NoAddress { nic: String, ip_type: IpType },

    /// Enumerating interfaces failed.
    #[error("failed to enumerate interfaces: {0}")]
    Enumerate(#[from] nix::Error),
}

// ============================================================================
// IP family
// ============================================================================

/// IP family selector for interface address resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpType {
    V4,
    V6,
}

impl IpType {
    /// Check whether an address belongs to this family.
    pub fn matches(self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (IpType::V4, IpAddr::V4(_)) | (IpType::V6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for IpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpType::V4 => f.write_str("v4"),
            IpType::V6 => f.write_str("v6"),
        }
    }
}

impl FromStr for IpType {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v4" | "ipv4" | "4" => Ok(IpType::V4),
            "v6" | "ipv6" | "6" => Ok(IpType::V6),
            other => Err(NetworkError::InvalidIpType(other.to_string())),
        }
    }
}

// ============================================================================
// Interface addresses
// ============================================================================

/// A single address assigned to a network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    /// Interface name (e.g., "eth0", "lo").
    pub nic: String,

    /// Address assigned to the interface.
    pub addr: IpAddr,
}

/// List every IPv4/IPv6 address assigned to local interfaces.
pub fn interface_addresses() -> Result<Vec<InterfaceAddr>, NetworkError> {
    let mut out = Vec::new();
    for ifa in getifaddrs()? {
        let Some(storage) = ifa.address else {
            continue;
        };
        let addr = if let Some(sin) = storage.as_sockaddr_in() {
            IpAddr::V4(*SocketAddrV4::from(*sin).ip())
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            IpAddr::V6(*SocketAddrV6::from(*sin6).ip())
        } else {
            continue;
        };
        out.push(InterfaceAddr {
            nic: ifa.interface_name,
            addr,
        });
    }
    Ok(out)
}

/// Resolve the address of `nic` in the requested family.
pub fn nic_address(nic: &str, ip_type: IpType) -> Result<IpAddr, NetworkError> {
    let addrs = interface_addresses()?;
    select_address(&addrs, nic, ip_type).ok_or_else(|| NetworkError::NoAddress {
        nic: nic.to_string(),
        ip_type,
    })
}

/// Pick an address for `nic` from a list of interface addresses.
///
/// IPv6 link-local addresses need a scope id to be bindable, so a global
/// address is preferred when the interface has one.
pub fn select_address(addrs: &[InterfaceAddr], nic: &str, ip_type: IpType) -> Option<IpAddr> {
    let mut candidates = addrs
        .iter()
        .filter(|a| a.nic == nic && ip_type.matches(&a.addr))
        .map(|a| a.addr);

    let first = candidates.next()?;
    if !is_ipv6_link_local(&first) {
        return Some(first);
    }
    candidates
        .find(|a| !is_ipv6_link_local(a))
        .or(Some(first))
}

fn is_ipv6_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        IpAddr::V4(_) => false,
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Format an IP the way listener ids use it (no brackets, canonical form).
pub fn ip_str(addr: &IpAddr) -> String {
    addr.to_string()
}

/// Format a socket address as `ip:port` without IPv6 brackets.
pub fn addr_id(addr: &SocketAddr) -> String {
    format!("{}:{}", ip_str(&addr.ip()), addr.port())
}
