//! Tunneling: backend connectors, relay and the CONNECT proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> BindServer -> HttpConnectProtocolHandler -> ConnectorProvider -> Backend
//!                                                             |
//!                                               GroupManager / direct DNS
//! ```

mod connector;
mod relay;
mod tunnel;

pub use connector::{
    connect_group, Connector, ConnectorCallback, ConnectorLink, ConnectorOutcome,
    ConnectorProvider, DirectConnectorProvider, GroupConnectorProvider, DEFAULT_CONNECT_TIMEOUT,
};
pub use relay::{relay, RelayStats};
pub use tunnel::{ConnectProxy, ProxyOptions};
