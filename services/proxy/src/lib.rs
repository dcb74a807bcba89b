//! relaygate proxy core.
//!
//! A TCP proxy that accepts connections on listening sockets driven by
//! single-threaded reactors, negotiates HTTP CONNECT tunnels through
//! composable protocol handlers, and relays bytes to backends chosen from
//! health-checked groups.
//!
//! ## Architecture
//!
//! ```text
//! acceptor NetEventLoop --adopt--> worker NetEventLoop
//!                                    |
//!                       HttpConnectProtocolHandler --provide--> ConnectorProvider
//!                                    |                               |
//!                                  relay <------ Connector ---- ServerGroup (healthy)
//! ```

pub mod auto;
pub mod backend;
pub mod config;
pub mod error;
pub mod net;
pub mod protocol;
pub mod proxy;

pub use auto::AutoConfig;
pub use backend::{
    BackendEndpoint, CheckProtocol, Discovery, GroupManager, HealthCheckConfig, HttpDiscovery,
    Method, ServerGroup, ServerHandle, StaticDiscovery,
};
pub use error::{ProxyError, Result};
pub use net::{BindServer, Connection, ConnectionInfo, EventLoopGroup, NetEventLoop};
pub use protocol::http_connect::{HttpConnectContext, HttpConnectProtocolHandler};
pub use protocol::{ProtocolHandler, ProtocolHandlerContext};
pub use proxy::{
    ConnectProxy, Connector, ConnectorCallback, ConnectorProvider, DirectConnectorProvider,
    GroupConnectorProvider, ProxyOptions,
};
