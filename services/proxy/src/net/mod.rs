//! Sockets and reactors.
//!
//! - `BindServer`: bound listening socket with lifecycle and counters
//! - `NetEventLoop`: single-threaded reactor owning listeners and connections
//! - `EventLoopGroup`: reactors grouped for acceptor/worker distribution
//! - `Connection`: an accepted socket owned by exactly one reactor

mod bind_server;
mod connection;
mod event_loop;
mod flow;

pub use bind_server::{BindServer, DEFAULT_BACKLOG};
pub use connection::{Connection, ConnectionInfo};
pub use event_loop::{ConnectionHandler, EventLoopGroup, NetEventLoop, ServerHandler};
pub use flow::{FlowStats, NetFlowRecorder};
