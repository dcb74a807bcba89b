//! Protocol handler framework.
//!
//! A `ProtocolHandler` is a synchronous state machine over a per-connection
//! context value it defines. The framework (`ProtocolDriver`) owns the socket:
//! it reads bytes into the context's inbound buffer, invokes the handler,
//! and flushes whatever the handler wrote. Handlers never touch the socket,
//! so they never block the reactor.
//!
//! Handlers compose by delegation: an outer handler owns an inner handler
//! plus a nested context, forwards inbound bytes into it, and collects its
//! writes back.

mod driver;
pub mod http;
pub mod http_connect;

use bytes::BytesMut;

use crate::net::{ConnectionInfo, NetEventLoop};

pub use driver::{Detached, DriverEvent, ProtocolDriver, MAX_INBOUND_BYTES};

/// Per-connection state handed to every handler callback.
pub struct ProtocolHandlerContext<T> {
    /// Logical connection id.
    pub connection_id: String,
    /// The underlying connection.
    pub connection: ConnectionInfo,
    /// Reactor that owns the connection.
    pub event_loop: NetEventLoop,
    /// Handler-defined value; `None` until `init` runs.
    pub data: Option<T>,
    inbound: BytesMut,
    outbound: BytesMut,
}

impl<T> ProtocolHandlerContext<T> {
    pub fn new(connection: ConnectionInfo, event_loop: NetEventLoop) -> Self {
        Self {
            connection_id: connection.id().to_string(),
            connection,
            event_loop,
            data: None,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
        }
    }

    /// A fresh context for an embedded handler on the same connection.
    pub fn nested<U>(&self) -> ProtocolHandlerContext<U> {
        ProtocolHandlerContext {
            connection_id: self.connection_id.clone(),
            connection: self.connection.clone(),
            event_loop: self.event_loop.clone(),
            data: None,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
        }
    }

    /// Bytes received and not yet consumed.
    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    /// Mark the first `n` inbound bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.inbound.len());
        let _ = self.inbound.split_to(n);
    }

    /// Append received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Queue bytes to be written to the peer.
    pub fn write(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Move all inbound bytes into an embedded handler's context.
    pub fn forward_to<U>(&mut self, inner: &mut ProtocolHandlerContext<U>) {
        let bytes = self.inbound.split();
        inner.inbound.unsplit(bytes);
    }

    /// Take back an embedded handler's writes and unconsumed bytes.
    pub fn collect_from<U>(&mut self, inner: &mut ProtocolHandlerContext<U>) {
        let writes = inner.outbound.split();
        self.outbound.unsplit(writes);
        let rest = inner.inbound.split();
        let newer = self.inbound.split();
        self.inbound.unsplit(rest);
        self.inbound.unsplit(newer);
    }

    pub(crate) fn inbound_buf(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    pub(crate) fn outbound_buf(&mut self) -> &mut BytesMut {
        &mut self.outbound
    }

    pub(crate) fn take_inbound(&mut self) -> BytesMut {
        self.inbound.split()
    }
}

/// A protocol state machine driven by the framework.
pub trait ProtocolHandler {
    /// Context value this handler keeps per connection.
    type Data;

    /// Called once when attached. Must set `ctx.data` before returning.
    fn init(&self, ctx: &mut ProtocolHandlerContext<Self::Data>);

    /// New inbound bytes are available.
    ///
    /// Consume what this call needs; completion of any sub-protocol is
    /// signalled by mutating `ctx.data`.
    fn readable(&self, ctx: &mut ProtocolHandlerContext<Self::Data>);

    /// I/O failure. The framework is already tearing the connection down.
    fn exception(&self, ctx: &mut ProtocolHandlerContext<Self::Data>, err: &std::io::Error);

    /// The peer closed the connection cleanly.
    fn end(&self, ctx: &mut ProtocolHandlerContext<Self::Data>);

    /// Whether the connection should be closed when this handler is detached
    /// (`false` hands it to the next owner).
    fn close_on_removal(&self, ctx: &ProtocolHandlerContext<Self::Data>) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_collect() {
        let event_loop = NetEventLoop::spawn("ctx-test").unwrap();
        let info = ConnectionInfo::new(
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
            None,
        );
        let mut outer: ProtocolHandlerContext<()> =
            ProtocolHandlerContext::new(info, event_loop.clone());
        let mut inner: ProtocolHandlerContext<u8> = outer.nested();
        assert_eq!(inner.connection_id, outer.connection_id);

        outer.feed(b"hello world");
        outer.forward_to(&mut inner);
        assert!(outer.inbound().is_empty());
        assert_eq!(inner.inbound(), b"hello world");

        inner.consume(6);
        inner.write(b"ack");
        outer.collect_from(&mut inner);

        assert_eq!(outer.inbound(), b"world");
        assert!(inner.inbound().is_empty());
        assert!(outer.has_pending_writes());
        assert_eq!(&outer.outbound_buf()[..], b"ack");

        event_loop.close();
    }
}
