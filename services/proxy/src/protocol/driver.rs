//! Drives a `ProtocolHandler` over a connection owned by the current reactor.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{ProtocolHandler, ProtocolHandlerContext};
use crate::net::{Connection, ConnectionInfo, NetEventLoop, NetFlowRecorder};

/// Upper bound on bytes a handler may leave unconsumed.
pub const MAX_INBOUND_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// What happened during one `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// Bytes were read and handed to `readable`.
    Readable,
    /// The peer closed; `end` was called.
    End,
    /// An I/O error occurred; `exception` was called.
    Exception,
}

/// Result of detaching a handler from its connection.
pub enum Detached {
    /// The handler asked for the connection to be closed.
    Closed,
    /// The connection moves on to the next owner with unconsumed bytes.
    Handover {
        connection: ConnectionInfo,
        stream: TcpStream,
        leftover: BytesMut,
    },
}

/// Owns a connection's socket and a handler context for it.
///
/// Callbacks run strictly one at a time. All socket operations are
/// cancellation safe, so `step` can sit in a `select!`.
pub struct ProtocolDriver<H: ProtocolHandler> {
    handler: Arc<H>,
    ctx: ProtocolHandlerContext<H::Data>,
    stream: TcpStream,
}

impl<H: ProtocolHandler> ProtocolDriver<H> {
    /// Attach `handler` to `conn`: run `init` and flush what it wrote.
    pub async fn attach(
        handler: Arc<H>,
        conn: Connection,
        event_loop: NetEventLoop,
    ) -> io::Result<Self> {
        let (info, stream) = conn.into_parts();
        let mut ctx = ProtocolHandlerContext::new(info, event_loop);
        handler.init(&mut ctx);

        let mut driver = Self {
            handler,
            ctx,
            stream,
        };
        if let Err(e) = driver.flush().await {
            driver.handler.exception(&mut driver.ctx, &e);
            return Err(e);
        }
        Ok(driver)
    }

    pub fn context(&self) -> &ProtocolHandlerContext<H::Data> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ProtocolHandlerContext<H::Data> {
        &mut self.ctx
    }

    /// Ask the handler whether detaching now should close the connection.
    pub fn close_on_removal(&self) -> bool {
        self.handler.close_on_removal(&self.ctx)
    }

    /// Wait for the next readiness event and dispatch it to the handler.
    pub async fn step(&mut self) -> DriverEvent {
        if self.ctx.inbound().len() >= MAX_INBOUND_BYTES {
            let err = io::Error::new(io::ErrorKind::InvalidData, "inbound buffer limit exceeded");
            self.handler.exception(&mut self.ctx, &err);
            return DriverEvent::Exception;
        }

        let buf = self.ctx.inbound_buf();
        buf.reserve(READ_CHUNK);
        match self.stream.read_buf(buf).await {
            Ok(0) => {
                self.handler.end(&mut self.ctx);
                DriverEvent::End
            }
            Ok(n) => {
                self.ctx.connection.inc_from_remote_bytes(n as u64);
                self.handler.readable(&mut self.ctx);
                match self.flush().await {
                    Ok(()) => DriverEvent::Readable,
                    Err(e) => {
                        self.handler.exception(&mut self.ctx, &e);
                        DriverEvent::Exception
                    }
                }
            }
            Err(e) => {
                self.handler.exception(&mut self.ctx, &e);
                DriverEvent::Exception
            }
        }
    }

    /// Write out everything the handler queued.
    ///
    /// Bytes leave the buffer only once written, so a cancelled flush loses
    /// nothing.
    pub async fn flush(&mut self) -> io::Result<()> {
        while self.ctx.has_pending_writes() {
            let n = self.stream.write(&self.ctx.outbound_buf()[..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.ctx.connection.inc_to_remote_bytes(n as u64);
            self.ctx.outbound_buf().advance(n);
        }
        Ok(())
    }

    /// Remove the handler, closing or handing over the connection.
    pub async fn detach(mut self) -> Detached {
        let flushed = self.flush().await;
        if let Err(e) = &flushed {
            self.handler.exception(&mut self.ctx, e);
        }

        if flushed.is_err() || self.handler.close_on_removal(&self.ctx) {
            if let Err(e) = self.stream.shutdown().await {
                debug!(connection = %self.ctx.connection_id, error = %e, "error closing connection");
            }
            return Detached::Closed;
        }

        let leftover = self.ctx.take_inbound();
        let Self { ctx, stream, .. } = self;
        Detached::Handover {
            connection: ctx.connection,
            stream,
            leftover,
        }
    }
}
