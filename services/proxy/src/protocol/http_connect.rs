//! HTTP CONNECT handshake.
//!
//! ```text
//! AwaitingRequest --(valid CONNECT, 200 written)--> AwaitingBackend
//! AwaitingBackend --(provider invoked)------------> Tunneling
//! AwaitingRequest --(invalid request)-------------> Failed
//! ```
//!
//! The outcome (a backend `Connector` or an error) is delivered on a one-shot
//! channel created in `init`; the sender is consumed when it fires.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::http::{HttpContext, HttpProtocolHandler, HttpRequest};
use super::{ProtocolHandler, ProtocolHandlerContext};
use crate::error::ProxyError;
use crate::proxy::{ConnectorCallback, ConnectorOutcome, ConnectorProvider};

/// Response written once the CONNECT target is accepted.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

enum ConnectState {
    AwaitingRequest {
        parser: HttpProtocolHandler,
        parser_ctx: Box<ProtocolHandlerContext<HttpContext>>,
    },
    AwaitingBackend {
        host: String,
        port: u16,
    },
    Tunneling {
        host: String,
        port: u16,
    },
    Failed,
}

/// Per-connection state of the CONNECT handshake.
pub struct HttpConnectContext {
    state: ConnectState,
    callback: Option<ConnectorCallback>,
    outcome: Option<ConnectorOutcome>,
}

impl HttpConnectContext {
    /// The CONNECT request was accepted and the 200 line written.
    pub fn handshake_done(&self) -> bool {
        matches!(
            self.state,
            ConnectState::AwaitingBackend { .. } | ConnectState::Tunneling { .. }
        )
    }

    /// The connector provider has been invoked.
    pub fn callback_done(&self) -> bool {
        matches!(self.state, ConnectState::Tunneling { .. })
    }

    /// Negotiated tunnel target; `None` until the handshake is done.
    pub fn target(&self) -> Option<(&str, u16)> {
        match &self.state {
            ConnectState::AwaitingBackend { host, port }
            | ConnectState::Tunneling { host, port } => Some((host.as_str(), *port)),
            _ => None,
        }
    }

    /// Take the receiving end of the outcome channel. Yields it once.
    pub fn take_outcome(&mut self) -> Option<ConnectorOutcome> {
        self.outcome.take()
    }

    fn fail(&mut self, err: ProxyError) {
        self.state = ConnectState::Failed;
        if let Some(callback) = self.callback.take() {
            let _ = callback.send(Err(err));
        }
    }
}

/// Accepts `CONNECT host:port` and asks a `ConnectorProvider` for the backend.
pub struct HttpConnectProtocolHandler {
    provider: Arc<dyn ConnectorProvider>,
}

impl HttpConnectProtocolHandler {
    pub fn new(provider: Arc<dyn ConnectorProvider>) -> Self {
        Self { provider }
    }

    fn advance(
        &self,
        ctx: &mut ProtocolHandlerContext<HttpConnectContext>,
        data: &mut HttpConnectContext,
    ) {
        if let ConnectState::AwaitingRequest { parser, parser_ctx } = &mut data.state {
            ctx.forward_to(parser_ctx);
            parser.readable(parser_ctx);
            ctx.collect_from(parser_ctx);

            let parsed = match parser_ctx.data.as_mut() {
                Some(http) => match (http.result.take(), http.error.take()) {
                    (Some(request), _) => Ok(request),
                    (None, Some(error)) => Err(ProxyError::ProtocolViolation(error)),
                    (None, None) => return,
                },
                None => return,
            };

            let negotiated = parsed.and_then(|request| negotiate(&ctx.connection_id, &request));
            match negotiated {
                Ok((host, port)) => {
                    debug!(connection = %ctx.connection_id, host = %host, port, "connect to target");
                    ctx.write(CONNECT_ESTABLISHED);
                    data.state = ConnectState::AwaitingBackend { host, port };
                }
                Err(e) => {
                    data.fail(e);
                    return;
                }
            }
        }

        let (host, port) = match &data.state {
            ConnectState::AwaitingBackend { host, port } => (host.clone(), *port),
            _ => return,
        };
        data.state = ConnectState::Tunneling {
            host: host.clone(),
            port,
        };
        if let Some(callback) = data.callback.take() {
            self.provider.provide(&ctx.connection, &host, port, callback);
        }
    }
}

impl ProtocolHandler for HttpConnectProtocolHandler {
    type Data = HttpConnectContext;

    fn init(&self, ctx: &mut ProtocolHandlerContext<HttpConnectContext>) {
        debug!(connection = %ctx.connection_id, "http connect init");

        let parser = HttpProtocolHandler::new();
        let mut parser_ctx = Box::new(ctx.nested::<HttpContext>());
        parser.init(&mut parser_ctx);

        let (callback, outcome) = oneshot::channel();
        ctx.data = Some(HttpConnectContext {
            state: ConnectState::AwaitingRequest { parser, parser_ctx },
            callback: Some(callback),
            outcome: Some(outcome),
        });
    }

    fn readable(&self, ctx: &mut ProtocolHandlerContext<HttpConnectContext>) {
        let Some(mut data) = ctx.data.take() else {
            return;
        };
        self.advance(ctx, &mut data);
        ctx.data = Some(data);
    }

    fn exception(
        &self,
        ctx: &mut ProtocolHandlerContext<HttpConnectContext>,
        err: &std::io::Error,
    ) {
        // The framework closes the connection.
        debug!(connection = %ctx.connection_id, error = %err, "http connect exception");
    }

    fn end(&self, ctx: &mut ProtocolHandlerContext<HttpConnectContext>) {
        debug!(connection = %ctx.connection_id, "http connect end");
    }

    fn close_on_removal(&self, ctx: &ProtocolHandlerContext<HttpConnectContext>) -> bool {
        ctx.data.as_ref().is_none_or(|data| !data.callback_done())
    }
}

/// Validate the request and extract the CONNECT target.
fn negotiate(connection_id: &str, request: &HttpRequest) -> Result<(String, u16), ProxyError> {
    let is_connect = request.method.eq_ignore_ascii_case("connect");
    if !is_connect && !request.url.starts_with("http://") {
        warn!(
            connection = %connection_id,
            method = %request.method,
            url = %request.url,
            "method is wrong, expecting CONNECT or proxying for http"
        );
        return Err(ProxyError::ProtocolViolation(format!(
            "invalid method {}",
            request.method
        )));
    }
    if !is_connect {
        debug!(connection = %connection_id, "client is sending raw http request");
        return Err(ProxyError::ProtocolViolation(
            "do not support raw http request".to_string(),
        ));
    }

    parse_connect_target(&request.url).inspect_err(|e| {
        warn!(connection = %connection_id, url = %request.url, error = %e, "invalid connect target");
    })
}

/// Split a CONNECT url into host and port on its last colon.
///
/// Bracketed IPv6 literals keep their brackets in the host.
pub fn parse_connect_target(url: &str) -> Result<(String, u16), ProxyError> {
    let Some(idx) = url.rfind(':') else {
        return Err(ProxyError::ProtocolViolation(format!("invalid url: {}", url)));
    };
    let host = url[..idx].trim();
    let port = url[idx + 1..].trim();

    if host.is_empty() {
        return Err(ProxyError::ProtocolViolation(format!(
            "invalid url: host: {}",
            url
        )));
    }
    let port: i64 = port
        .parse()
        .map_err(|_| ProxyError::ProtocolViolation(format!("invalid url: port: {}", url)))?;
    if port <= 0 || port > 65535 {
        return Err(ProxyError::ProtocolViolation(format!(
            "invalid url: port: out of range: {}",
            url
        )));
    }

    Ok((host.to_string(), port as u16))
}
