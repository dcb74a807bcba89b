//! HTTP/1.x request head parsing as a protocol handler.
//!
//! The handler consumes exactly one request head and leaves any following
//! bytes in the inbound buffer for whoever owns the connection next.

use tracing::debug;

use super::{ProtocolHandler, ProtocolHandlerContext};

/// Default limit on the size of a request head.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;

/// Maximum number of headers accepted in one request.
pub const MAX_HEADERS: usize = 64;

/// A parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// First header value matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parser progress for one connection.
#[derive(Debug, Default)]
pub struct HttpContext {
    /// The request, once its head is complete.
    pub result: Option<HttpRequest>,
    /// Why parsing stopped, if the head was malformed or too large.
    pub error: Option<String>,
}

impl HttpContext {
    /// Whether parsing reached a final state.
    pub fn is_done(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

/// Parses a single HTTP/1.x request head.
#[derive(Debug, Clone)]
pub struct HttpProtocolHandler {
    max_head_bytes: usize,
}

impl HttpProtocolHandler {
    pub fn new() -> Self {
        Self {
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
        }
    }

    pub fn with_max_head_bytes(max_head_bytes: usize) -> Self {
        Self { max_head_bytes }
    }
}

impl Default for HttpProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler for HttpProtocolHandler {
    type Data = HttpContext;

    fn init(&self, ctx: &mut ProtocolHandlerContext<HttpContext>) {
        ctx.data = Some(HttpContext::default());
    }

    fn readable(&self, ctx: &mut ProtocolHandlerContext<HttpContext>) {
        if ctx.data.as_ref().is_none_or(HttpContext::is_done) {
            return;
        }

        let parsed = parse_head(ctx.inbound(), self.max_head_bytes);
        let Some(data) = ctx.data.as_mut() else {
            return;
        };
        match parsed {
            Ok(Some((request, len))) => {
                data.result = Some(request);
                ctx.consume(len);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(connection = %ctx.connection_id, error = %e, "invalid http request");
                data.error = Some(e);
            }
        }
    }

    fn exception(&self, ctx: &mut ProtocolHandlerContext<HttpContext>, err: &std::io::Error) {
        debug!(connection = %ctx.connection_id, error = %err, "http exception");
    }

    fn end(&self, ctx: &mut ProtocolHandlerContext<HttpContext>) {
        debug!(connection = %ctx.connection_id, "http end");
    }

    fn close_on_removal(&self, _ctx: &ProtocolHandlerContext<HttpContext>) -> bool {
        true
    }
}

/// Parse a request head from `buf`.
///
/// Returns the request and the head length once complete, `None` while more
/// bytes are needed.
fn parse_head(buf: &[u8], max_head_bytes: usize) -> Result<Option<(HttpRequest, usize)>, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            if len > max_head_bytes {
                return Err(format!("request head exceeds {} bytes", max_head_bytes));
            }
            let request = HttpRequest {
                method: req.method.unwrap_or_default().to_string(),
                url: req.path.unwrap_or_default().to_string(),
                version: req.version.unwrap_or(1),
                headers: req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect(),
            };
            Ok(Some((request, len)))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_head_bytes {
                Err(format!("request head exceeds {} bytes", max_head_bytes))
            } else {
                Ok(None)
            }
        }
        Err(e) => Err(format!("malformed http request: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_head() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nrest";
        let (req, len) = parse_head(raw, DEFAULT_MAX_HEAD_BYTES).unwrap().unwrap();
        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.url, "example.com:443");
        assert_eq!(req.version, 1);
        assert_eq!(req.header("host"), Some("example.com:443"));
        assert_eq!(&raw[len..], b"rest");
    }

    #[test]
    fn test_parse_partial_head() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: exa";
        assert!(parse_head(raw, DEFAULT_MAX_HEAD_BYTES).unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let raw = b"\x16\x03\x01\x00\x05hello\r\n\r\n";
        assert!(parse_head(raw, DEFAULT_MAX_HEAD_BYTES).is_err());
    }

    #[test]
    fn test_parse_head_limit() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', 100));
        assert!(parse_head(&raw, 64).is_err());
        raw.extend_from_slice(b"\r\n\r\n");
        assert!(parse_head(&raw, 64).is_err());
    }
}
