//! HTTP request header handling.
//!
//! Wraps `http::Request<()>` and adds the connection-management questions the server asks of
//! every request head: keep-alive, upgrade, `Expect: 100-continue` and declared trailers.

use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT, TRAILER, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, HeaderName, Method, Request, Uri, Version};

use crate::utils::{has_token, tokens};

#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl Default for RequestHeader {
    fn default() -> Self {
        Self { inner: Request::new(()) }
    }
}

impl RequestHeader {
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// The path of the request target. For absolute-form targets this is the path component
    /// only, independent of the `Host` header.
    pub fn path(&self) -> &str {
        self.inner.uri().path()
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.uri().query()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn is_head(&self) -> bool {
        self.inner.method() == Method::HEAD
    }

    /// POST and PUT must declare their body framing.
    pub fn requires_length(&self) -> bool {
        matches!(self.method(), &Method::POST | &Method::PUT)
    }

    /// Whether the client asked to keep the connection open after this exchange.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0 needs an explicit
    /// `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self.headers().get_all(CONNECTION);
        match self.version() {
            Version::HTTP_10 => has_token(connection, "keep-alive"),
            _ => !has_token(connection, "close"),
        }
    }

    /// `Transfer-Encoding` and `Content-Length` together. The body is read as chunked but the
    /// connection is not reused afterwards.
    pub fn has_conflicting_length(&self) -> bool {
        self.headers().contains_key(TRANSFER_ENCODING) && self.headers().contains_key(CONTENT_LENGTH)
    }

    /// A request is upgradable when its `Connection` header carries the `upgrade` token.
    pub fn is_upgrade(&self) -> bool {
        has_token(self.headers().get_all(CONNECTION), "upgrade")
    }

    /// The protocol requested through the `Upgrade` header, if any.
    pub fn upgrade_protocol(&self) -> Option<&str> {
        self.headers().get(UPGRADE).and_then(|v| v.to_str().ok())
    }

    /// `Expect: 100-continue` on an HTTP/1.1 request.
    pub fn expects_continue(&self) -> bool {
        self.version() != Version::HTTP_10
            && self
                .headers()
                .get(EXPECT)
                .is_some_and(|v| v.as_bytes().trim_ascii().eq_ignore_ascii_case(b"100-continue"))
    }

    /// The trailer names announced by the `Trailer` header.
    pub fn declared_trailers(&self) -> Vec<HeaderName> {
        tokens(self.headers().get_all(TRAILER)).filter_map(|t| HeaderName::from_bytes(t).ok()).collect()
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}
