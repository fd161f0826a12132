//! Server settings consumed by the connection core.
//!
//! A [`ServerConfig`] is built once and shared by every connection as an `Arc`, so each
//! connection reads an immutable snapshot.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue};
use thiserror::Error;

use crate::ensure;

/// How the bytes of a request header value are turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderEncoding {
    /// Strict UTF-8, invalid sequences reject the request with 400
    #[default]
    Utf8,
    /// ISO-8859-1, every byte maps to one char
    Latin1,
}

impl HeaderEncoding {
    /// Whether `bytes` is valid in this encoding.
    pub fn validate(self, bytes: &[u8]) -> bool {
        match self {
            HeaderEncoding::Utf8 => std::str::from_utf8(bytes).is_ok(),
            HeaderEncoding::Latin1 => true,
        }
    }

    /// Decodes a header value. Invalid UTF-8 is replaced, values are validated on receipt.
    pub fn decode(self, value: &HeaderValue) -> Cow<'_, str> {
        match self {
            HeaderEncoding::Utf8 => String::from_utf8_lossy(value.as_bytes()),
            HeaderEncoding::Latin1 => match value.to_str() {
                Ok(ascii) => Cow::Borrowed(ascii),
                Err(_) => Cow::Owned(value.as_bytes().iter().map(|b| char::from(*b)).collect()),
            },
        }
    }
}

/// Picks the encoding of a header by name. `None` falls back to UTF-8.
pub type HeaderEncodingSelector = Arc<dyn Fn(&HeaderName) -> Option<HeaderEncoding> + Send + Sync>;

/// The slowest acceptable request body upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinDataRate {
    pub bytes_per_second: f64,
    pub grace_period: Duration,
}

impl MinDataRate {
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Self {
        Self { bytes_per_second, grace_period }
    }

    /// How long reading `bytes` may take in total before the rate counts as too slow.
    pub fn allowed_time(&self, bytes: u64) -> Duration {
        #[allow(clippy::cast_precision_loss, reason = "byte counts far below 2^52")]
        let at_rate = Duration::from_secs_f64(bytes as f64 / self.bytes_per_second);
        at_rate.max(self.grace_period)
    }
}

impl Default for MinDataRate {
    fn default() -> Self {
        Self { bytes_per_second: 240.0, grace_period: Duration::from_secs(5) }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

#[derive(Clone)]
pub struct ServerConfig {
    max_request_line_size: usize,
    max_request_headers_total_size: usize,
    max_request_header_count: usize,
    header_encoding_selector: Option<HeaderEncodingSelector>,
    allow_bare_lf: bool,
    allow_synchronous_io: bool,
    min_request_body_data_rate: Option<MinDataRate>,
    keep_alive_timeout: Duration,
    request_headers_timeout: Duration,
    shutdown_timeout: Duration,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("max_request_line_size", &self.max_request_line_size)
            .field("max_request_headers_total_size", &self.max_request_headers_total_size)
            .field("max_request_header_count", &self.max_request_header_count)
            .field("header_encoding_selector", &self.header_encoding_selector.is_some())
            .field("allow_bare_lf", &self.allow_bare_lf)
            .field("allow_synchronous_io", &self.allow_synchronous_io)
            .field("min_request_body_data_rate", &self.min_request_body_data_rate)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("request_headers_timeout", &self.request_headers_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_request_line_size: 8 * 1024,
            max_request_headers_total_size: 32 * 1024,
            max_request_header_count: 100,
            header_encoding_selector: None,
            allow_bare_lf: false,
            allow_synchronous_io: false,
            min_request_body_data_rate: Some(MinDataRate::default()),
            keep_alive_timeout: Duration::from_secs(130),
            request_headers_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder { config: ServerConfig::default() }
    }

    pub fn max_request_line_size(&self) -> usize {
        self.max_request_line_size
    }

    pub fn max_request_headers_total_size(&self) -> usize {
        self.max_request_headers_total_size
    }

    pub fn max_request_header_count(&self) -> usize {
        self.max_request_header_count
    }

    /// The encoding used for a given request header.
    pub fn header_encoding(&self, name: &HeaderName) -> HeaderEncoding {
        self.header_encoding_selector.as_ref().and_then(|select| select(name)).unwrap_or_default()
    }

    pub fn allow_bare_lf(&self) -> bool {
        self.allow_bare_lf
    }

    pub fn allow_synchronous_io(&self) -> bool {
        self.allow_synchronous_io
    }

    pub fn min_request_body_data_rate(&self) -> Option<MinDataRate> {
        self.min_request_body_data_rate
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }

    pub fn request_headers_timeout(&self) -> Duration {
        self.request_headers_timeout
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn max_request_line_size(mut self, size: usize) -> Self {
        self.config.max_request_line_size = size;
        self
    }

    pub fn max_request_headers_total_size(mut self, size: usize) -> Self {
        self.config.max_request_headers_total_size = size;
        self
    }

    pub fn max_request_header_count(mut self, count: usize) -> Self {
        self.config.max_request_header_count = count;
        self
    }

    pub fn header_encoding_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&HeaderName) -> Option<HeaderEncoding> + Send + Sync + 'static,
    {
        self.config.header_encoding_selector = Some(Arc::new(selector));
        self
    }

    pub fn allow_bare_lf(mut self, allow: bool) -> Self {
        self.config.allow_bare_lf = allow;
        self
    }

    pub fn allow_synchronous_io(mut self, allow: bool) -> Self {
        self.config.allow_synchronous_io = allow;
        self
    }

    pub fn min_request_body_data_rate(mut self, rate: Option<MinDataRate>) -> Self {
        self.config.min_request_body_data_rate = rate;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keep_alive_timeout = timeout;
        self
    }

    pub fn request_headers_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_headers_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let config = self.config;
        ensure!(config.max_request_line_size > 0, ConfigError::Zero { name: "max_request_line_size" });
        ensure!(config.max_request_headers_total_size > 0, ConfigError::Zero { name: "max_request_headers_total_size" });
        ensure!(config.max_request_header_count > 0, ConfigError::Zero { name: "max_request_header_count" });
        if let Some(rate) = config.min_request_body_data_rate {
            ensure!(rate.bytes_per_second > 0.0, ConfigError::Zero { name: "min_request_body_data_rate" });
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rejects_zero_limits() {
        let result = ServerConfig::builder().max_request_header_count(0).build();
        assert_eq!(result.unwrap_err(), ConfigError::Zero { name: "max_request_header_count" });

        let result = ServerConfig::builder().min_request_body_data_rate(Some(MinDataRate::new(0.0, Duration::ZERO))).build();
        assert!(result.is_err());
    }

    #[test]
    fn encoding_selector_defaults_to_utf8() {
        let config = ServerConfig::builder()
            .header_encoding_selector(|name| (name.as_str() == "x-latin").then_some(HeaderEncoding::Latin1))
            .build()
            .unwrap();

        assert_eq!(config.header_encoding(&HeaderName::from_static("x-latin")), HeaderEncoding::Latin1);
        assert_eq!(config.header_encoding(&HeaderName::from_static("host")), HeaderEncoding::Utf8);
    }

    #[test]
    fn latin1_decoding() {
        let value = HeaderValue::from_bytes(b"caf\xe9").unwrap();
        assert!(!HeaderEncoding::Utf8.validate(value.as_bytes()));
        assert!(HeaderEncoding::Latin1.validate(value.as_bytes()));
        assert_eq!(HeaderEncoding::Latin1.decode(&value), "café");
    }

    #[test]
    fn data_rate_allowance() {
        let rate = MinDataRate::new(100.0, Duration::from_secs(2));
        assert_eq!(rate.allowed_time(0), Duration::from_secs(2));
        assert_eq!(rate.allowed_time(1000), Duration::from_secs(10));
    }
}
