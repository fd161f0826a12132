//! HTTP header decoder for parsing request heads
//!
//! Turns the request line and header fields into a [`RequestHeader`], decides how the body is
//! framed and reports how much of the header budget is left for chunked trailers.
//!
//! # Limits
//!
//! All limits come from [`ServerConfig`]:
//!
//! - the request line, including its line terminator, may not exceed `max_request_line_size`
//!   (414 otherwise)
//! - the header lines, each counted with its CRLF but without the request line and the blank
//!   line, may not exceed `max_request_headers_total_size` (431 otherwise)
//! - at most `max_request_header_count` fields (431 otherwise)
//!
//! # Body strategy
//!
//! Follows RFC 9112 section 6.3: a `Transfer-Encoding` whose final coding is `chunked` selects the
//! chunked decoder, any other final coding is rejected. Otherwise `Content-Length` gives the
//! length, all repeated values must agree. POST and PUT without either are rejected with 411
//! (400 on HTTP/1.0), other methods have no body.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::header::HeaderBudget;
use crate::config::ServerConfig;
use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader};
use crate::utils::{is_chunked, tokens};

/// Decoder for HTTP request heads implementing the [`Decoder`] trait.
#[derive(Debug, Clone)]
pub struct HeaderDecoder {
    config: Arc<ServerConfig>,
}

impl HeaderDecoder {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize, HeaderBudget);
    type Error = ParseError;

    /// Attempts to decode a request head from the provided bytes buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((header, payload_size, budget)))` once the head is complete, the head bytes are
    ///   removed from `src`
    /// - `Ok(None)` if more data is needed
    /// - `Err(ParseError)` if the head is malformed or over a limit
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let max_line = self.config.max_request_line_size();
        let max_bytes = self.config.max_request_headers_total_size();
        let max_count = self.config.max_request_header_count();

        let Some(line_end) = src.iter().position(|b| *b == b'\n') else {
            ensure!(src.len() <= max_line, ParseError::RequestLineTooLong { max_size: max_line });
            return Ok(None);
        };
        let request_line_len = line_end + 1;
        ensure!(request_line_len <= max_line, ParseError::RequestLineTooLong { max_size: max_line });

        let mut budget = HeaderBudget::new(max_bytes, max_count);

        let mut headers = vec![httparse::EMPTY_HEADER; max_count];
        let mut req = httparse::Request::new(&mut headers);

        let parsed_result = req.parse(&src[..]).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(max_count),
            e => ParseError::invalid_header(e),
        });

        let body_offset = match parsed_result? {
            Status::Complete(body_offset) => body_offset,
            Status::Partial => {
                budget.check_pending(src.len() - request_line_len)?;
                return Ok(None);
            }
        };
        trace!(head_size = body_offset, "parsed request head");

        if !self.config.allow_bare_lf() {
            ensure!(!has_bare_lf(&src[..body_offset]), ParseError::invalid_header("bare LF line terminator"));
        }

        let terminator = if src[..body_offset].ends_with(b"\r\n") { 2 } else { 1 };
        let header_bytes = body_offset.saturating_sub(request_line_len + terminator);
        let header_count = req.headers.len();
        budget.consume(header_bytes, header_count)?;

        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            // http2 and http3 are not spoken here
            v => return Err(ParseError::InvalidVersion(v)),
        };
        let method = req.method.and_then(|m| Method::from_bytes(m.as_bytes()).ok()).ok_or(ParseError::InvalidMethod)?;
        let uri = req.path.and_then(|p| Uri::try_from(p).ok()).ok_or(ParseError::InvalidUri)?;

        let mut header_map = HeaderMap::with_capacity(header_count);
        for header in req.headers.iter() {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_bytes(header.value).map_err(ParseError::invalid_header)?;
            ensure!(
                self.config.header_encoding(&name).validate(value.as_bytes()),
                ParseError::InvalidHeaderEncoding { name: name.to_string() }
            );
            header_map.append(name, value);
        }

        let mut request = Request::new(());
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.version_mut() = version;
        *request.headers_mut() = header_map;
        let header = RequestHeader::from(request);

        src.advance(body_offset);

        let payload_size = parse_payload(&header)?;
        Ok(Some((header, payload_size, budget)))
    }
}

pub(crate) fn has_bare_lf(bytes: &[u8]) -> bool {
    bytes.iter().enumerate().any(|(i, b)| *b == b'\n' && (i == 0 || bytes[i - 1] != b'\r'))
}

/// Determines how the request body is framed.
///
/// # Errors
///
/// - `Transfer-Encoding` whose final coding is not `chunked`, regardless of `Content-Length`
/// - invalid or disagreeing `Content-Length` values
/// - an upgrade request that carries a body
/// - POST or PUT without any framing
fn parse_payload(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    // refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length
    let headers = header.headers();
    let has_transfer_encoding = headers.contains_key(TRANSFER_ENCODING);

    if header.is_upgrade() {
        let length = content_length(headers)?;
        ensure!(!has_transfer_encoding && length.unwrap_or(0) == 0, ParseError::UpgradeWithBody);
        return Ok(PayloadSize::new_empty());
    }

    if has_transfer_encoding {
        ensure!(
            is_chunked(headers.get_all(TRANSFER_ENCODING)),
            ParseError::invalid_transfer_encoding("the final transfer coding is not chunked")
        );
        return Ok(PayloadSize::new_chunked());
    }

    match content_length(headers)? {
        Some(length) => Ok(PayloadSize::new_length(length)),
        None if header.requires_length() => {
            Err(ParseError::LengthRequired { http10: header.version() == Version::HTTP_10 })
        }
        None => Ok(PayloadSize::new_empty()),
    }
}

/// Parses every `Content-Length` value; repeated values must agree.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for token in tokens(headers.get_all(CONTENT_LENGTH)) {
        ensure!(token.iter().all(u8::is_ascii_digit), ParseError::invalid_content_length("value is not a number"));
        let parsed = std::str::from_utf8(token)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| ParseError::invalid_content_length("value overflows u64"))?;
        match length {
            Some(previous) => ensure!(previous == parsed, ParseError::invalid_content_length("conflicting values")),
            None => length = Some(parsed),
        }
    }
    if length.is_none() && headers.contains_key(CONTENT_LENGTH) {
        return Err(ParseError::invalid_content_length("empty value"));
    }
    Ok(length)
}
