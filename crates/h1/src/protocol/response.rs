//! HTTP response header handling.
//!
//! The response head is an `http::Response<()>`; the body travels separately through the
//! response writer. [`prepare_head`] turns the head the application built into the head that
//! goes on the wire, deciding the body framing and whether the connection survives.

use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Response, StatusCode, Version};

use crate::protocol::{BodyFraming, SendError};
use crate::utils::{has_token, is_chunked};

/// Type alias for HTTP response headers.
///
/// This type represents the header portion of an HTTP response, using
/// `http::Response<()>` with an empty body placeholder.
pub type ResponseHead = Response<()>;

/// The interim response sent before the first body read of an `Expect: 100-continue` request.
pub(crate) const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// What the response framing depends on besides the response head itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFacts {
    pub version: Version,
    pub is_head: bool,
    pub keep_alive: bool,
}

impl Default for RequestFacts {
    fn default() -> Self {
        Self { version: Version::HTTP_11, is_head: false, keep_alive: true }
    }
}

/// The outcome of [`prepare_head`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepared {
    pub framing: BodyFraming,
    pub keep_alive: bool,
}

/// Statuses that never carry a body.
pub fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::RESET_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// The `Content-Length` the application declared, ignored when a `Transfer-Encoding` is set.
pub fn declared_length(headers: &HeaderMap) -> Result<Option<u64>, SendError> {
    if headers.contains_key(TRANSFER_ENCODING) {
        return Ok(None);
    }
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| SendError::invalid_body("response content-length is not a number")),
    }
}

/// Completes the response head and decides its body framing.
///
/// `app_completed` is true when the head is produced after the application returned without
/// writing, in which case an unframed body is known to be empty.
pub fn prepare_head(head: &mut ResponseHead, request: RequestFacts, app_completed: bool) -> Result<Prepared, SendError> {
    let status = head.status();
    let headers = head.headers_mut();
    let mut keep_alive = request.keep_alive;

    let has_connection = headers.contains_key(CONNECTION);
    if keep_alive && has_connection && !has_token(headers.get_all(CONNECTION), "keep-alive") {
        keep_alive = false;
    }

    // a final coding other than chunked can only be delimited by closing the connection
    let has_transfer_encoding = headers.contains_key(TRANSFER_ENCODING);
    if has_transfer_encoding && !is_chunked(headers.get_all(TRANSFER_ENCODING)) {
        keep_alive = false;
    }

    let framing = if status_forbids_body(status) {
        if has_transfer_encoding {
            return Err(SendError::HeaderNotAllowed { name: "Transfer-Encoding", status });
        }
        if status == StatusCode::RESET_CONTENT {
            if !headers.contains_key(CONTENT_LENGTH) {
                headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
        } else if headers.get(CONTENT_LENGTH).is_some_and(|v| v.as_bytes().trim_ascii() == b"0") {
            headers.remove(CONTENT_LENGTH);
        }
        BodyFraming::NoBody
    } else if request.is_head {
        BodyFraming::NoBody
    } else if has_transfer_encoding {
        if is_chunked(headers.get_all(TRANSFER_ENCODING)) { BodyFraming::Chunked } else { BodyFraming::CloseDelimited }
    } else if let Some(length) = declared_length(headers)? {
        BodyFraming::Length(length)
    } else if app_completed {
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        BodyFraming::Length(0)
    } else if request.version == Version::HTTP_11 && keep_alive {
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        BodyFraming::Chunked
    } else {
        keep_alive = false;
        BodyFraming::CloseDelimited
    };

    if !has_connection {
        if !keep_alive {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        } else if request.version == Version::HTTP_10 {
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
    }

    Ok(Prepared { framing, keep_alive })
}

/// Replaces the head with a bodyless error response.
pub fn reset_to_error(head: &mut ResponseHead, status: StatusCode) {
    *head = Response::new(());
    *head.status_mut() = status;
    head.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTTP11: RequestFacts = RequestFacts { version: Version::HTTP_11, is_head: false, keep_alive: true };
    const HTTP10_KEEP_ALIVE: RequestFacts = RequestFacts { version: Version::HTTP_10, is_head: false, keep_alive: true };

    fn head(status: u16, headers: &[(&str, &str)]) -> ResponseHead {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn http11_defaults_to_chunked() {
        let mut h = head(200, &[]);
        let prepared = prepare_head(&mut h, HTTP11, false).unwrap();
        assert_eq!(prepared, Prepared { framing: BodyFraming::Chunked, keep_alive: true });
        assert_eq!(h.headers()[TRANSFER_ENCODING], "chunked");
    }

    #[test]
    fn completed_without_body_is_zero_length() {
        let mut h = head(200, &[]);
        let prepared = prepare_head(&mut h, HTTP11, true).unwrap();
        assert_eq!(prepared.framing, BodyFraming::Length(0));
        assert_eq!(h.headers()[CONTENT_LENGTH], "0");
        assert!(!h.headers().contains_key(CONNECTION));
    }

    #[test]
    fn transfer_encoding_wins_over_content_length() {
        let mut h = head(200, &[("Content-Length", "11"), ("Transfer-Encoding", "chunked")]);
        let prepared = prepare_head(&mut h, HTTP11, false).unwrap();
        assert_eq!(prepared.framing, BodyFraming::Chunked);
        assert_eq!(h.headers()[CONTENT_LENGTH], "11");
    }

    #[test]
    fn non_chunked_final_coding_forces_close() {
        let mut h = head(200, &[("Transfer-Encoding", "gzip"), ("Connection", "keep-alive")]);
        let prepared = prepare_head(&mut h, HTTP11, false).unwrap();
        assert_eq!(prepared, Prepared { framing: BodyFraming::CloseDelimited, keep_alive: false });
        // the application owns the connection header, it is not rewritten
        assert_eq!(h.headers()[CONNECTION], "keep-alive");
    }

    #[test]
    fn http10_keep_alive_needs_content_length() {
        let mut h = head(200, &[]);
        let prepared = prepare_head(&mut h, HTTP10_KEEP_ALIVE, false).unwrap();
        assert_eq!(prepared, Prepared { framing: BodyFraming::CloseDelimited, keep_alive: false });
        assert_eq!(h.headers()[CONNECTION], "close");

        let mut h = head(200, &[("Content-Length", "11")]);
        let prepared = prepare_head(&mut h, HTTP10_KEEP_ALIVE, false).unwrap();
        assert_eq!(prepared, Prepared { framing: BodyFraming::Length(11), keep_alive: true });
        assert_eq!(h.headers()[CONNECTION], "keep-alive");
    }

    #[test]
    fn no_body_statuses() {
        let mut h = head(204, &[("Content-Length", "0")]);
        assert_eq!(prepare_head(&mut h, HTTP11, true).unwrap().framing, BodyFraming::NoBody);
        assert!(!h.headers().contains_key(CONTENT_LENGTH));

        let mut h = head(205, &[]);
        assert_eq!(prepare_head(&mut h, HTTP11, true).unwrap().framing, BodyFraming::NoBody);
        assert_eq!(h.headers()[CONTENT_LENGTH], "0");

        let mut h = head(304, &[("Transfer-Encoding", "chunked")]);
        assert!(matches!(prepare_head(&mut h, HTTP11, false), Err(SendError::HeaderNotAllowed { .. })));
    }

    #[test]
    fn head_requests_get_no_automatic_framing() {
        let mut h = head(200, &[]);
        let facts = RequestFacts { is_head: true, ..HTTP11 };
        assert_eq!(prepare_head(&mut h, facts, true).unwrap().framing, BodyFraming::NoBody);
        assert!(h.headers().is_empty());
    }

    #[test]
    fn connection_header_without_keep_alive_closes() {
        let mut h = head(200, &[("Connection", "close"), ("Content-Length", "2")]);
        let prepared = prepare_head(&mut h, HTTP11, false).unwrap();
        assert_eq!(prepared, Prepared { framing: BodyFraming::Length(2), keep_alive: false });
        assert_eq!(h.headers().get_all(CONNECTION).iter().count(), 1);
    }
}
