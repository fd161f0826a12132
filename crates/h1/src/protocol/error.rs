use std::error::Error;
use std::io;

use http::StatusCode;
use thiserror::Error;

/// Error type carried across the application seam.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Connection level failure returned by [`crate::connection::HttpConnection::process`].
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// A request that can not be framed. Each variant maps to the status code sent back when
/// the response has not started yet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("request line too long, limit is {max_size}")]
    RequestLineTooLong { max_size: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid header encoding for {name}")]
    InvalidHeaderEncoding { name: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid transfer-encoding header: {reason}")]
    InvalidTransferEncoding { reason: String },

    #[error("length required")]
    LengthRequired { http10: bool },

    #[error("upgrade request must not carry a body")]
    UpgradeWithBody,

    #[error("malformed chunked body: {reason}")]
    MalformedChunk { reason: String },

    #[error("unexpected end of request content")]
    UnexpectedEndOfRequestContent,

    #[error("request headers timeout")]
    RequestHeadersTimeout,

    #[error("io error: {reason}")]
    Io { reason: String },
}

impl From<io::Error> for ParseError {
    fn from(e: io::Error) -> Self {
        Self::Io { reason: e.to_string() }
    }
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn invalid_transfer_encoding<S: ToString>(str: S) -> Self {
        Self::InvalidTransferEncoding { reason: str.to_string() }
    }

    pub fn malformed_chunk<S: ToString>(str: S) -> Self {
        Self::MalformedChunk { reason: str.to_string() }
    }

    /// The status code of the automatic error response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TooLargeHeader { .. } | Self::TooManyHeaders { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Self::RequestLineTooLong { .. } => StatusCode::URI_TOO_LONG,
            Self::LengthRequired { http10: false } => StatusCode::LENGTH_REQUIRED,
            Self::RequestHeadersTimeout => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Failures of the request body reader.
#[derive(Error, Debug)]
pub enum BodyError {
    #[error("bad request body: {0}")]
    Framing(#[from] ParseError),

    #[error("reader has already completed")]
    ReaderCompleted,

    #[error("read was called again before the previous result was advanced")]
    ReadWithoutAdvance,

    #[error("advance was called without a pending read")]
    AdvanceWithoutRead,

    #[error("invalid advance: consumed {consumed}, examined {examined}, available {available}")]
    InvalidAdvance { consumed: usize, examined: usize, available: usize },

    #[error("the read was canceled")]
    Canceled,

    #[error("the request was aborted")]
    Aborted,

    #[error("request trailers are not available yet")]
    TrailersNotAvailable,

    #[error("synchronous IO is disallowed")]
    SynchronousIoDisallowed,

    #[error("failed to send 100 continue: {0}")]
    Continue(SendError),

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl BodyError {
    /// The framing error behind this failure, if the request itself was malformed.
    pub fn as_parse_error(&self) -> Option<&ParseError> {
        match self {
            Self::Framing(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures of the response writer.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Response Content-Length mismatch: too many bytes written ({written} of {declared}).")]
    TooManyBytesWritten { written: u64, declared: u64 },

    #[error("Response Content-Length mismatch: too few bytes written ({written} of {declared}).")]
    TooFewBytesWritten { written: u64, declared: u64 },

    #[error("writing to the response body is not supported for {status} responses")]
    BodyNotAllowed { status: StatusCode },

    #[error("header {name} is not allowed on {status} responses")]
    HeaderNotAllowed { name: &'static str, status: StatusCode },

    #[error("the response has already started")]
    ResponseAlreadyStarted,

    #[error("the buffer was acquired before the response started and is no longer valid")]
    StaleBuffer,

    #[error("can't advance {count} bytes, only {available} were leased")]
    InvalidAdvance { count: usize, available: usize },

    #[error("the response writer has already completed")]
    WriterCompleted,

    #[error("the request can not be upgraded")]
    NotUpgradable,

    #[error("an on_starting callback failed: {reason}")]
    OnStartingFailed { reason: String },

    #[error("synchronous IO is disallowed")]
    SynchronousIoDisallowed,

    #[error("the request was aborted")]
    Aborted,

    #[error("the flush was canceled")]
    Canceled,

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Failures of a delayed client certificate request.
#[derive(Error, Debug)]
pub enum RenegotiateError {
    #[error("the request body must be fully read before renegotiating")]
    BodyNotDrained,

    #[error("renegotiation failed: {source}")]
    Failed { source: BoxError },
}
