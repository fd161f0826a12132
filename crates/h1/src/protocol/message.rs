use bytes::{Buf, Bytes};

/// Represents an item in the HTTP message payload stream.
///
/// Produced by the payload decoders and consumed by the payload encoders: either a piece of
/// body data or the end of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    /// A chunk of payload data
    Chunk(Data),
    /// Marks the end of the payload stream
    Eof,
}

/// How the length of a request body is known. Decided once from the request head.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Payload with known length in bytes
    Length(u64),
    /// Payload using chunked transfer encoding
    Chunked,
    /// Empty payload (no body)
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn new_length(length: u64) -> Self {
        if length == 0 { Self::Empty } else { Self::Length(length) }
    }

    #[inline]
    pub fn new_chunked() -> Self {
        Self::Chunked
    }

    #[inline]
    pub fn new_empty() -> Self {
        Self::Empty
    }

    /// Returns true if the payload uses chunked transfer encoding
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    /// Returns true if the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }
}

/// The framing chosen for a response body. Locked in when the response headers are written.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BodyFraming {
    /// Exactly this many bytes, announced by `Content-Length`
    Length(u64),
    /// `Transfer-Encoding: chunked`, one chunk per flush
    Chunked,
    /// Raw bytes, the body ends when the connection closes. Also used after an upgrade.
    CloseDelimited,
    /// The response can't carry a body (1xx, 204, 205, 304 or a HEAD request)
    NoBody,
}

impl BodyFraming {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, BodyFraming::Chunked)
    }
}

impl<D: Buf> PayloadItem<D> {
    /// Returns true if this item represents the end of the payload stream
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    /// Returns true if this item contains chunk data
    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }
}

impl PayloadItem {
    /// Returns a reference to the contained bytes if this is a Chunk
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }
}
