//! A unified decoder for request bodies.
//!
//! Picks the decoding strategy from the [`PayloadSize`] decided by the header decoder:
//! - Content-Length based payloads
//! - Chunked transfer encoding
//! - Messages with no body
//! - Raw bytes until the peer closes, once the connection has been upgraded

use std::sync::Arc;

use bytes::BytesMut;
use http::HeaderMap;
use tokio_util::codec::Decoder;

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::codec::header::HeaderBudget;
use crate::config::ServerConfig;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};

#[derive(Debug, Clone)]
pub struct PayloadDecoder {
    kind: Kind,
}

#[derive(Debug, Clone)]
enum Kind {
    /// Decode payload with a fixed content length
    Length(LengthDecoder),

    /// Decode payload using chunked transfer encoding
    Chunked(ChunkedDecoder),

    /// Handle messages with no body
    NoBody,

    /// Pass every byte through until the peer closes
    UntilEof,
}

impl PayloadDecoder {
    /// Creates the decoder matching a request's framing. Chunked trailers are charged against
    /// `budget`.
    pub fn new(size: PayloadSize, budget: HeaderBudget, config: &Arc<ServerConfig>) -> Self {
        match size {
            PayloadSize::Length(length) => Self::fix_length(length),
            PayloadSize::Chunked => Self { kind: Kind::Chunked(ChunkedDecoder::new(budget, Arc::clone(config))) },
            PayloadSize::Empty => Self::empty(),
        }
    }

    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new(HeaderBudget::unlimited(), Arc::new(ServerConfig::default()))) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthDecoder::new(size)) }
    }

    /// Creates a decoder for an upgraded connection: every byte is payload.
    pub fn until_eof() -> Self {
        Self { kind: Kind::UntilEof }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::NoBody)
    }

    /// The trailers of a chunked body, once it has been fully decoded.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        match &mut self.kind {
            Kind::Chunked(chunked_decoder) => chunked_decoder.take_trailers(),
            _ => None,
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(length_decoder) => length_decoder.decode(src),
            Kind::Chunked(chunked_decoder) => chunked_decoder.decode(src),
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
            Kind::UntilEof if src.is_empty() => Ok(None),
            Kind::UntilEof => Ok(Some(PayloadItem::Chunk(src.split().freeze()))),
        }
    }

    /// Called once the peer closed its side. Only an upgraded stream may end there, every other
    /// body that is not complete yet was cut short.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::UntilEof if src.is_empty() => Ok(Some(PayloadItem::Eof)),
            _ => match self.decode(src)? {
                Some(item) => Ok(Some(item)),
                None => Err(ParseError::UnexpectedEndOfRequestContent),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_strategy_from_size() {
        let budget = HeaderBudget::unlimited();
        let config = Arc::new(ServerConfig::default());
        assert!(PayloadDecoder::new(PayloadSize::Empty, budget, &config).is_empty());
        assert!(PayloadDecoder::new(PayloadSize::Chunked, budget, &config).is_chunked());

        let mut decoder = PayloadDecoder::new(PayloadSize::Length(3), budget, &config);
        let mut buffer = BytesMut::from(&b"abcGET"[..]);
        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().as_bytes().unwrap(), "abc");
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(&buffer[..], b"GET");
    }

    #[test]
    fn no_body_is_eof_right_away() {
        let mut buffer = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(PayloadDecoder::empty().decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn chunked_cut_short() {
        let mut decoder = PayloadDecoder::chunked();
        let mut buffer = BytesMut::from(&b"5\r\nhel"[..]);
        assert!(decoder.decode_eof(&mut buffer).unwrap().unwrap().is_chunk());
        assert_eq!(decoder.decode_eof(&mut buffer).unwrap_err(), ParseError::UnexpectedEndOfRequestContent);
    }

    #[test]
    fn chunked_trailers() {
        let mut decoder = PayloadDecoder::chunked();
        let mut buffer = BytesMut::from(&b"0\r\nX-Sum: 7\r\n\r\n"[..]);
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(decoder.take_trailers().unwrap()["x-sum"], "7");
        assert!(decoder.take_trailers().is_none());
    }

    #[test]
    fn until_eof() {
        let mut decoder = PayloadDecoder::until_eof();
        let mut buffer = BytesMut::from(&b"raw bytes"[..]);
        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().as_bytes().unwrap(), "raw bytes");
        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert!(decoder.decode_eof(&mut buffer).unwrap().unwrap().is_eof());
    }
}
