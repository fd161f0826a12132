//! Encoder for response bodies, one strategy per [`BodyFraming`].

use bytes::{Buf, BufMut, BytesMut};
use http::HeaderMap;
use tokio_util::codec::Encoder;
use tracing::debug;

use crate::codec::body::chunked_encoder::ChunkedEncoder;
use crate::codec::body::length_encoder::LengthEncoder;
use crate::protocol::{BodyFraming, PayloadItem, SendError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// content-length payload
    Length(LengthEncoder),

    /// transfer-encoding chunked payload
    Chunked(ChunkedEncoder),

    /// raw bytes until the connection closes
    CloseDelimited,

    /// the response has no body, data is dropped
    NoBody,
}

impl PayloadEncoder {
    pub fn new(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::Length(length) => Self::fix_length(length),
            BodyFraming::Chunked => Self::chunked(),
            BodyFraming::CloseDelimited => Self { kind: Kind::CloseDelimited },
            BodyFraming::NoBody => Self::empty(),
        }
    }

    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedEncoder::new()) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthEncoder::new(size)) }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::NoBody)
    }

    /// Trailer fields for a chunked body. Only chunked bodies can carry them, the fields are
    /// dropped for every other framing.
    pub fn set_trailers(&mut self, trailers: HeaderMap) {
        match &mut self.kind {
            Kind::Chunked(encoder) => *encoder.trailers_mut() = trailers,
            _ if trailers.is_empty() => {}
            _ => debug!(count = trailers.len(), "dropping response trailers, the body is not chunked"),
        }
    }

    pub fn is_finish(&self) -> bool {
        match &self.kind {
            Kind::Length(encoder) => encoder.is_finish(),
            Kind::Chunked(encoder) => encoder.is_finish(),
            Kind::CloseDelimited | Kind::NoBody => true,
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            Kind::Length(encoder) => encoder.encode(item, dst),
            Kind::Chunked(encoder) => encoder.encode(item, dst),
            Kind::CloseDelimited => {
                if let PayloadItem::Chunk(mut bytes) = item {
                    while bytes.has_remaining() {
                        let chunk = bytes.chunk();
                        let n = chunk.len();
                        dst.put_slice(chunk);
                        bytes.advance(n);
                    }
                }
                Ok(())
            }
            Kind::NoBody => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderValue;

    fn encode_all(mut encoder: PayloadEncoder, chunks: &[&'static [u8]]) -> BytesMut {
        let mut dst = BytesMut::new();
        for chunk in chunks {
            encoder.encode(PayloadItem::Chunk(Bytes::from_static(chunk)), &mut dst).unwrap();
        }
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();
        dst
    }

    #[test]
    fn framing_strategies() {
        assert_eq!(&encode_all(PayloadEncoder::new(BodyFraming::Length(4)), &[b"ab", b"cd"])[..], b"abcd");
        assert_eq!(&encode_all(PayloadEncoder::new(BodyFraming::CloseDelimited), &[b"ab", b"cd"])[..], b"abcd");
        assert!(encode_all(PayloadEncoder::new(BodyFraming::NoBody), &[b"ab"]).is_empty());
        assert_eq!(
            &encode_all(PayloadEncoder::new(BodyFraming::Chunked), &[b"ab", b"cd"])[..],
            b"2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn trailers_only_for_chunked() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-sum", HeaderValue::from_static("1"));

        let mut encoder = PayloadEncoder::new(BodyFraming::Length(0));
        encoder.set_trailers(trailers.clone());
        assert!(encode_all(encoder, &[]).is_empty());

        let mut encoder = PayloadEncoder::chunked();
        encoder.set_trailers(trailers);
        assert_eq!(&encode_all(encoder, &[])[..], b"0\r\nX-Sum: 1\r\n\r\n");
    }
}
