//! Encoder for chunked response bodies, see
//! [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1).

use std::io::Write;

use bytes::{Buf, BufMut, BytesMut};
use http::HeaderMap;
use tokio_util::codec::Encoder;

use crate::codec::header::{encode_fields, FastWrite};
use crate::protocol::{PayloadItem, SendError};

/// Bytes a chunk adds around its data besides the hex size: the CRLF after the size line and the
/// CRLF after the data.
pub const CHUNK_CRLF_OVERHEAD: usize = 4;

/// The framing overhead of a chunk carrying `len` bytes.
pub fn chunk_overhead(len: usize) -> usize {
    if len == 0 { 0 } else { hex_digits(len) + CHUNK_CRLF_OVERHEAD }
}

fn hex_digits(len: usize) -> usize {
    (usize::BITS - len.leading_zeros()).div_ceil(4) as usize
}

/// Writes one chunk per [`PayloadItem::Chunk`]. Empty chunks are skipped since a zero size line
/// ends the body. [`PayloadItem::Eof`] writes the last chunk and the trailers, once.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkedEncoder {
    eof: bool,
    trailers: HeaderMap,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trailer fields written after the last chunk.
    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        match item {
            PayloadItem::Chunk(mut bytes) => {
                let len = bytes.remaining();
                if len == 0 {
                    return Ok(());
                }
                dst.reserve(len + chunk_overhead(len));
                write!(FastWrite(dst), "{len:X}\r\n")?;
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let n = chunk.len();
                    dst.put_slice(chunk);
                    bytes.advance(n);
                }
                dst.put_slice(b"\r\n");
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                dst.put_slice(b"0\r\n");
                encode_fields(&self.trailers, dst);
                dst.put_slice(b"\r\n");
                Ok(())
            }
        }
    }
}
