use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::Encoder;

use crate::protocol::{PayloadItem, SendError};

/// Passes body bytes through unchanged, up to the declared length.
///
/// The response writer checks the byte count before anything reaches the encoder, this only
/// refuses to write past the length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    length: u64,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { length }
    }

    pub fn is_finish(&self) -> bool {
        self.length == 0
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(mut bytes) => {
                if !bytes.has_remaining() {
                    return Ok(());
                }
                let len = bytes.remaining() as u64;
                if len > self.length {
                    return Err(SendError::invalid_body(format!("{len} bytes exceed the remaining {}", self.length)));
                }
                dst.reserve(bytes.remaining());
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let n = chunk.len();
                    dst.put_slice(chunk);
                    bytes.advance(n);
                }
                self.length -= len;
                Ok(())
            }
            PayloadItem::Eof => Ok(()),
        }
    }
}
