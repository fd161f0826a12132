//! HTTP header encoder for serializing response heads
//!
//! Writes the status line and the header fields of a head that already went through
//! [`crate::protocol::prepare_head`]. The status line always announces `HTTP/1.1`, whatever the
//! request version was; header fields are written in `HeaderMap` order with title-cased names.

use std::io;
use std::io::Write;

use bytes::{BufMut, BytesMut};
use http::HeaderMap;
use tokio_util::codec::Encoder;

use crate::protocol::{ResponseHead, SendError};

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encoder for HTTP response heads implementing the [`Encoder`] trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderEncoder;

impl Encoder<&ResponseHead> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, header: &ResponseHead, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(INIT_HEADER_SIZE);

        let status = header.status();
        write!(FastWrite(dst), "HTTP/1.1 {} {}\r\n", status.as_str(), status.canonical_reason().unwrap_or(""))?;

        encode_fields(header.headers(), dst);
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Writes `Name: value\r\n` lines, shared with the chunked trailer block.
pub(crate) fn encode_fields(headers: &HeaderMap, dst: &mut BytesMut) {
    for (header_name, header_value) in headers {
        title_case(dst, header_name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(header_value.as_bytes());
        dst.put_slice(b"\r\n");
    }
}

// header names are lowercase ASCII in `http`, the wire gets `Content-Length` style names
fn title_case(dst: &mut BytesMut, name: &[u8]) {
    dst.reserve(name.len());

    let mut prev = b'-';
    for &(mut c) in name {
        if prev == b'-' {
            c.make_ascii_uppercase();
        }
        dst.put_u8(c);
        prev = c;
    }
}

/// `io::Write` adapter over a `BytesMut`, so `write!` can format straight into the buffer.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Response;

    #[test]
    fn encodes_status_line_and_headers_in_order() {
        let head = Response::builder()
            .status(200)
            .header("X-First", "1")
            .header("Content-Length", "11")
            .header("x-first", "2")
            .body(())
            .unwrap();

        let mut dst = BytesMut::new();
        HeaderEncoder.encode(&head, &mut dst).unwrap();

        assert_eq!(&dst[..], &b"HTTP/1.1 200 OK\r\nX-First: 1\r\nX-First: 2\r\nContent-Length: 11\r\n\r\n"[..]);
    }

    #[test]
    fn unknown_status_has_empty_reason() {
        let head = Response::builder().status(599).body(()).unwrap();
        let mut dst = BytesMut::new();
        HeaderEncoder.encode(&head, &mut dst).unwrap();
        assert_eq!(&dst[..], &b"HTTP/1.1 599 \r\n\r\n"[..]);
    }
}
