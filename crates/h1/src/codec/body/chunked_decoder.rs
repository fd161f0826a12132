//! Decoder implementation for HTTP chunked transfer encoding.
//!
//! This module decodes bodies framed as specified in
//! [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1).
//!
//! Chunk extensions are validated and dropped. The trailer block after the last chunk is parsed
//! into a `HeaderMap`, charged against the header budget left over by the request head and checked
//! against the configured header encodings.

use std::sync::Arc;
use std::task::Poll;

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;
use ChunkedState::*;

use crate::codec::header::{has_bare_lf, HeaderBudget};
use crate::config::ServerConfig;
use crate::ensure;
use crate::protocol::{ParseError, PayloadItem};

/// A decoder for handling HTTP chunked transfer encoding.
///
/// The decoder processes incoming bytes according to the chunked format:
/// - Each chunk starts with its size in hexadecimal
/// - Followed by optional extensions and CRLF
/// - Then the chunk data and CRLF
/// - A zero-sized chunk ends the body, followed by optional trailer fields and a blank line
#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    remaining_size: u64,
    size_digits: usize,
    allow_bare_lf: bool,
    budget: HeaderBudget,
    config: Arc<ServerConfig>,
    trailers: Option<HeaderMap>,
}

impl ChunkedDecoder {
    /// Creates a decoder that charges trailers against `budget`. Line terminators and trailer
    /// encodings follow `config`.
    pub fn new(budget: HeaderBudget, config: Arc<ServerConfig>) -> Self {
        let allow_bare_lf = config.allow_bare_lf();
        Self { state: Size, remaining_size: 0, size_digits: 0, allow_bare_lf, budget, config, trailers: None }
    }

    /// The trailer fields, available once the decoder produced [`PayloadItem::Eof`].
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Read the chunk size in hex
    Size,
    /// Handle whitespace after size
    SizeLws,
    /// Skip chunk extensions
    Extension,
    /// Read LF after chunk size
    SizeLf,
    /// Read chunk data
    Body,
    /// Read CR after chunk data
    BodyCr,
    /// Read LF after chunk data
    BodyLf,
    /// Read the trailer block up to the blank line
    Trailers,
    /// Final state after reading last chunk
    End,
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Decodes chunked transfer encoded data from the input buffer.
    ///
    /// # Returns
    /// - `Ok(Some(PayloadItem::Chunk(bytes)))` when chunk data is available
    /// - `Ok(Some(PayloadItem::Eof))` once the last chunk and the trailers are consumed
    /// - `Ok(None)` when more data is needed
    /// - `Err(ParseError)` if the chunked framing is invalid
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == End {
                trace!("finished reading chunked data");
                return Ok(Some(PayloadItem::Eof));
            }

            if src.is_empty() {
                // need more data
                return Ok(None);
            }

            let mut buf = None;

            self.state = match self.step(src, &mut buf) {
                Poll::Pending => return Ok(None),
                Poll::Ready(Ok(new_state)) => new_state,
                Poll::Ready(Err(e)) => return Err(e),
            };

            if let Some(bytes) = buf {
                trace!(len = bytes.len(), "read chunked bytes");
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }
        }
    }
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        if $src.len() > 0 {
            $src.get_u8()
        } else {
            return Poll::Pending;
        }
    }};
}

fn malformed(reason: &str) -> Poll<Result<ChunkedState, ParseError>> {
    Poll::Ready(Err(ParseError::malformed_chunk(reason)))
}

impl ChunkedDecoder {
    fn step(&mut self, src: &mut BytesMut, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        match self.state {
            Size => self.read_size(src),
            SizeLws => self.read_size_lws(src),
            Extension => self.read_extension(src),
            SizeLf => self.read_size_lf(src),
            Body => self.read_body(src, buf),
            BodyCr => self.read_body_cr(src),
            BodyLf => Self::read_body_lf(src),
            Trailers => self.read_trailers(src),
            End => Poll::Ready(Ok(End)),
        }
    }

    /// The state after a complete size line.
    fn size_line_done(&mut self) -> Poll<Result<ChunkedState, ParseError>> {
        if self.size_digits == 0 {
            return malformed("empty chunk size");
        }
        self.size_digits = 0;
        if self.remaining_size == 0 { Poll::Ready(Ok(Trailers)) } else { Poll::Ready(Ok(Body)) }
    }

    /// Reads and parses the chunk size in hexadecimal format.
    ///
    /// - On hex digit: stay in Size to read more digits
    /// - On whitespace, semicolon or CR: the size is complete, it must have at least one digit
    /// - On anything else, or when the size overflows: error
    fn read_size(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        let b = try_next_byte!(src);
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b + 10 - b'a',
            b'A'..=b'F' => b + 10 - b'A',
            b'\t' | b' ' | b';' | b'\r' | b'\n' if self.size_digits == 0 => return malformed("empty chunk size"),
            b'\t' | b' ' => return Poll::Ready(Ok(SizeLws)),
            b';' => return Poll::Ready(Ok(Extension)),
            b'\r' => return Poll::Ready(Ok(SizeLf)),
            b'\n' if self.allow_bare_lf => return self.size_line_done(),
            _ => return malformed("invalid chunk size"),
        };

        self.size_digits += 1;
        match self.remaining_size.checked_mul(16).and_then(|size| size.checked_add(u64::from(digit))) {
            Some(size) => {
                self.remaining_size = size;
                Poll::Ready(Ok(Size))
            }
            None => malformed("invalid overflow chunked length"),
        }
    }

    /// Processes linear whitespace after the chunk size: only more whitespace, an extension or the
    /// end of the line may follow.
    fn read_size_lws(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            // LWS can follow the chunk size, but no more digits can come
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' if self.allow_bare_lf => self.size_line_done(),
            _ => malformed("invalid chunk size linear white space"),
        }
    }

    /// Skips chunk extensions up to the end of the line. Their content is never surfaced.
    fn read_extension(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        // extensions end at the next CRLF. A plain LF is rejected unless bare LF is tolerated,
        // some peers don't send the CR
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' if self.allow_bare_lf => self.size_line_done(),
            b'\n' => malformed("invalid chunk extension contains newline"),
            _ => Poll::Ready(Ok(Extension)),
        }
    }

    /// Validates the LF that ends the size line, then moves to the data or to the trailers of
    /// the last chunk.
    fn read_size_lf(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => self.size_line_done(),
            _ => malformed("invalid chunk size LF"),
        }
    }

    /// Reads up to the remaining size of the current chunk out of `src`.
    fn read_body(&mut self, src: &mut BytesMut, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        if src.is_empty() {
            return Poll::Pending;
        }

        // cap remaining bytes at the max capacity of usize
        let remaining = usize::try_from(self.remaining_size).unwrap_or(usize::MAX);
        let read_size = remaining.min(src.len());

        self.remaining_size -= read_size as u64;
        *buf = Some(src.split_to(read_size).freeze());

        if self.remaining_size > 0 { Poll::Ready(Ok(Body)) } else { Poll::Ready(Ok(BodyCr)) }
    }

    fn read_body_cr(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(BodyLf)),
            b'\n' if self.allow_bare_lf => Poll::Ready(Ok(Size)),
            _ => malformed("invalid chunk body CR"),
        }
    }

    fn read_body_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(Size)),
            _ => malformed("invalid chunk body LF"),
        }
    }

    /// Trailer values obey the same encoding rules as request headers.
    fn check_encoding(&self, name: &HeaderName, value: &HeaderValue) -> Result<(), ParseError> {
        ensure!(
            self.config.header_encoding(name).validate(value.as_bytes()),
            ParseError::InvalidHeaderEncoding { name: name.to_string() }
        );
        Ok(())
    }

    /// Reads the trailer block after the last chunk, up to and including the blank line.
    fn read_trailers(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        let mut headers = vec![httparse::EMPTY_HEADER; self.budget.remaining_count()];

        let (offset, trailers) = match httparse::parse_headers(&src[..], &mut headers) {
            Ok(Status::Complete((offset, parsed))) => {
                let mut trailers = HeaderMap::with_capacity(parsed.len());
                for header in parsed {
                    let name = match HeaderName::from_bytes(header.name.as_bytes()) {
                        Ok(name) => name,
                        Err(e) => return Poll::Ready(Err(ParseError::invalid_header(e))),
                    };
                    let value = match HeaderValue::from_bytes(header.value) {
                        Ok(value) => value,
                        Err(e) => return Poll::Ready(Err(ParseError::invalid_header(e))),
                    };
                    if let Err(e) = self.check_encoding(&name, &value) {
                        return Poll::Ready(Err(e));
                    }
                    trailers.append(name, value);
                }
                (offset, trailers)
            }
            Ok(Status::Partial) => {
                return match self.budget.check_pending(src.len()) {
                    Ok(()) => Poll::Pending,
                    Err(e) => Poll::Ready(Err(e)),
                };
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Poll::Ready(Err(ParseError::too_many_headers(self.budget.max_count())));
            }
            Err(e) => return Poll::Ready(Err(ParseError::malformed_chunk(e))),
        };

        let block = &src[..offset];
        if !self.allow_bare_lf && has_bare_lf(block) {
            return malformed("bare LF in trailers");
        }
        let terminator = if block.ends_with(b"\r\n") { 2 } else { 1 };
        if let Err(e) = self.budget.consume(offset - terminator, trailers.len()) {
            return Poll::Ready(Err(e));
        }

        trace!(count = trailers.len(), "read chunked trailers");
        src.advance(offset);
        self.trailers = Some(trailers);
        Poll::Ready(Ok(End))
    }
}
