//! The pull side of a request body.
//!
//! [`BodyReader`] owns the transport read half for the whole connection. Between requests the
//! connection parses heads out of the same buffer; during a request the reader decodes body
//! bytes out of it with the [`PayloadDecoder`] chosen from the request head.
//!
//! Reads follow a read/advance protocol: [`BodyReader::read`] returns every decoded byte not
//! consumed yet, and the caller reports with [`BodyReader::advance`] how much it consumed and how
//! much it examined. Examining everything makes the next read wait for more data, so a caller
//! can look at a partial message without consuming it.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::codec::{HeaderBudget, PayloadDecoder};
use crate::config::{MinDataRate, ServerConfig};
use crate::connection::Incoming;
use crate::ensure;
use crate::protocol::{BodyError, BoxError, ParseError, PayloadItem, PayloadSize};
use crate::utils::PendingCancel;

/// Where the body stream stands. Moves forward only, apart from repeated reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadState {
    NotStarted,
    Reading,
    /// The application completed the reader, further reads fail
    Completed,
    /// The body framing was invalid, further reads fail with the same error
    Faulted(ParseError),
}

/// The outcome of one [`BodyReader::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    /// Every decoded byte not consumed yet
    pub data: Bytes,
    /// No more data follows `data`
    pub is_completed: bool,
}

/// Time spent waiting on the transport and bytes received, for the minimum data rate.
#[derive(Debug, Clone, Copy, Default)]
struct RateWatch {
    waited: Duration,
    received: u64,
}

pub struct BodyReader {
    incoming: Incoming,
    decoder: PayloadDecoder,
    state: ReadState,
    segment: Bytes,
    examined_all: bool,
    awaiting_advance: bool,
    body_done: bool,
    trailers: Option<HeaderMap>,
    completion_error: Option<BoxError>,
    continue_pending: bool,
    config: Arc<ServerConfig>,
    min_rate: Option<MinDataRate>,
    rate: RateWatch,
    cancel: PendingCancel,
    abort: CancellationToken,
    allow_synchronous_io: bool,
}

impl BodyReader {
    pub fn new(incoming: Incoming, abort: CancellationToken) -> Self {
        Self {
            incoming,
            decoder: PayloadDecoder::empty(),
            state: ReadState::NotStarted,
            segment: Bytes::new(),
            examined_all: false,
            awaiting_advance: false,
            body_done: true,
            trailers: None,
            completion_error: None,
            continue_pending: false,
            config: Arc::new(ServerConfig::default()),
            min_rate: None,
            rate: RateWatch::default(),
            cancel: PendingCancel::default(),
            abort,
            allow_synchronous_io: false,
        }
    }

    /// Prepares the reader for the body of the next request.
    pub(crate) fn reset(&mut self, size: PayloadSize, budget: HeaderBudget, expects_continue: bool) {
        self.decoder = PayloadDecoder::new(size, budget, &self.config);
        self.state = ReadState::NotStarted;
        self.segment = Bytes::new();
        self.examined_all = false;
        self.awaiting_advance = false;
        self.body_done = size.is_empty();
        self.trailers = if self.body_done { Some(HeaderMap::new()) } else { None };
        self.completion_error = None;
        self.continue_pending = expects_continue && !self.body_done;
        self.rate = RateWatch::default();
        // handles given out for the previous request must not reach this one
        self.cancel = PendingCancel::default();
    }

    pub(crate) fn configure(&mut self, config: &Arc<ServerConfig>) {
        self.config = Arc::clone(config);
        self.min_rate = config.min_request_body_data_rate();
        self.allow_synchronous_io = config.allow_synchronous_io();
    }

    pub(crate) fn incoming_mut(&mut self) -> &mut Incoming {
        &mut self.incoming
    }

    pub fn state(&self) -> &ReadState {
        &self.state
    }

    /// The body has been received up to its end, trailers included.
    pub fn is_body_done(&self) -> bool {
        self.body_done
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// A handle that cancels one pending or upcoming read from anywhere.
    pub fn cancel_handle(&self) -> PendingCancel {
        self.cancel.clone()
    }

    pub fn cancel_pending_read(&self) {
        self.cancel.cancel();
    }

    pub fn allow_synchronous_io(&self) -> bool {
        self.allow_synchronous_io
    }

    pub(crate) fn set_allow_synchronous_io(&mut self, allow: bool) {
        self.allow_synchronous_io = allow;
    }

    /// Consumes the pending interim response flag. True at most once per request.
    pub(crate) fn take_continue(&mut self) -> bool {
        std::mem::take(&mut self.continue_pending)
    }

    /// The client still waits for `100 Continue` and has not sent the body.
    pub(crate) fn continue_pending(&self) -> bool {
        self.continue_pending
    }

    pub(crate) fn take_completion_error(&mut self) -> Option<BoxError> {
        self.completion_error.take()
    }

    /// Switches to raw passthrough after a protocol upgrade.
    pub(crate) fn upgrade(&mut self) {
        self.decoder = PayloadDecoder::until_eof();
        self.state = ReadState::NotStarted;
        self.body_done = false;
        self.continue_pending = false;
        self.min_rate = None;
    }

    /// Returns the decoded bytes not consumed yet, waiting for more when everything buffered has
    /// been examined.
    ///
    /// # Errors
    ///
    /// - [`BodyError::Canceled`] once per cancellation request, the reader stays usable
    /// - [`BodyError::ReaderCompleted`] after [`BodyReader::complete`]
    /// - [`BodyError::ReadWithoutAdvance`] when the previous result was not advanced
    /// - [`BodyError::Framing`] when the body is malformed or cut short, on every later read too
    /// - [`BodyError::Aborted`] once the request was aborted
    pub async fn read(&mut self) -> Result<ReadResult, BodyError> {
        match &self.state {
            ReadState::Completed => return Err(BodyError::ReaderCompleted),
            ReadState::Faulted(e) => return Err(BodyError::Framing(e.clone())),
            ReadState::NotStarted | ReadState::Reading => {}
        }
        ensure!(!self.awaiting_advance, BodyError::ReadWithoutAdvance);
        ensure!(!self.abort.is_cancelled(), BodyError::Aborted);
        if self.cancel.take() {
            info!("request body read canceled");
            return Err(BodyError::Canceled);
        }
        self.state = ReadState::Reading;

        if (self.segment.is_empty() || self.examined_all) && !self.body_done {
            self.fill_segment().await?;
        }

        self.examined_all = false;
        self.awaiting_advance = true;
        Ok(ReadResult { data: self.segment.clone(), is_completed: self.body_done })
    }

    /// Releases `consumed` bytes of the last read. `examined` bytes, counted from the same start,
    /// have been looked at: when that covers the whole result, the next read waits for new data.
    pub fn advance(&mut self, consumed: usize, examined: usize) -> Result<(), BodyError> {
        ensure!(self.awaiting_advance, BodyError::AdvanceWithoutRead);
        let available = self.segment.len();
        ensure!(consumed <= examined && examined <= available, BodyError::InvalidAdvance {
            consumed,
            examined,
            available
        });

        self.awaiting_advance = false;
        self.segment.advance(consumed);
        self.examined_all = available > 0 && examined == available;
        Ok(())
    }

    /// Marks the reader done. Without an error the rest of the body is drained by the
    /// connection so it can be reused; with an error the request fails.
    pub fn complete(&mut self, error: Option<BoxError>) {
        if self.state == ReadState::Completed {
            return;
        }
        if let Some(e) = error {
            debug!(cause = %e, "request body reader completed with an error");
            self.completion_error = Some(e);
        }
        self.state = ReadState::Completed;
        self.awaiting_advance = false;
    }

    /// Reads into `buf`, returning the number of bytes copied. `0` means the body ended, or that
    /// `buf` is empty, in which case nothing is read.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let result = self.read().await?;
        let n = result.data.len().min(buf.len());
        buf[..n].copy_from_slice(&result.data[..n]);
        self.advance(n, n)?;
        Ok(n)
    }

    /// Collects the remaining body.
    pub async fn read_to_end(&mut self) -> Result<Bytes, BodyError> {
        loop {
            let result = self.read().await?;
            let len = result.data.len();
            if result.is_completed {
                self.advance(len, len)?;
                return Ok(result.data);
            }
            self.advance(0, len)?;
        }
    }

    /// Discards what is left of the body so the next request can be parsed.
    pub(crate) async fn drain(&mut self) -> Result<(), BodyError> {
        if let ReadState::Faulted(e) = &self.state {
            return Err(BodyError::Framing(e.clone()));
        }
        self.segment = Bytes::new();
        self.awaiting_advance = false;
        // a cancel aimed at the application must not cut the drain short
        self.cancel.take();

        let mut drained = 0;
        while !self.body_done {
            self.fill_segment().await?;
            drained += self.segment.len();
            self.segment = Bytes::new();
            if let ReadState::Faulted(e) = &self.state {
                return Err(BodyError::Framing(e.clone()));
            }
        }
        debug!(drained, "drained request body");
        Ok(())
    }

    /// Decodes at least one more byte, or up to the end of the body.
    async fn fill_segment(&mut self) -> Result<(), BodyError> {
        let before = self.segment.len();
        loop {
            if let Err(e) = self.decode_buffered() {
                if self.segment.len() > before {
                    // deliver what arrived, the next read reports the error
                    self.state = ReadState::Faulted(e);
                    return Ok(());
                }
                self.state = ReadState::Faulted(e.clone());
                return Err(BodyError::Framing(e));
            }
            if self.segment.len() > before || self.body_done {
                return Ok(());
            }
            self.fill_from_transport().await?;
        }
    }

    /// Decodes everything that is already buffered without waiting.
    fn decode_buffered(&mut self) -> Result<(), ParseError> {
        let mut decoded: Option<BytesMut> = None;
        let result = loop {
            let eof = self.incoming.is_eof();
            let src = self.incoming.buffer_mut();
            let item = if eof { self.decoder.decode_eof(src) } else { self.decoder.decode(src) };
            match item {
                Ok(Some(PayloadItem::Chunk(bytes))) => {
                    trace!(len = bytes.len(), "decoded request body bytes");
                    decoded.get_or_insert_with(BytesMut::new).extend_from_slice(&bytes);
                }
                Ok(Some(PayloadItem::Eof)) => {
                    self.body_done = true;
                    self.trailers = Some(self.decoder.take_trailers().unwrap_or_default());
                    break Ok(());
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Some(decoded) = decoded {
            if self.segment.is_empty() {
                self.segment = decoded.freeze();
            } else {
                let mut joined = BytesMut::with_capacity(self.segment.len() + decoded.len());
                joined.extend_from_slice(&self.segment);
                joined.extend_from_slice(&decoded);
                self.segment = joined.freeze();
            }
        }
        result
    }

    /// Waits for more bytes from the transport, racing abort, cancellation and the minimum data
    /// rate.
    async fn fill_from_transport(&mut self) -> Result<(), BodyError> {
        let started = Instant::now();
        let deadline = self
            .min_rate
            .map(|rate| started + rate.allowed_time(self.rate.received).saturating_sub(self.rate.waited));

        let (incoming, cancel, abort) = (&mut self.incoming, &self.cancel, &self.abort);
        let filled = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(BodyError::Aborted),
            _ = cancel.requested() => {
                info!("request body read canceled");
                Err(BodyError::Canceled)
            }
            n = incoming.fill() => n.map_err(BodyError::from),
            _ = sleep_until_deadline(deadline) => {
                info!(received = self.rate.received, "request body data rate below the minimum, canceling the read");
                self.rate = RateWatch::default();
                return Err(BodyError::Canceled);
            }
        };

        self.rate.waited += started.elapsed();
        if let Ok(n) = filled {
            self.rate.received += n as u64;
        }
        filled.map(|_| ())
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader")
            .field("incoming", &self.incoming)
            .field("state", &self.state)
            .field("buffered", &self.segment.len())
            .field("body_done", &self.body_done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn reader(size: PayloadSize) -> (DuplexStream, BodyReader) {
        let (client, server) = tokio::io::duplex(1024);
        let mut reader = BodyReader::new(Incoming::new(server), CancellationToken::new());
        reader.reset(size, HeaderBudget::unlimited(), false);
        (client, reader)
    }

    #[tokio::test]
    async fn reads_length_body_and_stops() {
        let (mut client, mut reader) = reader(PayloadSize::Length(11));
        client.write_all(b"Hello World").await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let body = reader.read_to_end().await.unwrap();
        assert_eq!(body, "Hello World");
        assert!(reader.is_body_done());
        assert_eq!(&reader.incoming_mut().buffer()[..], b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn read_advance_protocol() {
        let (mut client, mut reader) = reader(PayloadSize::Length(6));
        client.write_all(b"abc").await.unwrap();

        let first = reader.read().await.unwrap();
        assert_eq!(first.data, "abc");
        assert!(!first.is_completed);
        assert!(matches!(reader.read().await, Err(BodyError::ReadWithoutAdvance)));

        assert!(matches!(reader.advance(2, 1), Err(BodyError::InvalidAdvance { .. })));
        assert!(matches!(reader.advance(0, 4), Err(BodyError::InvalidAdvance { .. })));

        // consume one byte, keep the rest unexamined: it comes back right away
        reader.advance(1, 1).unwrap();
        assert!(matches!(reader.advance(0, 0), Err(BodyError::AdvanceWithoutRead)));
        let again = reader.read().await.unwrap();
        assert_eq!(again.data, "bc");

        // examined everything, the next read waits for more and returns old and new bytes
        reader.advance(0, 2).unwrap();
        client.write_all(b"def").await.unwrap();
        let joined = reader.read().await.unwrap();
        assert_eq!(joined.data, "bcdef");
        assert!(joined.is_completed);
        reader.advance(5, 5).unwrap();
    }

    #[tokio::test]
    async fn zero_length_read_does_not_block() {
        let (_client, mut reader) = reader(PayloadSize::Length(6));
        assert_eq!(reader.read_into(&mut []).await.unwrap(), 0);
        assert_eq!(reader.state(), &ReadState::NotStarted);
    }

    #[tokio::test]
    async fn byte_at_a_time_chunked() {
        let (mut client, mut reader) = reader(PayloadSize::Chunked);
        let writer = tokio::spawn(async move {
            for b in b"5\r\nHello\r\n6\r\n World\r\n0\r\nX-Sum: 1\r\n\r\n" {
                client.write_all(&[*b]).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let body = reader.read_to_end().await.unwrap();
        assert_eq!(body, "Hello World");
        assert_eq!(reader.trailers().unwrap()["x-sum"], "1");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn premature_end_is_distinguishable() {
        let (mut client, mut reader) = reader(PayloadSize::Length(10));
        client.write_all(b"short").await.unwrap();
        drop(client);

        let result = reader.read().await.unwrap();
        assert_eq!(result.data, "short");
        reader.advance(5, 5).unwrap();

        let err = reader.read().await.unwrap_err();
        assert_eq!(err.as_parse_error(), Some(&ParseError::UnexpectedEndOfRequestContent));
        // faulted for good
        assert!(matches!(reader.read().await, Err(BodyError::Framing(_))));
    }

    #[tokio::test]
    async fn cancel_affects_one_read() {
        let (mut client, mut reader) = reader(PayloadSize::Length(5));
        let handle = reader.cancel_handle();

        handle.cancel();
        assert!(matches!(reader.read().await, Err(BodyError::Canceled)));

        client.write_all(b"hello").await.unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn cancel_wakes_pending_read() {
        let (_client, mut reader) = reader(PayloadSize::Length(5));
        let handle = reader.cancel_handle();

        let canceler = tokio::spawn(async move {
            tokio::task::yield_now().await;
            handle.cancel();
        });
        assert!(matches!(reader.read().await, Err(BodyError::Canceled)));
        canceler.await.unwrap();
    }

    #[tokio::test]
    async fn read_after_complete() {
        let (_client, mut reader) = reader(PayloadSize::Length(5));
        reader.complete(None);
        assert!(matches!(reader.read().await, Err(BodyError::ReaderCompleted)));
        assert_eq!(BodyError::ReaderCompleted.to_string(), "reader has already completed");
    }

    #[tokio::test]
    async fn abort_fails_reads() {
        let (_client, mut reader) = reader(PayloadSize::Length(5));
        reader.abort.cancel();
        assert!(matches!(reader.read().await, Err(BodyError::Aborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn min_data_rate_cancels_one_read() {
        let (mut client, mut reader) = reader(PayloadSize::Length(5));
        let config = ServerConfig::builder()
            .min_request_body_data_rate(Some(MinDataRate::new(240.0, Duration::from_secs(5))))
            .build()
            .unwrap();
        reader.configure(&Arc::new(config));

        assert!(matches!(reader.read().await, Err(BodyError::Canceled)));

        client.write_all(b"hello").await.unwrap();
        assert_eq!(reader.read_to_end().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn drain_discards_the_rest() {
        let (mut client, mut reader) = reader(PayloadSize::Chunked);
        client.write_all(b"5\r\nHello\r\n0\r\n\r\nNEXT").await.unwrap();

        let first = reader.read().await.unwrap();
        reader.advance(1, 1).unwrap();
        assert_eq!(first.data, "Hello");

        reader.drain().await.unwrap();
        assert!(reader.is_body_done());
        assert_eq!(&reader.incoming_mut().buffer()[..], b"NEXT");
    }

    #[tokio::test]
    async fn drain_fails_on_malformed_body() {
        let (mut client, mut reader) = reader(PayloadSize::Chunked);
        client.write_all(b"Cii\r\n").await.unwrap();
        assert!(matches!(reader.drain().await, Err(BodyError::Framing(ParseError::MalformedChunk { .. }))));
    }

    #[tokio::test]
    async fn empty_body_is_done_up_front() {
        let (_client, mut reader) = reader(PayloadSize::Empty);
        assert!(reader.is_body_done());
        assert!(reader.trailers().unwrap().is_empty());
        let result = reader.read().await.unwrap();
        assert!(result.is_completed);
        assert!(result.data.is_empty());
    }
}
