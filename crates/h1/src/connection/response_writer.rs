//! The write side of a response.
//!
//! Body bytes are committed into a pending buffer through [`ResponseWriter::get_buffer`] and
//! [`ResponseWriter::advance`] and go on the wire at the next [`ResponseWriter::flush`]. The first
//! flush, or [`ResponseWriter::start`], runs the `on_starting` callbacks, decides the body framing
//! with [`prepare_head`] and writes the head. From then on the framing is fixed: every flush of a
//! chunked body is one chunk, and [`ResponseWriter::complete`] writes the last chunk.

use std::fmt;
use std::pin::pin;

use bytes::{Buf, BytesMut};
use http::header::CONNECTION;
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body::Body;
use http_body_util::BodyExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::codec::{HeaderEncoder, PayloadEncoder};
use crate::ensure;
use crate::protocol::{
    declared_length, prepare_head, reset_to_error, status_forbids_body, BodyFraming, BoxError, PayloadItem,
    RequestFacts, ResponseHead, SendError, CONTINUE_RESPONSE,
};
use crate::utils::PendingCancel;

/// Size of one pooled write segment.
pub const SEGMENT_SIZE: usize = 4096;

/// Payload of a segment-sized chunk: the `FF9\r\n` size line and the trailing CRLF take 7 bytes.
pub const CHUNKED_SEGMENT_SIZE: usize = SEGMENT_SIZE - 7;

/// Runs right before the head is written and may still change it.
pub type OnStarting = Box<dyn FnOnce(&mut ResponseHead) -> Result<(), BoxError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Started,
    Completed,
}

/// A region of the pending buffer handed out by `get_buffer`.
#[derive(Debug, Clone, Copy)]
struct Lease {
    generation: u64,
    start: usize,
    len: usize,
}

pub struct ResponseWriter {
    io: Box<dyn AsyncWrite + Send + Unpin>,
    head: ResponseHead,
    trailers: HeaderMap,
    facts: RequestFacts,
    phase: Phase,
    framing: BodyFraming,
    encoder: PayloadEncoder,
    pending: BytesMut,
    lease: Option<Lease>,
    generation: u64,
    out: BytesMut,
    bytes_written: u64,
    keep_alive: bool,
    on_starting: Vec<OnStarting>,
    cancel: PendingCancel,
    abort: CancellationToken,
    failure: Option<String>,
    upgraded: bool,
    head_body_logged: bool,
    allow_synchronous_io: bool,
}

impl ResponseWriter {
    pub fn new<W>(io: W, abort: CancellationToken) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            io: Box::new(io),
            head: ResponseHead::default(),
            trailers: HeaderMap::new(),
            facts: RequestFacts::default(),
            phase: Phase::NotStarted,
            framing: BodyFraming::NoBody,
            encoder: PayloadEncoder::empty(),
            pending: BytesMut::new(),
            lease: None,
            generation: 0,
            out: BytesMut::new(),
            bytes_written: 0,
            keep_alive: true,
            on_starting: Vec::new(),
            cancel: PendingCancel::default(),
            abort,
            failure: None,
            upgraded: false,
            head_body_logged: false,
            allow_synchronous_io: false,
        }
    }

    /// Prepares the writer for the response to the next request.
    pub(crate) fn reset(&mut self, facts: RequestFacts) {
        self.head = ResponseHead::default();
        self.trailers.clear();
        self.facts = facts;
        self.phase = Phase::NotStarted;
        self.framing = BodyFraming::NoBody;
        self.encoder = PayloadEncoder::empty();
        self.pending.clear();
        self.lease = None;
        self.generation += 1;
        self.out.clear();
        self.bytes_written = 0;
        self.keep_alive = facts.keep_alive;
        self.on_starting.clear();
        self.cancel = PendingCancel::default();
        self.failure = None;
        self.upgraded = false;
        self.head_body_logged = false;
    }

    /// Replaces a response that has not started with a bodyless error response. Pending body
    /// bytes and `on_starting` callbacks are dropped.
    pub(crate) fn reset_to_error(&mut self, status: StatusCode) {
        reset_to_error(&mut self.head, status);
        self.trailers.clear();
        self.pending.clear();
        self.lease = None;
        self.on_starting.clear();
        self.failure = None;
    }

    pub(crate) fn set_allow_synchronous_io(&mut self, allow: bool) {
        self.allow_synchronous_io = allow;
    }

    pub(crate) fn disable_keep_alive(&mut self) {
        self.keep_alive = false;
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// The head, as long as it has not been written.
    pub fn head_mut(&mut self) -> Result<&mut ResponseHead, SendError> {
        ensure!(self.phase == Phase::NotStarted, SendError::ResponseAlreadyStarted);
        Ok(&mut self.head)
    }

    pub fn headers_mut(&mut self) -> Result<&mut HeaderMap, SendError> {
        Ok(self.head_mut()?.headers_mut())
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), SendError> {
        *self.head_mut()?.status_mut() = status;
        Ok(())
    }

    /// Trailer fields sent after the last chunk. Dropped unless the body is chunked.
    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    pub fn has_started(&self) -> bool {
        self.phase != Phase::NotStarted
    }

    pub fn is_completed(&self) -> bool {
        self.phase == Phase::Completed
    }

    /// The framing locked in when the head was written.
    pub fn framing(&self) -> Option<BodyFraming> {
        self.has_started().then_some(self.framing)
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Body bytes committed so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Registers a callback run right before the head is written. Callbacks run last registered
    /// first, once.
    pub fn on_starting<F>(&mut self, callback: F) -> Result<(), SendError>
    where
        F: FnOnce(&mut ResponseHead) -> Result<(), BoxError> + Send + 'static,
    {
        ensure!(self.phase == Phase::NotStarted, SendError::ResponseAlreadyStarted);
        self.on_starting.push(Box::new(callback));
        Ok(())
    }

    /// A handle that cancels one pending or upcoming flush from anywhere.
    pub fn cancel_handle(&self) -> PendingCancel {
        self.cancel.clone()
    }

    pub fn cancel_pending_flush(&self) {
        self.cancel.cancel();
    }

    /// Committed bytes not flushed yet. Once the head is written, the framing of a chunked body
    /// counts too.
    pub fn unflushed_bytes(&self) -> usize {
        let leased = match self.lease {
            Some(lease) if lease.generation == self.generation => lease.len,
            _ => 0,
        };
        let pending = self.pending.len() - leased;
        if self.phase == Phase::Started && self.framing.is_chunked() {
            pending + crate::codec::chunk_overhead(pending)
        } else {
            pending
        }
    }

    fn segment_size(&self) -> usize {
        if self.phase == Phase::Started && self.framing.is_chunked() { CHUNKED_SEGMENT_SIZE } else { SEGMENT_SIZE }
    }

    fn check_writable(&self) -> Result<(), SendError> {
        ensure!(self.phase != Phase::Completed, SendError::WriterCompleted);
        ensure!(!self.abort.is_cancelled(), SendError::Aborted);
        if let Some(reason) = &self.failure {
            return Err(SendError::OnStartingFailed { reason: reason.clone() });
        }
        Ok(())
    }

    /// Gives back the memory of a lease that was never advanced.
    fn drop_lease(&mut self) {
        if let Some(lease) = self.lease.take() {
            if lease.generation == self.generation {
                self.pending.truncate(lease.start);
            }
        }
    }

    /// Memory leased before the head went out is stale. The lease is kept so a late `advance`
    /// reports it.
    fn invalidate_lease(&mut self) {
        if let Some(lease) = self.lease {
            if lease.generation == self.generation {
                self.pending.truncate(lease.start);
            }
        }
        self.generation += 1;
    }

    /// Hands out one segment of writable memory. The hint can't grow the region past one
    /// segment; commit what was written with [`ResponseWriter::advance`].
    pub fn get_buffer(&mut self, size_hint: usize) -> Result<&mut [u8], SendError> {
        self.check_writable()?;
        self.drop_lease();

        let len = self.segment_size();
        let start = self.pending.len();
        self.pending.resize(start + len, 0);
        self.lease = Some(Lease { generation: self.generation, start, len });
        trace!(size_hint, len, "leased response buffer");
        Ok(&mut self.pending[start..])
    }

    /// Commits `count` bytes of the last [`ResponseWriter::get_buffer`] region.
    ///
    /// # Errors
    ///
    /// - [`SendError::StaleBuffer`] when the region was leased before the head was written
    /// - [`SendError::TooManyBytesWritten`] when the bytes overrun the declared `Content-Length`;
    ///   keep-alive is off from then on, and a started response aborts the connection
    /// - [`SendError::BodyNotAllowed`] for statuses without a body
    pub fn advance(&mut self, count: usize) -> Result<(), SendError> {
        self.check_writable()?;
        let lease = self.lease.take().ok_or(SendError::InvalidAdvance { count, available: 0 })?;
        ensure!(lease.generation == self.generation, SendError::StaleBuffer);
        if count > lease.len {
            self.pending.truncate(lease.start);
            return Err(SendError::InvalidAdvance { count, available: lease.len });
        }
        self.pending.truncate(lease.start + count);
        if count == 0 {
            return Ok(());
        }
        let declared = self.current_declared_length().inspect_err(|_| self.pending.truncate(lease.start))?;

        if !self.upgraded {
            let status = self.head.status();
            if status_forbids_body(status) {
                self.pending.truncate(lease.start);
                return Err(SendError::BodyNotAllowed { status });
            }
            if self.facts.is_head {
                self.pending.truncate(lease.start);
                if !self.head_body_logged {
                    self.head_body_logged = true;
                    debug!("ignoring response body written for a HEAD request");
                }
                return Ok(());
            }
        }

        let written = self.bytes_written + count as u64;
        if let Some(declared) = declared {
            if written > declared {
                self.pending.truncate(lease.start);
                self.keep_alive = false;
                if self.has_started() {
                    // the client can't tell where the body ends anymore
                    self.abort.cancel();
                }
                return Err(SendError::TooManyBytesWritten { written, declared });
            }
        }
        self.bytes_written = written;
        Ok(())
    }

    /// Runs the `on_starting` callbacks, last registered first. Every callback runs even when an
    /// earlier one failed; any failure fails the response.
    fn run_on_starting(&mut self) -> Result<(), SendError> {
        let mut failure = None;
        while let Some(callback) = self.on_starting.pop() {
            if let Err(e) = callback(&mut self.head) {
                error!(cause = %e, "on_starting callback failed");
                failure.get_or_insert_with(|| e.to_string());
            }
        }
        if let Some(reason) = failure {
            self.failure = Some(reason.clone());
            return Err(SendError::OnStartingFailed { reason });
        }
        Ok(())
    }

    /// Decides the framing and encodes the head into the outgoing buffer.
    fn start_head(&mut self, app_completed: bool) -> Result<(), SendError> {
        self.run_on_starting()?;

        let facts = RequestFacts { keep_alive: self.keep_alive, ..self.facts };
        let prepared = prepare_head(&mut self.head, facts, app_completed)?;
        self.keep_alive = prepared.keep_alive;
        self.framing = prepared.framing;
        self.encoder = PayloadEncoder::new(prepared.framing);
        HeaderEncoder.encode(&self.head, &mut self.out)?;
        self.invalidate_lease();
        self.phase = Phase::Started;
        debug!(status = %self.head.status(), framing = ?self.framing, keep_alive = self.keep_alive, "response started");
        Ok(())
    }

    fn encode_pending(&mut self) -> Result<(), SendError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let data = self.pending.split().freeze();
        self.encoder.encode(PayloadItem::Chunk(data), &mut self.out)
    }

    /// Writes the outgoing buffer to the transport. A canceled or failed write keeps what was
    /// not written for the next attempt.
    async fn write_out(&mut self) -> Result<(), SendError> {
        let (io, out, cancel, abort) = (&mut self.io, &mut self.out, &self.cancel, &self.abort);
        tokio::select! {
            biased;
            _ = abort.cancelled() => Err(SendError::Aborted),
            _ = cancel.requested() => {
                debug!("response flush canceled");
                Err(SendError::Canceled)
            }
            written = async {
                io.write_all_buf(out).await?;
                io.flush().await
            } => written.map_err(SendError::io),
        }
    }

    /// Writes the head if needed, then the pending body bytes.
    pub async fn flush(&mut self) -> Result<(), SendError> {
        self.check_writable()?;
        if self.cancel.take() {
            debug!("response flush canceled");
            return Err(SendError::Canceled);
        }
        self.drop_lease();
        if self.phase == Phase::NotStarted {
            self.start_head(false)?;
        }
        self.encode_pending()?;
        self.write_out().await
    }

    /// Writes the head now, before any body byte. Buffers leased before become stale.
    pub async fn start(&mut self) -> Result<(), SendError> {
        self.check_writable()?;
        if self.phase == Phase::NotStarted {
            self.start_head(false)?;
        }
        self.write_out().await
    }

    /// Commits `data` and flushes it.
    ///
    /// A non-empty write to a status without a body writes the head, then fails with
    /// [`SendError::BodyNotAllowed`].
    pub async fn write(&mut self, data: &[u8]) -> Result<(), SendError> {
        self.check_writable()?;
        let status = self.head.status();
        if !data.is_empty() && !self.upgraded && status_forbids_body(status) {
            if self.phase == Phase::NotStarted {
                self.start().await?;
            }
            return Err(SendError::BodyNotAllowed { status });
        }

        let mut rest = data;
        while !rest.is_empty() {
            let buf = self.get_buffer(rest.len())?;
            let n = buf.len().min(rest.len());
            buf[..n].copy_from_slice(&rest[..n]);
            self.advance(n)?;
            rest = &rest[n..];
        }
        self.flush().await
    }

    /// Blocking [`ResponseWriter::write`], only when synchronous IO is allowed. Needs the
    /// multi-threaded runtime.
    pub fn write_sync(&mut self, data: &[u8]) -> Result<(), SendError> {
        ensure!(self.allow_synchronous_io, SendError::SynchronousIoDisallowed);
        let handle = tokio::runtime::Handle::current();
        tokio::task::block_in_place(|| handle.block_on(self.write(data)))
    }

    /// Streams an `http_body::Body` into the response. Trailer frames end up in
    /// [`ResponseWriter::trailers_mut`].
    pub async fn send_body<B>(&mut self, body: B) -> Result<(), SendError>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let mut body = pin!(body);
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| SendError::invalid_body(Into::<BoxError>::into(e)))?;
            match frame.into_data() {
                Ok(mut data) => {
                    let bytes = data.copy_to_bytes(data.remaining());
                    self.write(&bytes).await?;
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        self.trailers.extend(trailers);
                    }
                }
            }
        }
        Ok(())
    }

    /// Ends the response: writes the head if it never went out, the pending bytes and the end of
    /// a chunked body. Calling it again does nothing.
    ///
    /// With an error the connection is aborted instead.
    ///
    /// A response that never started and falls short of its `Content-Length`, or whose head can't
    /// be produced, turns into a `500` with `Content-Length: 0`.
    pub async fn complete(&mut self, error: Option<BoxError>) -> Result<(), SendError> {
        if self.phase == Phase::Completed {
            return Ok(());
        }
        if let Some(e) = error {
            error!(cause = %e, "response completed with an error, aborting the connection");
            self.phase = Phase::Completed;
            self.keep_alive = false;
            self.abort.cancel();
            return Ok(());
        }
        if self.abort.is_cancelled() {
            self.phase = Phase::Completed;
            return Err(SendError::Aborted);
        }
        self.drop_lease();

        if self.phase == Phase::NotStarted {
            if self.failure.take().is_some() {
                self.reset_to_error(StatusCode::INTERNAL_SERVER_ERROR);
            } else if let Some(e) = self.verify_length() {
                error!(cause = %e, "response content-length mismatch");
                if self.bytes_written > 0 {
                    self.keep_alive = false;
                }
                self.reset_to_error(StatusCode::INTERNAL_SERVER_ERROR);
            }
            // committed but never flushed bytes still need a framing
            let body_empty = self.pending.is_empty();
            if let Err(e) = self.start_head(body_empty) {
                error!(cause = %e, "failed to produce the response head");
                self.reset_to_error(StatusCode::INTERNAL_SERVER_ERROR);
                self.start_head(true)?;
            }
        } else if let Some(e) = self.verify_length() {
            error!(cause = %e, "response content-length mismatch");
            self.keep_alive = false;
        }

        self.encode_pending()?;
        self.encoder.set_trailers(std::mem::take(&mut self.trailers));
        self.encoder.encode(PayloadItem::<bytes::Bytes>::Eof, &mut self.out)?;
        self.phase = Phase::Completed;
        self.write_out().await
    }

    /// The length from the headers until the head is written, the locked-in framing after.
    fn current_declared_length(&self) -> Result<Option<u64>, SendError> {
        match (self.phase, self.framing) {
            (Phase::NotStarted, _) => declared_length(self.head.headers()),
            (_, BodyFraming::Length(length)) => Ok(Some(length)),
            _ => Ok(None),
        }
    }

    /// Too few bytes for the declared length. HEAD and `304` responses describe a body they don't
    /// carry.
    fn verify_length(&self) -> Option<SendError> {
        if self.facts.is_head || self.head.status() == StatusCode::NOT_MODIFIED || self.upgraded {
            return None;
        }
        let declared = self.current_declared_length().ok().flatten()?;
        (self.bytes_written < declared).then_some(SendError::TooFewBytesWritten { written: self.bytes_written, declared })
    }

    /// Sends the interim `100 Continue` response.
    pub(crate) async fn send_continue(&mut self) -> Result<(), SendError> {
        self.out.extend_from_slice(CONTINUE_RESPONSE);
        self.write_out().await
    }

    /// Sends `101 Switching Protocols` and turns the body into a raw byte stream.
    pub(crate) async fn upgrade(&mut self) -> Result<(), SendError> {
        self.check_writable()?;
        ensure!(self.phase == Phase::NotStarted, SendError::ResponseAlreadyStarted);

        *self.head.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        self.head.headers_mut().insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        self.run_on_starting()?;
        HeaderEncoder.encode(&self.head, &mut self.out)?;
        self.invalidate_lease();

        self.framing = BodyFraming::CloseDelimited;
        self.encoder = PayloadEncoder::new(BodyFraming::CloseDelimited);
        self.keep_alive = false;
        self.upgraded = true;
        self.phase = Phase::Started;
        debug!("connection upgraded");
        self.write_out().await
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Closes the sending side of the transport.
    pub(crate) async fn shutdown(&mut self) -> Result<(), SendError> {
        self.io.shutdown().await.map_err(SendError::io)
    }
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("status", &self.head.status())
            .field("phase", &self.phase)
            .field("framing", &self.framing)
            .field("bytes_written", &self.bytes_written)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
    use http::Version;
    use http_body::Frame;
    use http_body_util::{Full, StreamBody};
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn writer(facts: RequestFacts) -> (DuplexStream, ResponseWriter) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = ResponseWriter::new(server, CancellationToken::new());
        writer.reset(facts);
        (client, writer)
    }

    async fn wire(mut client: DuplexStream, writer: ResponseWriter) -> String {
        drop(writer);
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn chunked_by_default_one_chunk_per_write() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.write(b"Hello ").await.unwrap();
        writer.write(b"World!").await.unwrap();
        writer.complete(None).await.unwrap();
        writer.complete(None).await.unwrap();

        assert_eq!(
            wire(client, writer).await,
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nHello \r\n6\r\nWorld!\r\n0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn empty_flush_sends_head_without_empty_chunk() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.flush().await.unwrap();
        writer.flush().await.unwrap();
        writer.write(b"late").await.unwrap();
        writer.complete(None).await.unwrap();

        assert_eq!(
            wire(client, writer).await,
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nlate\r\n0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn complete_without_body_is_content_length_zero() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.complete(None).await.unwrap();
        assert_eq!(wire(client, writer).await, "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn complete_sends_bytes_that_were_never_flushed() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.get_buffer(5).unwrap()[..5].copy_from_slice(b"Hello");
        writer.advance(5).unwrap();
        writer.complete(None).await.unwrap();

        assert_eq!(
            wire(client, writer).await,
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn complete_sends_unflushed_bytes_close_delimited_for_http10() {
        let facts = RequestFacts { version: Version::HTTP_10, is_head: false, keep_alive: false };
        let (client, mut writer) = writer(facts);
        writer.get_buffer(5).unwrap()[..5].copy_from_slice(b"Hello");
        writer.advance(5).unwrap();
        writer.complete(None).await.unwrap();
        assert!(!writer.keep_alive());

        assert_eq!(wire(client, writer).await, "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nHello");
    }

    #[tokio::test]
    async fn unflushed_bytes_count_chunk_framing_after_start() {
        let (_client, mut writer) = writer(RequestFacts::default());

        let buf = writer.get_buffer(0).unwrap();
        assert_eq!(buf.len(), SEGMENT_SIZE);
        buf[..5].copy_from_slice(b"hello");
        writer.advance(5).unwrap();
        assert_eq!(writer.unflushed_bytes(), 5);

        writer.start().await.unwrap();
        assert_eq!(writer.framing(), Some(BodyFraming::Chunked));
        assert_eq!(writer.unflushed_bytes(), 5 + 1 + 4);

        assert_eq!(writer.get_buffer(10_000).unwrap().len(), CHUNKED_SEGMENT_SIZE);
    }

    #[tokio::test]
    async fn buffer_leased_before_start_is_stale() {
        let (_client, mut writer) = writer(RequestFacts::default());
        writer.get_buffer(16).unwrap()[..3].copy_from_slice(b"abc");
        writer.start().await.unwrap();
        assert!(matches!(writer.advance(3), Err(SendError::StaleBuffer)));
        assert_eq!(writer.unflushed_bytes(), 0);

        writer.get_buffer(16).unwrap()[..3].copy_from_slice(b"abc");
        writer.advance(3).unwrap();
    }

    #[tokio::test]
    async fn too_many_bytes_before_start() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.headers_mut().unwrap().insert(CONTENT_LENGTH, HeaderValue::from_static("5"));

        let err = writer.write(b"Hello World!").await.unwrap_err();
        assert_eq!(err.to_string(), "Response Content-Length mismatch: too many bytes written (12 of 5).");
        assert!(!writer.keep_alive());
        assert!(!writer.has_started());

        writer.reset_to_error(StatusCode::INTERNAL_SERVER_ERROR);
        writer.complete(None).await.unwrap();
        assert_eq!(
            wire(client, writer).await,
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn too_many_bytes_after_start_aborts() {
        let (_client, mut writer) = writer(RequestFacts::default());
        writer.headers_mut().unwrap().insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        writer.write(b"Hello").await.unwrap();

        assert!(matches!(writer.write(b"!").await, Err(SendError::TooManyBytesWritten { written: 6, declared: 5 })));
        assert!(writer.abort.is_cancelled());
        assert!(matches!(writer.write(b"more").await, Err(SendError::Aborted)));
    }

    #[tokio::test]
    async fn too_few_bytes_without_start_is_500() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.headers_mut().unwrap().insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        writer.complete(None).await.unwrap();

        // nothing was written, the connection survives
        assert!(writer.keep_alive());
        assert_eq!(wire(client, writer).await, "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn too_few_bytes_after_start_closes() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.headers_mut().unwrap().insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        writer.write(b"Hell").await.unwrap();
        writer.complete(None).await.unwrap();

        assert!(!writer.keep_alive());
        assert_eq!(wire(client, writer).await, "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHell");
    }

    #[tokio::test]
    async fn write_to_no_content_commits_head_then_fails() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.set_status(StatusCode::NO_CONTENT).unwrap();

        assert!(matches!(writer.write(b"body").await, Err(SendError::BodyNotAllowed { .. })));
        assert!(writer.has_started());
        assert!(matches!(writer.set_status(StatusCode::OK), Err(SendError::ResponseAlreadyStarted)));
        writer.complete(None).await.unwrap();

        assert_eq!(wire(client, writer).await, "HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[tokio::test]
    async fn head_request_discards_body() {
        let facts = RequestFacts { is_head: true, ..RequestFacts::default() };
        let (client, mut writer) = writer(facts);
        writer.write(b"ignored").await.unwrap();
        writer.complete(None).await.unwrap();

        assert_eq!(wire(client, writer).await, "HTTP/1.1 200 OK\r\n\r\n");
    }

    #[tokio::test]
    async fn http10_is_close_delimited() {
        let facts = RequestFacts { version: Version::HTTP_10, is_head: false, keep_alive: true };
        let (client, mut writer) = writer(facts);
        writer.write(b"Hello World").await.unwrap();
        writer.complete(None).await.unwrap();

        assert!(!writer.keep_alive());
        assert_eq!(wire(client, writer).await, "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nHello World");
    }

    #[tokio::test]
    async fn on_starting_runs_lifo_once() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer
            .on_starting(|head| {
                head.headers_mut().append("x-order", HeaderValue::from_static("first"));
                Ok(())
            })
            .unwrap();
        writer
            .on_starting(|head| {
                head.headers_mut().append("x-order", HeaderValue::from_static("second"));
                Ok(())
            })
            .unwrap();

        writer.write(b"a").await.unwrap();
        assert!(matches!(writer.on_starting(|_| Ok(())), Err(SendError::ResponseAlreadyStarted)));
        writer.write(b"b").await.unwrap();
        writer.complete(None).await.unwrap();

        assert_eq!(
            wire(client, writer).await,
            "HTTP/1.1 200 OK\r\nX-Order: second\r\nX-Order: first\r\nTransfer-Encoding: chunked\r\n\r\n\
             1\r\na\r\n1\r\nb\r\n0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn failing_on_starting_turns_into_500() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.on_starting(|_| Err("boom".into())).unwrap();

        assert!(matches!(writer.write(b"a").await, Err(SendError::OnStartingFailed { .. })));
        assert!(matches!(writer.write(b"a").await, Err(SendError::OnStartingFailed { .. })));
        writer.complete(None).await.unwrap();

        assert_eq!(wire(client, writer).await, "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn on_starting_failure_does_not_skip_others() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let (_client, mut writer) = writer(RequestFacts::default());
        {
            let ran = ran.clone();
            writer
                .on_starting(move |_| {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        writer.on_starting(|_| Err("boom".into())).unwrap();

        let err = writer.start().await.unwrap_err();
        assert_eq!(err.to_string(), "an on_starting callback failed: boom");
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_affects_one_flush() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.cancel_handle().cancel();

        assert!(matches!(writer.write(b"kept").await, Err(SendError::Canceled)));
        assert_eq!(writer.unflushed_bytes(), 4);
        writer.flush().await.unwrap();
        writer.complete(None).await.unwrap();

        assert_eq!(
            wire(client, writer).await,
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nkept\r\n0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn transfer_encoding_on_not_modified() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.set_status(StatusCode::NOT_MODIFIED).unwrap();
        writer.headers_mut().unwrap().insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        assert!(matches!(writer.start().await, Err(SendError::HeaderNotAllowed { .. })));
        writer.complete(None).await.unwrap();
        assert_eq!(wire(client, writer).await, "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n");
    }

    #[tokio::test]
    async fn send_body_with_trailers() {
        let (client, mut writer) = writer(RequestFacts::default());

        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("42"));
        let frames = vec![
            Ok::<_, std::convert::Infallible>(Frame::data(Bytes::from_static(b"Hello"))),
            Ok(Frame::trailers(trailers)),
        ];
        writer.send_body(StreamBody::new(futures::stream::iter(frames))).await.unwrap();
        writer.complete(None).await.unwrap();

        assert_eq!(
            wire(client, writer).await,
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n0\r\nX-Checksum: 42\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn send_full_body_with_length() {
        let (client, mut writer) = writer(RequestFacts::default());
        let body = Full::new(Bytes::from_static(b"Hello World"));
        let length = body.size_hint().exact().unwrap();
        writer.headers_mut().unwrap().insert(CONTENT_LENGTH, HeaderValue::from(length));
        writer.send_body(body).await.unwrap();
        writer.complete(None).await.unwrap();

        assert_eq!(wire(client, writer).await, "HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello World");
    }

    #[tokio::test]
    async fn write_sync_is_gated() {
        let (_client, mut writer) = writer(RequestFacts::default());
        assert!(matches!(writer.write_sync(b"x"), Err(SendError::SynchronousIoDisallowed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_sync_when_allowed() {
        let (client, mut writer) = writer(RequestFacts::default());
        writer.set_allow_synchronous_io(true);
        writer.write_sync(b"sync").unwrap();
        writer.complete(None).await.unwrap();

        assert_eq!(
            wire(client, writer).await,
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nsync\r\n0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn writes_fail_after_complete() {
        let (_client, mut writer) = writer(RequestFacts::default());
        writer.complete(None).await.unwrap();
        assert!(matches!(writer.write(b"late").await, Err(SendError::WriterCompleted)));
    }
}
