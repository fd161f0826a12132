//! The per-request arena handed to the [`Handler`](crate::handler::Handler).
//!
//! One [`RequestContext`] lives as long as its connection. Between requests the connection calls
//! `reset`, which replaces the request head, the trace identifier, the extensions and the
//! completion callbacks, so nothing a handler stored can be seen by the next request.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{Extensions, HeaderName, Version};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::codec::HeaderBudget;
use crate::config::ServerConfig;
use crate::connection::ResponseWriter;
use crate::ensure;
use crate::protocol::body::{BodyReader, ReadResult, ReadState};
use crate::protocol::{
    BodyError, BoxError, PayloadSize, RenegotiateError, RequestFacts, RequestHeader, ResponseHead, SendError,
};
use crate::transport::TransportInfo;
use crate::utils::PendingCancel;

type OnCompleted = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

pub struct RequestContext {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) transport: Arc<TransportInfo>,
    request: RequestHeader,
    pub(crate) reader: BodyReader,
    pub(crate) writer: ResponseWriter,
    on_completed: Vec<OnCompleted>,
    extensions: Extensions,
    trace_identifier: String,
    abort: CancellationToken,
}

impl RequestContext {
    pub(crate) fn new(
        config: Arc<ServerConfig>,
        mut reader: BodyReader,
        mut writer: ResponseWriter,
        abort: CancellationToken,
    ) -> Self {
        reader.configure(&config);
        writer.set_allow_synchronous_io(config.allow_synchronous_io());
        Self {
            config,
            transport: Arc::new(TransportInfo::default()),
            request: RequestHeader::default(),
            reader,
            writer,
            on_completed: Vec::new(),
            extensions: Extensions::new(),
            trace_identifier: String::new(),
            abort,
        }
    }

    /// Starts a new request on the same connection.
    pub(crate) fn reset(
        &mut self,
        request: RequestHeader,
        size: PayloadSize,
        budget: HeaderBudget,
        trace_identifier: String,
        keep_alive: bool,
    ) {
        let facts = RequestFacts { version: request.version(), is_head: request.is_head(), keep_alive };
        self.reader.reset(size, budget, request.expects_continue());
        self.writer.reset(facts);
        self.request = request;
        self.on_completed.clear();
        self.extensions.clear();
        self.trace_identifier = trace_identifier;
        self.set_allow_synchronous_io(self.config.allow_synchronous_io());
    }

    pub fn request(&self) -> &RequestHeader {
        &self.request
    }

    /// The protocol version of the request.
    pub fn version(&self) -> Version {
        self.request.version()
    }

    /// The request body. Reading it sends `100 Continue` first when the client asked for it.
    pub fn body(&mut self) -> RequestBody<'_> {
        RequestBody { reader: &mut self.reader, writer: &mut self.writer }
    }

    pub fn response(&mut self) -> &mut ResponseWriter {
        &mut self.writer
    }

    /// See [`ResponseWriter::on_starting`].
    pub fn on_starting<F>(&mut self, callback: F) -> Result<(), SendError>
    where
        F: FnOnce(&mut ResponseHead) -> Result<(), BoxError> + Send + 'static,
    {
        self.writer.on_starting(callback)
    }

    /// Registers a callback run after the response was sent. Callbacks run last registered
    /// first; a failing one is logged and the others still run.
    pub fn on_completed<F, Fut>(&mut self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_completed.push(Box::new(move || callback().boxed()));
    }

    pub(crate) async fn run_on_completed(&mut self) {
        while let Some(callback) = self.on_completed.pop() {
            if let Err(e) = callback().await {
                error!(cause = %e, "on_completed callback failed");
            }
        }
    }

    /// Aborts the request. Pending and later reads and writes fail and the connection closes
    /// without sending anything more.
    pub fn abort(&self) {
        debug!(trace_id = %self.trace_identifier, "request aborted by the application");
        self.abort.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn trace_identifier(&self) -> &str {
        &self.trace_identifier
    }

    /// Overrides the identifier for this request only.
    pub fn set_trace_identifier(&mut self, trace_identifier: impl Into<String>) {
        self.trace_identifier = trace_identifier.into();
    }

    pub fn transport(&self) -> &TransportInfo {
        &self.transport
    }

    /// The client certificate, asking the TLS layer for one when the handshake carried none.
    ///
    /// Renegotiating needs the request body to be received completely first, otherwise this
    /// fails with [`RenegotiateError::BodyNotDrained`] without contacting the TLS layer.
    pub async fn client_certificate(&mut self) -> Result<Option<Bytes>, RenegotiateError> {
        if let Some(certificate) = self.transport.secure.as_ref().and_then(|s| s.peer_certificate.clone()) {
            return Ok(Some(certificate));
        }
        let Some(renegotiate) = self.transport.renegotiate.clone() else {
            return Ok(None);
        };
        ensure!(self.reader.is_body_done(), RenegotiateError::BodyNotDrained);
        renegotiate.request_client_certificate().await.map_err(|source| RenegotiateError::Failed { source })
    }

    /// HTTP/1.1 carries trailers on chunked bodies.
    pub fn supports_trailers(&self) -> bool {
        true
    }

    /// Whether the body has been received up to and including its trailers.
    pub fn trailers_available(&self) -> bool {
        self.reader.trailers().is_some()
    }

    /// The names announced by the request's `Trailer` header.
    pub fn declared_trailers(&self) -> Vec<HeaderName> {
        self.request.declared_trailers()
    }

    /// A received trailer, repeated fields joined with `", "`. A trailer that never arrived is an
    /// empty string.
    ///
    /// # Errors
    ///
    /// [`BodyError::TrailersNotAvailable`] until the body has been read to its end.
    pub fn get_trailer(&self, name: &HeaderName) -> Result<String, BodyError> {
        let trailers = self.reader.trailers().ok_or(BodyError::TrailersNotAvailable)?;
        let encoding = self.config.header_encoding(name);
        let values: Vec<Cow<'_, str>> = trailers.get_all(name).iter().map(|v| encoding.decode(v)).collect();
        Ok(values.join(", "))
    }

    /// A request header decoded with the encoding configured for its name.
    pub fn request_header_str(&self, name: &HeaderName) -> Option<Cow<'_, str>> {
        let value = self.request.headers().get(name)?;
        Some(self.config.header_encoding(name).decode(value))
    }

    pub fn allow_synchronous_io(&self) -> bool {
        self.reader.allow_synchronous_io()
    }

    /// Opts this request in or out of `read_sync`/`write_sync`.
    pub fn set_allow_synchronous_io(&mut self, allow: bool) {
        self.reader.set_allow_synchronous_io(allow);
        self.writer.set_allow_synchronous_io(allow);
    }

    /// Switches the connection to the protocol the client asked for. The request body and the
    /// response body become raw byte streams and the connection ends with the handler.
    pub async fn upgrade(&mut self) -> Result<(), SendError> {
        ensure!(self.request.is_upgrade(), SendError::NotUpgradable);
        self.writer.upgrade().await?;
        self.reader.upgrade();
        Ok(())
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("trace_identifier", &self.trace_identifier)
            .field("request", &self.request)
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

/// The request body as seen by a handler.
///
/// Borrows the response writer too, the interim `100 Continue` response goes out on the first
/// read.
pub struct RequestBody<'a> {
    reader: &'a mut BodyReader,
    writer: &'a mut ResponseWriter,
}

impl RequestBody<'_> {
    async fn send_continue(&mut self) -> Result<(), BodyError> {
        if matches!(self.reader.state(), ReadState::Completed | ReadState::Faulted(_)) {
            return Ok(());
        }
        if self.reader.take_continue() && !self.writer.has_started() {
            self.writer.send_continue().await.map_err(BodyError::Continue)?;
            debug!("sent 100 continue");
        }
        Ok(())
    }

    /// See [`BodyReader::read`].
    pub async fn read(&mut self) -> Result<ReadResult, BodyError> {
        self.send_continue().await?;
        self.reader.read().await
    }

    pub fn advance(&mut self, consumed: usize, examined: usize) -> Result<(), BodyError> {
        self.reader.advance(consumed, examined)
    }

    /// Consumes and examines the same number of bytes.
    pub fn advance_to(&mut self, consumed: usize) -> Result<(), BodyError> {
        self.reader.advance(consumed, consumed)
    }

    /// Reads into `buf`. An empty `buf` returns `0` without sending `100 Continue`.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.send_continue().await?;
        self.reader.read_into(buf).await
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes, BodyError> {
        self.send_continue().await?;
        self.reader.read_to_end().await
    }

    /// Blocking [`RequestBody::read_into`], only when synchronous IO is allowed. Needs the
    /// multi-threaded runtime.
    pub fn read_sync(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        ensure!(self.reader.allow_synchronous_io(), BodyError::SynchronousIoDisallowed);
        let handle = tokio::runtime::Handle::current();
        tokio::task::block_in_place(|| handle.block_on(self.read_into(buf)))
    }

    pub fn state(&self) -> &ReadState {
        self.reader.state()
    }

    pub fn cancel_pending_read(&self) {
        self.reader.cancel_pending_read();
    }

    pub fn cancel_handle(&self) -> PendingCancel {
        self.reader.cancel_handle()
    }

    /// See [`BodyReader::complete`].
    pub fn complete(&mut self, error: Option<BoxError>) {
        self.reader.complete(error);
    }
}
