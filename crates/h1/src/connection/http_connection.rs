use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::codec::{HeaderBudget, HeaderDecoder};
use crate::config::ServerConfig;
use crate::connection::{Incoming, RequestContext, ResponseWriter};
use crate::handler::Handler;
use crate::protocol::body::BodyReader;
use crate::protocol::{BodyError, BoxError, HttpError, ParseError, PayloadSize, RequestFacts, RequestHeader};
use crate::transport::TransportInfo;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// An HTTP/1.x connection that parses requests and runs them through a [`Handler`] one at a
/// time.
///
/// `HttpConnection` owns the whole lifecycle of a connection:
/// - waiting for the next request, with the keep-alive timeout
/// - parsing the request head within the request headers timeout
/// - running the handler with a fresh [`RequestContext`]
/// - completing the response, including automatic error responses
/// - draining an unread request body before the next request
///
/// The connection ends when keep-alive is off, the client closes, the request is aborted or
/// upgraded, or the shutdown token fires.
pub struct HttpConnection {
    config: Arc<ServerConfig>,
    decoder: HeaderDecoder,
    ctx: RequestContext,
    shutdown: CancellationToken,
    abort: CancellationToken,
    connection_id: String,
    sequence: u32,
}

impl HttpConnection {
    pub fn new<R, W>(reader: R, writer: W, config: Arc<ServerConfig>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let abort = CancellationToken::new();
        let reader = BodyReader::new(Incoming::new(reader), abort.clone());
        let writer = ResponseWriter::new(writer, abort.clone());
        let ctx = RequestContext::new(Arc::clone(&config), reader, writer, abort.clone());
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        Self {
            decoder: HeaderDecoder::new(Arc::clone(&config)),
            config,
            ctx,
            shutdown: CancellationToken::new(),
            abort,
            connection_id: format!("{id:016X}"),
            sequence: 0,
        }
    }

    /// Addresses and TLS details of the underlying transport.
    pub fn with_transport(mut self, transport: TransportInfo) -> Self {
        self.ctx.transport = Arc::new(transport);
        self
    }

    /// A token that starts a graceful shutdown of this connection.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn process<H>(mut self, handler: Arc<H>) -> Result<(), HttpError>
    where
        H: Handler + ?Sized,
    {
        loop {
            let (header, size, budget) = match self.read_head().await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    self.close().await;
                    return Ok(());
                }
                Err(e) => {
                    info!(connection_id = %self.connection_id, cause = %e, "bad request, closing the connection");
                    self.send_error_response(e.status_code()).await;
                    self.close().await;
                    return Err(e.into());
                }
            };

            if !self.handle_request(handler.as_ref(), header, size, budget).await {
                self.close().await;
                return Ok(());
            }
        }
    }

    /// Waits for the next request head. `None` closes the connection without a response.
    async fn read_head(&mut self) -> Result<Option<(RequestHeader, PayloadSize, HeaderBudget)>, ParseError> {
        let keep_alive_timeout = self.config.keep_alive_timeout();
        let headers_timeout = self.config.request_headers_timeout();
        let incoming = self.ctx.reader.incoming_mut();

        if incoming.buffer().is_empty() {
            let filled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(connection_id = %self.connection_id, "shutdown while idle");
                    return Ok(None);
                }
                filled = timeout(keep_alive_timeout, incoming.fill()) => filled,
            };
            match filled {
                Err(_) => {
                    debug!(connection_id = %self.connection_id, "keep-alive timeout");
                    return Ok(None);
                }
                Ok(Err(e)) => {
                    info!(connection_id = %self.connection_id, cause = %e, "connection reset by the client");
                    return Ok(None);
                }
                Ok(Ok(_)) => {}
            }
        }

        let deadline = Instant::now() + headers_timeout;
        loop {
            if let Some(head) = self.decoder.decode(incoming.buffer_mut())? {
                return Ok(Some(head));
            }
            if incoming.is_eof() {
                if !incoming.buffer().is_empty() {
                    info!(connection_id = %self.connection_id, "connection closed in the middle of a request head");
                }
                return Ok(None);
            }
            match timeout_at(deadline, incoming.fill()).await {
                Err(_) => return Err(ParseError::RequestHeadersTimeout),
                Ok(Err(e)) => {
                    info!(connection_id = %self.connection_id, cause = %e, "connection reset by the client");
                    return Ok(None);
                }
                Ok(Ok(_)) => {}
            }
        }
    }

    /// Runs one request to completion. Returns whether the connection can serve another one.
    async fn handle_request<H>(
        &mut self,
        handler: &H,
        header: RequestHeader,
        size: PayloadSize,
        budget: HeaderBudget,
    ) -> bool
    where
        H: Handler + ?Sized,
    {
        self.sequence = self.sequence.wrapping_add(1);
        let trace_identifier = format!("{}:{:08X}", self.connection_id, self.sequence);
        let span = info_span!("request", trace_id = %trace_identifier, method = %header.method(), path = header.path());
        let keep_alive = header.keep_alive() && !header.has_conflicting_length() && !self.shutdown.is_cancelled();
        self.ctx.reset(header, size, budget, trace_identifier, keep_alive);

        async {
            let result = self.call_handler(handler).await;
            self.finish_request(result).await
        }
        .instrument(span)
        .await
    }

    /// Runs the handler. After a shutdown request it gets `shutdown_timeout` to finish, then the
    /// request is aborted.
    async fn call_handler<H>(&mut self, handler: &H) -> Result<(), BoxError>
    where
        H: Handler + ?Sized,
    {
        let shutdown_timeout = self.config.shutdown_timeout();
        let (ctx, shutdown, abort) = (&mut self.ctx, &self.shutdown, &self.abort);

        let call = handler.call(ctx);
        tokio::pin!(call);
        tokio::select! {
            biased;
            result = &mut call => return result,
            _ = shutdown.cancelled() => {}
        }

        debug!("shutdown requested while a request is in flight");
        match timeout(shutdown_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?shutdown_timeout, "request did not finish within the shutdown timeout, aborting");
                abort.cancel();
                Ok(())
            }
        }
    }

    /// Ends the response, runs `on_completed` and drains what the handler left of the body.
    async fn finish_request(&mut self, result: Result<(), BoxError>) -> bool {
        let result = result.and_then(|()| self.ctx.reader.take_completion_error().map_or(Ok(()), Err));

        if let Err(e) = result {
            if !self.abort.is_cancelled() {
                let status = match request_error_status(e.as_ref()) {
                    Some(status) => {
                        info!(cause = %e, %status, "request failed");
                        self.ctx.writer.disable_keep_alive();
                        status
                    }
                    None => {
                        error!(cause = %e, "request handler failed");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                if self.ctx.writer.has_started() {
                    debug!("response already started, aborting the connection");
                    self.abort.cancel();
                } else {
                    self.ctx.writer.reset_to_error(status);
                }
            }
        }

        if self.shutdown.is_cancelled() {
            self.ctx.writer.disable_keep_alive();
        }
        if let Err(e) = self.ctx.writer.complete(None).await {
            debug!(cause = %e, "failed to complete the response");
            self.abort.cancel();
        }

        self.ctx.run_on_completed().await;

        let writer = &self.ctx.writer;
        if !writer.keep_alive() || writer.is_upgraded() || self.abort.is_cancelled() || self.shutdown.is_cancelled() {
            return false;
        }
        if self.ctx.reader.continue_pending() {
            debug!("the client still waits for 100 continue, closing instead of draining");
            return false;
        }
        if let Err(e) = self.ctx.reader.drain().await {
            info!(cause = %e, "failed to drain the request body, closing the connection");
            return false;
        }
        debug!("keep-alive, waiting for the next request");
        true
    }

    /// Answers a request whose head could not be parsed.
    async fn send_error_response(&mut self, status: StatusCode) {
        let writer = &mut self.ctx.writer;
        writer.reset(RequestFacts { keep_alive: false, ..RequestFacts::default() });
        writer.reset_to_error(status);
        if let Err(e) = writer.complete(None).await {
            debug!(cause = %e, "failed to send the error response");
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ctx.writer.shutdown().await {
            debug!(cause = %e, "failed to shut down the transport");
        }
        debug!(connection_id = %self.connection_id, requests = self.sequence, "connection closed");
    }
}

/// The status for errors caused by the request itself. Anything else is a 500.
fn request_error_status(e: &(dyn Error + Send + Sync + 'static)) -> Option<StatusCode> {
    if let Some(e) = e.downcast_ref::<ParseError>() {
        return Some(e.status_code());
    }
    e.downcast_ref::<BodyError>().and_then(BodyError::as_parse_error).map(ParseError::status_code)
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("connection_id", &self.connection_id)
            .field("sequence", &self.sequence)
            .field("ctx", &self.ctx)
            .finish()
    }
}
