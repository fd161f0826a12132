//! The HTTP/1.x framing and connection core of an async server
//!
//! This crate turns a byte stream into a sequence of HTTP/1.0 and HTTP/1.1 requests and writes
//! their responses back, built on top of tokio. It owns the wire protocol: request heads,
//! `Content-Length` and chunked bodies, trailers, keep-alive, `100 Continue`, upgrades and the
//! response framing decisions. Routing, TLS handshakes and the application object model are left
//! to the embedding server.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1 with keep-alive and pipelining
//! - Pull-based request bodies with a read/advance protocol, cancellation and a minimum data rate
//! - Chunked request bodies with trailers, limited together with the request headers
//! - Response framing picked on the first flush: `Content-Length`, chunked or close-delimited
//! - `Content-Length` enforcement on responses
//! - `on_starting` and `on_completed` callbacks
//! - Graceful shutdown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use micro_h1::config::ServerConfig;
//! use micro_h1::connection::{HttpConnection, RequestContext};
//! use micro_h1::handler::Handler;
//! use micro_h1::protocol::BoxError;
//! use tokio::net::TcpListener;
//! use tracing::{error, info, warn, Level};
//! use tracing_subscriber::FmtSubscriber;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Handler for Echo {
//!     async fn call(&self, ctx: &mut RequestContext) -> Result<(), BoxError> {
//!         let body = ctx.body().read_to_end().await?;
//!         info!(len = body.len(), "receiving request body");
//!         ctx.response().write(&body).await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
//!     tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
//!
//!     let config = Arc::new(ServerConfig::default());
//!     let handler = Arc::new(Echo);
//!
//!     info!(port = 8080, "start listening");
//!     let tcp_listener = match TcpListener::bind("127.0.0.1:8080").await {
//!         Ok(tcp_listener) => tcp_listener,
//!         Err(e) => {
//!             error!(cause = %e, "bind server error");
//!             return;
//!         }
//!     };
//!
//!     loop {
//!         let (tcp_stream, _remote_addr) = match tcp_listener.accept().await {
//!             Ok(stream_and_addr) => stream_and_addr,
//!             Err(e) => {
//!                 warn!(cause = %e, "failed to accept");
//!                 continue;
//!             }
//!         };
//!
//!         let handler = handler.clone();
//!         let config = config.clone();
//!
//!         tokio::spawn(async move {
//!             let (reader, writer) = tcp_stream.into_split();
//!             let connection = HttpConnection::new(reader, writer, config);
//!             match connection.process(handler).await {
//!                 Ok(()) => info!("finished process, connection shutdown"),
//!                 Err(e) => error!(cause = %e, "service has error, connection shutdown"),
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`connection`]: the connection state machine, the per-request context, the response writer
//! - [`protocol`]: message types, framing decisions, errors and the request body reader
//! - [`codec`]: `tokio_util` codecs for request heads, response heads and bodies
//! - [`handler`]: the application seam
//! - [`config`]: the settings shared by every connection
//! - [`transport`]: addresses and TLS details handed over by the acceptor
//!
//! # Error Handling
//!
//! - [`protocol::HttpError`]: the result of a whole connection
//! - [`protocol::ParseError`]: malformed requests, each mapped to a status code
//! - [`protocol::BodyError`]: request body reads
//! - [`protocol::SendError`]: response writes

pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod transport;

mod utils;
pub(crate) use utils::ensure;
pub use utils::PendingCancel;

#[cfg(test)]
mod test_util {
    /// Wire text is written with `\n` in tests, the protocol wants `\r\n`.
    pub fn crlf(s: &str) -> String {
        s.replace('\n', "\r\n")
    }
}
