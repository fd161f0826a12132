//! HTTP connection handling module
//!
//! This module drives one transport connection from the first request byte to the close.
//!
//! # Components
//!
//! - [`HttpConnection`]: the connection state machine. It parses request heads, runs the
//!   handler, completes responses and decides whether the connection is reused.
//! - [`RequestContext`]: what a handler sees of one request, reset between requests
//! - [`RequestBody`]: the pull-based request body, with the interim `100 Continue` response
//! - [`ResponseWriter`]: buffered response body writes, framing decided on the first flush
//! - [`Incoming`]: the transport read half and the bytes received but not parsed yet

mod context;
mod http_connection;
mod incoming;
mod response_writer;

pub use context::{RequestBody, RequestContext};
pub use http_connection::HttpConnection;
pub use incoming::Incoming;
pub use response_writer::{CHUNKED_SEGMENT_SIZE, OnStarting, ResponseWriter, SEGMENT_SIZE};
