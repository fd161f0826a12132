//! Wire codecs for HTTP/1.x.
//!
//! - Request side: [`HeaderDecoder`] parses the request line and headers, then a
//!   [`PayloadDecoder`] yields the body as [`crate::protocol::PayloadItem`]s.
//! - Response side: [`HeaderEncoder`] writes the status line and headers, then a
//!   [`PayloadEncoder`] frames the body.
//!
//! All of them implement `tokio_util::codec::{Decoder, Encoder}` and work on `BytesMut` buffers
//! without doing any IO themselves.

mod body;
mod header;

pub use body::{chunk_overhead, PayloadDecoder, PayloadEncoder};
pub use header::{HeaderBudget, HeaderDecoder, HeaderEncoder};
