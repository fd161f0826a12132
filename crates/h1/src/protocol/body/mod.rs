//! Request body handling.
//!
//! The connection owns one [`BodyReader`] for its whole lifetime and re-arms it for every request
//! with the framing decided from the request head. The application pulls from it through
//! [`crate::connection::RequestBody`]; whatever it leaves unread is drained by the connection
//! before the next request is parsed.

mod body_reader;

pub use body_reader::{BodyReader, ReadResult, ReadState};
