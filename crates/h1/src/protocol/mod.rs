//! Core HTTP/1.x protocol types.
//!
//! - **Message Handling** ([`PayloadItem`], [`PayloadSize`], [`BodyFraming`]): body pieces and
//!   how request and response bodies are delimited
//! - **Request Processing** ([`RequestHeader`]): the parsed request head and the connection
//!   management questions asked of it
//! - **Response Processing** ([`ResponseHead`], [`prepare_head`]): the response head and the
//!   framing decision made when it goes on the wire
//! - **Body Streaming** ([`body`]): the request body reader
//! - **Error Handling**: [`HttpError`], [`ParseError`], [`BodyError`], [`SendError`]

mod message;
pub use message::BodyFraming;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub(crate) use response::CONTINUE_RESPONSE;
pub use response::{declared_length, prepare_head, reset_to_error, status_forbids_body};
pub use response::{Prepared, RequestFacts, ResponseHead};

mod error;
pub use error::BodyError;
pub use error::BoxError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::RenegotiateError;
pub use error::SendError;

pub mod body;
