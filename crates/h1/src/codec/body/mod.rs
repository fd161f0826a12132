//! Request and response body codecs.
//!
//! ## Decoders
//! - [`PayloadDecoder`]: picks chunked, length or no-body decoding for a request body
//!
//! ## Encoders
//! - [`PayloadEncoder`]: frames a response body as chunked, fixed length or close-delimited
//!
//! Each strategy is a variant selected once per message and matched on every call.

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use chunked_encoder::chunk_overhead;
pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
