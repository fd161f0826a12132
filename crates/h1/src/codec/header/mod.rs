//! HTTP header processing for requests and responses.
//!
//! - [`HeaderDecoder`] parses the request line and header fields with `httparse`, enforcing the
//!   configured limits, and picks the body strategy.
//! - [`HeaderEncoder`] serializes a prepared response head.
//! - [`HeaderBudget`] carries what is left of the header limits from the leading headers to the
//!   chunked trailers, which are charged against the same budget.

mod header_decoder;
mod header_encoder;

pub(crate) use header_decoder::has_bare_lf;
pub(crate) use header_encoder::{encode_fields, FastWrite};
pub use header_decoder::HeaderDecoder;
pub use header_encoder::HeaderEncoder;

use crate::ensure;
use crate::protocol::ParseError;

/// Remaining header count and byte allowance of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBudget {
    max_bytes: usize,
    max_count: usize,
    used_bytes: usize,
    used_count: usize,
}

impl HeaderBudget {
    pub fn new(max_bytes: usize, max_count: usize) -> Self {
        Self { max_bytes, max_count, used_bytes: 0, used_count: 0 }
    }

    /// An allowance without a byte limit, for bodies decoded outside a request. The field count
    /// stays bounded since parsing preallocates a slot per field.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX, 100)
    }

    /// Charges `bytes` of header lines and `count` fields, failing once a limit is crossed.
    pub fn consume(&mut self, bytes: usize, count: usize) -> Result<(), ParseError> {
        let used_bytes = self.used_bytes.saturating_add(bytes);
        let used_count = self.used_count.saturating_add(count);
        ensure!(used_count <= self.max_count, ParseError::too_many_headers(self.max_count));
        ensure!(used_bytes <= self.max_bytes, ParseError::too_large_header(used_bytes, self.max_bytes));
        self.used_bytes = used_bytes;
        self.used_count = used_count;
        Ok(())
    }

    /// Checks a partially received block of `bytes` without charging it.
    pub fn check_pending(&self, bytes: usize) -> Result<(), ParseError> {
        let pending = self.used_bytes.saturating_add(bytes);
        // the blank line ending the block is not charged
        ensure!(pending <= self.max_bytes.saturating_add(2), ParseError::too_large_header(pending, self.max_bytes));
        Ok(())
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn remaining_count(&self) -> usize {
        self.max_count - self.used_count
    }
}
