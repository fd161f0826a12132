//! Small helpers shared by the codecs and the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::header::GetAll;
use http::HeaderValue;
use tokio::sync::Notify;

/// Returns early with an error when a condition does not hold.
///
/// Works like `assert!` but returns `Err($error)` instead of panicking.
///
/// ```ignore
/// ensure!(header_count <= max_count, ParseError::too_many_headers(max_count));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;

/// Iterates the comma separated tokens of every value of a header, trimmed.
pub(crate) fn tokens<'a>(values: GetAll<'a, HeaderValue>) -> impl Iterator<Item = &'a [u8]> + 'a {
    values
        .into_iter()
        .flat_map(|value| value.as_bytes().split(|b| *b == b','))
        .map(<[u8]>::trim_ascii)
        .filter(|token| !token.is_empty())
}

/// Whether any value of the header carries `token`, compared case-insensitively.
pub(crate) fn has_token(values: GetAll<'_, HeaderValue>, token: &str) -> bool {
    tokens(values).any(|t| t.eq_ignore_ascii_case(token.as_bytes()))
}

/// The last coding of a `Transfer-Encoding` list, the one that frames the message.
pub(crate) fn final_token(values: GetAll<'_, HeaderValue>) -> Option<&[u8]> {
    tokens(values).last()
}

/// Whether the final transfer coding is `chunked`.
pub(crate) fn is_chunked(values: GetAll<'_, HeaderValue>) -> bool {
    final_token(values).is_some_and(|t| t.eq_ignore_ascii_case(b"chunked"))
}

/// Cancels exactly one pending or upcoming body read or response flush.
///
/// Cloned handles can be moved to another task. Cancelling does not close the reader or the
/// writer, the call after the canceled one behaves normally.
#[derive(Debug, Clone, Default)]
pub struct PendingCancel {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    notify: Notify,
}

impl PendingCancel {
    pub fn cancel(&self) {
        self.inner.requested.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    /// Consumes a cancellation request, if one is pending.
    pub(crate) fn take(&self) -> bool {
        self.inner.requested.swap(false, Ordering::AcqRel)
    }

    /// Resolves once a cancellation was requested, consuming it.
    pub(crate) async fn requested(&self) {
        loop {
            if self.take() {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use http::header::{CONNECTION, TRANSFER_ENCODING};

    #[test]
    fn check_is_chunked() {
        {
            let headers = HeaderMap::new();
            assert!(!is_chunked(headers.get_all(TRANSFER_ENCODING)));
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert(TRANSFER_ENCODING, "gzip, Chunked".parse().unwrap());
            assert!(is_chunked(headers.get_all(TRANSFER_ENCODING)));
        }

        {
            let mut headers = HeaderMap::new();
            headers.insert(TRANSFER_ENCODING, "chunked, gzip".parse().unwrap());
            assert!(!is_chunked(headers.get_all(TRANSFER_ENCODING)));
        }

        {
            // the final coding wins across repeated header lines
            let mut headers = HeaderMap::new();
            headers.append(TRANSFER_ENCODING, "chunked".parse().unwrap());
            headers.append(TRANSFER_ENCODING, "not-chunked".parse().unwrap());
            assert!(!is_chunked(headers.get_all(TRANSFER_ENCODING)));
        }
    }

    #[tokio::test]
    async fn pending_cancel_fires_once() {
        let cancel = PendingCancel::default();
        assert!(!cancel.take());

        cancel.clone().cancel();
        cancel.requested().await;
        assert!(!cancel.take());

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cancel.requested().await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        waiter.await.unwrap();
        assert!(!cancel.take());
    }

    #[test]
    fn check_has_token() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive, Upgrade".parse().unwrap());
        assert!(has_token(headers.get_all(CONNECTION), "upgrade"));
        assert!(has_token(headers.get_all(CONNECTION), "keep-alive"));
        assert!(!has_token(headers.get_all(CONNECTION), "close"));
    }
}
