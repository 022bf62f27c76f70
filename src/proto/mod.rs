//! Wire protocol engines: HTTP/1.1 and HTTP/2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;

pub(crate) mod h1;
pub(crate) mod h2;

/// A bidirectional byte stream a connection runs over: plain TCP or a TLS
/// session supplied by the configured provider.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// The application protocol negotiated for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1, one exchange at a time per connection.
    Http11,
    /// HTTP/2, many concurrent streams per connection.
    H2,
}

impl Protocol {
    /// The ALPN protocol identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http11 => "http/1.1",
            Protocol::H2 => "h2",
        }
    }

    /// Maps an ALPN identifier back to a protocol.
    pub fn from_alpn(id: &[u8]) -> Option<Protocol> {
        match id {
            b"http/1.1" => Some(Protocol::Http11),
            b"h2" => Some(Protocol::H2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cooperative cancellation flag shared by everything running on one
/// connection. Monotonic: once canceled, always canceled. Pending reads and
/// writes race against `canceled()` and abort.
#[derive(Clone, Default)]
pub(crate) struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub(crate) fn new() -> CancelHandle {
        CancelHandle::default()
    }

    pub(crate) fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub(crate) async fn canceled(&self) {
        loop {
            // Register before checking the flag so a cancel landing between
            // the check and the await still wakes us.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
