//! Error and Result module.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have hearth `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP calls and WebSockets.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    message: Option<Cow<'static, str>>,
    cause: Option<Cause>,
    suppressed: Vec<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// A URL failed to parse or canonicalize.
    InvalidUrl,
    /// An `io::Error` occurred while reading or writing a network stream.
    Io,
    /// The peer violated HTTP or WebSocket grammar. Not retryable.
    Protocol,
    /// Certificate, hostname, or cipher negotiation failed.
    Tls,
    /// A deadline fired.
    Timeout(TimeoutStage),
    /// The caller invoked `cancel()`.
    Canceled,
    /// The redirect/auth chain exceeded the follow-up bound.
    TooManyFollowUps,
    /// The HTTP/2 peer refused a stream. Always safe to retry.
    RefusedStream,
    /// An HTTP/1.1 header block exceeded the accumulation limit.
    HeadersTooLarge,
    /// A caller-supplied WebSocket close code was reserved or out of range.
    CloseReserved,
}

/// Which timer fired for a `Timeout` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutStage {
    /// The call-wide deadline.
    Call,
    /// A TCP connect attempt.
    Connect,
    /// A socket read.
    Read,
    /// A socket write.
    Write,
    /// The WebSocket (or HTTP/2) keepalive ping.
    Ping,
}

impl Error {
    /// Returns true if the URL failed to parse.
    pub fn is_invalid_url(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidUrl)
    }

    /// Returns true if a transport read or write failed.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the peer violated HTTP or WebSocket grammar.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if TLS negotiation failed.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if a deadline fired.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    /// The stage whose timer fired, if this is a timeout error.
    pub fn timeout_stage(&self) -> Option<TimeoutStage> {
        match self.inner.kind {
            Kind::Timeout(stage) => Some(stage),
            _ => None,
        }
    }

    /// Returns true if the call was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the follow-up chain exceeded its bound.
    pub fn is_too_many_follow_ups(&self) -> bool {
        matches!(self.inner.kind, Kind::TooManyFollowUps)
    }

    /// Returns true if the HTTP/2 peer refused the stream.
    pub fn is_refused_stream(&self) -> bool {
        matches!(self.inner.kind, Kind::RefusedStream)
    }

    /// Returns true if a response head exceeded the size limit.
    pub fn is_headers_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::HeadersTooLarge)
    }

    /// Returns true if a WebSocket close code was reserved or out of range.
    pub fn is_close_reserved(&self) -> bool {
        matches!(self.inner.kind, Kind::CloseReserved)
    }

    /// Errors from other route attempts, attached when every route failed.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                message: None,
                cause: None,
                suppressed: Vec::new(),
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn with_message<M: Into<Cow<'static, str>>>(mut self, message: M) -> Error {
        self.inner.message = Some(message.into());
        self
    }

    pub(crate) fn push_suppressed(&mut self, error: Error) {
        self.inner.suppressed.push(error);
    }

    pub(crate) fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub(crate) fn new_invalid_url<M: Into<Cow<'static, str>>>(reason: M) -> Error {
        Error::new(Kind::InvalidUrl).with_message(reason)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_protocol<M: Into<Cow<'static, str>>>(message: M) -> Error {
        Error::new(Kind::Protocol).with_message(message)
    }

    pub(crate) fn new_tls<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_timeout(stage: TimeoutStage) -> Error {
        Error::new(Kind::Timeout(stage))
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_too_many_follow_ups(count: u32) -> Error {
        Error::new(Kind::TooManyFollowUps)
            .with_message(format!("Too many follow-up requests: {}", count))
    }

    pub(crate) fn new_refused_stream() -> Error {
        Error::new(Kind::RefusedStream)
    }

    pub(crate) fn new_headers_too_large() -> Error {
        Error::new(Kind::HeadersTooLarge)
    }

    pub(crate) fn new_close_reserved<M: Into<Cow<'static, str>>>(message: M) -> Error {
        Error::new(Kind::CloseReserved).with_message(message)
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        match self.inner.message {
            Some(ref message) => &**message,
            None => self.description(),
        }
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::InvalidUrl => "invalid URL",
            Kind::Io => "connection error",
            Kind::Protocol => "peer violated the protocol",
            Kind::Tls => "TLS handshake failed",
            Kind::Timeout(TimeoutStage::Call) => "call timed out",
            Kind::Timeout(TimeoutStage::Connect) => "connect timed out",
            Kind::Timeout(TimeoutStage::Read) => "read timed out",
            Kind::Timeout(TimeoutStage::Write) => "write timed out",
            Kind::Timeout(TimeoutStage::Ping) => "ping timed out",
            Kind::Canceled => "operation was canceled",
            Kind::TooManyFollowUps => "too many follow-up requests",
            Kind::RefusedStream => "http2 stream was refused",
            Kind::HeadersTooLarge => "response header block is too large",
            Kind::CloseReserved => "close code is reserved or out of range",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hearth::Error");
        f.field(&self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field(message);
        }
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.message(), cause)
        } else {
            write!(f, "{}", self.message())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn timeout_stage_surfaces() {
        let err = Error::new_timeout(TimeoutStage::Read);
        assert!(err.is_timeout());
        assert_eq!(err.timeout_stage(), Some(TimeoutStage::Read));
        assert_eq!(Error::new_canceled().timeout_stage(), None);
    }

    #[test]
    fn suppressed_errors_ride_along() {
        let mut first = Error::new_io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        first.push_suppressed(Error::new_timeout(TimeoutStage::Connect));
        assert_eq!(first.suppressed().len(), 1);
        assert!(first.suppressed()[0].is_timeout());
    }

    #[test]
    fn message_prefers_custom_text() {
        let err = Error::new_protocol("Expected HTTP 101 response but was 200");
        assert_eq!(err.to_string(), "Expected HTTP 101 response but was 200");
    }
}
