//! Request and response bodies.

use std::fmt;
use std::io::Write;
use std::sync::Mutex;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::io::AsyncRead;

use crate::error::{Error, Kind, Result};

/// A request body: either a replayable byte buffer or a one-shot stream.
pub struct Body {
    content_type: Option<String>,
    kind: BodyKind,
}

enum BodyKind {
    Bytes(Bytes),
    Stream {
        content_length: Option<u64>,
        reader: Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    },
}

impl Body {
    /// An empty body.
    pub fn empty() -> Body {
        Body::from_bytes(Bytes::new())
    }

    /// A body backed by a byte buffer. Replayable on retries.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Body {
        Body {
            content_type: None,
            kind: BodyKind::Bytes(bytes.into()),
        }
    }

    /// A UTF-8 text body with no declared content type.
    pub fn from_text(text: impl Into<String>) -> Body {
        Body::from_bytes(Bytes::from(text.into()))
    }

    /// A streaming body. One-shot: it cannot be replayed after a failure,
    /// so retries and most follow-ups are disabled for its request.
    pub fn stream(
        content_length: Option<u64>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Body {
        Body {
            content_type: None,
            kind: BodyKind::Stream {
                content_length,
                reader: Mutex::new(Some(reader)),
            },
        }
    }

    /// Declares the body's media type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Body {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The byte count, when known up front.
    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            BodyKind::Bytes(bytes) => Some(bytes.len() as u64),
            BodyKind::Stream { content_length, .. } => *content_length,
        }
    }

    /// Returns true if this body can be transmitted at most once.
    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, BodyKind::Stream { .. })
    }

    pub(crate) fn as_bytes(&self) -> Option<&Bytes> {
        match &self.kind {
            BodyKind::Bytes(bytes) => Some(bytes),
            BodyKind::Stream { .. } => None,
        }
    }

    /// Takes the stream reader out of a one-shot body.
    pub(crate) fn take_reader(&self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.kind {
            BodyKind::Bytes(_) => None,
            BodyKind::Stream { reader, .. } => reader.lock().expect("body reader lock").take(),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Body");
        s.field("content_type", &self.content_type);
        match &self.kind {
            BodyKind::Bytes(bytes) => s.field("len", &bytes.len()),
            BodyKind::Stream { content_length, .. } => s.field("stream_len", content_length),
        };
        s.finish()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Body {
        Body::from_bytes(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Body {
        Body::from_text(text)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Body {
        Body::from_bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// Where streamed response bytes come from. Implemented by the exchange
/// layer; closing releases the underlying connection exactly once.
pub(crate) trait RawBodySource: Send + 'static {
    /// The next chunk, or `None` at end of body.
    fn read_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>>;

    /// Releases the source. `complete` is true when the body was fully
    /// consumed, which lets the connection return to the pool.
    fn close_source(&mut self, complete: bool);
}

/// A streaming response body.
///
/// The body owns its connection lease: reading to the end (or calling
/// [`close`](ResponseBody::close)) releases the connection back to the pool
/// or tears it down. Closure is idempotent; dropping an unclosed body closes
/// it.
pub struct ResponseBody {
    content_type: Option<String>,
    content_length: Option<u64>,
    source: Source,
    closed: bool,
}

enum Source {
    Empty,
    Buffered(Bytes),
    Streamed(Box<dyn RawBodySource>),
}

impl ResponseBody {
    pub(crate) fn empty() -> ResponseBody {
        ResponseBody {
            content_type: None,
            content_length: Some(0),
            source: Source::Empty,
            closed: false,
        }
    }

    /// A body backed by an in-memory buffer, for synthesized responses
    /// (caches, tests).
    pub fn from_bytes(content_type: Option<&str>, bytes: impl Into<Bytes>) -> ResponseBody {
        let bytes = bytes.into();
        ResponseBody {
            content_type: content_type.map(str::to_string),
            content_length: Some(bytes.len() as u64),
            source: Source::Buffered(bytes),
            closed: false,
        }
    }

    pub(crate) fn streamed(
        content_type: Option<String>,
        content_length: Option<u64>,
        source: Box<dyn RawBodySource>,
    ) -> ResponseBody {
        ResponseBody {
            content_type,
            content_length,
            source: Source::Streamed(source),
            closed: false,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The declared length, or `None` when unknown (chunked or until-close).
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// The next chunk of the body, or `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if self.closed {
            return Err(Error::new(Kind::Io).with_message("body is closed"));
        }
        match &mut self.source {
            Source::Empty => Ok(None),
            Source::Buffered(bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
            Source::Streamed(source) => match source.read_chunk().await {
                Ok(Some(chunk)) => Ok(Some(chunk)),
                Ok(None) => {
                    source.close_source(true);
                    self.source = Source::Empty;
                    Ok(None)
                }
                Err(e) => {
                    source.close_source(false);
                    self.source = Source::Empty;
                    Err(e)
                }
            },
        }
    }

    /// Reads the entire remaining body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = bytes::BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        self.close();
        Ok(buf.freeze())
    }

    /// Reads the entire remaining body as UTF-8 text, lossily.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Unwraps the body into a raw source so a decoding layer can wrap it.
    pub(crate) fn into_source(mut self) -> Box<dyn RawBodySource> {
        let source = std::mem::replace(&mut self.source, Source::Empty);
        self.closed = true; // the Drop impl must not release twice
        match source {
            Source::Empty => Box::new(BufferedSource(None)),
            Source::Buffered(bytes) => Box::new(BufferedSource(Some(bytes))),
            Source::Streamed(source) => source,
        }
    }

    /// Releases the connection resources held by this body. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Source::Streamed(source) = &mut self.source {
            source.close_source(false);
        }
        self.source = Source::Empty;
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("closed", &self.closed)
            .finish()
    }
}

/// An in-memory source, for synthesized bodies.
pub(crate) struct BufferedSource(Option<Bytes>);

impl RawBodySource for BufferedSource {
    fn read_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move { Ok(self.0.take().filter(|b| !b.is_empty())) })
    }

    fn close_source(&mut self, _complete: bool) {}
}

/// Transparent gzip decoding over another source, used when the bridge
/// interceptor added `Accept-Encoding: gzip`.
pub(crate) struct GzipSource {
    inner: Box<dyn RawBodySource>,
    decoder: Option<flate2::write::GzDecoder<Vec<u8>>>,
}

impl GzipSource {
    pub(crate) fn new(inner: Box<dyn RawBodySource>) -> GzipSource {
        GzipSource {
            inner,
            decoder: Some(flate2::write::GzDecoder::new(Vec::new())),
        }
    }

    fn drain(&mut self) -> Option<Bytes> {
        let decoder = self.decoder.as_mut()?;
        if decoder.get_ref().is_empty() {
            return None;
        }
        let out = std::mem::take(decoder.get_mut());
        Some(Bytes::from(out))
    }
}

impl RawBodySource for GzipSource {
    fn read_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            loop {
                if let Some(out) = self.drain() {
                    return Ok(Some(out));
                }
                let decoder = match self.decoder.as_mut() {
                    Some(decoder) => decoder,
                    None => return Ok(None),
                };
                match self.inner.read_chunk().await? {
                    Some(chunk) => {
                        decoder
                            .write_all(&chunk)
                            .map_err(|e| Error::new_protocol(format!("gzip: {}", e)))?;
                    }
                    None => {
                        let mut decoder = self.decoder.take().expect("gzip decoder");
                        decoder
                            .try_finish()
                            .map_err(|e| Error::new_protocol(format!("gzip: {}", e)))?;
                        let out = decoder.finish().map_err(|e| {
                            Error::new_protocol(format!("gzip: {}", e))
                        })?;
                        if out.is_empty() {
                            return Ok(None);
                        }
                        return Ok(Some(Bytes::from(out)));
                    }
                }
            }
        })
    }

    fn close_source(&mut self, complete: bool) {
        self.inner.close_source(complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    struct ChunkedSource {
        chunks: Vec<Bytes>,
        closed_complete: Option<bool>,
    }

    impl RawBodySource for ChunkedSource {
        fn read_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
            Box::pin(async move {
                if self.chunks.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(self.chunks.remove(0)))
                }
            })
        }

        fn close_source(&mut self, complete: bool) {
            self.closed_complete = Some(complete);
        }
    }

    #[tokio::test]
    async fn streamed_body_reads_to_end() {
        let source = ChunkedSource {
            chunks: vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")],
            closed_complete: None,
        };
        let body = ResponseBody::streamed(None, Some(11), Box::new(source));
        assert_eq!(body.content_length(), Some(11));
        assert_eq!(body.text().await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_reads() {
        let source = ChunkedSource {
            chunks: vec![Bytes::from_static(b"data")],
            closed_complete: None,
        };
        let mut body = ResponseBody::streamed(None, None, Box::new(source));
        body.close();
        body.close();
        assert!(body.chunk().await.is_err());
    }

    #[tokio::test]
    async fn gzip_source_inflates() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"Hello inflation!").unwrap();
        let compressed = encoder.finish().unwrap();

        let source = ChunkedSource {
            chunks: vec![Bytes::from(compressed)],
            closed_complete: None,
        };
        let body = ResponseBody::streamed(None, None, Box::new(GzipSource::new(Box::new(source))));
        assert_eq!(body.text().await.unwrap(), "Hello inflation!");
    }

    #[test]
    fn request_body_shapes() {
        let buffered = Body::from("payload");
        assert_eq!(buffered.content_length(), Some(7));
        assert!(!buffered.is_one_shot());

        let streamed = Body::stream(None, Box::new(&b"xyz"[..]));
        assert!(streamed.is_one_shot());
        assert_eq!(streamed.content_length(), None);
        assert!(streamed.take_reader().is_some());
        assert!(streamed.take_reader().is_none());
    }
}
