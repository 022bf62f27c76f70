//! Encoders for request bodies.

use crate::error::{Error, Result};

use super::io::Buffered;

/// Encodes a request body with either known-length or chunked framing.
#[derive(Debug)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    /// A writer for bodies with an up-front `Content-Length`.
    Length { remaining: u64 },
    /// A writer for `Transfer-Encoding: chunked` bodies.
    Chunked { finished: bool },
}

impl Encoder {
    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length { remaining: len },
        }
    }

    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked { finished: false },
        }
    }

    pub(crate) async fn write(&mut self, io: &mut Buffered, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.kind {
            Kind::Length { remaining } => {
                let len = data.len() as u64;
                if len > *remaining {
                    return Err(Error::new_protocol(format!(
                        "expected {} more bytes but received {}",
                        remaining, len
                    )));
                }
                *remaining -= len;
                io.write_all(data).await
            }
            Kind::Chunked { finished } => {
                if *finished {
                    return Err(Error::new_protocol("write after chunked body finished"));
                }
                let mut size_line = itoa_hex(data.len());
                size_line.push_str("\r\n");
                io.write_all(size_line.as_bytes()).await?;
                io.write_all(data).await?;
                io.write_all(b"\r\n").await
            }
        }
    }

    /// Terminates the body: verifies a sized body was fully written, or
    /// emits the zero-length final chunk.
    pub(crate) async fn finish(&mut self, io: &mut Buffered) -> Result<()> {
        match &mut self.kind {
            Kind::Length { remaining } => {
                if *remaining != 0 {
                    return Err(Error::new_protocol(format!(
                        "unexpected end of stream: {} bytes of the body were never written",
                        remaining
                    )));
                }
                Ok(())
            }
            Kind::Chunked { finished } => {
                if !*finished {
                    *finished = true;
                    io.write_all(b"0\r\n\r\n").await?;
                }
                Ok(())
            }
        }
    }
}

fn itoa_hex(mut value: usize) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = [0u8; 16];
    let mut at = digits.len();
    while value > 0 {
        at -= 1;
        digits[at] = b"0123456789abcdef"[value & 0xf];
        value >>= 4;
    }
    String::from_utf8_lossy(&digits[at..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::CancelHandle;

    /// A transport capturing everything written to it.
    pub(super) struct Sink(pub std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl tokio::io::AsyncRead for Sink {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    impl tokio::io::AsyncWrite for Sink {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn sink() -> (Buffered, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let written = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let io = Buffered::new(Box::new(Sink(written.clone())), CancelHandle::new());
        (io, written)
    }

    #[tokio::test]
    async fn sized_body_counts_down() {
        let (mut io, written) = sink();
        let mut encoder = Encoder::length(5);
        encoder.write(&mut io, b"hel").await.unwrap();
        encoder.write(&mut io, b"lo").await.unwrap();
        encoder.finish(&mut io).await.unwrap();
        assert_eq!(&*written.lock().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn sized_body_overflow_and_underflow() {
        let (mut io, _) = sink();
        let mut encoder = Encoder::length(2);
        assert!(encoder.write(&mut io, b"toolong").await.is_err());

        let mut short = Encoder::length(5);
        short.write(&mut io, b"ab").await.unwrap();
        assert!(short.finish(&mut io).await.is_err());
    }

    #[tokio::test]
    async fn chunked_framing() {
        let (mut io, written) = sink();
        let mut encoder = Encoder::chunked();
        encoder.write(&mut io, b"Wiki").await.unwrap();
        encoder.write(&mut io, b"pedia").await.unwrap();
        encoder.finish(&mut io).await.unwrap();
        assert_eq!(
            &*written.lock().unwrap(),
            b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn hex_sizes() {
        assert_eq!(itoa_hex(0), "0");
        assert_eq!(itoa_hex(10), "a");
        assert_eq!(itoa_hex(4096), "1000");
    }
}
