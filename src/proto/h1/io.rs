//! Buffered transport IO for HTTP/1.1 connections.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result, TimeoutStage};
use crate::proto::{CancelHandle, Transport};
use crate::timeout::timed;

const READ_BUF_SIZE: usize = 8 * 1024;

/// One transport plus its read buffer, read/write deadlines, and the
/// connection's cancel flag. Every IO operation races cancellation.
pub(crate) struct Buffered {
    io: Box<dyn Transport>,
    read_buf: BytesMut,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    cancel: CancelHandle,
}

impl Buffered {
    pub(crate) fn new(io: Box<dyn Transport>, cancel: CancelHandle) -> Buffered {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(READ_BUF_SIZE),
            read_timeout: None,
            write_timeout: None,
            cancel,
        }
    }

    pub(crate) fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub(crate) fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    pub(crate) fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Bytes read off the transport but not yet consumed.
    pub(crate) fn buffer(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Reads more bytes into the buffer. Returns the number read; zero means
    /// the peer closed the stream.
    pub(crate) async fn fill_buf(&mut self) -> Result<usize> {
        if self.cancel.is_canceled() {
            return Err(Error::new_canceled());
        }
        let cancel = self.cancel.clone();
        let io = &mut self.io;
        let read_buf = &mut self.read_buf;
        timed(TimeoutStage::Read, self.read_timeout, async move {
            tokio::select! {
                read = io.read_buf(read_buf) => Ok(read?),
                _ = cancel.canceled() => Err(Error::new_canceled()),
            }
        })
        .await
    }

    /// Consumes one byte, filling the buffer as needed.
    pub(crate) async fn read_byte(&mut self) -> Result<u8> {
        while self.read_buf.is_empty() {
            if self.fill_buf().await? == 0 {
                return Err(unexpected_eof());
            }
        }
        Ok(self.read_buf.split_to(1)[0])
    }

    /// Consumes up to `max` buffered bytes, filling the buffer as needed.
    /// `None` means the peer closed the stream.
    pub(crate) async fn read_chunk(&mut self, max: usize) -> Result<Option<Bytes>> {
        if self.read_buf.is_empty() && self.fill_buf().await? == 0 {
            return Ok(None);
        }
        let take = self.read_buf.len().min(max);
        Ok(Some(self.read_buf.split_to(take).freeze()))
    }

    /// Reads a CRLF-terminated line, excluding the terminator. Lenient about
    /// a bare LF. `limit` bounds the line length.
    pub(crate) async fn read_line(&mut self, limit: usize) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let b = self.read_byte().await?;
            if b == b'\n' {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }
            line.push(b);
            if line.len() > limit {
                return Err(Error::new_headers_too_large());
            }
        }
    }

    pub(crate) async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.cancel.is_canceled() {
            return Err(Error::new_canceled());
        }
        let cancel = self.cancel.clone();
        let io = &mut self.io;
        timed(TimeoutStage::Write, self.write_timeout, async move {
            tokio::select! {
                write = io.write_all(data) => {
                    write?;
                    Ok(())
                }
                _ = cancel.canceled() => Err(Error::new_canceled()),
            }
        })
        .await
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let io = &mut self.io;
        timed(TimeoutStage::Write, self.write_timeout, async move {
            tokio::select! {
                flush = io.flush() => {
                    flush?;
                    Ok(())
                }
                _ = cancel.canceled() => Err(Error::new_canceled()),
            }
        })
        .await
    }

    /// Tears the transport apart for a protocol upgrade, handing back any
    /// bytes that were read past the response head.
    pub(crate) fn into_parts(self) -> (Box<dyn Transport>, BytesMut, CancelHandle) {
        (self.io, self.read_buf, self.cancel)
    }
}

pub(crate) fn unexpected_eof() -> Error {
    Error::new_io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "unexpected end of stream",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffered(data: &'static [u8]) -> Buffered {
        Buffered::new(Box::new(Mock::new(data)), CancelHandle::new())
    }

    /// A transport that serves fixed bytes and discards writes.
    struct Mock {
        data: &'static [u8],
    }

    impl Mock {
        fn new(data: &'static [u8]) -> Mock {
            Mock { data }
        }
    }

    impl tokio::io::AsyncRead for Mock {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            let n = self.data.len().min(buf.remaining());
            buf.put_slice(&self.data[..n]);
            self.data = &self.data[n..];
            std::task::Poll::Ready(Ok(()))
        }
    }

    impl tokio::io::AsyncWrite for Mock {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
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

    #[tokio::test]
    async fn lines_and_bytes() {
        let mut io = buffered(b"HTTP/1.1 200 OK\r\nrest");
        assert_eq!(io.read_line(1024).await.unwrap(), "HTTP/1.1 200 OK");
        assert_eq!(io.read_byte().await.unwrap(), b'r');
    }

    #[tokio::test]
    async fn line_limit_enforced() {
        let mut io = buffered(b"aaaaaaaaaaaaaaaaaaaa\r\n");
        let err = io.read_line(8).await.unwrap_err();
        assert!(err.is_headers_too_large());
    }

    #[tokio::test]
    async fn eof_surfaces_as_none_chunk() {
        let mut io = buffered(b"ab");
        assert_eq!(io.read_chunk(10).await.unwrap().unwrap().as_ref(), b"ab");
        assert!(io.read_chunk(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_aborts_reads() {
        let mut io = buffered(b"");
        io.cancel_handle().cancel();
        assert!(io.fill_buf().await.unwrap_err().is_canceled());
    }
}
