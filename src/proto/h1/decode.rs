//! Decoders to handle different Transfer-Encodings.

use bytes::Bytes;
use tracing::trace;

use crate::error::{Error, Result};
use crate::headers::Headers;

use super::io::{unexpected_eof, Buffered};
use super::role::{BodyLength, MAX_HEAD_SIZE};

use self::Kind::{Chunked, Eof, Length, Zero};

/// Maximum bytes of chunk-size-line extensions tolerated per body.
const CHUNK_EXTENSIONS_LIMIT: usize = 16 * 1024;

/// Decodes a response body framed per `BodyLength`.
#[derive(Debug)]
pub(crate) struct Decoder {
    kind: Kind,
    trailers: Headers,
}

#[derive(Debug)]
enum Kind {
    /// No body.
    Zero,
    /// A reader for bodies with a `Content-Length`.
    Length(u64),
    /// A reader for `Transfer-Encoding: chunked` bodies.
    Chunked {
        state: ChunkedState,
        chunk_len: u64,
        extensions_len: usize,
    },
    /// A reader for bodies delimited by connection close. The bool tracks
    /// whether EOF was seen.
    Eof(bool),
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Size,
    Body,
    BodyCrlf,
    Trailer,
    End,
}

impl Decoder {
    pub(crate) fn new(length: BodyLength) -> Decoder {
        let kind = match length {
            BodyLength::Zero => Zero,
            BodyLength::Length(n) => Length(n),
            BodyLength::Chunked => Chunked {
                state: ChunkedState::Size,
                chunk_len: 0,
                extensions_len: 0,
            },
            BodyLength::CloseDelimited => Eof(false),
        };
        Decoder {
            kind,
            trailers: Headers::new(),
        }
    }

    /// Returns true once the body has been fully consumed.
    pub(crate) fn is_complete(&self) -> bool {
        matches!(
            self.kind,
            Zero | Length(0)
                | Chunked {
                    state: ChunkedState::End,
                    ..
                }
                | Eof(true)
        )
    }

    /// Whether the body length was framed; close-delimited bodies poison the
    /// connection for reuse.
    pub(crate) fn is_framed(&self) -> bool {
        !matches!(self.kind, Eof(_))
    }

    /// Trailer headers, populated after a chunked body completes.
    pub(crate) fn trailers(&self) -> Headers {
        self.trailers.clone()
    }

    /// Reads the next chunk of body data, or `None` once complete.
    pub(crate) async fn decode(&mut self, io: &mut Buffered) -> Result<Option<Bytes>> {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Zero => Ok(None),
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let max = (*remaining).min(usize::MAX as u64) as usize;
                match io.read_chunk(max).await? {
                    Some(chunk) => {
                        *remaining -= chunk.len() as u64;
                        Ok(Some(chunk))
                    }
                    None => Err(unexpected_eof()),
                }
            }
            Chunked {
                ref mut state,
                ref mut chunk_len,
                ref mut extensions_len,
            } => loop {
                match *state {
                    ChunkedState::Size => {
                        *chunk_len = read_chunk_size(io, extensions_len).await?;
                        trace!("chunk size: {}", chunk_len);
                        if *chunk_len == 0 {
                            *state = ChunkedState::Trailer;
                        } else {
                            *state = ChunkedState::Body;
                        }
                    }
                    ChunkedState::Body => {
                        let max = (*chunk_len).min(usize::MAX as u64) as usize;
                        let chunk = io.read_chunk(max).await?.ok_or_else(unexpected_eof)?;
                        *chunk_len -= chunk.len() as u64;
                        if *chunk_len == 0 {
                            *state = ChunkedState::BodyCrlf;
                        }
                        return Ok(Some(chunk));
                    }
                    ChunkedState::BodyCrlf => {
                        expect_crlf(io).await?;
                        *state = ChunkedState::Size;
                    }
                    ChunkedState::Trailer => {
                        let mut trailers = Headers::builder();
                        loop {
                            let line = io.read_line(MAX_HEAD_SIZE).await?;
                            if line.is_empty() {
                                break;
                            }
                            trailers = trailers.add_lenient(&line);
                        }
                        self.trailers = trailers.build();
                        *state = ChunkedState::End;
                    }
                    ChunkedState::End => {
                        trace!("end of chunked");
                        return Ok(None);
                    }
                }
            },
            Eof(ref mut seen) => {
                if *seen {
                    return Ok(None);
                }
                match io.read_chunk(8192).await? {
                    Some(chunk) => Ok(Some(chunk)),
                    None => {
                        *seen = true;
                        Ok(None)
                    }
                }
            }
        }
    }
}

async fn read_chunk_size(io: &mut Buffered, extensions_len: &mut usize) -> Result<u64> {
    let invalid = || Error::new_protocol("invalid chunk size line");
    let overflow = || Error::new_protocol("invalid chunk size: overflow");

    let mut size: u64 = 0;
    let mut digits = 0;
    loop {
        let b = io.read_byte().await?;
        match b {
            b'0'..=b'9' => {
                size = size.checked_mul(16).ok_or_else(overflow)?;
                size = size.checked_add((b - b'0') as u64).ok_or_else(overflow)?;
                digits += 1;
            }
            b'a'..=b'f' => {
                size = size.checked_mul(16).ok_or_else(overflow)?;
                size = size
                    .checked_add((b + 10 - b'a') as u64)
                    .ok_or_else(overflow)?;
                digits += 1;
            }
            b'A'..=b'F' => {
                size = size.checked_mul(16).ok_or_else(overflow)?;
                size = size
                    .checked_add((b + 10 - b'A') as u64)
                    .ok_or_else(overflow)?;
                digits += 1;
            }
            b';' | b' ' | b'\t' => {
                // Chunk extensions: skipped, but bounded.
                if digits == 0 {
                    return Err(invalid());
                }
                loop {
                    let b = io.read_byte().await?;
                    *extensions_len += 1;
                    if *extensions_len > CHUNK_EXTENSIONS_LIMIT {
                        return Err(Error::new_protocol("chunk extensions too large"));
                    }
                    if b == b'\n' {
                        return Ok(size);
                    }
                }
            }
            b'\r' => {
                if io.read_byte().await? != b'\n' {
                    return Err(invalid());
                }
                if digits == 0 {
                    return Err(invalid());
                }
                return Ok(size);
            }
            b'\n' => {
                // Lenient: bare LF terminator, as some servers send.
                if digits == 0 {
                    return Err(invalid());
                }
                return Ok(size);
            }
            _ => return Err(invalid()),
        }
    }
}

async fn expect_crlf(io: &mut Buffered) -> Result<()> {
    let cr = io.read_byte().await?;
    if cr == b'\n' {
        return Ok(());
    }
    if cr != b'\r' || io.read_byte().await? != b'\n' {
        return Err(Error::new_protocol("expected crlf after chunk"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::CancelHandle;

    fn buffered(data: &'static [u8]) -> Buffered {
        Buffered::new(
            Box::new(std::io::Cursor::new(data.to_vec())),
            CancelHandle::new(),
        )
    }

    async fn read_all(decoder: &mut Decoder, io: &mut Buffered) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = decoder.decode(io).await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn length_decoder() {
        let mut io = buffered(b"hello worldEXTRA");
        let mut decoder = Decoder::new(BodyLength::Length(11));
        assert_eq!(read_all(&mut decoder, &mut io).await.unwrap(), b"hello world");
        assert!(decoder.is_complete());
        assert!(decoder.is_framed());
        // The extra bytes stay buffered for the next response.
        assert_eq!(&io.buffer()[..], b"EXTRA");
    }

    #[tokio::test]
    async fn length_decoder_eof_early_is_error() {
        let mut io = buffered(b"only");
        let mut decoder = Decoder::new(BodyLength::Length(11));
        assert!(read_all(&mut decoder, &mut io).await.is_err());
    }

    #[tokio::test]
    async fn chunked_decoder() {
        let mut io = buffered(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        let mut decoder = Decoder::new(BodyLength::Chunked);
        assert_eq!(read_all(&mut decoder, &mut io).await.unwrap(), b"Wikipedia");
        assert!(decoder.is_complete());
        assert!(decoder.trailers().is_empty());
    }

    #[tokio::test]
    async fn chunked_lowercase_hex_and_extensions() {
        let mut io = buffered(b"a;name=value\r\n0123456789\r\n0\r\n\r\n");
        let mut decoder = Decoder::new(BodyLength::Chunked);
        assert_eq!(read_all(&mut decoder, &mut io).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn chunked_trailers() {
        let mut io = buffered(b"3\r\nabc\r\n0\r\nExpires: never\r\n\r\n");
        let mut decoder = Decoder::new(BodyLength::Chunked);
        assert_eq!(read_all(&mut decoder, &mut io).await.unwrap(), b"abc");
        assert_eq!(decoder.trailers().get("expires"), Some("never"));
    }

    #[tokio::test]
    async fn chunked_invalid_size() {
        let mut io = buffered(b"zz\r\n");
        let mut decoder = Decoder::new(BodyLength::Chunked);
        assert!(read_all(&mut decoder, &mut io).await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn eof_decoder_reads_until_close() {
        let mut io = buffered(b"unframed body");
        let mut decoder = Decoder::new(BodyLength::CloseDelimited);
        assert_eq!(read_all(&mut decoder, &mut io).await.unwrap(), b"unframed body");
        assert!(decoder.is_complete());
        assert!(!decoder.is_framed());
    }

    #[tokio::test]
    async fn zero_decoder_is_immediately_complete() {
        let mut io = buffered(b"");
        let mut decoder = Decoder::new(BodyLength::Zero);
        assert_eq!(read_all(&mut decoder, &mut io).await.unwrap(), b"");
        assert!(decoder.is_complete());
    }
}
