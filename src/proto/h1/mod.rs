//! The HTTP/1.1 exchange codec.
//!
//! One codec drives one request/response pass over a connection's
//! [`Buffered`] transport. States move strictly forward:
//!
//! ```text
//! IDLE -> WRITING_REQUEST_HEADERS -> WRITING_REQUEST_BODY
//!      -> READING_RESPONSE_HEADERS -> READING_RESPONSE_BODY -> IDLE | CLOSED
//! ```

pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod io;
pub(crate) mod role;

use bytes::Bytes;
use tracing::trace;

use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::request::Request;

use self::decode::Decoder;
use self::encode::Encoder;
use self::io::Buffered;
use self::role::{read_response_head, response_body_length, write_request_head, ResponseHead};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    WritingRequestBody,
    ReadingResponseHeaders,
    ReadingResponseBody,
    Closed,
}

pub(crate) struct Http1Codec {
    io: Buffered,
    state: State,
    encoder: Option<Encoder>,
    decoder: Option<Decoder>,
    request_is_head: bool,
    request_wants_close: bool,
    response_wants_close: bool,
    response_minor_version: u8,
    response_keep_alive: bool,
}

impl Http1Codec {
    pub(crate) fn new(io: Buffered) -> Http1Codec {
        Http1Codec {
            io,
            state: State::Idle,
            encoder: None,
            decoder: None,
            request_is_head: false,
            request_wants_close: false,
            response_wants_close: false,
            response_minor_version: 1,
            response_keep_alive: false,
        }
    }

    /// Writes the request line and headers. `absolute_target` is set for
    /// unencrypted requests sent through an HTTP proxy.
    pub(crate) async fn write_request_headers(
        &mut self,
        request: &Request,
        absolute_target: bool,
    ) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::new_protocol(format!(
                "state: {:?}",
                self.state
            )));
        }
        self.request_is_head = request.method().as_str() == "HEAD";
        self.request_wants_close = request.headers().contains_value("Connection", "close");

        let mut head = Vec::new();
        write_request_head(&mut head, request, absolute_target);
        trace!("writing request head, {} bytes", head.len());
        self.io.write_all(&head).await?;

        if request.body().is_some() {
            self.encoder = Some(new_encoder(request)?);
            self.state = State::WritingRequestBody;
        } else {
            self.io.flush().await?;
            self.state = State::ReadingResponseHeaders;
        }
        Ok(())
    }

    pub(crate) async fn write_request_body(&mut self, data: &[u8]) -> Result<()> {
        if self.state != State::WritingRequestBody {
            return Err(Error::new_protocol(format!("state: {:?}", self.state)));
        }
        let encoder = self.encoder.as_mut().expect("encoder in body state");
        encoder.write(&mut self.io, data).await
    }

    /// Completes the request: terminates body framing and flushes.
    pub(crate) async fn finish_request(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.finish(&mut self.io).await?;
        }
        self.io.flush().await?;
        if self.state == State::WritingRequestBody {
            self.state = State::ReadingResponseHeaders;
        }
        Ok(())
    }

    /// Reads response headers.
    ///
    /// With `expect_continue`, an interim 100 yields `Ok(None)`: the caller
    /// should transmit the request body and read again. Other informational
    /// responses are skipped.
    pub(crate) async fn read_response_headers(
        &mut self,
        expect_continue: bool,
    ) -> Result<Option<ResponseHead>> {
        if !matches!(
            self.state,
            State::ReadingResponseHeaders | State::WritingRequestBody
        ) {
            return Err(Error::new_protocol(format!("state: {:?}", self.state)));
        }
        loop {
            let head = read_response_head(&mut self.io).await?;
            trace!("read response head: {} {}", head.code, head.reason);
            match head.code {
                100 => {
                    if expect_continue {
                        return Ok(None);
                    }
                    // Unsolicited 100: skip it.
                }
                code if (101..200).contains(&code) => {
                    // Informational responses other than the upgrade reply
                    // are skipped. 101 is final for an upgrade request.
                    if code == 101 {
                        self.record_response(&head);
                        return Ok(Some(head));
                    }
                }
                _ => {
                    self.record_response(&head);
                    self.state = State::ReadingResponseBody;
                    return Ok(Some(head));
                }
            }
        }
    }

    fn record_response(&mut self, head: &ResponseHead) {
        self.response_minor_version = head.minor_version;
        self.response_wants_close = head.headers.contains_value("Connection", "close");
        self.response_keep_alive = head.headers.contains_value("Connection", "keep-alive");
    }

    /// Prepares the body decoder for a response head.
    pub(crate) fn open_response_body(&mut self, head: &ResponseHead) -> Result<()> {
        let length = response_body_length(self.request_is_head, head)?;
        self.decoder = Some(Decoder::new(length));
        Ok(())
    }

    /// Reads the next body chunk, or `None` once the body is complete.
    pub(crate) async fn read_body_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.state != State::ReadingResponseBody {
            return Err(Error::new_protocol(format!("state: {:?}", self.state)));
        }
        let decoder = self.decoder.as_mut().expect("decoder in body state");
        match decoder.decode(&mut self.io).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.state = if self.connection_reusable() {
                    State::Idle
                } else {
                    State::Closed
                };
                Ok(None)
            }
            Err(e) => {
                self.state = State::Closed;
                Err(e)
            }
        }
    }

    pub(crate) fn trailers(&self) -> Headers {
        self.decoder
            .as_ref()
            .map(|d| d.trailers())
            .unwrap_or_default()
    }

    /// A connection is reusable iff the response was fully consumed with
    /// framed length and neither side asked to close.
    pub(crate) fn connection_reusable(&self) -> bool {
        let body_done = self
            .decoder
            .as_ref()
            .map(|d| d.is_complete() && d.is_framed())
            .unwrap_or(false);
        if !body_done || self.request_wants_close || self.response_wants_close {
            return false;
        }
        // HTTP/1.0 keep-alive is opt-in.
        self.response_minor_version != 0 || self.response_keep_alive
    }

    /// Whether the exchange finished in a state that permits another one.
    pub(crate) fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Hands the raw transport to a protocol upgrade (a 101 response),
    /// along with any bytes buffered past the response head. The connection
    /// is opaque to HTTP parsing afterward.
    pub(crate) fn into_upgrade(self) -> Buffered {
        self.io
    }

    /// Returns the transport for pooling after a completed exchange.
    pub(crate) fn into_io(self) -> Buffered {
        self.io
    }
}

fn new_encoder(request: &Request) -> Result<Encoder> {
    let headers = request.headers();
    let chunked = headers
        .get("Transfer-Encoding")
        .map(|te| te.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    if chunked {
        return Ok(Encoder::chunked());
    }
    match headers.get("Content-Length") {
        Some(value) => {
            let length = value
                .trim()
                .parse()
                .map_err(|_| Error::new_protocol(format!("invalid content-length: {}", value)))?;
            Ok(Encoder::length(length))
        }
        None => {
            // Fall back to the body's own length; the bridge normally sets
            // the header before we get here.
            match request.body().and_then(|b| b.content_length()) {
                Some(length) => Ok(Encoder::length(length)),
                None => Ok(Encoder::chunked()),
            }
        }
    }
}
