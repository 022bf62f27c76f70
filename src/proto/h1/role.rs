//! HTTP/1.1 head encoding and lenient response-head parsing.

use bytes::BytesMut;
use tracing::trace;

use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::request::Request;

use super::io::{unexpected_eof, Buffered};

const MAX_HEADERS: usize = 100;
const AVERAGE_HEADER_SIZE: usize = 30;

/// Accumulated header lines are capped at 256 KiB per response.
pub(crate) const MAX_HEAD_SIZE: usize = 256 * 1024;

/// A parsed response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub(crate) minor_version: u8,
    pub(crate) code: u16,
    pub(crate) reason: String,
    pub(crate) headers: Headers,
}

/// Appends `METHOD SP request-target SP HTTP/1.1 CRLF headers CRLF` to `dst`.
///
/// `absolute_target` selects absolute-form (for unencrypted requests through
/// an HTTP proxy) over origin-form.
pub(crate) fn write_request_head(dst: &mut Vec<u8>, request: &Request, absolute_target: bool) {
    dst.reserve(50 + request.headers().len() * AVERAGE_HEADER_SIZE);
    dst.extend_from_slice(request.method().as_str().as_bytes());
    dst.push(b' ');
    dst.extend_from_slice(request_target(request, absolute_target).as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in request.headers().iter() {
        dst.extend_from_slice(name.as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }
    dst.extend_from_slice(b"\r\n");
}

fn request_target(request: &Request, absolute_target: bool) -> String {
    let url = request.url();
    if absolute_target {
        // Absolute form, fragment elided.
        let mut target = format!("{}://{}", url.scheme(), url.host_header());
        target.push_str(&url.encoded_path());
        if let Some(query) = url.encoded_query() {
            target.push('?');
            target.push_str(&query);
        }
        target
    } else {
        let mut target = url.encoded_path();
        if let Some(query) = url.encoded_query() {
            target.push('?');
            target.push_str(&query);
        }
        target
    }
}

/// Reads a response head off the transport.
///
/// Lenient where RFC 7230 permits: a single leading CRLF left over from a
/// previous keep-alive response is skipped, header names keep their wire
/// case, and values may contain non-ASCII bytes.
pub(crate) async fn read_response_head(io: &mut Buffered) -> Result<ResponseHead> {
    let mut skipped_leading_crlf = false;
    loop {
        if !skipped_leading_crlf {
            if io.buffer().starts_with(b"\r\n") {
                let _ = io.buffer().split_to(2);
                skipped_leading_crlf = true;
            } else if io.buffer().len() >= 2 {
                skipped_leading_crlf = true;
            }
        }

        if skipped_leading_crlf {
            if let Some(head) = parse_head(io.buffer())? {
                return Ok(head);
            }
            if io.buffer().len() > MAX_HEAD_SIZE {
                return Err(Error::new_headers_too_large());
            }
        }
        if io.fill_buf().await? == 0 {
            return Err(unexpected_eof());
        }
    }
}

fn parse_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    trace!("Response.parse([Header; {}], [u8; {}])", MAX_HEADERS, buf.len());
    let len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(Error::new_headers_too_large()),
        Err(e) => {
            return Err(Error::new_protocol(format!("malformed response: {}", e)));
        }
    };
    if len > MAX_HEAD_SIZE {
        return Err(Error::new_headers_too_large());
    }

    let minor_version = response.version.unwrap_or(1) as u8;
    let code = response
        .code
        .ok_or_else(|| Error::new_protocol("malformed response: missing status code"))?;
    let reason = response.reason.unwrap_or("").to_string();

    let mut builder = Headers::builder();
    for header in response.headers.iter() {
        let value = String::from_utf8_lossy(header.value);
        builder = builder.add_lenient_pair(header.name, &value);
    }

    let _ = buf.split_to(len);
    Ok(Some(ResponseHead {
        minor_version,
        code,
        reason,
        headers: builder.build(),
    }))
}

/// How a message body is framed, per RFC 7230 section 3.3.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyLength {
    /// No body at all: HEAD responses, 1xx, 204, 304.
    Zero,
    /// `Content-Length` bytes.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Until the peer closes the connection. Unframed: such a connection
    /// cannot be reused.
    CloseDelimited,
}

/// Determines how a response body is framed.
pub(crate) fn response_body_length(
    request_is_head: bool,
    head: &ResponseHead,
) -> Result<BodyLength> {
    if request_is_head
        || (100..200).contains(&head.code)
        || head.code == 204
        || head.code == 304
    {
        return Ok(BodyLength::Zero);
    }
    if is_chunked(&head.headers) {
        return Ok(BodyLength::Chunked);
    }
    match head.headers.get("Content-Length") {
        Some(value) => {
            let length: u64 = value
                .trim()
                .parse()
                .map_err(|_| Error::new_protocol(format!("invalid content-length: {}", value)))?;
            Ok(BodyLength::Length(length))
        }
        None => Ok(BodyLength::CloseDelimited),
    }
}

fn is_chunked(headers: &Headers) -> bool {
    // chunked must always be the last encoding
    match headers.get("Transfer-Encoding") {
        Some(value) => value
            .rsplit(',')
            .next()
            .map(|encoding| encoding.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::h1::io::Buffered;
    use crate::proto::CancelHandle;
    use crate::url::Url;

    async fn parse(raw: &'static [u8]) -> Result<ResponseHead> {
        let mut io = Buffered::new(Box::new(tokio_test_stream(raw)), CancelHandle::new());
        read_response_head(&mut io).await
    }

    fn tokio_test_stream(data: &'static [u8]) -> impl crate::proto::Transport {
        std::io::Cursor::new(data.to_vec())
    }

    #[tokio::test]
    async fn parses_status_line_and_headers() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Two: a\r\nX-Two: b\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.minor_version, 1);
        assert_eq!(head.headers.get("content-type"), Some("text/plain"));
        assert_eq!(head.headers.values("x-two"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn tolerates_single_leading_crlf() {
        let head = parse(b"\r\nHTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        assert_eq!(head.code, 204);
    }

    #[tokio::test]
    async fn empty_reason_is_ok() {
        let head = parse(b"HTTP/1.1 503 \r\nRetry-After: 0\r\n\r\n").await.unwrap();
        assert_eq!(head.code, 503);
        assert_eq!(head.reason, "");
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        assert!(parse(b"SIP/2.0 200 OK\r\n\r\n").await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn truncated_head_is_io_error() {
        assert!(parse(b"HTTP/1.1 200 OK\r\nPartial: ").await.unwrap_err().is_io());
    }

    #[test]
    fn request_head_wire_format() {
        let request = Request::builder()
            .url(Url::parse("http://example.com/a%20b?q=1").unwrap())
            .header("Host", "example.com")
            .unwrap()
            .build()
            .unwrap();
        let mut out = Vec::new();
        write_request_head(&mut out, &request, false);
        assert_eq!(
            out,
            b"GET /a%20b?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );

        let mut absolute = Vec::new();
        write_request_head(&mut absolute, &request, true);
        assert!(absolute.starts_with(b"GET http://example.com/a%20b?q=1 HTTP/1.1\r\n"));
    }

    #[test]
    fn body_length_rules() {
        let head = |code: u16, headers: Headers| ResponseHead {
            minor_version: 1,
            code,
            reason: String::new(),
            headers,
        };
        let with = |name: &str, value: &str| {
            Headers::builder().add(name, value).unwrap().build()
        };

        assert_eq!(
            response_body_length(true, &head(200, with("Content-Length", "5"))).unwrap(),
            BodyLength::Zero
        );
        assert_eq!(
            response_body_length(false, &head(204, Headers::new())).unwrap(),
            BodyLength::Zero
        );
        assert_eq!(
            response_body_length(false, &head(200, with("Transfer-Encoding", "chunked"))).unwrap(),
            BodyLength::Chunked
        );
        assert_eq!(
            response_body_length(false, &head(200, with("Content-Length", "42"))).unwrap(),
            BodyLength::Length(42)
        );
        assert_eq!(
            response_body_length(false, &head(200, Headers::new())).unwrap(),
            BodyLength::CloseDelimited
        );
        assert!(response_body_length(false, &head(200, with("Content-Length", "nope"))).is_err());
    }
}
