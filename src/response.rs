//! Immutable HTTP responses and their builder.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::body::ResponseBody;
use crate::cache_control::CacheControl;
use crate::challenge::{parse_challenges, Challenge};
use crate::error::{Error, Kind, Result};
use crate::headers::Headers;
use crate::proto::Protocol;
use crate::request::Request;
use crate::tls::Handshake;

/// A slot the exchange fills with trailer headers once the body has been
/// exhausted.
#[derive(Clone, Default)]
pub(crate) struct TrailersSlot {
    inner: Arc<Mutex<Option<Headers>>>,
}

impl TrailersSlot {
    pub(crate) fn fill(&self, trailers: Headers) {
        *self.inner.lock().expect("trailers lock") = Some(trailers);
    }

    fn get(&self) -> Option<Headers> {
        self.inner.lock().expect("trailers lock").clone()
    }
}

/// An HTTP response.
///
/// The body is streaming and owns a connection lease; read it (or close it)
/// promptly. Everything else is an immutable value.
pub struct Response {
    request: Request,
    protocol: Protocol,
    code: u16,
    message: String,
    headers: Headers,
    body: ResponseBody,
    handshake: Option<Handshake>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: u64,
    received_response_at_millis: u64,
    trailers: TrailersSlot,
    cache_control: OnceLock<CacheControl>,
}

impl Response {
    /// The request that initiated this response. For a response that followed
    /// redirects or auth, this is the final request issued on the wire.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The protocol that was negotiated.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The HTTP status code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// The HTTP reason phrase, possibly empty.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the code is in `[200, 300)`.
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this response redirects to another URL.
    pub fn is_redirect(&self) -> bool {
        matches!(self.code, 300 | 301 | 302 | 303 | 307 | 308)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The last header value for `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Consumes the response, returning its body.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Reads the entire body as bytes.
    pub async fn bytes(self) -> Result<bytes::Bytes> {
        self.body.bytes().await
    }

    /// Reads the entire body as UTF-8 text, lossily.
    pub async fn text(self) -> Result<String> {
        self.body.text().await
    }

    /// The TLS handshake of the connection that carried this response, if
    /// the connection used TLS.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// The raw network response that produced this one, if any. Its body is
    /// always absent.
    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    /// The cache hit that produced this one, if any. Its body is absent.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    /// The response to a prior redirect or auth follow-up, if any. Its body
    /// is absent.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    /// When the request's first byte was sent, in millis since epoch.
    pub fn sent_request_at_millis(&self) -> u64 {
        self.sent_request_at_millis
    }

    /// When the response's headers were received, in millis since epoch.
    pub fn received_response_at_millis(&self) -> u64 {
        self.received_response_at_millis
    }

    /// The trailer headers. Only available once the body has been fully
    /// consumed; errors before that.
    pub fn trailers(&self) -> Result<Headers> {
        self.trailers.get().ok_or_else(|| {
            Error::new(Kind::Io)
                .with_message("trailers are not available until the response body is exhausted")
        })
    }

    /// The response's cache directives, parsed on first use.
    pub fn cache_control(&self) -> &CacheControl {
        self.cache_control
            .get_or_init(|| CacheControl::parse(&self.headers))
    }

    /// The authorization challenges appropriate for this response's code:
    /// `WWW-Authenticate` for 401, `Proxy-Authenticate` for 407.
    pub fn challenges(&self) -> Vec<Challenge> {
        let header_name = match self.code {
            401 => "WWW-Authenticate",
            407 => "Proxy-Authenticate",
            _ => return Vec::new(),
        };
        parse_challenges(&self.headers, header_name)
    }

    /// Returns a builder seeded with a copy of this response's metadata.
    /// The body does not survive the copy.
    pub fn new_builder(&self) -> ResponseBuilder {
        ResponseBuilder {
            request: Some(self.request.clone()),
            protocol: Some(self.protocol),
            code: Some(self.code),
            message: self.message.clone(),
            headers: self.headers.new_builder(),
            body: None,
            handshake: self.handshake.clone(),
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
            trailers: self.trailers.clone(),
        }
    }

    /// Attaches the response to the previous request in a follow-up chain
    /// without disturbing this response's streaming body.
    pub(crate) fn set_prior_response(&mut self, prior: &Response) {
        self.prior_response = Some(Box::new(prior.strip_body()));
    }

    /// Swaps in the application's request (the bridge restores it so
    /// follow-ups rebuild from what the caller sent, not the wire form).
    pub(crate) fn set_request(&mut self, request: Request) {
        self.request = request;
    }

    /// A copy of this response without its body, for use as provenance on
    /// another response.
    pub(crate) fn strip_body(&self) -> Response {
        let mut stripped = self.new_builder().build_unchecked();
        // Provenance chains are acyclic: older responses are kept one level
        // deep only.
        stripped.network_response = None;
        stripped.cache_response = None;
        stripped.prior_response = self.prior_response.as_ref().map(|p| Box::new(p.strip_body()));
        stripped
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("protocol", &self.protocol)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("url", self.request.url())
            .finish()
    }
}

/// Builds a [`Response`].
pub struct ResponseBuilder {
    request: Option<Request>,
    protocol: Option<Protocol>,
    code: Option<u16>,
    message: String,
    headers: crate::headers::HeadersBuilder,
    body: Option<ResponseBody>,
    handshake: Option<Handshake>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: u64,
    received_response_at_millis: u64,
    trailers: TrailersSlot,
}

impl ResponseBuilder {
    pub fn new() -> ResponseBuilder {
        ResponseBuilder {
            request: None,
            protocol: None,
            code: None,
            message: String::new(),
            headers: Headers::builder(),
            body: None,
            handshake: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_request_at_millis: 0,
            received_response_at_millis: 0,
            trailers: TrailersSlot::default(),
        }
    }

    pub fn request(mut self, request: Request) -> ResponseBuilder {
        self.request = Some(request);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> ResponseBuilder {
        self.protocol = Some(protocol);
        self
    }

    pub fn code(mut self, code: u16) -> ResponseBuilder {
        self.code = Some(code);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> ResponseBuilder {
        self.message = message.into();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<ResponseBuilder> {
        self.headers = self.headers.set(name, value)?;
        Ok(self)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Result<ResponseBuilder> {
        self.headers = self.headers.add(name, value)?;
        Ok(self)
    }

    pub fn remove_header(mut self, name: &str) -> ResponseBuilder {
        self.headers = self.headers.remove_all(name);
        self
    }

    pub fn headers(mut self, headers: Headers) -> ResponseBuilder {
        self.headers = headers.new_builder();
        self
    }

    pub fn body(mut self, body: ResponseBody) -> ResponseBuilder {
        self.body = Some(body);
        self
    }

    pub fn handshake(mut self, handshake: Option<Handshake>) -> ResponseBuilder {
        self.handshake = handshake;
        self
    }

    /// Attaches the raw network response this response was derived from.
    /// The attached copy is stripped of its body.
    pub fn network_response(mut self, response: Option<&Response>) -> ResponseBuilder {
        self.network_response = response.map(|r| Box::new(r.strip_body()));
        self
    }

    /// Attaches the cache response this response was derived from. The
    /// attached copy is stripped of its body.
    pub fn cache_response(mut self, response: Option<&Response>) -> ResponseBuilder {
        self.cache_response = response.map(|r| Box::new(r.strip_body()));
        self
    }

    /// Attaches the response to the previous request in a follow-up chain.
    /// The attached copy is stripped of its body.
    pub fn prior_response(mut self, response: Option<&Response>) -> ResponseBuilder {
        self.prior_response = response.map(|r| Box::new(r.strip_body()));
        self
    }

    pub fn sent_request_at_millis(mut self, millis: u64) -> ResponseBuilder {
        self.sent_request_at_millis = millis;
        self
    }

    pub fn received_response_at_millis(mut self, millis: u64) -> ResponseBuilder {
        self.received_response_at_millis = millis;
        self
    }

    pub(crate) fn trailers_slot(mut self, trailers: TrailersSlot) -> ResponseBuilder {
        self.trailers = trailers;
        self
    }

    pub(crate) fn header_lenient(mut self, name: &str, value: &str) -> ResponseBuilder {
        self.headers = self.headers.add_lenient_pair(name, value);
        self
    }

    /// Freezes the builder into a [`Response`].
    pub fn build(self) -> Result<Response> {
        if self.request.is_none() {
            return Err(Error::new_protocol("request == None"));
        }
        if self.protocol.is_none() {
            return Err(Error::new_protocol("protocol == None"));
        }
        if self.code.is_none() {
            return Err(Error::new_protocol("code == None"));
        }
        Ok(self.build_unchecked())
    }

    fn build_unchecked(self) -> Response {
        Response {
            request: self.request.expect("request"),
            protocol: self.protocol.expect("protocol"),
            code: self.code.expect("code"),
            message: self.message,
            headers: self.headers.build(),
            body: self.body.unwrap_or_else(ResponseBody::empty),
            handshake: self.handshake,
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
            trailers: self.trailers,
            cache_control: OnceLock::new(),
        }
    }
}

impl Default for ResponseBuilder {
    fn default() -> ResponseBuilder {
        ResponseBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::Url;

    fn response(code: u16) -> Response {
        ResponseBuilder::new()
            .request(crate::request::Request::get(
                Url::parse("http://example.com/").unwrap(),
            ))
            .protocol(Protocol::Http11)
            .code(code)
            .message("OK")
            .build()
            .unwrap()
    }

    #[test]
    fn code_classification() {
        assert!(response(200).is_successful());
        assert!(response(299).is_successful());
        assert!(!response(300).is_successful());
        assert!(!response(199).is_successful());
        for code in [300, 301, 302, 303, 307, 308] {
            assert!(response(code).is_redirect(), "{}", code);
        }
        assert!(!response(304).is_redirect());
    }

    #[test]
    fn provenance_is_stripped_and_acyclic() {
        let network = response(200);
        let wrapped = network
            .new_builder()
            .network_response(Some(&network))
            .build()
            .unwrap();
        let inner = wrapped.network_response().unwrap();
        assert_eq!(inner.code(), 200);
        assert!(inner.network_response().is_none());
        assert!(inner.cache_response().is_none());
    }

    #[test]
    fn trailers_gated_on_body() {
        let resp = response(200);
        assert!(resp.trailers().is_err());

        let slot = TrailersSlot::default();
        slot.fill(Headers::builder().add("x-check", "9").unwrap().build());
        let resp = ResponseBuilder::new()
            .request(crate::request::Request::get(
                Url::parse("http://example.com/").unwrap(),
            ))
            .protocol(Protocol::H2)
            .code(200)
            .trailers_slot(slot)
            .build()
            .unwrap();
        assert_eq!(resp.trailers().unwrap().get("x-check"), Some("9"));
    }

    #[test]
    fn challenges_only_for_auth_codes() {
        let unauthorized = ResponseBuilder::new()
            .request(crate::request::Request::get(
                Url::parse("http://example.com/").unwrap(),
            ))
            .protocol(Protocol::Http11)
            .code(401)
            .header("WWW-Authenticate", "Basic realm=\"x\"")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(unauthorized.challenges().len(), 1);
        assert!(response(200).challenges().is_empty());
    }
}
