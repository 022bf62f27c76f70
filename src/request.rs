//! Immutable HTTP requests and their builder.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::body::Body;
use crate::cache_control::CacheControl;
use crate::error::{Error, Result};
use crate::ext::Tags;
use crate::headers::{Headers, HeadersBuilder};
use crate::url::Url;

/// An HTTP request method: an uppercase RFC 7230 token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Method(Arc<str>);

impl Method {
    pub const GET: &'static str = "GET";
    pub const HEAD: &'static str = "HEAD";
    pub const POST: &'static str = "POST";
    pub const PUT: &'static str = "PUT";
    pub const PATCH: &'static str = "PATCH";
    pub const DELETE: &'static str = "DELETE";

    /// Validates `method` as a token and uppercases it.
    pub fn new(method: &str) -> Result<Method> {
        if method.is_empty() {
            return Err(Error::new_protocol("method is empty"));
        }
        for b in method.bytes() {
            let token = matches!(b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
                | b'^' | b'_' | b'`' | b'|' | b'~'
                | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z');
            if !token {
                return Err(Error::new_protocol(format!("invalid method: {}", method)));
            }
        }
        Ok(Method(Arc::from(method.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// GET and HEAD must not carry a body.
    pub(crate) fn forbids_request_body(&self) -> bool {
        matches!(self.as_str(), "GET" | "HEAD")
    }

    /// POST, PUT, and PATCH must carry one.
    pub(crate) fn requires_request_body(&self) -> bool {
        matches!(self.as_str(), "POST" | "PUT" | "PATCH")
    }

    /// Methods safe to retry after a connect-level failure even mid-flight.
    pub(crate) fn is_idempotent(&self) -> bool {
        !matches!(self.as_str(), "POST" | "PATCH" | "CONNECT")
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<str> for Method {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

fn method_literal(name: &'static str) -> Method {
    Method(Arc::from(name))
}

/// An immutable HTTP request.
///
/// Copy a request into a mutable form with [`new_builder`](Request::new_builder);
/// the original is unaffected by any subsequent edits.
#[derive(Clone)]
pub struct Request {
    url: Url,
    method: Method,
    headers: Headers,
    body: Option<Arc<Body>>,
    tags: Tags,
    cache_control: Arc<OnceLock<CacheControl>>,
}

impl Request {
    /// Returns a new builder.
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    /// A GET request for `url`.
    pub fn get(url: Url) -> Request {
        RequestBuilder::new()
            .url(url)
            .build()
            .expect("GET request with a URL cannot fail to build")
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The last header value for `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_deref()
    }

    pub(crate) fn body_arc(&self) -> Option<Arc<Body>> {
        self.body.clone()
    }

    /// The tag of type `T`, if one was attached.
    pub fn tag<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.tags.get::<T>()
    }

    pub fn is_https(&self) -> bool {
        self.url.is_https()
    }

    /// The request's cache directives, parsed on first use.
    pub fn cache_control(&self) -> &CacheControl {
        self.cache_control
            .get_or_init(|| CacheControl::parse(&self.headers))
    }

    /// Returns a builder seeded with a copy of this request.
    pub fn new_builder(&self) -> RequestBuilder {
        RequestBuilder {
            url: Some(self.url.clone()),
            method: self.method.clone(),
            headers: self.headers.new_builder(),
            body: self.body.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method.as_str())
            .field("url", &self.url)
            .finish()
    }
}

/// Builds a [`Request`].
#[derive(Clone, Debug)]
pub struct RequestBuilder {
    url: Option<Url>,
    method: Method,
    headers: HeadersBuilder,
    body: Option<Arc<Body>>,
    tags: Tags,
}

impl RequestBuilder {
    pub fn new() -> RequestBuilder {
        RequestBuilder {
            url: None,
            method: method_literal(Method::GET),
            headers: Headers::builder(),
            body: None,
            tags: Tags::new(),
        }
    }

    /// Sets the target URL.
    pub fn url(mut self, url: Url) -> RequestBuilder {
        self.url = Some(url);
        self
    }

    /// Parses and sets the target URL.
    pub fn url_str(mut self, url: &str) -> Result<RequestBuilder> {
        self.url = Some(Url::parse(url)?);
        Ok(self)
    }

    /// Sets a header, replacing any prior values for the name.
    pub fn header(mut self, name: &str, value: &str) -> Result<RequestBuilder> {
        self.headers = self.headers.set(name, value)?;
        Ok(self)
    }

    /// Adds a header, keeping any prior values for the name.
    pub fn add_header(mut self, name: &str, value: &str) -> Result<RequestBuilder> {
        self.headers = self.headers.add(name, value)?;
        Ok(self)
    }

    /// Removes every header named `name`.
    pub fn remove_header(mut self, name: &str) -> RequestBuilder {
        self.headers = self.headers.remove_all(name);
        self
    }

    /// Replaces all headers.
    pub fn headers(mut self, headers: Headers) -> RequestBuilder {
        self.headers = headers.new_builder();
        self
    }

    /// Sets the request's cache directives, replacing the header. An empty
    /// directive set removes the header entirely.
    pub fn cache_control(mut self, cache_control: &CacheControl) -> RequestBuilder {
        let value = cache_control.to_string();
        if value.is_empty() {
            self.headers = self.headers.remove_all("Cache-Control");
        } else {
            self.headers = self.headers.set_static("Cache-Control", value);
        }
        self
    }

    /// Sets the method and body together, enforcing RFC 7231 body rules.
    pub fn method(mut self, method: Method, body: Option<Body>) -> Result<RequestBuilder> {
        if body.is_some() && method.forbids_request_body() {
            return Err(Error::new_protocol(format!(
                "method {} must not have a request body",
                method
            )));
        }
        if body.is_none() && method.requires_request_body() {
            return Err(Error::new_protocol(format!(
                "method {} must have a request body",
                method
            )));
        }
        self.method = method;
        self.body = body.map(Arc::new);
        Ok(self)
    }

    pub fn get(self) -> RequestBuilder {
        self.method_unchecked(Method::GET, None)
    }

    pub fn head(self) -> RequestBuilder {
        self.method_unchecked(Method::HEAD, None)
    }

    pub fn post(self, body: Body) -> RequestBuilder {
        self.method_unchecked(Method::POST, Some(body))
    }

    pub fn put(self, body: Body) -> RequestBuilder {
        self.method_unchecked(Method::PUT, Some(body))
    }

    pub fn patch(self, body: Body) -> RequestBuilder {
        self.method_unchecked(Method::PATCH, Some(body))
    }

    /// DELETE may carry a body or not.
    pub fn delete(self, body: Option<Body>) -> RequestBuilder {
        self.method_unchecked(Method::DELETE, body)
    }

    fn method_unchecked(mut self, name: &'static str, body: Option<Body>) -> RequestBuilder {
        self.method = method_literal(name);
        self.body = body.map(Arc::new);
        self
    }

    pub(crate) fn body_arc(mut self, body: Option<Arc<Body>>) -> RequestBuilder {
        self.body = body;
        self
    }

    /// Attaches a tag, replacing any existing tag of the same type.
    pub fn tag<T: Any + Send + Sync>(mut self, value: T) -> RequestBuilder {
        self.tags.insert(value);
        self
    }

    /// Freezes the builder into an immutable [`Request`].
    pub fn build(self) -> Result<Request> {
        let url = self
            .url
            .ok_or_else(|| Error::new_invalid_url("url == None"))?;
        Ok(Request {
            url,
            method: self.method,
            headers: self.headers.build(),
            body: self.body,
            tags: self.tags,
            cache_control: Arc::new(OnceLock::new()),
        })
    }
}

impl Default for RequestBuilder {
    fn default() -> RequestBuilder {
        RequestBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    #[test]
    fn method_body_rules() {
        let b = Request::builder().url(url());
        assert!(b
            .clone()
            .method(Method::new("GET").unwrap(), Some(Body::from("x")))
            .is_err());
        assert!(b
            .clone()
            .method(Method::new("POST").unwrap(), None)
            .is_err());
        assert!(b
            .clone()
            .method(Method::new("DELETE").unwrap(), None)
            .is_ok());
        assert!(b
            .method(Method::new("DELETE").unwrap(), Some(Body::from("x")))
            .is_ok());
    }

    #[test]
    fn methods_uppercase() {
        assert_eq!(Method::new("get").unwrap().as_str(), "GET");
        assert!(Method::new("GE T").is_err());
        assert!(Method::new("").is_err());
    }

    #[test]
    fn rebuild_preserves_everything() {
        #[derive(Debug, PartialEq)]
        struct Marker(u32);

        let request = Request::builder()
            .url(url())
            .header("Accept", "*/*")
            .unwrap()
            .tag(Marker(5))
            .post(Body::from("payload"))
            .build()
            .unwrap();

        let rebuilt = request.new_builder().build().unwrap();
        assert_eq!(rebuilt.url(), request.url());
        assert_eq!(rebuilt.method(), request.method());
        assert_eq!(rebuilt.headers(), request.headers());
        assert_eq!(rebuilt.tag::<Marker>(), Some(&Marker(5)));
    }

    #[test]
    fn builder_copies_do_not_alias() {
        let original = Request::builder()
            .url(url())
            .header("A", "1")
            .unwrap()
            .build()
            .unwrap();
        let edited = original
            .new_builder()
            .header("A", "2")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(original.header("A"), Some("1"));
        assert_eq!(edited.header("A"), Some("2"));
    }

    #[test]
    fn cache_control_is_lazy_and_cached() {
        let request = Request::builder()
            .url(url())
            .header("Cache-Control", "no-cache")
            .unwrap()
            .build()
            .unwrap();
        assert!(request.cache_control().no_cache());
        assert!(std::ptr::eq(request.cache_control(), request.cache_control()));
    }
}
