//! The HTTP client: shared configuration, pool, and dispatcher.

pub(crate) mod call;
pub(crate) mod conn;
pub(crate) mod dispatcher;
pub(crate) mod exchange;
pub(crate) mod pool;
pub(crate) mod route;

use std::sync::Arc;
use std::time::Duration;

use crate::client::call::Call;
use crate::client::dispatcher::Dispatcher;
use crate::client::pool::ConnectionPool;
use crate::client::route::{NoProxySelector, Proxy, ProxySelector, Route, RouteDatabase};
use crate::dns::{Dns, SystemDns};
use crate::error::Error;
use crate::interceptor::Interceptor;
use crate::proto::Protocol;
use crate::request::Request;
use crate::response::Response;
use crate::timeout::TimeoutConfig;
use crate::tls::{NoTlsProvider, TlsProvider};
use crate::url::Url;
use crate::ws::{WebSocket, WebSocketListener};

/// Answers 401 (server) and 407 (proxy) challenges with a re-authenticated
/// request, or `None` to give up.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, route: Option<&Route>, response: &Response) -> Option<Request>;
}

/// The default authenticator: never authenticates.
pub(crate) struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(&self, _route: Option<&Route>, _response: &Response) -> Option<Request> {
        None
    }
}

/// The response cache seam. Storage format and eviction policy live behind
/// this trait.
pub trait HttpCache: Send + Sync + 'static {
    /// A stored response usable for `request`, or `None`.
    fn lookup(&self, request: &Request) -> Option<Response>;

    /// Offers a network response for storage.
    fn store(&self, response: &Response);
}

/// Receives call lifecycle events. All methods default to no-ops.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync + 'static {
    fn call_start(&self, call: &Call) {}
    fn call_end(&self, call: &Call) {}
    fn call_failed(&self, call: &Call, error: &Error) {}
    fn connect_start(&self, call: &Call, route: &Route) {}
    fn connect_end(&self, call: &Call, route: &Route) {}
    fn connect_failed(&self, call: &Call, route: &Route, error: &Error) {}
    fn connection_acquired(&self, call: &Call, connection_id: u64) {}
    fn connection_released(&self, call: &Call) {}
}

struct NoopEventListener;

impl EventListener for NoopEventListener {}

/// An HTTP / WebSocket client.
///
/// Cheap to clone; clones share the connection pool, dispatcher, and route
/// database. Create one and reuse it: each client carries its own pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    dispatcher: Dispatcher,
    pool: ConnectionPool,
    dns: Arc<dyn Dns>,
    tls: Arc<dyn TlsProvider>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    authenticator: Arc<dyn Authenticator>,
    proxy_authenticator: Arc<dyn Authenticator>,
    cache: Option<Arc<dyn HttpCache>>,
    event_listener: Arc<dyn EventListener>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    tls_fallback: bool,
    timeouts: TimeoutConfig,
    protocols: Vec<Protocol>,
    route_database: Arc<RouteDatabase>,
    user_agent: String,
}

impl Client {
    /// A client with default configuration.
    pub fn new() -> Client {
        ClientBuilder::new().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Prepares `request` for execution.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request, false)
    }

    /// Opens a WebSocket to `request`'s URL and returns immediately; the
    /// listener receives the outcome.
    pub fn new_web_socket(
        &self,
        request: Request,
        listener: Arc<dyn WebSocketListener>,
    ) -> WebSocket {
        crate::ws::connect(self.clone(), request, listener)
    }

    /// A builder sharing this client's pool, dispatcher, and route state.
    pub fn new_builder(&self) -> ClientBuilder {
        let inner = &self.inner;
        ClientBuilder {
            interceptors: inner.interceptors.clone(),
            network_interceptors: inner.network_interceptors.clone(),
            dispatcher: Some(inner.dispatcher.clone()),
            pool: Some(inner.pool.clone()),
            dns: inner.dns.clone(),
            tls: inner.tls.clone(),
            proxy: inner.proxy.clone(),
            proxy_selector: inner.proxy_selector.clone(),
            authenticator: inner.authenticator.clone(),
            proxy_authenticator: inner.proxy_authenticator.clone(),
            cache: inner.cache.clone(),
            event_listener: inner.event_listener.clone(),
            follow_redirects: inner.follow_redirects,
            follow_ssl_redirects: inner.follow_ssl_redirects,
            retry_on_connection_failure: inner.retry_on_connection_failure,
            tls_fallback: inner.tls_fallback,
            timeouts: inner.timeouts,
            protocols: inner.protocols.clone(),
            route_database: Some(inner.route_database.clone()),
            max_requests: 64,
            max_requests_per_host: 5,
            user_agent: inner.user_agent.clone(),
        }
    }

    /// Shuts the client down: queued calls fail, idle connections close.
    pub fn shutdown(&self) {
        self.inner.dispatcher.cancel_all_queued();
        self.inner.pool.evict_all();
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// The number of asynchronous calls currently executing.
    pub fn running_calls_count(&self) -> usize {
        self.inner.dispatcher.running_calls_count()
    }

    /// The number of asynchronous calls awaiting a dispatcher slot.
    pub fn queued_calls_count(&self) -> usize {
        self.inner.dispatcher.queued_calls_count()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.interceptors
    }

    pub(crate) fn network_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.network_interceptors
    }

    pub(crate) fn dns(&self) -> Arc<dyn Dns> {
        self.inner.dns.clone()
    }

    pub(crate) fn tls(&self) -> Arc<dyn TlsProvider> {
        self.inner.tls.clone()
    }

    pub(crate) fn proxy(&self) -> Option<&Proxy> {
        self.inner.proxy.as_ref()
    }

    pub(crate) fn proxy_selector(&self) -> &dyn ProxySelector {
        &*self.inner.proxy_selector
    }

    pub(crate) fn authenticator(&self) -> &dyn Authenticator {
        &*self.inner.authenticator
    }

    pub(crate) fn proxy_authenticator(&self) -> &dyn Authenticator {
        &*self.inner.proxy_authenticator
    }

    pub(crate) fn proxy_authenticator_arc(&self) -> Arc<dyn Authenticator> {
        self.inner.proxy_authenticator.clone()
    }

    pub(crate) fn cache(&self) -> Option<Arc<dyn HttpCache>> {
        self.inner.cache.clone()
    }

    pub(crate) fn event_listener(&self) -> Arc<dyn EventListener> {
        self.inner.event_listener.clone()
    }

    pub fn follow_redirects(&self) -> bool {
        self.inner.follow_redirects
    }

    pub fn follow_ssl_redirects(&self) -> bool {
        self.inner.follow_ssl_redirects
    }

    pub fn retry_on_connection_failure(&self) -> bool {
        self.inner.retry_on_connection_failure
    }

    pub(crate) fn tls_fallback(&self) -> bool {
        self.inner.tls_fallback
    }

    pub(crate) fn timeouts(&self) -> TimeoutConfig {
        self.inner.timeouts
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.inner.protocols
    }

    pub(crate) fn route_database(&self) -> Arc<RouteDatabase> {
        self.inner.route_database.clone()
    }

    pub(crate) fn user_agent(&self) -> &str {
        &self.inner.user_agent
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("protocols", &self.inner.protocols)
            .finish()
    }
}

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    dispatcher: Option<Dispatcher>,
    pool: Option<ConnectionPool>,
    dns: Arc<dyn Dns>,
    tls: Arc<dyn TlsProvider>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    authenticator: Arc<dyn Authenticator>,
    proxy_authenticator: Arc<dyn Authenticator>,
    cache: Option<Arc<dyn HttpCache>>,
    event_listener: Arc<dyn EventListener>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    tls_fallback: bool,
    timeouts: TimeoutConfig,
    protocols: Vec<Protocol>,
    route_database: Option<Arc<RouteDatabase>>,
    max_requests: usize,
    max_requests_per_host: usize,
    user_agent: String,
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            dispatcher: None,
            pool: None,
            dns: Arc::new(SystemDns),
            tls: Arc::new(NoTlsProvider),
            proxy: None,
            proxy_selector: Arc::new(NoProxySelector),
            authenticator: Arc::new(NoAuthenticator),
            proxy_authenticator: Arc::new(NoAuthenticator),
            cache: None,
            event_listener: Arc::new(NoopEventListener),
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            tls_fallback: true,
            timeouts: TimeoutConfig::default(),
            protocols: vec![Protocol::H2, Protocol::Http11],
            route_database: None,
            max_requests: 64,
            max_requests_per_host: 5,
            user_agent: concat!("hearth/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Total deadline per call, from enqueue to body closure. Off by
    /// default.
    pub fn call_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.timeouts.call = timeout;
        self
    }

    /// Deadline per TCP connect attempt.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.timeouts.connect = timeout;
        self
    }

    /// Deadline per socket read.
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.timeouts.read = timeout;
        self
    }

    /// Deadline per socket write.
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.timeouts.write = timeout;
        self
    }

    /// WebSocket and HTTP/2 keepalive cadence. Off by default.
    pub fn ping_interval(mut self, interval: Option<Duration>) -> ClientBuilder {
        self.timeouts.ping = interval;
        self
    }

    /// Whether to follow 3xx redirects. On by default.
    pub fn follow_redirects(mut self, follow: bool) -> ClientBuilder {
        self.follow_redirects = follow;
        self
    }

    /// Whether redirects may cross between `https` and `http`. On by
    /// default.
    pub fn follow_ssl_redirects(mut self, follow: bool) -> ClientBuilder {
        self.follow_ssl_redirects = follow;
        self
    }

    /// Whether to fail over to other routes on connection trouble. On by
    /// default.
    pub fn retry_on_connection_failure(mut self, retry: bool) -> ClientBuilder {
        self.retry_on_connection_failure = retry;
        self
    }

    /// Whether `https` connects retry with a compatibility TLS mode after
    /// a modern-mode failure.
    pub fn tls_mode_fallback(mut self, fallback: bool) -> ClientBuilder {
        self.tls_fallback = fallback;
        self
    }

    /// Dispatcher bound on total in-flight asynchronous calls.
    pub fn max_requests(mut self, max: usize) -> ClientBuilder {
        self.max_requests = max;
        self
    }

    /// Dispatcher bound on in-flight asynchronous calls per host.
    pub fn max_requests_per_host(mut self, max: usize) -> ClientBuilder {
        self.max_requests_per_host = max;
        self
    }

    /// The ALPN preference order. Must include HTTP/1.1.
    pub fn protocols(mut self, protocols: Vec<Protocol>) -> crate::Result<ClientBuilder> {
        if !protocols.contains(&Protocol::Http11) {
            return Err(Error::new_protocol(
                "protocols must contain http/1.1",
            ));
        }
        self.protocols = protocols;
        Ok(self)
    }

    /// An explicit proxy, bypassing the proxy selector.
    pub fn proxy(mut self, proxy: Option<Proxy>) -> ClientBuilder {
        self.proxy = proxy;
        self
    }

    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> ClientBuilder {
        self.proxy_selector = selector;
        self
    }

    /// Responds to 401 challenges from origin servers.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> ClientBuilder {
        self.authenticator = authenticator;
        self
    }

    /// Responds to 407 challenges from proxies.
    pub fn proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> ClientBuilder {
        self.proxy_authenticator = authenticator;
        self
    }

    /// A shared connection pool.
    pub fn connection_pool(mut self, pool: ConnectionPool) -> ClientBuilder {
        self.pool = Some(pool);
        self
    }

    /// An optional HTTP response cache.
    pub fn cache(mut self, cache: Option<Arc<dyn HttpCache>>) -> ClientBuilder {
        self.cache = cache;
        self
    }

    pub fn dns(mut self, dns: Arc<dyn Dns>) -> ClientBuilder {
        self.dns = dns;
        self
    }

    /// The TLS engine for `https` URLs. The default provider fails every
    /// handshake.
    pub fn tls_provider(mut self, tls: Arc<dyn TlsProvider>) -> ClientBuilder {
        self.tls = tls;
        self
    }

    pub fn event_listener(mut self, listener: Arc<dyn EventListener>) -> ClientBuilder {
        self.event_listener = listener;
        self
    }

    /// Adds an application interceptor (outermost; sees one logical call).
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> ClientBuilder {
        self.interceptors.push(interceptor);
        self
    }

    /// Adds a network interceptor (innermost; sees every wire attempt).
    pub fn network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> ClientBuilder {
        self.network_interceptors.push(interceptor);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> ClientBuilder {
        self.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                interceptors: self.interceptors,
                network_interceptors: self.network_interceptors,
                dispatcher: self
                    .dispatcher
                    .unwrap_or_else(|| Dispatcher::new(self.max_requests, self.max_requests_per_host)),
                pool: self.pool.unwrap_or_default(),
                dns: self.dns,
                tls: self.tls,
                proxy: self.proxy,
                proxy_selector: self.proxy_selector,
                authenticator: self.authenticator,
                proxy_authenticator: self.proxy_authenticator,
                cache: self.cache,
                event_listener: self.event_listener,
                follow_redirects: self.follow_redirects,
                follow_ssl_redirects: self.follow_ssl_redirects,
                retry_on_connection_failure: self.retry_on_connection_failure,
                tls_fallback: self.tls_fallback,
                timeouts: self.timeouts,
                protocols: self.protocols,
                route_database: self.route_database.unwrap_or_default(),
                user_agent: self.user_agent,
            }),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder::new()
    }
}

/// Convenience: `GET` a URL with a throwaway default client.
pub async fn get(url: &str) -> crate::Result<Response> {
    let url = Url::parse(url)?;
    let client = Client::new();
    client.new_call(Request::get(url)).execute().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let client = Client::new();
        assert!(client.follow_redirects());
        assert!(client.follow_ssl_redirects());
        assert!(client.retry_on_connection_failure());
        assert_eq!(client.protocols(), [Protocol::H2, Protocol::Http11]);
        assert_eq!(client.timeouts().connect, Some(Duration::from_secs(10)));
        assert_eq!(client.timeouts().call, None);
    }

    #[test]
    fn protocols_must_include_http11() {
        assert!(Client::builder().protocols(vec![Protocol::H2]).is_err());
        assert!(Client::builder()
            .protocols(vec![Protocol::H2, Protocol::Http11])
            .is_ok());
    }

    #[test]
    fn rebuilding_shares_pool_and_dispatcher() {
        let first = Client::builder()
            .call_timeout(Some(Duration::from_secs(30)))
            .build();
        let second = first.new_builder().follow_redirects(false).build();

        assert_eq!(second.timeouts().call, Some(Duration::from_secs(30)));
        assert!(!second.follow_redirects());
        assert!(first.follow_redirects());
    }

    #[test]
    fn calls_are_single_use() {
        let client = Client::new();
        let call = client.new_call(Request::get(Url::parse("http://example.com/").unwrap()));
        assert!(!call.is_executed());
        let fresh = call.clone_call();
        assert!(!fresh.is_executed());
    }
}
