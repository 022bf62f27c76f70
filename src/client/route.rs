//! Route planning: enumerating (proxy, address, TLS-mode) combinations
//! lazily, with failover memory.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::dns::Dns;
use crate::error::{Error, Result};
use crate::url::Url;

/// How a route reaches the origin server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// No proxy; connect to the origin directly.
    Direct,
    /// An HTTP proxy: absolute-form requests for `http`, a CONNECT tunnel
    /// for `https`.
    Http { host: String, port: u16 },
    /// A SOCKS5 proxy. Origin hostnames are resolved by the proxy.
    Socks { host: String, port: u16 },
}

impl Proxy {
    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }
}

/// Which TLS parameter set a connection attempt uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TlsMode {
    /// An `http` URL: no TLS at all.
    Cleartext,
    /// Current protocol versions and cipher suites only.
    Modern,
    /// The widest parameter set the provider supports, for old servers.
    Compatible,
}

/// A concrete transport target: where to open the socket, through which
/// proxy, with which TLS mode. Equality identifies a target exactly.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    host: String,
    port: u16,
    proxy: Proxy,
    socket_addr: SocketAddr,
    tls_mode: TlsMode,
}

impl Route {
    /// The origin host this route serves (the URL's canonical host).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Where the TCP connection is opened: the origin or the proxy.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    pub fn is_https(&self) -> bool {
        self.tls_mode != TlsMode::Cleartext
    }

    /// True when requests must be tunneled through HTTP CONNECT: an HTTP
    /// proxy carrying `https` traffic.
    pub fn requires_tunnel(&self) -> bool {
        self.is_https() && matches!(self.proxy, Proxy::Http { .. })
    }
}

#[cfg(test)]
impl Route {
    pub(crate) fn test_route(host: &str, port: u16) -> Route {
        Route {
            host: host.to_string(),
            port,
            proxy: Proxy::Direct,
            socket_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            tls_mode: TlsMode::Cleartext,
        }
    }
}

/// Chooses the proxies to attempt for a URL, in order.
pub trait ProxySelector: Send + Sync + 'static {
    fn select(&self, url: &Url) -> Vec<Proxy>;
}

/// The default selector: always direct.
pub(crate) struct NoProxySelector;

impl ProxySelector for NoProxySelector {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}

/// A client-wide blacklist of routes that recently failed. Failed routes
/// are attempted last, after every fresh route.
#[derive(Default)]
pub(crate) struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    /// Records a failed connection attempt on `route`.
    pub(crate) fn failed(&self, route: &Route) {
        debug!("route failed: {:?}", route.socket_addr);
        self.failed.lock().expect("route db lock").insert(route.clone());
    }

    /// Records a successful connection on `route`, clearing its history.
    pub(crate) fn connected(&self, route: &Route) {
        self.failed.lock().expect("route db lock").remove(route);
    }

    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().expect("route db lock").contains(route)
    }
}

/// Lazily yields routes for one call.
///
/// For each proxy in order, the host (the proxy's, or the origin's when
/// direct) is resolved, and one route is produced per (address, TLS mode).
/// Routes that failed recently are deferred behind untried ones, and a
/// route never repeats within the same call.
pub(crate) struct RouteSelector {
    host: String,
    port: u16,
    tls_modes: Vec<TlsMode>,
    proxies: Vec<Proxy>,
    next_proxy: usize,
    dns: Arc<dyn Dns>,
    route_database: Arc<RouteDatabase>,
    current: VecDeque<Route>,
    postponed: Vec<Route>,
    postponed_flushed: bool,
    attempted: HashSet<Route>,
}

impl RouteSelector {
    pub(crate) fn new(
        url: &Url,
        proxy_override: Option<Proxy>,
        proxy_selector: &dyn ProxySelector,
        tls_fallback: bool,
        dns: Arc<dyn Dns>,
        route_database: Arc<RouteDatabase>,
    ) -> RouteSelector {
        // An explicit proxy short-circuits selection entirely.
        let proxies = match proxy_override {
            Some(proxy) => vec![proxy],
            None => {
                let mut proxies = proxy_selector.select(url);
                if proxies.is_empty() {
                    proxies.push(Proxy::Direct);
                }
                proxies
            }
        };
        let tls_modes = if url.is_https() {
            if tls_fallback {
                vec![TlsMode::Modern, TlsMode::Compatible]
            } else {
                vec![TlsMode::Modern]
            }
        } else {
            vec![TlsMode::Cleartext]
        };
        RouteSelector {
            host: url.host().to_string(),
            port: url.port(),
            tls_modes,
            proxies,
            next_proxy: 0,
            dns,
            route_database,
            current: VecDeque::new(),
            postponed: Vec::new(),
            postponed_flushed: false,
            attempted: HashSet::new(),
        }
    }

    /// The next untried route, or `None` when every combination has been
    /// attempted.
    pub(crate) async fn next(&mut self) -> Result<Option<Route>> {
        loop {
            if let Some(route) = self.current.pop_front() {
                if self.attempted.contains(&route) {
                    continue;
                }
                if !self.postponed_flushed && self.route_database.should_postpone(&route) {
                    self.postponed.push(route);
                    continue;
                }
                self.attempted.insert(route.clone());
                return Ok(Some(route));
            }
            if self.next_proxy < self.proxies.len() {
                let proxy = self.proxies[self.next_proxy].clone();
                self.next_proxy += 1;
                let routes = self.resolve(proxy).await?;
                self.current.extend(routes);
                continue;
            }
            if !self.postponed.is_empty() {
                // Every fresh route is exhausted; fall back to the ones
                // with failure history.
                self.postponed_flushed = true;
                self.current.extend(self.postponed.drain(..));
                continue;
            }
            return Ok(None);
        }
    }

    /// Whether another route is worth trying after a failure.
    pub(crate) fn has_next(&self) -> bool {
        !self.current.is_empty()
            || self.next_proxy < self.proxies.len()
            || !self.postponed.is_empty()
    }

    async fn resolve(&self, proxy: Proxy) -> Result<Vec<Route>> {
        // With any proxy in play, the origin host is never resolved here:
        // the proxy resolves names.
        let (lookup_host, lookup_port) = match &proxy {
            Proxy::Direct => (self.host.as_str(), self.port),
            Proxy::Http { host, port } | Proxy::Socks { host, port } => (host.as_str(), *port),
        };
        debug!("resolving {} for {:?}", lookup_host, proxy);
        let addrs = self
            .dns
            .resolve(lookup_host)
            .await
            .map_err(Error::new_io)?;
        let mut routes = Vec::with_capacity(addrs.len() * self.tls_modes.len());
        for addr in addrs {
            for &tls_mode in &self.tls_modes {
                routes.push(Route {
                    host: self.host.clone(),
                    port: self.port,
                    proxy: proxy.clone(),
                    socket_addr: SocketAddr::new(addr, lookup_port),
                    tls_mode,
                });
            }
        }
        Ok(routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::net::IpAddr;

    struct FakeDns;

    impl Dns for FakeDns {
        fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, std::io::Result<Vec<IpAddr>>> {
            Box::pin(async move {
                match host {
                    "example.com" => Ok(vec![
                        "10.0.0.1".parse().unwrap(),
                        "10.0.0.2".parse().unwrap(),
                    ]),
                    "proxy.example.com" => Ok(vec!["10.1.1.1".parse().unwrap()]),
                    _ => Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "unknown host",
                    )),
                }
            })
        }
    }

    fn selector(url: &str, proxies: Vec<Proxy>, fallback: bool) -> RouteSelector {
        struct Fixed(Vec<Proxy>);
        impl ProxySelector for Fixed {
            fn select(&self, _url: &Url) -> Vec<Proxy> {
                self.0.clone()
            }
        }
        RouteSelector::new(
            &Url::parse(url).unwrap(),
            None,
            &Fixed(proxies),
            fallback,
            Arc::new(FakeDns),
            Arc::new(RouteDatabase::default()),
        )
    }

    async fn drain(selector: &mut RouteSelector) -> Vec<Route> {
        let mut routes = Vec::new();
        while let Some(route) = selector.next().await.unwrap() {
            routes.push(route);
        }
        routes
    }

    #[tokio::test]
    async fn direct_routes_in_address_then_mode_order() {
        let mut s = selector("https://example.com/", vec![Proxy::Direct], true);
        let routes = drain(&mut s).await;
        assert_eq!(routes.len(), 4);
        assert_eq!(routes[0].socket_addr().to_string(), "10.0.0.1:443");
        assert_eq!(routes[0].tls_mode(), TlsMode::Modern);
        assert_eq!(routes[1].tls_mode(), TlsMode::Compatible);
        assert_eq!(routes[2].socket_addr().to_string(), "10.0.0.2:443");
    }

    #[tokio::test]
    async fn no_duplicate_routes_per_call() {
        let mut s = selector("http://example.com/", vec![Proxy::Direct, Proxy::Direct], false);
        let routes = drain(&mut s).await;
        assert_eq!(routes.len(), 2); // second identical proxy adds nothing
    }

    #[tokio::test]
    async fn proxy_routes_resolve_the_proxy_not_the_origin() {
        let mut s = selector(
            // The origin host does not resolve; only the proxy may be
            // looked up.
            "http://unresolvable.internal/",
            vec![Proxy::Http {
                host: "proxy.example.com".to_string(),
                port: 8080,
            }],
            false,
        );
        let routes = drain(&mut s).await;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].socket_addr().to_string(), "10.1.1.1:8080");
        assert_eq!(routes[0].host(), "unresolvable.internal");
    }

    #[tokio::test]
    async fn failed_routes_are_postponed() {
        let db = Arc::new(RouteDatabase::default());
        let url = Url::parse("http://example.com/").unwrap();
        let mut first = RouteSelector::new(
            &url,
            None,
            &NoProxySelector,
            false,
            Arc::new(FakeDns),
            db.clone(),
        );
        let bad = first.next().await.unwrap().unwrap();
        db.failed(&bad);

        let mut second = RouteSelector::new(
            &url,
            None,
            &NoProxySelector,
            false,
            Arc::new(FakeDns),
            db.clone(),
        );
        let routes = drain(&mut second).await;
        assert_eq!(routes.len(), 2);
        // The failed address sorts last now.
        assert_eq!(routes[1], bad);
        assert_eq!(routes[0].socket_addr().to_string(), "10.0.0.2:80");
    }

    #[tokio::test]
    async fn explicit_proxy_short_circuits() {
        let url = Url::parse("http://example.com/").unwrap();
        let mut s = RouteSelector::new(
            &url,
            Some(Proxy::Http {
                host: "proxy.example.com".to_string(),
                port: 3128,
            }),
            &NoProxySelector,
            false,
            Arc::new(FakeDns),
            Arc::new(RouteDatabase::default()),
        );
        let routes = drain(&mut s).await;
        assert_eq!(routes.len(), 1);
        assert!(matches!(routes[0].proxy(), Proxy::Http { .. }));
    }

    #[tokio::test]
    async fn dns_failure_propagates() {
        let mut s = selector("http://unresolvable.internal/", vec![Proxy::Direct], false);
        assert!(s.next().await.is_err());
    }
}
