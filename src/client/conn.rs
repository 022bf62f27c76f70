//! One client connection: a transport hosting one HTTP/1.1 exchange at a
//! time or many HTTP/2 streams, plus the machinery that establishes it
//! (TCP, SOCKS, HTTP CONNECT tunneling, TLS, ALPN).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::client::route::{Proxy, Route};
use crate::client::Authenticator;
use crate::error::{Error, Result, TimeoutStage};
use crate::headers::Headers;
use crate::proto::h1::decode::Decoder;
use crate::proto::h1::io::Buffered;
use crate::proto::h1::role::{self, BodyLength};
use crate::proto::h2::conn::H2Connection;
use crate::proto::{CancelHandle, Protocol};
use crate::request::{Method, Request};
use crate::response::ResponseBuilder;
use crate::timeout::timed;
use crate::tls::{Handshake, TlsProvider};
use crate::url::{Url, UrlBuilder};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Proxy-auth round trips before a CONNECT attempt is abandoned.
const MAX_TUNNEL_ATTEMPTS: u32 = 21;

/// What `Connection::connect` needs from the client configuration.
pub(crate) struct ConnectParams {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) tls: std::sync::Arc<dyn TlsProvider>,
    pub(crate) protocols: Vec<Protocol>,
    pub(crate) proxy_authenticator: std::sync::Arc<dyn Authenticator>,
}

/// A live transport to an origin (possibly via a proxy).
///
/// Owned exclusively by the pool while idle; shared with the exchanges
/// running on it while active.
pub struct Connection {
    id: u64,
    route: Route,
    protocol: Protocol,
    handshake: Option<Handshake>,
    io: ConnIo,
    cancel: CancelHandle,
    state: StdMutex<ConnState>,
}

pub(crate) enum ConnIo {
    /// The buffered transport, present while no exchange has it leased.
    H1(StdMutex<Option<Buffered>>),
    H2(H2Connection),
}

struct ConnState {
    no_new_exchanges: bool,
    allocations: usize,
    idle_at: Instant,
    closed: bool,
}

impl Connection {
    /// Establishes a connection over `route`.
    pub(crate) async fn connect(route: Route, params: &ConnectParams) -> Result<Connection> {
        let cancel = CancelHandle::new();
        debug!("connecting to {:?} via {:?}", route.socket_addr(), route.proxy());

        let tcp = timed(TimeoutStage::Connect, params.connect_timeout, async {
            let stream = TcpStream::connect(route.socket_addr())
                .await
                .map_err(Error::new_io)?;
            let _ = stream.set_nodelay(true);
            Ok(stream)
        })
        .await?;

        let mut io = Buffered::new(Box::new(tcp), cancel.clone());
        io.set_read_timeout(params.read_timeout);
        io.set_write_timeout(params.write_timeout);

        if let Proxy::Socks { .. } = route.proxy() {
            connect_socks(&mut io, &route).await?;
        }
        if route.requires_tunnel() {
            connect_tunnel(&mut io, &route, params).await?;
        }

        let (io, handshake, protocol) = if route.is_https() {
            let (transport, read_buf, cancel_handle) = io.into_parts();
            debug_assert!(read_buf.is_empty(), "unread bytes before TLS handshake");
            let session = params
                .tls
                .handshake(transport, route.host(), &params.protocols, route.tls_mode())
                .await?;
            let protocol = session.alpn.unwrap_or(Protocol::Http11);
            let mut encrypted = Buffered::new(session.transport, cancel_handle);
            encrypted.set_read_timeout(params.read_timeout);
            encrypted.set_write_timeout(params.write_timeout);
            (encrypted, Some(session.handshake), protocol)
        } else {
            (io, None, Protocol::Http11)
        };

        let conn_io = match protocol {
            Protocol::H2 => {
                let (transport, read_buf, cancel_handle) = io.into_parts();
                debug_assert!(read_buf.is_empty(), "unread bytes before h2 preface");
                let h2 =
                    H2Connection::handshake(transport, cancel_handle, params.ping_interval)
                        .await?;
                ConnIo::H2(h2)
            }
            Protocol::Http11 => ConnIo::H1(StdMutex::new(Some(io))),
        };

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!("connection {} established: {}", id, protocol);
        Ok(Connection {
            id,
            route,
            protocol,
            handshake,
            io: conn_io,
            cancel,
            state: StdMutex::new(ConnState {
                no_new_exchanges: false,
                allocations: 0,
                idle_at: Instant::now(),
                closed: false,
            }),
        })
    }

    /// A connection with no transport, for pool accounting tests.
    #[cfg(test)]
    pub(crate) fn test_connection(route: Route) -> Connection {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            protocol: Protocol::Http11,
            handshake: None,
            io: ConnIo::H1(StdMutex::new(None)),
            cancel: CancelHandle::new(),
            state: StdMutex::new(ConnState {
                no_new_exchanges: false,
                allocations: 0,
                idle_at: Instant::now(),
                closed: false,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub(crate) fn h2(&self) -> Option<&H2Connection> {
        match &self.io {
            ConnIo::H2(h2) => Some(h2),
            ConnIo::H1(_) => None,
        }
    }

    /// Leases the HTTP/1.1 transport to an exchange. The connection must
    /// have been allocated first.
    pub(crate) fn take_h1(&self) -> Option<Buffered> {
        match &self.io {
            ConnIo::H1(slot) => slot.lock().expect("h1 io lock").take(),
            ConnIo::H2(_) => None,
        }
    }

    /// Returns the HTTP/1.1 transport after a completed exchange.
    pub(crate) fn put_h1(&self, io: Buffered) {
        if let ConnIo::H1(slot) = &self.io {
            *slot.lock().expect("h1 io lock") = Some(io);
        }
    }

    /// Sticky: set on IO errors, GOAWAY, pool drain, or refused streams.
    /// In-flight exchanges may still finish.
    pub(crate) fn mark_no_new_exchanges(&self) {
        self.state.lock().expect("conn state lock").no_new_exchanges = true;
    }

    pub(crate) fn no_new_exchanges(&self) -> bool {
        self.state.lock().expect("conn state lock").no_new_exchanges
    }

    pub(crate) fn allocate(&self) {
        let mut state = self.state.lock().expect("conn state lock");
        state.allocations += 1;
    }

    pub(crate) fn release_allocation(&self) {
        let mut state = self.state.lock().expect("conn state lock");
        state.allocations = state.allocations.saturating_sub(1);
        if state.allocations == 0 {
            state.idle_at = Instant::now();
        }
    }

    pub(crate) fn allocations(&self) -> usize {
        self.state.lock().expect("conn state lock").allocations
    }

    fn allocation_limit(&self) -> usize {
        match &self.io {
            ConnIo::H1(_) => 1,
            ConnIo::H2(h2) => h2.max_concurrent_streams().min(1 << 20) as usize,
        }
    }

    pub(crate) fn idle_at(&self) -> Instant {
        self.state.lock().expect("conn state lock").idle_at
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.allocations() == 0
    }

    /// Whether this connection can carry a new exchange to `host:port`.
    pub(crate) fn is_eligible(&self, host: &str, port: u16) -> bool {
        {
            let state = self.state.lock().expect("conn state lock");
            if state.no_new_exchanges || state.closed {
                return false;
            }
            if state.allocations >= self.allocation_limit() {
                return false;
            }
        }
        if self.cancel.is_canceled() {
            return false;
        }
        if self.route.port() != port {
            return false;
        }
        if self.route.host() == host {
            return match &self.io {
                ConnIo::H1(_) => true,
                ConnIo::H2(h2) => h2.is_healthy(),
            };
        }
        // HTTP/2 coalescing: a different origin whose hostname the peer's
        // certificate covers.
        match &self.io {
            ConnIo::H2(h2) if h2.is_healthy() && self.route.proxy().is_direct() => self
                .handshake
                .as_ref()
                .and_then(|hs| hs.peer_certificates().first())
                .map(|cert| cert.matches_hostname(host))
                .unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) fn is_healthy(&self) -> bool {
        let state = self.state.lock().expect("conn state lock");
        if state.closed || self.cancel.is_canceled() {
            return false;
        }
        match &self.io {
            ConnIo::H1(_) => true,
            ConnIo::H2(h2) => h2.is_healthy(),
        }
    }

    /// Cancels everything running on the connection and closes it.
    pub(crate) fn close(&self) {
        trace!("closing connection {}", self.id);
        {
            let mut state = self.state.lock().expect("conn state lock");
            state.closed = true;
            state.no_new_exchanges = true;
        }
        if let ConnIo::H2(h2) = &self.io {
            h2.close(crate::proto::h2::ErrorCode::NO_ERROR);
        }
        self.cancel.cancel();
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("route", &self.route.socket_addr())
            .finish()
    }
}

/// SOCKS5 by-name CONNECT: greeting, no-auth, then the origin hostname
/// (the proxy resolves it).
async fn connect_socks(io: &mut Buffered, route: &Route) -> Result<()> {
    io.write_all(&[0x05, 0x01, 0x00]).await?;
    io.flush().await?;
    let version = io.read_byte().await?;
    let method = io.read_byte().await?;
    if version != 0x05 || method != 0x00 {
        return Err(Error::new_io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "SOCKS proxy refused the greeting",
        )));
    }

    let host = route.host().as_bytes();
    if host.len() > 255 {
        return Err(Error::new_protocol("SOCKS host name too long"));
    }
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host);
    request.extend_from_slice(&route.port().to_be_bytes());
    io.write_all(&request).await?;
    io.flush().await?;

    let version = io.read_byte().await?;
    let reply = io.read_byte().await?;
    let _reserved = io.read_byte().await?;
    if version != 0x05 || reply != 0x00 {
        return Err(Error::new_io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("SOCKS proxy failed to connect: reply {}", reply),
        )));
    }
    let addr_len = match io.read_byte().await? {
        0x01 => 4,
        0x03 => io.read_byte().await? as usize,
        0x04 => 16,
        other => {
            return Err(Error::new_protocol(format!(
                "SOCKS unknown address type {}",
                other
            )))
        }
    };
    for _ in 0..addr_len + 2 {
        let _ = io.read_byte().await?;
    }
    Ok(())
}

/// Builds a tunnel through an HTTP proxy with `CONNECT`, consulting the
/// proxy authenticator on 407 up to the attempt bound.
async fn connect_tunnel(io: &mut Buffered, route: &Route, params: &ConnectParams) -> Result<()> {
    let target = format!("{}:{}", bracketed_host(route.host()), route.port());
    let tunnel_url = UrlBuilder::new()
        .scheme("https")?
        .host(route.host())?
        .port(route.port())?
        .build()?;
    let mut proxy_authorization: Option<String> = None;

    for _ in 0..MAX_TUNNEL_ATTEMPTS {
        let mut head = Vec::with_capacity(128);
        head.extend_from_slice(b"CONNECT ");
        head.extend_from_slice(target.as_bytes());
        head.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        head.extend_from_slice(target.as_bytes());
        head.extend_from_slice(b"\r\nProxy-Connection: Keep-Alive\r\n");
        if let Some(credential) = &proxy_authorization {
            head.extend_from_slice(b"Proxy-Authorization: ");
            head.extend_from_slice(credential.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        io.write_all(&head).await?;
        io.flush().await?;

        let response_head = role::read_response_head(io).await?;
        match response_head.code {
            200..=299 => return Ok(()),
            407 => {
                drain_tunnel_body(io, &response_head.headers).await?;
                let tunnel_request = tunnel_request(&tunnel_url, &target)?;
                let response = ResponseBuilder::new()
                    .request(tunnel_request)
                    .protocol(Protocol::Http11)
                    .code(407)
                    .message(response_head.reason.clone())
                    .headers(response_head.headers.clone())
                    .build()?;
                match params
                    .proxy_authenticator
                    .authenticate(Some(route), &response)
                {
                    Some(request) => {
                        proxy_authorization = request
                            .header("Proxy-Authorization")
                            .map(str::to_string);
                        if proxy_authorization.is_none() {
                            return Err(Error::new_protocol(
                                "proxy authenticator returned a request without credentials",
                            ));
                        }
                    }
                    None => {
                        return Err(Error::new_io(std::io::Error::new(
                            std::io::ErrorKind::PermissionDenied,
                            "failed to authenticate with proxy",
                        )))
                    }
                }
            }
            code => {
                return Err(Error::new_protocol(format!(
                    "unexpected response code for CONNECT: {}",
                    code
                )))
            }
        }
    }
    Err(Error::new_protocol("too many tunnel attempts"))
}

fn tunnel_request(url: &Url, _target: &str) -> Result<Request> {
    Request::builder()
        .url(url.clone())
        .method(Method::new("CONNECT")?, None)?
        .build()
}

/// A 407 may carry a framed body; consume it so the stream stays aligned
/// for the retry. Unframed bodies poison the tunnel.
async fn drain_tunnel_body(io: &mut Buffered, headers: &Headers) -> Result<()> {
    let head = role::ResponseHead {
        minor_version: 1,
        code: 407,
        reason: String::new(),
        headers: headers.clone(),
    };
    let length = role::response_body_length(false, &head)?;
    if matches!(length, BodyLength::CloseDelimited) {
        return Err(Error::new_protocol(
            "proxy 407 response without framed body",
        ));
    }
    let mut decoder = Decoder::new(length);
    while decoder.decode(io).await?.is_some() {}
    Ok(())
}

fn bracketed_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_target_forms() {
        assert_eq!(bracketed_host("example.com"), "example.com");
        assert_eq!(bracketed_host("2001:db8::1"), "[2001:db8::1]");
    }
}
