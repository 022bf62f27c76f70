//! An easy and correct HTTP / WebSocket client stack.
//!
//! hearth speaks HTTP/1.1 and HTTP/2 over a shared pool of persistent
//! connections, plans routes across proxies and addresses with failover,
//! follows redirects and auth challenges, enforces caller-visible
//! timeouts, and upgrades to full-duplex RFC 6455 WebSockets (with
//! permessage-deflate) over the same machinery.
//!
//! TLS and DNS are pluggable: bring a [`TlsProvider`] for `https` and, if
//! you like, a custom [`Dns`] resolver. Everything else is batteries
//! included.
//!
//! ```no_run
//! # async fn run() -> hearth::Result<()> {
//! let client = hearth::Client::new();
//! let request = hearth::Request::get(hearth::Url::parse("http://example.com/")?);
//! let response = client.new_call(request).execute().await?;
//! println!("{}", response.text().await?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod body;
mod cache_control;
mod challenge;
mod client;
mod dns;
mod error;
mod ext;
mod headers;
mod interceptor;
mod proto;
mod request;
mod response;
mod timeout;
mod tls;
mod url;
mod ws;

pub use crate::body::{Body, ResponseBody};
pub use crate::cache_control::{CacheControl, CacheControlBuilder};
pub use crate::challenge::Challenge;
pub use crate::client::call::Call;
pub use crate::client::conn::Connection;
pub use crate::client::pool::ConnectionPool;
pub use crate::client::route::{Proxy, ProxySelector, Route, TlsMode};
pub use crate::client::{
    get, Authenticator, Client, ClientBuilder, EventListener, HttpCache,
};
pub use crate::dns::{Dns, SystemDns};
pub use crate::error::{Error, Result, TimeoutStage};
pub use crate::headers::{Headers, HeadersBuilder};
pub use crate::interceptor::{Chain, Interceptor};
pub use crate::proto::h2::ErrorCode;
pub use crate::proto::{Protocol, Transport};
pub use crate::request::{Method, Request, RequestBuilder};
pub use crate::response::{Response, ResponseBuilder};
pub use crate::tls::{Certificate, Handshake, TlsProvider, TlsSession, TlsVersion};
pub use crate::url::{Url, UrlBuilder};
pub use crate::ws::{WebSocket, WebSocketListener};
