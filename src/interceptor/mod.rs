//! The interceptor chain: an ordered list of functions that observe,
//! transform, short-circuit, or retry a call.
//!
//! Application interceptors sit outermost and see one logical call;
//! network interceptors sit just above the wire and see every attempt.
//! In between run the built-in layers: retry-and-follow-up, bridge, cache,
//! connect, and finally the call server.

pub(crate) mod bridge;
pub(crate) mod cache;
pub(crate) mod call_server;
pub(crate) mod connect;
pub(crate) mod retry;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::client::call::Call;
use crate::client::conn::Connection;
use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

/// Observes and optionally rewrites a call. `chain.proceed` hands the
/// request to the next interceptor; all but the retry layer call it exactly
/// once per attempt.
pub trait Interceptor: Send + Sync + 'static {
    fn intercept<'a>(&'a self, chain: &'a mut Chain) -> BoxFuture<'a, Result<Response>>;
}

/// One position in a call's interceptor list.
pub struct Chain {
    call: Call,
    interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
    index: usize,
    request: Request,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Chain {
    pub(crate) fn new(
        call: Call,
        interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
        request: Request,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Chain {
        Chain {
            call,
            interceptors,
            index: 0,
            request,
            connect_timeout,
            read_timeout,
            write_timeout,
        }
    }

    /// The request as this position sees it.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    /// The connection the call currently holds. Present for network
    /// interceptors; `None` for application interceptors.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.call.connection()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Adjusts the connect timeout for everything downstream of this
    /// position.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Chain {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Chain {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Chain {
        self.write_timeout = timeout;
        self
    }

    /// Passes `request` to the next interceptor and returns its response.
    pub fn proceed(&mut self, request: Request) -> BoxFuture<'_, Result<Response>> {
        Box::pin(async move {
            if self.call.is_canceled() {
                return Err(crate::error::Error::new_canceled());
            }
            let interceptor = self.interceptors[self.index].clone();
            let mut next = Chain {
                call: self.call.clone(),
                interceptors: self.interceptors.clone(),
                index: self.index + 1,
                request,
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
            };
            interceptor.intercept(&mut next).await
        })
    }
}
