//! A call: one request, its follow-ups, and the machinery that runs them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use crate::client::conn::{ConnectParams, Connection};
use crate::client::exchange::{CancelTarget, Exchange, ExchangeRef};
use crate::client::route::{Route, RouteSelector};
use crate::client::Client;
use crate::error::{Error, Result, TimeoutStage};
use crate::interceptor::bridge::BridgeInterceptor;
use crate::interceptor::cache::CacheInterceptor;
use crate::interceptor::call_server::CallServerInterceptor;
use crate::interceptor::connect::ConnectInterceptor;
use crate::interceptor::retry::RetryAndFollowUpInterceptor;
use crate::interceptor::{Chain, Interceptor};
use crate::proto::h1::io::Buffered;
use crate::request::Request;
use crate::response::Response;

/// A request ready to be executed. Each call runs at most once;
/// [`clone_call`](Call::clone_call) makes a fresh one for the same request.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

struct CallInner {
    client: Client,
    request: Request,
    for_web_socket: bool,
    executed: AtomicBool,
    canceled: AtomicBool,
    /// True once the response body has been released (or the call failed);
    /// stops the call-timeout timer.
    completed: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
    selector: TokioMutex<Option<SelectorState>>,
    /// A route worth reconnecting after an exchange-level failure (for
    /// example an HTTP/2 REFUSED_STREAM): same target, fresh connection.
    next_route_to_try: StdMutex<Option<Route>>,
    exchange: StdMutex<Option<ExchangeRef>>,
    connection: StdMutex<Option<Arc<Connection>>>,
    cancel_target: StdMutex<Option<CancelTarget>>,
    route: StdMutex<Option<Route>>,
}

struct SelectorState {
    host: String,
    port: u16,
    selector: RouteSelector,
}

impl Call {
    pub(crate) fn new(client: Client, request: Request, for_web_socket: bool) -> Call {
        Call {
            inner: Arc::new(CallInner {
                client,
                request,
                for_web_socket,
                executed: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                completed: Arc::new(AtomicBool::new(false)),
                timed_out: Arc::new(AtomicBool::new(false)),
                selector: TokioMutex::new(None),
                next_route_to_try: StdMutex::new(None),
                exchange: StdMutex::new(None),
                connection: StdMutex::new(None),
                cancel_target: StdMutex::new(None),
                route: StdMutex::new(None),
            }),
        }
    }

    /// The request this call was created for.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// True once `execute` or `enqueue` has run. Never resets.
    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    /// True once `cancel` has been invoked. Monotonic.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Cancels the call: pending work fails promptly with a canceled error,
    /// and the active exchange (if any) is forcibly closed.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("canceling call to {}", self.inner.request.url().redact());
        let target = self.inner.cancel_target.lock().expect("cancel lock").clone();
        if let Some(target) = target {
            target.cancel();
        }
    }

    /// A fresh, unexecuted call for the same request.
    pub fn clone_call(&self) -> Call {
        Call::new(
            self.inner.client.clone(),
            self.inner.request.clone(),
            self.inner.for_web_socket,
        )
    }

    /// Runs the call on the current task and returns its response.
    pub async fn execute(&self) -> Result<Response> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::new_protocol("Already Executed"));
        }
        self.execute_inner().await
    }

    /// Schedules the call on the client's dispatcher; `callback` is invoked
    /// exactly once with the outcome.
    pub fn enqueue<F>(&self, callback: F)
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            callback(Err(Error::new_protocol("Already Executed")));
            return;
        }
        self.inner
            .client
            .dispatcher()
            .enqueue(self.clone(), Box::new(callback));
    }

    /// The shared execute path; the executed flag is already set.
    pub(crate) async fn execute_inner(&self) -> Result<Response> {
        let events = self.inner.client.event_listener();
        events.call_start(self);

        if let Some(call_timeout) = self.inner.client.timeouts().call {
            // The call deadline spans everything up to body closure; it
            // fires an asynchronous cancel rather than bounding this future.
            let call = self.clone();
            let completed = self.inner.completed.clone();
            let timed_out = self.inner.timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(call_timeout).await;
                if !completed.load(Ordering::SeqCst) {
                    timed_out.store(true, Ordering::SeqCst);
                    call.cancel();
                }
            });
        }

        let result = match self.run().await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.inner.completed.store(true, Ordering::SeqCst);
                // A cancel provoked by the call timer reports as a timeout.
                if self.inner.timed_out.load(Ordering::SeqCst) && e.is_canceled() {
                    Err(Error::new_timeout(TimeoutStage::Call).with(e))
                } else {
                    Err(e)
                }
            }
        };
        match &result {
            Ok(_) => events.call_end(self),
            Err(e) => events.call_failed(self, e),
        }
        result
    }

    async fn run(&self) -> Result<Response> {
        let client = &self.inner.client;
        let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();
        interceptors.extend(client.interceptors().iter().cloned());
        interceptors.push(Arc::new(RetryAndFollowUpInterceptor));
        interceptors.push(Arc::new(BridgeInterceptor {
            user_agent: client.user_agent().to_string(),
        }));
        interceptors.push(Arc::new(CacheInterceptor {
            cache: client.cache(),
        }));
        interceptors.push(Arc::new(ConnectInterceptor));
        interceptors.extend(client.network_interceptors().iter().cloned());
        interceptors.push(Arc::new(CallServerInterceptor));

        let timeouts = client.timeouts();
        let mut chain = Chain::new(
            self.clone(),
            Arc::new(interceptors),
            self.inner.request.clone(),
            timeouts.connect,
            timeouts.read,
            timeouts.write,
        );
        chain.proceed(self.inner.request.clone()).await
    }

    // ===== interceptor support =====

    pub(crate) fn client(&self) -> &Client {
        &self.inner.client
    }

    pub(crate) fn is_for_web_socket(&self) -> bool {
        self.inner.for_web_socket
    }

    pub(crate) fn exchange(&self) -> Option<ExchangeRef> {
        self.inner.exchange.lock().expect("exchange lock").clone()
    }

    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.connection.lock().expect("connection lock").clone()
    }

    pub(crate) fn route(&self) -> Option<Route> {
        self.inner.route.lock().expect("route lock").clone()
    }

    pub(crate) fn set_cancel_target(&self, target: CancelTarget) {
        if self.is_canceled() {
            target.cancel();
            return;
        }
        *self.inner.cancel_target.lock().expect("cancel lock") = Some(target);
    }

    /// Stashes the failed attempt's route for one direct reconnect.
    pub(crate) fn plan_retry_on_route(&self, route: Route) {
        *self.inner.next_route_to_try.lock().expect("route retry lock") = Some(route);
    }

    /// Whether a failed attempt has somewhere else to go.
    pub(crate) async fn has_more_routes(&self) -> bool {
        if self
            .inner
            .next_route_to_try
            .lock()
            .expect("route retry lock")
            .is_some()
        {
            return true;
        }
        match &*self.inner.selector.lock().await {
            Some(state) => state.selector.has_next(),
            // No selector yet: the next attempt may still find a pooled
            // connection or resolve fresh routes.
            None => true,
        }
    }

    /// Finds or establishes a connection for `request` and binds a fresh
    /// exchange to this call.
    pub(crate) async fn initialize_exchange(
        &self,
        request: &Request,
        connect_timeout: Option<std::time::Duration>,
        read_timeout: Option<std::time::Duration>,
        write_timeout: Option<std::time::Duration>,
    ) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::new_canceled());
        }
        let client = &self.inner.client;
        let events = client.event_listener();
        let url = request.url();
        let host = url.host().to_string();
        let port = url.port();

        let retry_route = self
            .inner
            .next_route_to_try
            .lock()
            .expect("route retry lock")
            .take()
            .filter(|route| route.host() == host && route.port() == port);

        let connection = match client.connection_pool().acquire(&host, port) {
            Some(connection) => connection,
            None => {
                let mut connected = None;
                if let Some(route) = retry_route {
                    // One direct reconnect to the route that just failed at
                    // the exchange level; the selector is not consulted.
                    let params = self.connect_params(connect_timeout, read_timeout, write_timeout);
                    events.connect_start(self, &route);
                    match Connection::connect(route.clone(), &params).await {
                        Ok(connection) => {
                            client.route_database().connected(&route);
                            events.connect_end(self, &route);
                            let connection = Arc::new(connection);
                            connection.allocate();
                            client.connection_pool().put(connection.clone());
                            connected = Some(connection);
                        }
                        Err(e) => {
                            client.route_database().failed(&route);
                            events.connect_failed(self, &route, &e);
                        }
                    }
                }
                match connected {
                    Some(connection) => connection,
                    None => {
                        self.connect_new(request, connect_timeout, read_timeout, write_timeout)
                            .await?
                    }
                }
            }
        };
        *self.inner.route.lock().expect("route lock") = Some(connection.route().clone());
        events.connection_acquired(self, connection.id());

        let mut exchange = Exchange::new(
            connection.clone(),
            client.connection_pool().clone(),
            read_timeout,
            write_timeout,
        )?;
        exchange.set_done_flag(self.inner.completed.clone());
        let target = exchange.cancel_target();
        let exchange_ref: ExchangeRef = Arc::new(TokioMutex::new(exchange));
        *self.inner.exchange.lock().expect("exchange lock") = Some(exchange_ref);
        *self.inner.connection.lock().expect("connection lock") = Some(connection);
        self.set_cancel_target(target);
        if self.is_canceled() {
            return Err(Error::new_canceled());
        }
        Ok(())
    }

    fn connect_params(
        &self,
        connect_timeout: Option<std::time::Duration>,
        read_timeout: Option<std::time::Duration>,
        write_timeout: Option<std::time::Duration>,
    ) -> ConnectParams {
        let client = &self.inner.client;
        ConnectParams {
            connect_timeout,
            read_timeout,
            write_timeout,
            ping_interval: client.timeouts().ping,
            tls: client.tls(),
            protocols: client.protocols().to_vec(),
            proxy_authenticator: client.proxy_authenticator_arc(),
        }
    }

    async fn connect_new(
        &self,
        request: &Request,
        connect_timeout: Option<std::time::Duration>,
        read_timeout: Option<std::time::Duration>,
        write_timeout: Option<std::time::Duration>,
    ) -> Result<Arc<Connection>> {
        let client = &self.inner.client;
        let events = client.event_listener();
        let url = request.url();
        let host = url.host().to_string();
        let port = url.port();

        let mut guard = self.inner.selector.lock().await;
        let stale = match &*guard {
            Some(state) => state.host != host || state.port != port,
            None => true,
        };
        if stale {
            *guard = Some(SelectorState {
                host: host.clone(),
                port,
                selector: RouteSelector::new(
                    url,
                    client.proxy().cloned(),
                    client.proxy_selector(),
                    client.tls_fallback(),
                    client.dns(),
                    client.route_database(),
                ),
            });
        }
        let selector = &mut guard.as_mut().expect("selector").selector;
        let params = self.connect_params(connect_timeout, read_timeout, write_timeout);

        let mut first_error: Option<Error> = None;
        loop {
            if self.is_canceled() {
                return Err(Error::new_canceled());
            }
            let route = match selector.next().await {
                Ok(Some(route)) => route,
                Ok(None) => {
                    return Err(first_error.unwrap_or_else(|| {
                        Error::new_io(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            format!("exhausted all routes to {}:{}", host, port),
                        ))
                    }))
                }
                Err(e) => {
                    return Err(match first_error {
                        Some(mut first) => {
                            first.push_suppressed(e);
                            first
                        }
                        None => e,
                    })
                }
            };

            events.connect_start(self, &route);
            match Connection::connect(route.clone(), &params).await {
                Ok(connection) => {
                    client.route_database().connected(&route);
                    events.connect_end(self, &route);
                    let connection = Arc::new(connection);
                    // The first allocation is ours; the pool sees an
                    // already-active connection.
                    connection.allocate();
                    client.connection_pool().put(connection.clone());
                    return Ok(connection);
                }
                Err(e) => {
                    debug!("connect to {:?} failed: {}", route.socket_addr(), e);
                    client.route_database().failed(&route);
                    events.connect_failed(self, &route, &e);
                    match &mut first_error {
                        Some(first) => first.push_suppressed(e),
                        None => first_error = Some(e),
                    }
                }
            }
        }
    }

    /// Drops the call's exchange, releasing its connection.
    pub(crate) async fn release_exchange(&self, complete: bool) {
        let exchange = self.inner.exchange.lock().expect("exchange lock").take();
        *self.inner.connection.lock().expect("connection lock") = None;
        if let Some(exchange) = exchange {
            exchange.lock().await.release(complete);
            self.inner
                .client
                .event_listener()
                .connection_released(self);
        }
    }

    /// Takes the upgraded transport after a 101 response (WebSockets).
    pub(crate) async fn take_upgrade(&self) -> Result<(Buffered, Arc<Connection>)> {
        let exchange = self
            .inner
            .exchange
            .lock()
            .expect("exchange lock")
            .take()
            .ok_or_else(|| Error::new_protocol("no exchange to upgrade"))?;
        let mut exchange = exchange.lock().await;
        exchange.into_upgrade()
    }

    /// Marks the call complete so the call-timeout timer stands down.
    pub(crate) fn mark_completed(&self) {
        self.inner.completed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("url", &self.inner.request.url().redact())
            .field("executed", &self.is_executed())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
