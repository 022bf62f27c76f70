//! One request/response pass bound to a connection and a codec.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::Mutex as TokioMutex;
use tracing::trace;

use crate::body::RawBodySource;
use crate::client::conn::Connection;
use crate::client::pool::ConnectionPool;
use crate::client::route::Proxy;
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::proto::h1::io::Buffered;
use crate::proto::h1::Http1Codec;
use crate::proto::h2::conn::{H2Connection, Http2Codec};
use crate::proto::Protocol;
use crate::request::Request;
use crate::response::TrailersSlot;

/// The shared handle to an exchange: the call holds one for cancellation,
/// the response body holds one to read through and release.
pub(crate) type ExchangeRef = Arc<TokioMutex<Exchange>>;

/// A response head as the exchange layer reports it.
pub(crate) struct ExchangeHead {
    pub(crate) code: u16,
    pub(crate) reason: String,
    pub(crate) headers: Headers,
}

enum Codec {
    H1(Http1Codec),
    H2 {
        conn: H2Connection,
        codec: Option<Http2Codec>,
        read_timeout: Option<Duration>,
    },
}

/// What `Call::cancel` needs to abort the wire work without locks.
#[derive(Clone)]
pub(crate) struct CancelTarget {
    connection: Arc<Connection>,
    h2_stream: Option<(H2Connection, u32)>,
}

impl CancelTarget {
    pub(crate) fn cancel(&self) {
        match &self.h2_stream {
            // Cancel closes the whole HTTP/1.1 connection, but only resets
            // this exchange's stream on a shared HTTP/2 connection.
            Some((conn, stream_id)) => conn.reset_stream(*stream_id),
            None => self.connection.cancel(),
        }
    }
}

pub(crate) struct Exchange {
    connection: Arc<Connection>,
    pool: ConnectionPool,
    codec: Option<Codec>,
    trailers_slot: TrailersSlot,
    released: bool,
    /// Set on release so the owning call's timeout timer stands down.
    done: Option<Arc<std::sync::atomic::AtomicBool>>,
}

impl Exchange {
    /// Creates an exchange on an already-allocated connection.
    pub(crate) fn new(
        connection: Arc<Connection>,
        pool: ConnectionPool,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<Exchange> {
        let codec = match connection.protocol() {
            Protocol::Http11 => {
                let mut io = connection.take_h1().ok_or_else(|| {
                    Error::new_protocol("connection already has an active exchange")
                })?;
                io.set_read_timeout(read_timeout);
                io.set_write_timeout(write_timeout);
                Codec::H1(Http1Codec::new(io))
            }
            Protocol::H2 => {
                let conn = connection
                    .h2()
                    .expect("h2 connection for h2 protocol")
                    .clone();
                Codec::H2 {
                    conn,
                    codec: None,
                    read_timeout,
                }
            }
        };
        Ok(Exchange {
            connection,
            pool,
            codec: Some(codec),
            trailers_slot: TrailersSlot::default(),
            released: false,
            done: None,
        })
    }

    pub(crate) fn set_done_flag(&mut self, flag: Arc<std::sync::atomic::AtomicBool>) {
        self.done = Some(flag);
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn trailers_slot(&self) -> TrailersSlot {
        self.trailers_slot.clone()
    }

    pub(crate) fn cancel_target(&self) -> CancelTarget {
        let h2_stream = match &self.codec {
            Some(Codec::H2 {
                conn,
                codec: Some(codec),
                ..
            }) => Some((conn.clone(), codec.stream_id())),
            _ => None,
        };
        CancelTarget {
            connection: self.connection.clone(),
            h2_stream,
        }
    }

    pub(crate) async fn write_request_headers(&mut self, request: &Request) -> Result<()> {
        let result = match self.codec.as_mut().expect("codec") {
            Codec::H1(codec) => {
                // Unencrypted requests through an HTTP proxy use the
                // absolute request-target form.
                let absolute = matches!(self.connection.route().proxy(), Proxy::Http { .. })
                    && !self.connection.route().is_https();
                codec.write_request_headers(request, absolute).await
            }
            Codec::H2 {
                conn,
                codec,
                read_timeout,
            } => match Http2Codec::send_request(conn, request, *read_timeout).await {
                Ok(new_codec) => {
                    *codec = Some(new_codec);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };
        self.track(result)
    }

    pub(crate) async fn write_request_body(&mut self, data: &[u8]) -> Result<()> {
        let result = match self.codec.as_mut().expect("codec") {
            Codec::H1(codec) => codec.write_request_body(data).await,
            Codec::H2 { codec, .. } => {
                codec
                    .as_mut()
                    .expect("headers before body")
                    .write_request_body(data)
                    .await
            }
        };
        self.track(result)
    }

    pub(crate) async fn finish_request(&mut self) -> Result<()> {
        let result = match self.codec.as_mut().expect("codec") {
            Codec::H1(codec) => codec.finish_request().await,
            Codec::H2 { codec, .. } => {
                codec
                    .as_mut()
                    .expect("headers before finish")
                    .finish_request()
                    .await
            }
        };
        self.track(result)
    }

    /// Reads the response head. `Ok(None)` reports an interim 100 when
    /// `expect_continue` is set; the caller then sends the request body and
    /// reads again.
    pub(crate) async fn read_response_headers(
        &mut self,
        expect_continue: bool,
    ) -> Result<Option<ExchangeHead>> {
        let result = match self.codec.as_mut().expect("codec") {
            Codec::H1(codec) => match codec.read_response_headers(expect_continue).await {
                Ok(Some(head)) => {
                    // A 101 hands the raw transport to the upgrade; there
                    // is no HTTP body to decode.
                    let opened = if head.code != 101 {
                        codec.open_response_body(&head)
                    } else {
                        Ok(())
                    };
                    opened.map(|()| {
                        Some(ExchangeHead {
                            code: head.code,
                            reason: head.reason,
                            headers: head.headers,
                        })
                    })
                }
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            },
            Codec::H2 { codec, .. } => {
                let codec = codec.as_mut().expect("headers before response");
                match codec.read_response_headers(expect_continue).await {
                    Ok(Some((code, headers))) => Ok(Some(ExchangeHead {
                        code,
                        reason: String::new(),
                        headers,
                    })),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        };
        self.track(result)
    }

    pub(crate) async fn read_body_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.released {
            return Ok(None);
        }
        let result = match self.codec.as_mut().expect("codec") {
            Codec::H1(codec) => codec.read_body_chunk().await,
            Codec::H2 { codec, .. } => {
                codec
                    .as_mut()
                    .expect("headers before body read")
                    .read_body_chunk()
                    .await
            }
        };
        self.track(result)
    }

    fn codec_trailers(&self) -> Headers {
        match &self.codec {
            Some(Codec::H1(codec)) => codec.trailers(),
            Some(Codec::H2 {
                codec: Some(codec), ..
            }) => codec.trailers(),
            _ => Headers::new(),
        }
    }

    /// Releases the connection: back to the pool after a clean, complete
    /// body; torn down otherwise. Idempotent.
    pub(crate) fn release(&mut self, complete: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(done) = &self.done {
            done.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        trace!(
            "releasing connection {} (complete={})",
            self.connection.id(),
            complete
        );
        match self.codec.take() {
            Some(Codec::H1(codec)) => {
                if complete && codec.is_idle() && codec.connection_reusable() {
                    self.connection.put_h1(codec.into_io());
                } else {
                    // Dropping the codec drops the socket.
                    self.connection.mark_no_new_exchanges();
                }
            }
            Some(Codec::H2 {
                codec: Some(codec), ..
            }) => {
                if !complete {
                    codec.cancel();
                }
            }
            _ => {}
        }
        self.pool.release(&self.connection);
    }

    /// Hands the raw transport to a WebSocket after a 101 response. The
    /// connection leaves HTTP service permanently; the caller owns its
    /// teardown.
    pub(crate) fn into_upgrade(&mut self) -> Result<(Buffered, Arc<Connection>)> {
        self.released = true;
        self.connection.mark_no_new_exchanges();
        match self.codec.take() {
            Some(Codec::H1(codec)) => Ok((codec.into_upgrade(), self.connection.clone())),
            _ => Err(Error::new_protocol("upgrade requires an HTTP/1.1 exchange")),
        }
    }

    /// Marks the connection unusable after an error and records the result.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            trace!("exchange failed on connection {}: {}", self.connection.id(), e);
            self.connection.mark_no_new_exchanges();
        }
        result
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        // Whatever happens to the call, the connection lease must not leak.
        self.release(false);
    }
}

/// The streaming body source handed to `ResponseBody`: reads through the
/// exchange and releases the connection at the end.
pub(crate) struct ExchangeBody {
    exchange: ExchangeRef,
}

impl ExchangeBody {
    pub(crate) fn new(exchange: ExchangeRef) -> ExchangeBody {
        ExchangeBody { exchange }
    }
}

impl RawBodySource for ExchangeBody {
    fn read_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
        Box::pin(async move {
            let mut exchange = self.exchange.lock().await;
            match exchange.read_body_chunk().await {
                Ok(Some(chunk)) => Ok(Some(chunk)),
                Ok(None) => {
                    let trailers = exchange.codec_trailers();
                    exchange.trailers_slot.fill(trailers);
                    exchange.release(true);
                    Ok(None)
                }
                Err(e) => {
                    exchange.release(false);
                    Err(e)
                }
            }
        })
    }

    fn close_source(&mut self, complete: bool) {
        // Usually uncontended: the same task that reads the body closes it.
        match self.exchange.try_lock() {
            Ok(mut exchange) => exchange.release(complete),
            Err(_) => {
                let exchange = self.exchange.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        exchange.lock().await.release(complete);
                    });
                }
            }
        }
    }
}
