//! The terminal interceptor: writes the request onto the exchange and
//! reads the response off it.

use futures_util::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tracing::trace;

use crate::body::ResponseBody;
use crate::client::exchange::{ExchangeBody, ExchangeHead};
use crate::error::{Error, Result};
use crate::response::{Response, ResponseBuilder};

use super::cache::now_millis;
use super::{Chain, Interceptor};

pub(crate) struct CallServerInterceptor;

impl Interceptor for CallServerInterceptor {
    fn intercept<'a>(&'a self, chain: &'a mut Chain) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let request = chain.request().clone();
            let call = chain.call().clone();
            let exchange_ref = call
                .exchange()
                .ok_or_else(|| Error::new_protocol("no exchange bound to call"))?;

            let sent_request_at = now_millis();
            let mut early_head: Option<ExchangeHead> = None;
            {
                let mut exchange = exchange_ref.lock().await;
                exchange.write_request_headers(&request).await?;
                // An HTTP/2 exchange has a live stream now; make cancel
                // reset it instead of the whole connection.
                call.set_cancel_target(exchange.cancel_target());

                if let Some(body) = request.body() {
                    let expects_continue = request
                        .header("Expect")
                        .map(|e| e.eq_ignore_ascii_case("100-continue"))
                        .unwrap_or(false);
                    let mut send_body = true;
                    if expects_continue {
                        match exchange.read_response_headers(true).await? {
                            None => {}
                            Some(head) => {
                                // The server answered without wanting the
                                // body. The request is incomplete, so the
                                // connection can't be reused.
                                trace!("server replied {} before request body", head.code);
                                send_body = false;
                                exchange.connection().mark_no_new_exchanges();
                                early_head = Some(head);
                            }
                        }
                    }
                    if send_body {
                        match body.as_bytes() {
                            Some(bytes) => exchange.write_request_body(bytes).await?,
                            None => {
                                let mut reader = body.take_reader().ok_or_else(|| {
                                    Error::new_protocol("one-shot request body already consumed")
                                })?;
                                let mut buf = [0u8; 8 * 1024];
                                loop {
                                    let n = reader.read(&mut buf).await.map_err(Error::new_io)?;
                                    if n == 0 {
                                        break;
                                    }
                                    exchange.write_request_body(&buf[..n]).await?;
                                }
                            }
                        }
                        exchange.finish_request().await?;
                    }
                } else {
                    exchange.finish_request().await?;
                }

                if early_head.is_none() {
                    early_head = exchange.read_response_headers(false).await?;
                }
            }
            let head = early_head.expect("response head after non-interim read");
            let received_response_at = now_millis();

            let connection = call
                .connection()
                .ok_or_else(|| Error::new_protocol("no connection bound to call"))?;

            let mut builder = ResponseBuilder::new()
                .request(request.clone())
                .protocol(connection.protocol())
                .code(head.code)
                .message(head.reason)
                .headers(head.headers.clone())
                .handshake(connection.handshake().cloned())
                .sent_request_at_millis(sent_request_at)
                .received_response_at_millis(received_response_at);
            {
                let exchange = exchange_ref.lock().await;
                builder = builder.trailers_slot(exchange.trailers_slot());
            }

            let body = if call.is_for_web_socket() && head.code == 101 {
                // The exchange keeps the raw transport for the upgrade.
                ResponseBody::empty()
            } else {
                let content_type = head.headers.get("Content-Type").map(str::to_string);
                let content_length = head
                    .headers
                    .get("Content-Length")
                    .and_then(|v| v.trim().parse::<u64>().ok());
                ResponseBody::streamed(
                    content_type,
                    content_length,
                    Box::new(ExchangeBody::new(exchange_ref.clone())),
                )
            };
            let response = builder.body(body).build()?;

            trace!(
                "received response {} for {}",
                response.code(),
                request.url().redact()
            );
            Ok(response)
        })
    }
}
