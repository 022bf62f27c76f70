//! Serves requests from the configured cache and stamps response
//! provenance. Storage itself lives behind the `HttpCache` seam.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tracing::trace;

use crate::client::HttpCache;
use crate::error::Result;
use crate::proto::Protocol;
use crate::response::{Response, ResponseBuilder};

use super::{Chain, Interceptor};

pub(crate) struct CacheInterceptor {
    pub(crate) cache: Option<Arc<dyn HttpCache>>,
}

impl Interceptor for CacheInterceptor {
    fn intercept<'a>(&'a self, chain: &'a mut Chain) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let request = chain.request().clone();
            let cached = self.cache.as_ref().and_then(|c| c.lookup(&request));

            let request_cc = request.cache_control();
            let only_if_cached = request_cc.only_if_cached();
            let forbid_cached = request_cc.no_cache() || request_cc.no_store();

            if let Some(cached) = cached {
                if !forbid_cached {
                    trace!("cache hit for {}", request.url().redact());
                    let provenance = cached.strip_body();
                    let builder = cached.new_builder();
                    let body = cached.into_body();
                    return builder
                        .cache_response(Some(&provenance))
                        .body(body)
                        .build();
                }
            }

            if only_if_cached {
                // The cache couldn't satisfy it and the network is off
                // limits: synthesize the canonical failure.
                return ResponseBuilder::new()
                    .request(request)
                    .protocol(Protocol::Http11)
                    .code(504)
                    .message("Unsatisfiable Request (only-if-cached)")
                    .sent_request_at_millis(now_millis())
                    .received_response_at_millis(now_millis())
                    .build();
            }

            let response = chain.proceed(request.clone()).await?;

            if let Some(cache) = self.cache.as_ref() {
                if is_cacheable(&request, &response) {
                    cache.store(&response);
                }
            }
            Ok(response)
        })
    }
}

fn is_cacheable(request: &crate::request::Request, response: &Response) -> bool {
    request.method().as_str() == "GET"
        && response.is_successful()
        && !request.cache_control().no_store()
        && !response.cache_control().no_store()
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
