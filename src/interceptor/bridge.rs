//! Bridges application requests to network requests: fills in the headers
//! the wire needs, and transparently decodes gzip on the way back.

use futures_util::future::BoxFuture;
use tracing::trace;

use crate::body::{GzipSource, ResponseBody};
use crate::error::Result;
use crate::response::Response;

use super::{Chain, Interceptor};

pub(crate) struct BridgeInterceptor {
    pub(crate) user_agent: String,
}

impl Interceptor for BridgeInterceptor {
    fn intercept<'a>(&'a self, chain: &'a mut Chain) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let user_request = chain.request().clone();
            let mut builder = user_request.new_builder();

            if let Some(body) = user_request.body() {
                if let Some(content_type) = body.content_type() {
                    if user_request.header("Content-Type").is_none() {
                        builder = builder.header("Content-Type", content_type)?;
                    }
                }
                match body.content_length() {
                    Some(length) => {
                        builder = builder
                            .header("Content-Length", &length.to_string())?
                            .remove_header("Transfer-Encoding");
                    }
                    None => {
                        builder = builder
                            .header("Transfer-Encoding", "chunked")?
                            .remove_header("Content-Length");
                    }
                }
            }

            if user_request.header("Host").is_none() {
                builder = builder.header("Host", &user_request.url().host_header())?;
            }
            if user_request.header("Connection").is_none() {
                builder = builder.header("Connection", "Keep-Alive")?;
            }

            // If we add an Accept-Encoding we're also responsible for
            // decoding the response.
            let mut transparent_gzip = false;
            if user_request.header("Accept-Encoding").is_none()
                && user_request.header("Range").is_none()
            {
                transparent_gzip = true;
                builder = builder.header("Accept-Encoding", "gzip")?;
            }

            if user_request.header("User-Agent").is_none() {
                builder = builder.header("User-Agent", &self.user_agent)?;
            }

            let mut response = chain.proceed(builder.build()?).await?;
            // Follow-ups rebuild from the caller's request, not the wire
            // form with our added headers.
            response.set_request(user_request.clone());

            let is_gzipped = response
                .header("Content-Encoding")
                .map(|e| e.eq_ignore_ascii_case("gzip"))
                .unwrap_or(false);
            if transparent_gzip && is_gzipped && promises_body(&response) {
                trace!("transparently decoding gzip response body");
                let content_type = response
                    .body()
                    .content_type()
                    .map(str::to_string);
                let mut builder = response
                    .new_builder()
                    .remove_header("Content-Encoding")
                    .remove_header("Content-Length");
                let source = GzipSource::new(response.into_body().into_source());
                builder = builder.body(ResponseBody::streamed(
                    content_type,
                    None,
                    Box::new(source),
                ));
                return builder.build();
            }

            Ok(response)
        })
    }
}

fn promises_body(response: &Response) -> bool {
    !matches!(response.code(), 204 | 304) && response.request().method().as_str() != "HEAD"
}

#[cfg(test)]
mod tests {
    use super::*;

    // The header-filling behavior is covered end-to-end in the call tests;
    // here we pin the body-promise rule the gunzip path keys on.
    #[test]
    fn no_body_for_head_or_not_modified() {
        use crate::proto::Protocol;
        use crate::request::Request;
        use crate::response::ResponseBuilder;
        use crate::url::Url;

        let url = Url::parse("http://example.com/").unwrap();
        let ok = ResponseBuilder::new()
            .request(Request::get(url.clone()))
            .protocol(Protocol::Http11)
            .code(200)
            .build()
            .unwrap();
        assert!(promises_body(&ok));

        let not_modified = ResponseBuilder::new()
            .request(Request::get(url.clone()))
            .protocol(Protocol::Http11)
            .code(304)
            .build()
            .unwrap();
        assert!(!promises_body(&not_modified));

        let head = ResponseBuilder::new()
            .request(
                Request::builder()
                    .url(url)
                    .head()
                    .build()
                    .unwrap(),
            )
            .protocol(Protocol::Http11)
            .code(200)
            .build()
            .unwrap();
        assert!(!promises_body(&head));
    }
}
