//! Recovery from failed attempts: route failover retries, redirects, auth
//! challenges, and the occasional 408/503 replay. The one interceptor
//! allowed to call `proceed` more than once.

use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use crate::client::route::Route;
use crate::client::Authenticator;
use crate::error::{Error, Kind, Result, TimeoutStage};
use crate::request::Request;
use crate::response::Response;

use super::{Chain, Interceptor};

/// Redirects plus auth follow-ups plus retries, combined.
pub(crate) const MAX_FOLLOW_UPS: u32 = 20;

pub(crate) struct RetryAndFollowUpInterceptor;

impl Interceptor for RetryAndFollowUpInterceptor {
    fn intercept<'a>(&'a self, chain: &'a mut Chain) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let call = chain.call().clone();
            let mut request = chain.request().clone();
            let mut prior: Option<Response> = None;
            let mut follow_up_count: u32 = 0;

            loop {
                let result = chain.proceed(request.clone()).await;
                let mut response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        let failed_route = call.route();
                        call.release_exchange(false).await;
                        if call.is_canceled() {
                            return Err(if e.is_canceled() { e } else { Error::new_canceled() });
                        }
                        if !call.client().retry_on_connection_failure()
                            || !recoverable(&e, &request)
                        {
                            return Err(e);
                        }
                        if let Some(route) = failed_route {
                            // The failure happened after connecting; the
                            // same target is worth one fresh connection.
                            call.plan_retry_on_route(route);
                        }
                        if !call.has_more_routes().await {
                            return Err(e);
                        }
                        // Retries share the follow-up budget.
                        follow_up_count += 1;
                        if follow_up_count > MAX_FOLLOW_UPS {
                            return Err(Error::new_too_many_follow_ups(follow_up_count).with(e));
                        }
                        debug!("recovering from {}; retrying", e);
                        continue;
                    }
                };

                if let Some(prior) = prior.take() {
                    response.set_prior_response(&prior);
                }

                let client = call.client();
                let route = call.route();
                let policy = FollowUpPolicy {
                    follow_redirects: client.follow_redirects(),
                    follow_ssl_redirects: client.follow_ssl_redirects(),
                    retry_on_connection_failure: client.retry_on_connection_failure(),
                    authenticator: client.authenticator(),
                    proxy_authenticator: client.proxy_authenticator(),
                    route: route.as_ref(),
                };
                let follow_up = follow_up_request(&response, &policy)?;

                let next = match follow_up {
                    Some(next) => next,
                    None => return Ok(response),
                };

                follow_up_count += 1;
                if follow_up_count > MAX_FOLLOW_UPS {
                    response.body_mut().close();
                    return Err(Error::new_too_many_follow_ups(follow_up_count));
                }

                trace!(
                    "follow-up {} of {}: {} {}",
                    follow_up_count,
                    MAX_FOLLOW_UPS,
                    next.method(),
                    next.url().redact()
                );
                response.body_mut().close();
                call.release_exchange(true).await;
                request = next;
                prior = Some(response);
            }
        })
    }
}

/// Whether `error` is a connect-level or stream-reset event that is safe to
/// retry on another route.
fn recoverable(error: &Error, request: &Request) -> bool {
    // An HTTP/2 REFUSED_STREAM means the peer never began processing; even
    // one-shot bodies were not transmitted.
    if error.is_refused_stream() {
        return true;
    }
    match error.kind() {
        // The connect never completed, so no byte of any body was sent.
        Kind::Timeout(TimeoutStage::Connect) => true,
        // Mid-flight: a one-shot body may be partially transmitted and
        // cannot be replayed, and non-idempotent methods may have taken
        // effect on the server.
        Kind::Io => {
            !request.body().map(|b| b.is_one_shot()).unwrap_or(false)
                && request.method().is_idempotent()
        }
        _ => false,
    }
}

/// The inputs the follow-up decision needs, separated from the call for
/// testability.
pub(crate) struct FollowUpPolicy<'a> {
    pub(crate) follow_redirects: bool,
    pub(crate) follow_ssl_redirects: bool,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) authenticator: &'a dyn Authenticator,
    pub(crate) proxy_authenticator: &'a dyn Authenticator,
    pub(crate) route: Option<&'a Route>,
}

/// Decides what (if anything) to issue after `response`: an auth retry, a
/// redirect, or a timed replay.
pub(crate) fn follow_up_request(
    response: &Response,
    policy: &FollowUpPolicy<'_>,
) -> Result<Option<Request>> {
    match response.code() {
        401 => Ok(policy.authenticator.authenticate(policy.route, response)),
        407 => Ok(policy
            .proxy_authenticator
            .authenticate(policy.route, response)),
        300 | 301 | 302 | 303 | 307 | 308 => build_redirect(response, policy),
        408 => {
            if !policy.retry_on_connection_failure {
                return Ok(None);
            }
            let request = response.request();
            if request.body().map(|b| b.is_one_shot()).unwrap_or(false) {
                return Ok(None);
            }
            if matches!(response.prior_response().map(Response::code), Some(408)) {
                // We attempted to retry and got another timeout. Give up.
                return Ok(None);
            }
            if retry_after_seconds(response).unwrap_or(0) > 0 {
                return Ok(None);
            }
            Ok(Some(request.clone()))
        }
        503 => {
            if matches!(response.prior_response().map(Response::code), Some(503)) {
                return Ok(None);
            }
            if retry_after_seconds(response) == Some(0) {
                // Specifically "Retry-After: 0": the server wants an
                // immediate retry, once.
                return Ok(Some(response.request().clone()));
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn build_redirect(response: &Response, policy: &FollowUpPolicy<'_>) -> Result<Option<Request>> {
    if !policy.follow_redirects {
        return Ok(None);
    }
    let location = match response.header("Location") {
        Some(location) if !location.is_empty() => location,
        _ => return Ok(None),
    };
    let request = response.request();
    let url = match request.url().resolve(location) {
        Some(url) => url,
        None => return Ok(None),
    };

    // Scheme changes (https -> http and back) are opt-in.
    if url.scheme() != request.url().scheme() && !policy.follow_ssl_redirects {
        return Ok(None);
    }

    let mut builder = request.new_builder();
    let method = request.method();
    let preserve_method = matches!(response.code(), 307 | 308)
        || method.as_str() == "GET"
        || method.as_str() == "HEAD";
    if preserve_method {
        if request.body().map(|b| b.is_one_shot()).unwrap_or(false) {
            // A one-shot body cannot be replayed to the new target.
            return Ok(None);
        }
        builder = builder.body_arc(request.body_arc());
    } else {
        // 300/301/302/303 rewrite to GET and shed the body.
        builder = builder
            .get()
            .remove_header("Transfer-Encoding")
            .remove_header("Content-Length")
            .remove_header("Content-Type");
    }

    // Don't leak credentials across hosts.
    let same_host = url.host() == request.url().host()
        && url.port() == request.url().port()
        && url.scheme() == request.url().scheme();
    if !same_host {
        builder = builder.remove_header("Authorization");
    }

    Ok(Some(builder.url(url).build()?))
}

fn retry_after_seconds(response: &Response) -> Option<u64> {
    let value = response.header("Retry-After")?;
    // HTTP dates are treated as "too far away to wait for".
    value.trim().parse::<u64>().ok().or(Some(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::Body;
    use crate::client::NoAuthenticator;
    use crate::proto::Protocol;
    use crate::response::ResponseBuilder;
    use crate::url::Url;

    fn policy<'a>() -> FollowUpPolicy<'a> {
        FollowUpPolicy {
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            authenticator: &NoAuthenticator,
            proxy_authenticator: &NoAuthenticator,
            route: None,
        }
    }

    fn response_for(request: Request, code: u16) -> ResponseBuilder {
        ResponseBuilder::new()
            .request(request)
            .protocol(Protocol::Http11)
            .code(code)
    }

    fn post_to_a() -> Request {
        Request::builder()
            .url(Url::parse("http://example.com/a").unwrap())
            .header("Content-Type", "text/plain")
            .unwrap()
            .post(Body::from("payload"))
            .build()
            .unwrap()
    }

    #[test]
    fn redirect_302_rewrites_post_to_get() {
        let response = response_for(post_to_a(), 302)
            .header("Location", "/b")
            .unwrap()
            .build()
            .unwrap();
        let next = follow_up_request(&response, &policy()).unwrap().unwrap();
        assert_eq!(next.method().as_str(), "GET");
        assert!(next.body().is_none());
        assert_eq!(next.url().to_string(), "http://example.com/b");
        assert!(next.header("Content-Type").is_none());
    }

    #[test]
    fn redirect_307_preserves_method_and_body() {
        let response = response_for(post_to_a(), 307)
            .header("Location", "/b")
            .unwrap()
            .build()
            .unwrap();
        let next = follow_up_request(&response, &policy()).unwrap().unwrap();
        assert_eq!(next.method().as_str(), "POST");
        assert!(next.body().is_some());
    }

    #[test]
    fn redirect_across_schemes_requires_opt_in() {
        let request = Request::get(Url::parse("https://example.com/a").unwrap());
        let response = response_for(request, 301)
            .header("Location", "http://example.com/insecure")
            .unwrap()
            .build()
            .unwrap();

        let mut no_ssl = policy();
        no_ssl.follow_ssl_redirects = false;
        assert!(follow_up_request(&response, &no_ssl).unwrap().is_none());
        assert!(follow_up_request(&response, &policy()).unwrap().is_some());
    }

    #[test]
    fn redirect_drops_authorization_across_hosts() {
        let request = Request::builder()
            .url(Url::parse("http://example.com/a").unwrap())
            .header("Authorization", "Bearer secret")
            .unwrap()
            .build()
            .unwrap();
        let response = response_for(request, 301)
            .header("Location", "http://other.com/b")
            .unwrap()
            .build()
            .unwrap();
        let next = follow_up_request(&response, &policy()).unwrap().unwrap();
        assert!(next.header("Authorization").is_none());

        let request = Request::builder()
            .url(Url::parse("http://example.com/a").unwrap())
            .header("Authorization", "Bearer secret")
            .unwrap()
            .build()
            .unwrap();
        let response = response_for(request, 301)
            .header("Location", "/same-host")
            .unwrap()
            .build()
            .unwrap();
        let next = follow_up_request(&response, &policy()).unwrap().unwrap();
        assert_eq!(next.header("Authorization"), Some("Bearer secret"));
    }

    #[test]
    fn unauthorized_consults_authenticator() {
        struct FixedAuth;
        impl Authenticator for FixedAuth {
            fn authenticate(
                &self,
                _route: Option<&Route>,
                response: &Response,
            ) -> Option<Request> {
                response
                    .request()
                    .new_builder()
                    .header("Authorization", "Basic dTpw")
                    .ok()?
                    .build()
                    .ok()
            }
        }

        let request = Request::get(Url::parse("http://example.com/").unwrap());
        let response = response_for(request, 401).build().unwrap();

        let mut with_auth = policy();
        with_auth.authenticator = &FixedAuth;
        let next = follow_up_request(&response, &with_auth).unwrap().unwrap();
        assert_eq!(next.header("Authorization"), Some("Basic dTpw"));

        // The default authenticator gives up.
        assert!(follow_up_request(&response, &policy()).unwrap().is_none());
    }

    #[test]
    fn service_unavailable_retries_only_on_zero() {
        let request = Request::get(Url::parse("http://example.com/").unwrap());
        let immediate = response_for(request.clone(), 503)
            .header("Retry-After", "0")
            .unwrap()
            .build()
            .unwrap();
        assert!(follow_up_request(&immediate, &policy()).unwrap().is_some());

        let later = response_for(request.clone(), 503)
            .header("Retry-After", "120")
            .unwrap()
            .build()
            .unwrap();
        assert!(follow_up_request(&later, &policy()).unwrap().is_none());

        let unspecified = response_for(request, 503).build().unwrap();
        assert!(follow_up_request(&unspecified, &policy()).unwrap().is_none());
    }

    #[test]
    fn request_timeout_retries_once() {
        let request = Request::get(Url::parse("http://example.com/").unwrap());
        let first = response_for(request.clone(), 408).build().unwrap();
        assert!(follow_up_request(&first, &policy()).unwrap().is_some());

        let prior = response_for(request.clone(), 408).build().unwrap();
        let mut second = response_for(request, 408).build().unwrap();
        second.set_prior_response(&prior);
        assert!(follow_up_request(&second, &policy()).unwrap().is_none());
    }

    #[test]
    fn plain_responses_return() {
        let request = Request::get(Url::parse("http://example.com/").unwrap());
        let ok = response_for(request, 200).build().unwrap();
        assert!(follow_up_request(&ok, &policy()).unwrap().is_none());
    }

    #[test]
    fn recoverability_rules() {
        let get = Request::get(Url::parse("http://example.com/").unwrap());
        let post = post_to_a();
        let io = Error::new_io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));

        assert!(recoverable(&io, &get));
        assert!(!recoverable(&io, &post)); // non-idempotent mid-flight
        assert!(recoverable(&Error::new_refused_stream(), &post));
        assert!(recoverable(
            &Error::new_timeout(TimeoutStage::Connect),
            &get
        ));
        assert!(!recoverable(&Error::new_timeout(TimeoutStage::Read), &get));
        assert!(!recoverable(&Error::new_protocol("bad frame"), &get));
        assert!(!recoverable(&Error::new_canceled(), &get));

        let streaming = Request::builder()
            .url(Url::parse("http://example.com/").unwrap())
            .post(Body::stream(None, Box::new(&b"x"[..])))
            .build()
            .unwrap();
        assert!(!recoverable(&io, &streaming));
        assert!(recoverable(&Error::new_refused_stream(), &streaming));
        // Nothing was transmitted when the connect itself timed out, so
        // even a one-shot body is safe to retry.
        assert!(recoverable(
            &Error::new_timeout(TimeoutStage::Connect),
            &streaming
        ));
    }
}
