//! Opens (or reuses) the connection a request needs and binds an exchange
//! to the call.

use futures_util::future::BoxFuture;

use crate::error::Result;
use crate::response::Response;

use super::{Chain, Interceptor};

pub(crate) struct ConnectInterceptor;

impl Interceptor for ConnectInterceptor {
    fn intercept<'a>(&'a self, chain: &'a mut Chain) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let request = chain.request().clone();
            let call = chain.call().clone();
            call.initialize_exchange(
                &request,
                chain.connect_timeout(),
                chain.read_timeout(),
                chain.write_timeout(),
            )
            .await?;
            chain.proceed(request).await
        })
    }
}
