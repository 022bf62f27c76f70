//! The DNS resolver seam.

use std::io;
use std::net::IpAddr;

use futures_util::future::BoxFuture;

/// Resolves hostnames to address lists.
///
/// Implementations return every known address; the route planner turns the
/// list into individual connect attempts in order.
pub trait Dns: Send + Sync + 'static {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;
}

/// The system resolver, via the runtime's `getaddrinfo` thread pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDns;

impl Dns for SystemDns {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            // Port 0 satisfies the ToSocketAddrs contract; only the
            // addresses are kept.
            let addrs = tokio::net::lookup_host((host, 0))
                .await?
                .map(|addr| addr.ip())
                .collect::<Vec<_>>();
            if addrs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {}", host),
                ));
            }
            Ok(addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_ip_literals_without_network() {
        let addrs = SystemDns.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
