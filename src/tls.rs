//! The TLS provider seam.
//!
//! hearth does not ship a TLS engine. A [`TlsProvider`] supplies the
//! handshake, session introspection, and ALPN negotiation; the rest of the
//! stack only consumes the resulting [`Transport`] and [`Handshake`] record.

use std::fmt;

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::client::route::TlsMode;
use crate::error::{Error, Result};
use crate::proto::{Protocol, Transport};

/// A TLS protocol version observed on a completed handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::Tls12 => f.write_str("TLSv1.2"),
            TlsVersion::Tls13 => f.write_str("TLSv1.3"),
        }
    }
}

/// An X.509 certificate as observed by the TLS provider: the DER bytes plus
/// the pre-extracted names it is valid for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    der: Bytes,
    subject_alt_names: Vec<String>,
}

impl Certificate {
    pub fn new(der: impl Into<Bytes>, subject_alt_names: Vec<String>) -> Certificate {
        Certificate {
            der: der.into(),
            subject_alt_names,
        }
    }

    pub fn der(&self) -> &Bytes {
        &self.der
    }

    pub fn subject_alt_names(&self) -> &[String] {
        &self.subject_alt_names
    }

    /// Returns true if this certificate covers `host`, honoring a single
    /// leading wildcard label.
    pub fn matches_hostname(&self, host: &str) -> bool {
        self.subject_alt_names.iter().any(|name| {
            if let Some(suffix) = name.strip_prefix("*.") {
                match host.split_once('.') {
                    Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
                    None => false,
                }
            } else {
                name.eq_ignore_ascii_case(host)
            }
        })
    }
}

/// A record of a completed TLS handshake.
#[derive(Clone, Debug)]
pub struct Handshake {
    tls_version: TlsVersion,
    cipher_suite: String,
    peer_certificates: Vec<Certificate>,
    local_certificates: Vec<Certificate>,
}

impl Handshake {
    pub fn new(
        tls_version: TlsVersion,
        cipher_suite: impl Into<String>,
        peer_certificates: Vec<Certificate>,
        local_certificates: Vec<Certificate>,
    ) -> Handshake {
        Handshake {
            tls_version,
            cipher_suite: cipher_suite.into(),
            peer_certificates,
            local_certificates,
        }
    }

    pub fn tls_version(&self) -> TlsVersion {
        self.tls_version
    }

    pub fn cipher_suite(&self) -> &str {
        &self.cipher_suite
    }

    pub fn peer_certificates(&self) -> &[Certificate] {
        &self.peer_certificates
    }

    pub fn local_certificates(&self) -> &[Certificate] {
        &self.local_certificates
    }
}

/// The product of [`TlsProvider::handshake`]: the encrypted transport, the
/// session record, and whatever protocol ALPN selected.
pub struct TlsSession {
    pub transport: Box<dyn Transport>,
    pub handshake: Handshake,
    pub alpn: Option<Protocol>,
}

/// Performs TLS handshakes for the client.
///
/// The provider must verify the peer certificate chain against
/// `server_name`, negotiate ALPN from `protocols` (in preference order), and
/// fail with an error for anything it cannot verify. `mode` selects between
/// a modern and a maximally-compatible parameter set.
pub trait TlsProvider: Send + Sync + 'static {
    fn handshake<'a>(
        &'a self,
        transport: Box<dyn Transport>,
        server_name: &'a str,
        protocols: &'a [Protocol],
        mode: TlsMode,
    ) -> BoxFuture<'a, Result<TlsSession>>;
}

/// The default provider: fails every handshake. Configure a real provider
/// to make `https` URLs work.
pub(crate) struct NoTlsProvider;

impl TlsProvider for NoTlsProvider {
    fn handshake<'a>(
        &'a self,
        _transport: Box<dyn Transport>,
        server_name: &'a str,
        _protocols: &'a [Protocol],
        _mode: TlsMode,
    ) -> BoxFuture<'a, Result<TlsSession>> {
        Box::pin(async move {
            Err(Error::new_tls(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("no TLS provider configured for {}", server_name),
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_matching() {
        let cert = Certificate::new(
            Bytes::new(),
            vec!["example.com".to_string(), "*.cdn.example.com".to_string()],
        );
        assert!(cert.matches_hostname("example.com"));
        assert!(cert.matches_hostname("EXAMPLE.COM"));
        assert!(cert.matches_hostname("a.cdn.example.com"));
        assert!(!cert.matches_hostname("cdn.example.com"));
        assert!(!cert.matches_hostname("a.b.cdn.example.com"));
        assert!(!cert.matches_hostname("other.com"));
    }
}
