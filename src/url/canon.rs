//! Percent-encoding sets and host canonicalization.

use std::net::{Ipv4Addr, Ipv6Addr};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

// One encode set per URL component. All non-ASCII is UTF-8 percent-encoded
// by `utf8_percent_encode` regardless of the set.

pub(crate) const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'/')
    .add(b'?')
    .add(b'#')
    .add(b'%');

pub(crate) const QUERY_COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'\'')
    .add(b'<')
    .add(b'>')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'=');

pub(crate) const FRAGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'%');

pub(crate) const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'\'')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'/')
    .add(b'\\')
    .add(b'?')
    .add(b'#')
    .add(b'%');

pub(crate) fn encode(component: &str, set: &'static AsciiSet) -> String {
    utf8_percent_encode(component, set).to_string()
}

pub(crate) fn decode(component: &str) -> String {
    percent_decode_str(component).decode_utf8_lossy().into_owned()
}

/// Canonicalizes a host: strips brackets and zero-compresses IPv6 literals,
/// normalizes IPv4 dotted-decimal, and IDNA-maps everything else to lowercase
/// Punycode ASCII.
///
/// Returns the canonical host without brackets; rendering re-adds them for
/// any host containing `:`.
pub(crate) fn canonicalize_host(input: &str) -> Result<String, &'static str> {
    if input.is_empty() {
        return Err("host is empty");
    }
    if let Some(inner) = input.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or("unbalanced brackets in host")?;
        let address: Ipv6Addr = inner.parse().map_err(|_| "invalid IPv6 address")?;
        return Ok(address.to_string());
    }
    if input.contains(':') {
        // An IPv6 literal is only valid inside brackets.
        return Err("IPv6 host must be enclosed in brackets");
    }

    let decoded = decode(input);
    if let Ok(address) = decoded.parse::<Ipv4Addr>() {
        return Ok(address.to_string());
    }

    let ascii = idna::domain_to_ascii(&decoded).map_err(|_| "invalid host")?;
    if ascii.is_empty() {
        return Err("host is empty");
    }
    for b in ascii.bytes() {
        if matches!(
            b,
            0x00..=0x20 | b'#' | b'%' | b'/' | b':' | b'?' | b'@' | b'[' | b'\\' | b']' | 0x7f
        ) {
            return Err("invalid host");
        }
    }
    Ok(ascii)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_canonicalize() {
        assert_eq!(canonicalize_host("WWW.Google.COM").unwrap(), "www.google.com");
        assert_eq!(canonicalize_host("1.2.3.4").unwrap(), "1.2.3.4");
        assert_eq!(
            canonicalize_host("[2001:db8:0:0:0:0:0:1]").unwrap(),
            "2001:db8::1"
        );
        assert_eq!(canonicalize_host("bücher.de").unwrap(), "xn--bcher-kva.de");
    }

    #[test]
    fn bad_hosts_rejected() {
        assert!(canonicalize_host("").is_err());
        assert!(canonicalize_host("::1").is_err());
        assert!(canonicalize_host("[::1").is_err());
        assert!(canonicalize_host("host name").is_err());
    }

    #[test]
    fn component_encoding_round_trips() {
        let segment = "polar bears/and?more#still";
        let encoded = encode(segment, PATH_SEGMENT);
        assert_eq!(encoded, "polar%20bears%2Fand%3Fmore%23still");
        assert_eq!(decode(&encoded), segment);
    }
}
