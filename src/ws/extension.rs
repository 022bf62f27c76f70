//! `Sec-WebSocket-Extensions` negotiation. The only honored extension is
//! `permessage-deflate`; anything unrecognized flags the response so the
//! socket can be refused with close code 1010.

use crate::headers::Headers;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct WebSocketExtensions {
    pub(crate) per_message_deflate: bool,
    pub(crate) client_max_window_bits: Option<u8>,
    pub(crate) client_no_context_takeover: bool,
    pub(crate) server_max_window_bits: Option<u8>,
    pub(crate) server_no_context_takeover: bool,
    /// Set when the server sent anything we don't understand: an unknown
    /// extension, an unknown parameter, or a duplicated one.
    pub(crate) unknown_values: bool,
}

impl WebSocketExtensions {
    /// Whether the negotiated parameter values are ones we can honor:
    /// `client_max_window_bits` must be 15 (the window cannot be
    /// truncated), `server_max_window_bits` must be in `[8, 15]`.
    pub(crate) fn is_valid(&self) -> bool {
        if self.unknown_values {
            return false;
        }
        if let Some(bits) = self.client_max_window_bits {
            if bits != 15 {
                return false;
            }
        }
        if let Some(bits) = self.server_max_window_bits {
            if !(8..=15).contains(&bits) {
                return false;
            }
        }
        true
    }

    pub(crate) fn parse(headers: &Headers) -> WebSocketExtensions {
        let mut extensions = WebSocketExtensions::default();
        for header_value in headers.values("Sec-WebSocket-Extensions") {
            for extension in header_value.split(',') {
                let mut parts = extension.split(';');
                let name = parts.next().unwrap_or("").trim();
                if !name.eq_ignore_ascii_case("permessage-deflate") {
                    if !name.is_empty() {
                        extensions.unknown_values = true;
                    }
                    continue;
                }
                if extensions.per_message_deflate {
                    // The extension may be offered once.
                    extensions.unknown_values = true;
                }
                extensions.per_message_deflate = true;

                for parameter in parts {
                    let (key, value) = match parameter.split_once('=') {
                        Some((key, value)) => {
                            (key.trim(), Some(value.trim().trim_matches('"')))
                        }
                        None => (parameter.trim(), None),
                    };
                    match key.to_ascii_lowercase().as_str() {
                        "client_max_window_bits" => {
                            if extensions.client_max_window_bits.is_some() {
                                extensions.unknown_values = true;
                            }
                            match value.and_then(|v| v.parse::<u8>().ok()) {
                                Some(bits) => extensions.client_max_window_bits = Some(bits),
                                None => extensions.unknown_values = true,
                            }
                        }
                        "client_no_context_takeover" => {
                            if extensions.client_no_context_takeover || value.is_some() {
                                extensions.unknown_values = true;
                            }
                            extensions.client_no_context_takeover = true;
                        }
                        "server_max_window_bits" => {
                            if extensions.server_max_window_bits.is_some() {
                                extensions.unknown_values = true;
                            }
                            match value.and_then(|v| v.parse::<u8>().ok()) {
                                Some(bits) => extensions.server_max_window_bits = Some(bits),
                                None => extensions.unknown_values = true,
                            }
                        }
                        "server_no_context_takeover" => {
                            if extensions.server_no_context_takeover || value.is_some() {
                                extensions.unknown_values = true;
                            }
                            extensions.server_no_context_takeover = true;
                        }
                        _ => extensions.unknown_values = true,
                    }
                }
            }
        }
        extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: &str) -> WebSocketExtensions {
        let headers = Headers::builder()
            .add("Sec-WebSocket-Extensions", value)
            .unwrap()
            .build();
        WebSocketExtensions::parse(&headers)
    }

    #[test]
    fn plain_permessage_deflate() {
        let ext = parse("permessage-deflate");
        assert!(ext.per_message_deflate);
        assert!(ext.is_valid());
        assert!(!ext.client_no_context_takeover);
        assert!(!ext.server_no_context_takeover);
    }

    #[test]
    fn all_parameters() {
        let ext = parse(
            "permessage-deflate; client_max_window_bits=15; client_no_context_takeover; \
             server_max_window_bits=12; server_no_context_takeover",
        );
        assert!(ext.per_message_deflate);
        assert_eq!(ext.client_max_window_bits, Some(15));
        assert!(ext.client_no_context_takeover);
        assert_eq!(ext.server_max_window_bits, Some(12));
        assert!(ext.server_no_context_takeover);
        assert!(ext.is_valid());
    }

    #[test]
    fn truncated_client_window_rejected() {
        // We cannot shrink our deflate window: 15 is the only acceptable
        // value.
        assert!(!parse("permessage-deflate; client_max_window_bits=8").is_valid());
        assert!(parse("permessage-deflate; client_max_window_bits=15").is_valid());
    }

    #[test]
    fn server_window_bounds() {
        assert!(parse("permessage-deflate; server_max_window_bits=8").is_valid());
        assert!(!parse("permessage-deflate; server_max_window_bits=7").is_valid());
        assert!(!parse("permessage-deflate; server_max_window_bits=16").is_valid());
    }

    #[test]
    fn unknown_extension_or_parameter_flagged() {
        assert!(!parse("x-custom-extension").is_valid());
        assert!(!parse("permessage-deflate; mystery_parameter=1").is_valid());
        assert!(!parse("permessage-deflate, x-other").is_valid());
    }

    #[test]
    fn duplicated_parameters_flagged() {
        assert!(!parse(
            "permessage-deflate; client_no_context_takeover; client_no_context_takeover"
        )
        .is_valid());
        assert!(!parse("permessage-deflate, permessage-deflate").is_valid());
    }

    #[test]
    fn absent_header_negotiates_nothing() {
        let ext = WebSocketExtensions::parse(&Headers::new());
        assert!(!ext.per_message_deflate);
        assert!(ext.is_valid());
    }
}
