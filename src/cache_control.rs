//! Cache-Control header parsing and building.

use std::fmt;

use crate::headers::Headers;

/// The cache directives of a request or response.
///
/// Parsed leniently: unknown directives are ignored, values may be quoted or
/// bare, and directives are collected across every `Cache-Control` header
/// (and `Pragma`, whose presence only invalidates the cached raw value).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheControl {
    no_cache: bool,
    no_store: bool,
    max_age_seconds: Option<i64>,
    s_max_age_seconds: Option<i64>,
    is_private: bool,
    is_public: bool,
    must_revalidate: bool,
    max_stale_seconds: Option<i64>,
    min_fresh_seconds: Option<i64>,
    only_if_cached: bool,
    no_transform: bool,
    immutable: bool,
    header_value: Option<String>,
}

impl CacheControl {
    /// A directive set requiring the network: `no-cache`.
    pub fn force_network() -> CacheControl {
        CacheControlBuilder::new().no_cache().build()
    }

    /// A directive set requiring the cache, however stale:
    /// `only-if-cached, max-stale=<max>`.
    pub fn force_cache() -> CacheControl {
        let mut cc = CacheControlBuilder::new().only_if_cached().build();
        cc.max_stale_seconds = Some(i64::MAX);
        cc
    }

    /// In a response, `no-cache` forbids using the cache without validation.
    /// In a request, it forces a network response.
    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    /// `no-store` forbids the cache from storing this message.
    pub fn no_store(&self) -> bool {
        self.no_store
    }

    /// Freshness lifetime, in seconds.
    pub fn max_age_seconds(&self) -> Option<i64> {
        self.max_age_seconds
    }

    /// Shared-cache freshness lifetime, in seconds.
    pub fn s_max_age_seconds(&self) -> Option<i64> {
        self.s_max_age_seconds
    }

    pub fn is_private(&self) -> bool {
        self.is_private
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    pub fn must_revalidate(&self) -> bool {
        self.must_revalidate
    }

    /// How stale a cached response the request will accept, in seconds.
    /// `max-stale` without a value parses to `i64::MAX`.
    pub fn max_stale_seconds(&self) -> Option<i64> {
        self.max_stale_seconds
    }

    pub fn min_fresh_seconds(&self) -> Option<i64> {
        self.min_fresh_seconds
    }

    /// `only-if-cached` forbids the network entirely.
    pub fn only_if_cached(&self) -> bool {
        self.only_if_cached
    }

    pub fn no_transform(&self) -> bool {
        self.no_transform
    }

    pub fn immutable(&self) -> bool {
        self.immutable
    }

    /// Parses the cache directives of `headers`.
    pub fn parse(headers: &Headers) -> CacheControl {
        let mut result = CacheControl::default();
        let mut can_use_header_value = true;

        for i in 0..headers.len() {
            let name = headers.name_at(i);
            let value = headers.value_at(i);

            if name.eq_ignore_ascii_case("Cache-Control") {
                if result.header_value.is_some() {
                    // Multiple Cache-Control headers: re-serialize on demand.
                    can_use_header_value = false;
                } else {
                    result.header_value = Some(value.to_string());
                }
            } else if name.eq_ignore_ascii_case("Pragma") {
                // Might specify additional cache-control params. We invalidate
                // just in case.
                can_use_header_value = false;
            } else {
                continue;
            }

            parse_directives(value, &mut result);
        }

        if !can_use_header_value {
            result.header_value = None;
        }
        result
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = &self.header_value {
            return f.write_str(value);
        }
        let mut wrote = false;
        let mut directive = |f: &mut fmt::Formatter<'_>, text: String| -> fmt::Result {
            if wrote {
                f.write_str(", ")?;
            }
            wrote = true;
            f.write_str(&text)
        };
        if self.no_cache {
            directive(f, "no-cache".into())?;
        }
        if self.no_store {
            directive(f, "no-store".into())?;
        }
        if let Some(s) = self.max_age_seconds {
            directive(f, format!("max-age={}", s))?;
        }
        if let Some(s) = self.s_max_age_seconds {
            directive(f, format!("s-maxage={}", s))?;
        }
        if self.is_private {
            directive(f, "private".into())?;
        }
        if self.is_public {
            directive(f, "public".into())?;
        }
        if self.must_revalidate {
            directive(f, "must-revalidate".into())?;
        }
        if let Some(s) = self.max_stale_seconds {
            if s == i64::MAX {
                directive(f, "max-stale".into())?;
            } else {
                directive(f, format!("max-stale={}", s))?;
            }
        }
        if let Some(s) = self.min_fresh_seconds {
            directive(f, format!("min-fresh={}", s))?;
        }
        if self.only_if_cached {
            directive(f, "only-if-cached".into())?;
        }
        if self.no_transform {
            directive(f, "no-transform".into())?;
        }
        if self.immutable {
            directive(f, "immutable".into())?;
        }
        Ok(())
    }
}

fn parse_directives(value: &str, result: &mut CacheControl) {
    let bytes = value.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        // Directive name.
        let start = pos;
        while pos < bytes.len() && !matches!(bytes[pos], b'=' | b',' | b';') {
            pos += 1;
        }
        let directive = value[start..pos].trim().to_ascii_lowercase();

        // Optional parameter.
        let mut parameter: Option<String> = None;
        if pos < bytes.len() && bytes[pos] == b'=' {
            pos += 1;
            while pos < bytes.len() && matches!(bytes[pos], b' ' | b'\t') {
                pos += 1;
            }
            if pos < bytes.len() && bytes[pos] == b'"' {
                pos += 1;
                let param_start = pos;
                while pos < bytes.len() && bytes[pos] != b'"' {
                    pos += 1;
                }
                parameter = Some(value[param_start..pos].to_string());
                pos += 1; // closing quote
            } else {
                let param_start = pos;
                while pos < bytes.len() && !matches!(bytes[pos], b',' | b';') {
                    pos += 1;
                }
                parameter = Some(value[param_start..pos].trim().to_string());
            }
        }
        if pos < bytes.len() {
            pos += 1; // ',' or ';'
        }

        if directive.is_empty() {
            continue;
        }
        match directive.as_str() {
            "no-cache" => result.no_cache = true,
            "no-store" => result.no_store = true,
            "max-age" => result.max_age_seconds = parse_seconds(parameter.as_deref()),
            "s-maxage" => result.s_max_age_seconds = parse_seconds(parameter.as_deref()),
            "private" => result.is_private = true,
            "public" => result.is_public = true,
            "must-revalidate" => result.must_revalidate = true,
            "max-stale" => {
                result.max_stale_seconds = match parameter.as_deref() {
                    None | Some("") => Some(i64::MAX),
                    value => parse_seconds(value),
                }
            }
            "min-fresh" => result.min_fresh_seconds = parse_seconds(parameter.as_deref()),
            "only-if-cached" => result.only_if_cached = true,
            "no-transform" => result.no_transform = true,
            "immutable" => result.immutable = true,
            _ => {} // unknown directives are ignored
        }
    }
}

fn parse_seconds(parameter: Option<&str>) -> Option<i64> {
    let parameter = parameter?;
    match parameter.parse::<i64>() {
        Ok(seconds) if seconds >= 0 => Some(seconds),
        Ok(_) => Some(0),
        Err(_) => None,
    }
}

/// Builds the cache directives of a request.
#[derive(Clone, Debug, Default)]
pub struct CacheControlBuilder {
    no_cache: bool,
    no_store: bool,
    max_age_seconds: Option<i64>,
    max_stale_seconds: Option<i64>,
    min_fresh_seconds: Option<i64>,
    only_if_cached: bool,
    no_transform: bool,
    immutable: bool,
}

impl CacheControlBuilder {
    pub fn new() -> CacheControlBuilder {
        CacheControlBuilder::default()
    }

    /// Don't accept an unvalidated cached response.
    pub fn no_cache(mut self) -> CacheControlBuilder {
        self.no_cache = true;
        self
    }

    /// Don't store the server's response in any cache.
    pub fn no_store(mut self) -> CacheControlBuilder {
        self.no_store = true;
        self
    }

    /// Only accept responses cached within `seconds`.
    pub fn max_age_seconds(mut self, seconds: i64) -> CacheControlBuilder {
        self.max_age_seconds = Some(seconds.max(0));
        self
    }

    /// Accept responses that have exceeded their freshness by `seconds`.
    pub fn max_stale_seconds(mut self, seconds: i64) -> CacheControlBuilder {
        self.max_stale_seconds = Some(seconds.max(0));
        self
    }

    /// Only accept responses still fresh in `seconds` from now.
    pub fn min_fresh_seconds(mut self, seconds: i64) -> CacheControlBuilder {
        self.min_fresh_seconds = Some(seconds.max(0));
        self
    }

    /// Only use the cache; fail with 504 otherwise.
    pub fn only_if_cached(mut self) -> CacheControlBuilder {
        self.only_if_cached = true;
        self
    }

    pub fn no_transform(mut self) -> CacheControlBuilder {
        self.no_transform = true;
        self
    }

    pub fn immutable(mut self) -> CacheControlBuilder {
        self.immutable = true;
        self
    }

    pub fn build(self) -> CacheControl {
        CacheControl {
            no_cache: self.no_cache,
            no_store: self.no_store,
            max_age_seconds: self.max_age_seconds,
            max_stale_seconds: self.max_stale_seconds,
            min_fresh_seconds: self.min_fresh_seconds,
            only_if_cached: self.only_if_cached,
            no_transform: self.no_transform,
            immutable: self.immutable,
            ..CacheControl::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(name: &str, value: &str) -> Headers {
        Headers::builder().add(name, value).unwrap().build()
    }

    #[test]
    fn parse_common_directives() {
        let cc = CacheControl::parse(&headers("Cache-Control", "no-cache, max-age=60, public"));
        assert!(cc.no_cache());
        assert_eq!(cc.max_age_seconds(), Some(60));
        assert!(cc.is_public());
        assert!(!cc.no_store());
    }

    #[test]
    fn max_stale_without_value_is_unbounded() {
        let cc = CacheControl::parse(&headers("Cache-Control", "max-stale"));
        assert_eq!(cc.max_stale_seconds(), Some(i64::MAX));

        let bounded = CacheControl::parse(&headers("Cache-Control", "max-stale=300"));
        assert_eq!(bounded.max_stale_seconds(), Some(300));
    }

    #[test]
    fn quoted_and_unknown_directives() {
        let cc = CacheControl::parse(&headers(
            "Cache-Control",
            "private=\"set-cookie\", mystery-directive=7, s-maxage=30",
        ));
        assert!(cc.is_private());
        assert_eq!(cc.s_max_age_seconds(), Some(30));
    }

    #[test]
    fn raw_value_cached_for_single_header() {
        let cc = CacheControl::parse(&headers("Cache-Control", "no-store,  max-age=9"));
        assert_eq!(cc.to_string(), "no-store,  max-age=9");
    }

    #[test]
    fn pragma_invalidates_raw_value() {
        let h = Headers::builder()
            .add("Cache-Control", "max-age=10")
            .unwrap()
            .add("Pragma", "no-cache")
            .unwrap()
            .build();
        let cc = CacheControl::parse(&h);
        assert_eq!(cc.max_age_seconds(), Some(10));
        // Re-serialized from fields, not the raw header.
        assert_eq!(cc.to_string(), "no-cache, max-age=10");
    }

    #[test]
    fn multiple_cache_control_headers_merge() {
        let h = Headers::builder()
            .add("Cache-Control", "no-cache")
            .unwrap()
            .add("Cache-Control", "max-age=30")
            .unwrap()
            .build();
        let cc = CacheControl::parse(&h);
        assert!(cc.no_cache());
        assert_eq!(cc.max_age_seconds(), Some(30));
        assert_eq!(cc.to_string(), "no-cache, max-age=30");
    }

    #[test]
    fn builder_directives() {
        let cc = CacheControlBuilder::new()
            .no_cache()
            .max_age_seconds(120)
            .build();
        assert_eq!(cc.to_string(), "no-cache, max-age=120");
        assert_eq!(CacheControl::force_network().to_string(), "no-cache");
        assert!(CacheControl::force_cache().only_if_cached());
    }
}
