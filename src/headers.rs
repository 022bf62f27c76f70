//! An ordered, case-insensitive multimap of HTTP header fields.

use std::fmt;

use crate::error::{Error, Result};

/// An immutable list of HTTP header name/value pairs.
///
/// Insertion order is preserved. Name lookups are ASCII-case-insensitive and
/// multi-valued; `get` follows the wire convention of returning the *last*
/// value for a name.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Returns an empty set of headers.
    pub fn new() -> Headers {
        Headers::default()
    }

    /// Returns a new builder.
    pub fn builder() -> HeadersBuilder {
        HeadersBuilder {
            entries: Vec::new(),
        }
    }

    /// Returns a builder seeded with a copy of these headers.
    pub fn new_builder(&self) -> HeadersBuilder {
        HeadersBuilder {
            entries: self.entries.clone(),
        }
    }

    /// The last value for `name`, or `None` if the field is absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in insertion order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The distinct field names, lowercased, in first-insertion order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for (n, _) in &self.entries {
            let lower = n.to_ascii_lowercase();
            if !names.contains(&lower) {
                names.push(lower);
            }
        }
        names
    }

    /// The number of name/value pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no pairs.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The pair at `index`, in insertion order.
    pub fn name_at(&self, index: usize) -> &str {
        &self.entries[index].0
    }

    /// The value at `index`, in insertion order.
    pub fn value_at(&self, index: usize) -> &str {
        &self.entries[index].1
    }

    /// Iterates pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// The approximate wire size of these headers.
    pub fn byte_count(&self) -> usize {
        // name + ": " + value + "\r\n" per field
        self.entries
            .iter()
            .map(|(n, v)| n.len() + v.len() + 4)
            .sum()
    }

    pub(crate) fn contains_value(&self, name: &str, needle: &str) -> bool {
        // comma-separated list membership, e.g. Connection: Upgrade, close
        self.values(name).iter().any(|value| {
            value
                .split(',')
                .any(|item| item.trim().eq_ignore_ascii_case(needle))
        })
    }
}

impl PartialEq for Headers {
    fn eq(&self, other: &Headers) -> bool {
        // Multiset by name: per-name value sequences must match in order,
        // relative order across different names is ignored.
        let mut names = self.names();
        let mut other_names = other.names();
        names.sort_unstable();
        other_names.sort_unstable();
        if names != other_names {
            return false;
        }
        names
            .iter()
            .all(|name| self.values(name) == other.values(name))
    }
}

impl Eq for Headers {}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = std::vec::IntoIter<(&'a str, &'a str)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
            .collect::<Vec<_>>()
            .into_iter()
    }
}

/// Builds a [`Headers`], validating names and values as they are added.
#[derive(Clone, Debug, Default)]
pub struct HeadersBuilder {
    entries: Vec<(String, String)>,
}

impl HeadersBuilder {
    /// Adds a field, keeping any existing fields with the same name.
    pub fn add(mut self, name: &str, value: &str) -> Result<HeadersBuilder> {
        check_name(name)?;
        check_value(value, name)?;
        self.entries
            .push((name.to_string(), value.trim().to_string()));
        Ok(self)
    }

    /// Adds a field whose name and value are known-valid at the call site.
    pub(crate) fn add_static(mut self, name: &'static str, value: impl Into<String>) -> Self {
        debug_assert!(check_name(name).is_ok());
        let value = value.into();
        debug_assert!(check_value(&value, name).is_ok());
        self.entries.push((name.to_string(), value));
        self
    }

    /// Adds a raw header line received from the wire.
    ///
    /// Accepts ordinary `Name: value` lines, HTTP/2 pseudo-header lines such
    /// as `:status: 200`, and (leniently) lines with no colon at all. Values
    /// may contain arbitrary non-control UTF-8.
    pub fn add_lenient(mut self, line: &str) -> HeadersBuilder {
        // Skip a leading ':' so pseudo-header lines keep their full name.
        let search_from = if line.starts_with(':') { 1 } else { 0 };
        match line[search_from..].find(':') {
            Some(index) => {
                let index = index + search_from;
                let name = line[..index].trim();
                let value = line[index + 1..].trim();
                self.entries.push((name.to_string(), value.to_string()));
            }
            None if search_from == 1 => {
                // "raw" pseudo-line with empty value
                self.entries.push((line.trim().to_string(), String::new()));
            }
            None => {
                self.entries
                    .push((String::new(), line.trim().to_string()));
            }
        }
        self
    }

    pub(crate) fn add_lenient_pair(mut self, name: &str, value: &str) -> HeadersBuilder {
        self.entries
            .push((name.to_string(), value.trim().to_string()));
        self
    }

    /// Sets a field, removing any existing fields with the same name.
    pub fn set(mut self, name: &str, value: &str) -> Result<HeadersBuilder> {
        check_name(name)?;
        check_value(value, name)?;
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries
            .push((name.to_string(), value.trim().to_string()));
        Ok(self)
    }

    pub(crate) fn set_static(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.push((name.to_string(), value.into()));
        self
    }

    /// Removes every field named `name`.
    pub fn remove_all(mut self, name: &str) -> HeadersBuilder {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    /// The last value currently staged for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Freezes the builder into an immutable `Headers`.
    pub fn build(self) -> Headers {
        Headers {
            entries: self.entries,
        }
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::new_protocol("header name is empty"));
    }
    for (i, b) in name.bytes().enumerate() {
        if !is_token_byte(b) {
            return Err(Error::new_protocol(format!(
                "unexpected char {:#x} at {} in header name: {}",
                b, i, name
            )));
        }
    }
    Ok(())
}

fn check_value(value: &str, name: &str) -> Result<()> {
    for (i, b) in value.bytes().enumerate() {
        let ok = matches!(b, b'\t' | b' '..=b'~');
        if !ok {
            return Err(Error::new_protocol(format!(
                "unexpected char {:#x} at {} in {} value",
                b, i, name
            )));
        }
    }
    Ok(())
}

// RFC 7230 token characters.
fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}
