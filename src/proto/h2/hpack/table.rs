//! The HPACK static table and a dynamic table (RFC 7541 section 2.3).

use std::collections::VecDeque;

/// Per-entry overhead charged against the dynamic table size.
const ENTRY_OVERHEAD: usize = 32;

/// RFC 7541 appendix A. Indices are 1-based on the wire.
pub(super) const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// The evicting FIFO of recently-coded fields. The encoder and decoder each
/// keep an independent instance.
pub(super) struct DynamicTable {
    entries: VecDeque<(String, String)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub(super) fn new(max_size: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn max_size(&self) -> usize {
        self.max_size
    }

    /// Entry at 0-based index, most recently inserted first.
    pub(super) fn get(&self, index: usize) -> Option<(&str, &str)> {
        self.entries
            .get(index)
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Finds `(name, value)`; on a miss, finds any entry with `name`.
    /// Returns `(index, exact_match)`.
    pub(super) fn find(&self, name: &str, value: &str) -> Option<(usize, bool)> {
        let mut name_only = None;
        for (i, (n, v)) in self.entries.iter().enumerate() {
            if n == name {
                if v == value {
                    return Some((i, true));
                }
                if name_only.is_none() {
                    name_only = Some((i, false));
                }
            }
        }
        name_only
    }

    /// Finds any entry named `name`.
    pub(super) fn find_name(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    pub(super) fn insert(&mut self, name: String, value: String) {
        let entry_size = name.len() + value.len() + ENTRY_OVERHEAD;
        if entry_size > self.max_size {
            // An entry larger than the table empties it.
            self.entries.clear();
            self.size = 0;
            return;
        }
        while self.size + entry_size > self.max_size {
            if let Some((n, v)) = self.entries.pop_back() {
                self.size -= n.len() + v.len() + ENTRY_OVERHEAD;
            }
        }
        self.size += entry_size;
        self.entries.push_front((name, value));
    }

    pub(super) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.size > self.max_size {
            if let Some((n, v)) = self.entries.pop_back() {
                self.size -= n.len() + v.len() + ENTRY_OVERHEAD;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_well_known_indices() {
        assert_eq!(STATIC_TABLE.len(), 61);
        assert_eq!(STATIC_TABLE[1], (":method", "GET"));
        assert_eq!(STATIC_TABLE[7], (":status", "200"));
        assert_eq!(STATIC_TABLE[60], ("www-authenticate", ""));
    }

    #[test]
    fn insertion_order_and_eviction() {
        // Room for exactly two small entries.
        let mut table = DynamicTable::new(2 * (1 + 1 + 32));
        table.insert("a".into(), "1".into());
        table.insert("b".into(), "2".into());
        assert_eq!(table.get(0), Some(("b", "2")));
        assert_eq!(table.get(1), Some(("a", "1")));

        table.insert("c".into(), "3".into());
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0), Some(("c", "3")));
        assert_eq!(table.get(1), Some(("b", "2")));
    }

    #[test]
    fn oversized_entry_clears() {
        let mut table = DynamicTable::new(40);
        table.insert("a".into(), "1".into());
        table.insert("name".into(), "a-very-long-value-over-forty".into());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn resize_evicts() {
        let mut table = DynamicTable::new(1024);
        table.insert("a".into(), "1".into());
        table.insert("b".into(), "2".into());
        table.set_max_size(34);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0), Some(("b", "2")));
    }

    #[test]
    fn find_prefers_exact() {
        let mut table = DynamicTable::new(1024);
        table.insert("k".into(), "1".into());
        table.insert("k".into(), "2".into());
        assert_eq!(table.find("k", "1"), Some((1, true)));
        assert_eq!(table.find("k", "9"), Some((0, false)));
        assert_eq!(table.find("x", "1"), None);
    }
}
