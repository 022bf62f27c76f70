//! HPACK header compression, RFC 7541.
//!
//! The encoder and decoder keep independent dynamic tables, as the protocol
//! requires: ours is driven by what we emit, theirs by what we receive.

mod huffman;
mod table;

use crate::error::{Error, Result};

use self::table::{DynamicTable, STATIC_TABLE};

const DEFAULT_TABLE_SIZE: usize = 4_096;

/// Header fields that must never enter a dynamic table.
fn is_sensitive(name: &str) -> bool {
    matches!(
        name,
        "authorization" | "proxy-authorization" | "cookie" | "set-cookie"
    )
}

fn compression_error(detail: &'static str) -> Error {
    Error::new_protocol(format!("COMPRESSION_ERROR {}", detail))
}

// ===== integer primitives =====

fn encode_integer(value: usize, prefix_bits: u8, first_byte_flags: u8, dst: &mut Vec<u8>) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        dst.push(first_byte_flags | value as u8);
        return;
    }
    dst.push(first_byte_flags | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        dst.push((rest % 128 + 128) as u8);
        rest /= 128;
    }
    dst.push(rest as u8);
}

fn decode_integer(src: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize> {
    if *pos >= src.len() {
        return Err(compression_error("truncated integer"));
    }
    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = (src[*pos] as usize) & max_prefix;
    *pos += 1;
    if value < max_prefix {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        if *pos >= src.len() {
            return Err(compression_error("truncated integer"));
        }
        let b = src[*pos];
        *pos += 1;
        value = value
            .checked_add(((b & 0x7f) as usize) << shift)
            .ok_or_else(|| compression_error("integer overflow"))?;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(compression_error("integer overflow"));
        }
    }
}

// ===== string primitives =====

fn encode_string(value: &str, dst: &mut Vec<u8>) {
    let raw = value.as_bytes();
    let huffman_len = huffman::encoded_len(raw);
    if huffman_len < raw.len() {
        encode_integer(huffman_len, 7, 0x80, dst);
        huffman::encode(raw, dst);
    } else {
        encode_integer(raw.len(), 7, 0, dst);
        dst.extend_from_slice(raw);
    }
}

fn decode_string(src: &[u8], pos: &mut usize) -> Result<String> {
    if *pos >= src.len() {
        return Err(compression_error("truncated string"));
    }
    let huffman_coded = src[*pos] & 0x80 != 0;
    let len = decode_integer(src, pos, 7)?;
    if *pos + len > src.len() {
        return Err(compression_error("truncated string"));
    }
    let raw = &src[*pos..*pos + len];
    *pos += len;
    if huffman_coded {
        let mut decoded = Vec::with_capacity(len * 2);
        huffman::decode(raw, &mut decoded)?;
        Ok(String::from_utf8_lossy(&decoded).into_owned())
    } else {
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}

// ===== impl Encoder =====

/// Compresses header lists for one connection's sending side.
pub(crate) struct Encoder {
    table: DynamicTable,
}

impl Encoder {
    pub(crate) fn new() -> Encoder {
        Encoder {
            table: DynamicTable::new(DEFAULT_TABLE_SIZE),
        }
    }

    /// Encodes `headers` into `dst`. Names must already be lowercase.
    pub(crate) fn encode(&mut self, headers: &[(String, String)], dst: &mut Vec<u8>) {
        for (name, value) in headers {
            self.encode_field(name, value, dst);
        }
    }

    fn encode_field(&mut self, name: &str, value: &str, dst: &mut Vec<u8>) {
        if is_sensitive(name) {
            // Literal never indexed.
            match self.find_name_index(name) {
                Some(index) => encode_integer(index, 4, 0x10, dst),
                None => {
                    dst.push(0x10);
                    encode_string(name, dst);
                }
            }
            encode_string(value, dst);
            return;
        }

        // Exact match: indexed field.
        if let Some(index) = self.find_exact_index(name, value) {
            encode_integer(index, 7, 0x80, dst);
            return;
        }

        // Literal with incremental indexing.
        match self.find_name_index(name) {
            Some(index) => encode_integer(index, 6, 0x40, dst),
            None => {
                dst.push(0x40);
                encode_string(name, dst);
            }
        }
        encode_string(value, dst);
        self.table.insert(name.to_string(), value.to_string());
    }

    fn find_exact_index(&self, name: &str, value: &str) -> Option<usize> {
        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if *n == name && *v == value {
                return Some(i + 1);
            }
        }
        match self.table.find(name, value) {
            Some((i, true)) => Some(STATIC_TABLE.len() + 1 + i),
            _ => None,
        }
    }

    fn find_name_index(&self, name: &str) -> Option<usize> {
        for (i, (n, _)) in STATIC_TABLE.iter().enumerate() {
            if *n == name {
                return Some(i + 1);
            }
        }
        self.table
            .find_name(name)
            .map(|i| STATIC_TABLE.len() + 1 + i)
    }
}

// ===== impl Decoder =====

/// Decompresses header blocks for one connection's receiving side.
pub(crate) struct Decoder {
    table: DynamicTable,
    /// Upper bound for dynamic table size updates, from our SETTINGS.
    max_size_limit: usize,
}

impl Decoder {
    pub(crate) fn new() -> Decoder {
        Decoder {
            table: DynamicTable::new(DEFAULT_TABLE_SIZE),
            max_size_limit: DEFAULT_TABLE_SIZE,
        }
    }

    /// Decodes a complete header block.
    pub(crate) fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        let mut pos = 0;
        while pos < block.len() {
            let b = block[pos];
            if b & 0x80 != 0 {
                // Indexed header field.
                let index = decode_integer(block, &mut pos, 7)?;
                let (name, value) = self.lookup(index)?;
                headers.push((name, value));
            } else if b & 0xc0 == 0x40 {
                // Literal with incremental indexing.
                let index = decode_integer(block, &mut pos, 6)?;
                let name = if index == 0 {
                    decode_string(block, &mut pos)?
                } else {
                    self.lookup(index)?.0
                };
                let value = decode_string(block, &mut pos)?;
                self.table.insert(name.clone(), value.clone());
                headers.push((name, value));
            } else if b & 0xe0 == 0x20 {
                // Dynamic table size update.
                let size = decode_integer(block, &mut pos, 5)?;
                if size > self.max_size_limit {
                    return Err(compression_error("table size update too large"));
                }
                self.table.set_max_size(size);
            } else {
                // Literal without indexing (0x00) or never indexed (0x10).
                let index = decode_integer(block, &mut pos, 4)?;
                let name = if index == 0 {
                    decode_string(block, &mut pos)?
                } else {
                    self.lookup(index)?.0
                };
                let value = decode_string(block, &mut pos)?;
                headers.push((name, value));
            }
        }
        Ok(headers)
    }

    fn lookup(&self, index: usize) -> Result<(String, String)> {
        if index == 0 {
            return Err(compression_error("index zero"));
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_string(), value.to_string()));
        }
        match self.table.get(index - STATIC_TABLE.len() - 1) {
            Some((name, value)) => Ok((name.to_string(), value.to_string())),
            None => Err(compression_error("index out of table bounds")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn rfc7541_c_2_1_literal_with_indexing() {
        // custom-key: custom-header, raw-coded.
        let block = [
            0x40, 0x0a, b'c', b'u', b's', b't', b'o', b'm', b'-', b'k', b'e', b'y', 0x0d, b'c',
            b'u', b's', b't', b'o', b'm', b'-', b'h', b'e', b'a', b'd', b'e', b'r',
        ];
        let mut decoder = Decoder::new();
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(headers, pairs(&[("custom-key", "custom-header")]));
        assert_eq!(decoder.table.len(), 1);
    }

    #[test]
    fn rfc7541_c_2_4_indexed_static() {
        let mut decoder = Decoder::new();
        let headers = decoder.decode(&[0x82]).unwrap();
        assert_eq!(headers, pairs(&[(":method", "GET")]));
    }

    #[test]
    fn rfc7541_c_3_first_request() {
        let block = [
            0x82, 0x86, 0x84, 0x41, 0x0f, b'w', b'w', b'w', b'.', b'e', b'x', b'a', b'm', b'p',
            b'l', b'e', b'.', b'c', b'o', b'm',
        ];
        let mut decoder = Decoder::new();
        let headers = decoder.decode(&block).unwrap();
        assert_eq!(
            headers,
            pairs(&[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ])
        );
    }

    #[test]
    fn encoder_decoder_round_trip_with_dynamic_table() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        let first = pairs(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/search"),
            (":authority", "example.com"),
            ("x-custom", "one"),
        ]);
        let mut block = Vec::new();
        encoder.encode(&first, &mut block);
        assert_eq!(decoder.decode(&block).unwrap(), first);

        // Repeats now hit both dynamic tables.
        let second = pairs(&[(":authority", "example.com"), ("x-custom", "one")]);
        let mut block2 = Vec::new();
        encoder.encode(&second, &mut block2);
        assert!(block2.len() < 6);
        assert_eq!(decoder.decode(&block2).unwrap(), second);
    }

    #[test]
    fn sensitive_headers_never_indexed() {
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let headers = pairs(&[("authorization", "Basic dTpw")]);

        let mut block = Vec::new();
        encoder.encode(&headers, &mut block);
        // 0x10 prefix: literal never indexed, name from the static table.
        assert_eq!(block[0] & 0xf0, 0x10);
        assert_eq!(decoder.decode(&block).unwrap(), headers);
        assert_eq!(decoder.table.len(), 0);
    }

    #[test]
    fn integer_primitives() {
        // RFC 7541 C.1.1: 10 in a 5-bit prefix.
        let mut out = Vec::new();
        encode_integer(10, 5, 0, &mut out);
        assert_eq!(out, [0x0a]);

        // C.1.2: 1337 in a 5-bit prefix.
        let mut out = Vec::new();
        encode_integer(1337, 5, 0, &mut out);
        assert_eq!(out, [0x1f, 0x9a, 0x0a]);
        let mut pos = 0;
        assert_eq!(decode_integer(&out, &mut pos, 5).unwrap(), 1337);
    }

    #[test]
    fn malformed_blocks_rejected() {
        let mut decoder = Decoder::new();
        assert!(decoder.decode(&[0x80]).is_err()); // index 0
        assert!(decoder.decode(&[0xff]).is_err()); // truncated integer
        assert!(decoder.decode(&[0x40, 0x05, b'a']).is_err()); // truncated string
    }

    #[test]
    fn table_size_update_bounded() {
        let mut decoder = Decoder::new();
        // 0x3f then continuation: size 4096+ would exceed our limit.
        let mut block = Vec::new();
        encode_integer(8192, 5, 0x20, &mut block);
        assert!(decoder.decode(&block).is_err());

        let mut ok = Vec::new();
        encode_integer(0, 5, 0x20, &mut ok);
        decoder.decode(&ok).unwrap();
        assert_eq!(decoder.table.max_size(), 0);
    }
}
