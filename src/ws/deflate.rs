//! permessage-deflate message transforms, RFC 7692.
//!
//! The deflater emits a sync-flushed block and strips the trailing
//! `00 00 FF FF`; the inflater appends it back before inflating. With
//! `no_context_takeover` the sliding window is reset between messages.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, Result};

const EMPTY_DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Bound on how large a single inflated message may grow.
const MAX_INFLATED_SIZE: usize = 64 * 1024 * 1024;

pub(crate) struct MessageDeflater {
    compress: Compress,
    no_context_takeover: bool,
}

impl MessageDeflater {
    pub(crate) fn new(no_context_takeover: bool) -> MessageDeflater {
        MessageDeflater {
            compress: Compress::new(Compression::default(), false),
            no_context_takeover,
        }
    }

    pub(crate) fn deflate(&mut self, data: &[u8]) -> Result<Bytes> {
        if self.no_context_takeover {
            self.compress.reset();
        }
        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        let start_in = self.compress.total_in();
        loop {
            out.reserve(256);
            let consumed = (self.compress.total_in() - start_in) as usize;
            self.compress
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::new_protocol(format!("deflate: {}", e)))?;
            let all_consumed = (self.compress.total_in() - start_in) as usize == data.len();
            // A sync flush is complete once output stops filling up.
            if all_consumed && out.len() < out.capacity() {
                break;
            }
        }
        if out.ends_with(&EMPTY_DEFLATE_TAIL) {
            out.truncate(out.len() - EMPTY_DEFLATE_TAIL.len());
        }
        Ok(Bytes::from(out))
    }
}

pub(crate) struct MessageInflater {
    decompress: Decompress,
    no_context_takeover: bool,
}

impl MessageInflater {
    pub(crate) fn new(no_context_takeover: bool) -> MessageInflater {
        MessageInflater {
            decompress: Decompress::new(false),
            no_context_takeover,
        }
    }

    pub(crate) fn inflate(&mut self, data: &[u8]) -> Result<Bytes> {
        if self.no_context_takeover {
            self.decompress.reset(false);
        }
        let mut input = Vec::with_capacity(data.len() + EMPTY_DEFLATE_TAIL.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&EMPTY_DEFLATE_TAIL);

        let mut out = Vec::with_capacity(data.len() * 2 + 16);
        let start_in = self.decompress.total_in();
        loop {
            out.reserve(1024);
            let consumed = (self.decompress.total_in() - start_in) as usize;
            self.decompress
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| Error::new_protocol(format!("inflate: {}", e)))?;
            let all_consumed = (self.decompress.total_in() - start_in) as usize == input.len();
            if all_consumed && out.len() < out.capacity() {
                break;
            }
            if out.len() > MAX_INFLATED_SIZE {
                return Err(Error::new_protocol("inflated message too large"));
            }
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn inflates_golden_payload() {
        let mut inflater = MessageInflater::new(false);
        let inflated = inflater
            .inflate(&hex("f248cdc9c957c8cc4bcb492cc9cccf530400"))
            .unwrap();
        assert_eq!(&inflated[..], b"Hello inflation!");
    }

    #[test]
    fn deflates_hello_to_golden_bytes() {
        let mut deflater = MessageDeflater::new(true);
        let deflated = deflater.deflate(b"Hello").unwrap();
        assert_eq!(&deflated[..], hex("f248cdc9c90700"));
    }

    #[test]
    fn context_takeover_round_trips_repeats() {
        let mut deflater = MessageDeflater::new(false);
        let mut inflater = MessageInflater::new(false);
        for _ in 0..3 {
            let deflated = deflater.deflate(b"repetitive message, repetitive message").unwrap();
            let inflated = inflater.inflate(&deflated).unwrap();
            assert_eq!(&inflated[..], b"repetitive message, repetitive message");
        }
    }

    #[test]
    fn no_context_takeover_resets_between_messages() {
        let mut deflater = MessageDeflater::new(true);
        let first = deflater.deflate(b"same message").unwrap();
        let second = deflater.deflate(b"same message").unwrap();
        assert_eq!(first, second);

        let mut inflater = MessageInflater::new(true);
        assert_eq!(&inflater.inflate(&first).unwrap()[..], b"same message");
        assert_eq!(&inflater.inflate(&second).unwrap()[..], b"same message");
    }

    #[test]
    fn empty_message() {
        let mut deflater = MessageDeflater::new(false);
        let mut inflater = MessageInflater::new(false);
        let deflated = deflater.deflate(b"").unwrap();
        assert_eq!(&inflater.inflate(&deflated).unwrap()[..], b"");
    }
}
