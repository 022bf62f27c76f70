//! RFC 7540 frame layout: a 9-byte header (24-bit length, 8-bit type,
//! 8-bit flags, 31-bit stream id with a reserved bit) plus payload.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

pub(crate) const FRAME_HEADER_LEN: usize = 9;

/// The largest frame payload we will ever accept, regardless of SETTINGS.
pub(crate) const MAX_FRAME_SIZE_LIMIT: u32 = (1 << 24) - 1;

pub(crate) const DATA: u8 = 0x0;
pub(crate) const HEADERS: u8 = 0x1;
pub(crate) const PRIORITY: u8 = 0x2;
pub(crate) const RST_STREAM: u8 = 0x3;
pub(crate) const SETTINGS: u8 = 0x4;
pub(crate) const PUSH_PROMISE: u8 = 0x5;
pub(crate) const PING: u8 = 0x6;
pub(crate) const GOAWAY: u8 = 0x7;
pub(crate) const WINDOW_UPDATE: u8 = 0x8;
pub(crate) const CONTINUATION: u8 = 0x9;

pub(crate) mod flags {
    /// END_STREAM on DATA and HEADERS; ACK on SETTINGS and PING.
    pub(crate) const END_STREAM: u8 = 0x1;
    pub(crate) const ACK: u8 = 0x1;
    pub(crate) const END_HEADERS: u8 = 0x4;
    pub(crate) const PADDED: u8 = 0x8;
    pub(crate) const PRIORITY: u8 = 0x20;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub(crate) length: u32,
    pub(crate) kind: u8,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
}

impl FrameHeader {
    pub(crate) fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> FrameHeader {
        FrameHeader {
            length: u32::from_be_bytes([0, buf[0], buf[1], buf[2]]),
            kind: buf[3],
            flags: buf[4],
            // High bit is reserved; ignore it on receipt.
            stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        debug_assert!(self.length <= MAX_FRAME_SIZE_LIMIT);
        let len = self.length.to_be_bytes();
        dst.put_slice(&len[1..]);
        dst.put_u8(self.kind);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & 0x7fff_ffff);
    }

    pub(crate) fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Strips the pad-length prefix and trailing padding from a PADDED frame
/// payload.
pub(crate) fn strip_padding(payload: &mut BytesMut) -> Result<()> {
    if payload.is_empty() {
        return Err(frame_size_error("padded frame too short"));
    }
    let pad_len = payload.split_to(1)[0] as usize;
    if pad_len > payload.len() {
        return Err(Error::new_protocol(
            "PROTOCOL_ERROR padding is too large",
        ));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(())
}

pub(crate) fn frame_size_error(message: &'static str) -> Error {
    Error::new_protocol(format!("FRAME_SIZE_ERROR {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader {
            length: 0x01_0203,
            kind: HEADERS,
            flags: flags::END_HEADERS | flags::END_STREAM,
            stream_id: 77,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_LEN);
        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw.copy_from_slice(&buf);
        assert_eq!(FrameHeader::parse(&raw), header);
    }

    #[test]
    fn reserved_bit_ignored() {
        let raw = [0, 0, 0, DATA, 0, 0x80, 0, 0, 3];
        let header = FrameHeader::parse(&raw);
        assert_eq!(header.stream_id, 3);
    }

    #[test]
    fn padding_stripped() {
        let mut payload = BytesMut::from(&[2u8, b'h', b'i', 0, 0][..]);
        strip_padding(&mut payload).unwrap();
        assert_eq!(&payload[..], b"hi");

        let mut bad = BytesMut::from(&[9u8, b'x'][..]);
        assert!(strip_padding(&mut bad).is_err());
    }
}
