//! RFC 6455 frame reading and writing.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result, TimeoutStage};
use crate::timeout::timed;

use super::deflate::{MessageDeflater, MessageInflater};

pub(crate) const OPCODE_CONTINUATION: u8 = 0x0;
pub(crate) const OPCODE_TEXT: u8 = 0x1;
pub(crate) const OPCODE_BINARY: u8 = 0x2;
pub(crate) const OPCODE_CLOSE: u8 = 0x8;
pub(crate) const OPCODE_PING: u8 = 0x9;
pub(crate) const OPCODE_PONG: u8 = 0xa;

const B0_FLAG_FIN: u8 = 0x80;
const B0_FLAG_RSV1: u8 = 0x40;
const B0_FLAG_RSV2: u8 = 0x20;
const B0_FLAG_RSV3: u8 = 0x10;
const B0_MASK_OPCODE: u8 = 0x0f;
const B1_FLAG_MASK: u8 = 0x80;
const B1_MASK_LENGTH: u8 = 0x7f;

pub(crate) const PAYLOAD_BYTE_MAX: u64 = 125;
const PAYLOAD_SHORT: u8 = 126;
const PAYLOAD_LONG: u8 = 127;

/// Close code signaling no status was present.
pub(crate) const CLOSE_NO_STATUS_CODE: u16 = 1005;
/// Close code for an unacceptable extension negotiation.
pub(crate) const CLOSE_UNSUPPORTED_EXTENSION: u16 = 1010;
/// Max close reason length in UTF-8 bytes.
pub(crate) const CLOSE_MESSAGE_MAX: usize = 123;

/// Checks a caller-supplied close code against RFC 6455 section 7.4.
pub(crate) fn validate_close_code(code: u16) -> Result<()> {
    if !(1000..5000).contains(&code) {
        return Err(Error::new_close_reserved(format!(
            "Code must be in range [1000,5000): {}",
            code
        )));
    }
    if matches!(code, 1004 | 1005 | 1006 | 1015) {
        return Err(Error::new_close_reserved(format!(
            "Code {} is reserved and may not be used.",
            code
        )));
    }
    Ok(())
}

/// A fully-assembled incoming frame (data frames span fragments).
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

struct PartialMessage {
    opcode: u8,
    compressed: bool,
    buf: Vec<u8>,
}

/// Reads frames off the upgraded transport.
///
/// The read timeout does not run while awaiting the first byte of a new
/// frame; it arms once a frame header has begun.
pub(crate) struct WebSocketReader<R> {
    source: R,
    is_client: bool,
    read_timeout: Option<Duration>,
    inflater: Option<MessageInflater>,
    partial: Option<PartialMessage>,
}

impl<R: AsyncRead + Unpin> WebSocketReader<R> {
    pub(crate) fn new(
        is_client: bool,
        source: R,
        read_timeout: Option<Duration>,
        inflater: Option<MessageInflater>,
    ) -> WebSocketReader<R> {
        WebSocketReader {
            source,
            is_client,
            read_timeout,
            inflater,
            partial: None,
        }
    }

    /// Reads until a complete message or control frame is available.
    /// Control frames may interleave a fragmented message.
    pub(crate) async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            // No deadline on the first byte: idle sockets are fine.
            let mut b0_buf = [0u8; 1];
            self.source
                .read_exact(&mut b0_buf)
                .await
                .map_err(Error::new_io)?;
            let b0 = b0_buf[0];
            let b1 = self.read_u8_timed().await?;

            let fin = b0 & B0_FLAG_FIN != 0;
            let opcode = b0 & B0_MASK_OPCODE;
            let rsv1 = b0 & B0_FLAG_RSV1 != 0;
            if b0 & (B0_FLAG_RSV2 | B0_FLAG_RSV3) != 0 {
                return Err(Error::new_protocol("Reserved flags are unsupported."));
            }

            let masked = b1 & B1_FLAG_MASK != 0;
            if masked == self.is_client {
                // Frames a server sends must be unmasked; frames a client
                // sends must be masked.
                return Err(Error::new_protocol(if self.is_client {
                    "Server-sent frames must not be masked."
                } else {
                    "Client-sent frames must be masked."
                }));
            }

            let length = match b1 & B1_MASK_LENGTH {
                PAYLOAD_SHORT => {
                    let mut buf = [0u8; 2];
                    self.read_exact_timed(&mut buf).await?;
                    u16::from_be_bytes(buf) as u64
                }
                PAYLOAD_LONG => {
                    let mut buf = [0u8; 8];
                    self.read_exact_timed(&mut buf).await?;
                    let length = u64::from_be_bytes(buf);
                    if length >> 63 != 0 {
                        return Err(Error::new_protocol("Frame length overflow."));
                    }
                    length
                }
                short => short as u64,
            };

            let mask_key = if masked {
                let mut key = [0u8; 4];
                self.read_exact_timed(&mut key).await?;
                Some(key)
            } else {
                None
            };

            let is_control = opcode & 0x8 != 0;
            if is_control {
                if !fin {
                    return Err(Error::new_protocol("Control frames must be final."));
                }
                if length > PAYLOAD_BYTE_MAX {
                    return Err(Error::new_protocol(
                        "Control frame must be less than 125B.",
                    ));
                }
                if rsv1 {
                    return Err(Error::new_protocol("Unexpected rsv1 flag"));
                }
            }

            let mut payload = vec![0u8; length as usize];
            self.read_exact_timed(&mut payload).await?;
            if let Some(key) = mask_key {
                toggle_mask(&mut payload, key);
            }

            if is_control {
                return self.control_frame(opcode, payload);
            }

            match opcode {
                OPCODE_TEXT | OPCODE_BINARY => {
                    if self.partial.is_some() {
                        return Err(Error::new_protocol(format!(
                            "Expected continuation opcode. Got: {:#x}",
                            opcode
                        )));
                    }
                    if rsv1 && self.inflater.is_none() {
                        return Err(Error::new_protocol("Unexpected rsv1 flag"));
                    }
                    self.partial = Some(PartialMessage {
                        opcode,
                        compressed: rsv1,
                        buf: payload,
                    });
                }
                OPCODE_CONTINUATION => {
                    let partial = self.partial.as_mut().ok_or_else(|| {
                        Error::new_protocol("Unexpected continuation frame")
                    })?;
                    if rsv1 {
                        return Err(Error::new_protocol("Unexpected rsv1 flag"));
                    }
                    partial.buf.extend_from_slice(&payload);
                }
                opcode => {
                    return Err(Error::new_protocol(format!(
                        "Unknown opcode: {:#x}",
                        opcode
                    )))
                }
            }

            if fin {
                let partial = self.partial.take().expect("assembled message");
                let payload = if partial.compressed {
                    let inflater = self.inflater.as_mut().expect("negotiated inflater");
                    inflater.inflate(&partial.buf)?
                } else {
                    Bytes::from(partial.buf)
                };
                return match partial.opcode {
                    OPCODE_TEXT => {
                        let text = String::from_utf8(payload.to_vec()).map_err(|_| {
                            Error::new_protocol("Text message payload is not UTF-8")
                        })?;
                        Ok(Frame::Text(text))
                    }
                    _ => Ok(Frame::Binary(payload)),
                };
            }
        }
    }

    fn control_frame(&mut self, opcode: u8, payload: Vec<u8>) -> Result<Frame> {
        match opcode {
            OPCODE_PING => Ok(Frame::Ping(Bytes::from(payload))),
            OPCODE_PONG => Ok(Frame::Pong(Bytes::from(payload))),
            OPCODE_CLOSE => {
                let (code, reason) = match payload.len() {
                    0 => (CLOSE_NO_STATUS_CODE, String::new()),
                    1 => {
                        return Err(Error::new_protocol(
                            "Malformed close payload length of 1.",
                        ))
                    }
                    _ => {
                        let code = u16::from_be_bytes([payload[0], payload[1]]);
                        validate_close_code(code)
                            .map_err(|e| Error::new_protocol(e.to_string()))?;
                        let reason = String::from_utf8(payload[2..].to_vec()).map_err(|_| {
                            Error::new_protocol("Close reason is not UTF-8")
                        })?;
                        (code, reason)
                    }
                };
                Ok(Frame::Close { code, reason })
            }
            opcode => Err(Error::new_protocol(format!(
                "Unknown control opcode: {:#x}",
                opcode
            ))),
        }
    }

    async fn read_u8_timed(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_timed(&mut buf).await?;
        Ok(buf[0])
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<()> {
        let source = &mut self.source;
        timed(TimeoutStage::Read, self.read_timeout, async move {
            source.read_exact(buf).await.map_err(Error::new_io)?;
            Ok(())
        })
        .await
    }
}

/// Writes frames onto the upgraded transport. Client frames are masked
/// with a fresh random key per frame.
pub(crate) struct WebSocketWriter<W> {
    sink: W,
    is_client: bool,
    deflater: Option<MessageDeflater>,
    minimum_deflate_size: usize,
}

impl<W: AsyncWrite + Unpin> WebSocketWriter<W> {
    pub(crate) fn new(
        is_client: bool,
        sink: W,
        deflater: Option<MessageDeflater>,
        minimum_deflate_size: usize,
    ) -> WebSocketWriter<W> {
        WebSocketWriter {
            sink,
            is_client,
            deflater,
            minimum_deflate_size,
        }
    }

    pub(crate) async fn write_message(&mut self, opcode: u8, payload: Bytes) -> Result<()> {
        let mut b0 = B0_FLAG_FIN | opcode;
        let payload = match &mut self.deflater {
            Some(deflater) if payload.len() >= self.minimum_deflate_size => {
                b0 |= B0_FLAG_RSV1;
                deflater.deflate(&payload)?
            }
            _ => payload,
        };
        self.write_frame(b0, &payload).await
    }

    pub(crate) async fn write_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.write_control(OPCODE_PING, payload).await
    }

    pub(crate) async fn write_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.write_control(OPCODE_PONG, payload).await
    }

    /// Writes a CLOSE frame. Code zero with an empty reason writes an
    /// empty payload.
    pub(crate) async fn write_close(&mut self, code: u16, reason: &[u8]) -> Result<()> {
        let mut payload = Vec::new();
        if code != 0 || !reason.is_empty() {
            if code == 0 {
                return Err(Error::new_protocol("Code required to include reason."));
            }
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason);
        }
        self.write_control(OPCODE_CLOSE, &payload).await
    }

    async fn write_control(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > PAYLOAD_BYTE_MAX {
            return Err(Error::new_protocol("Payload size must be less than or equal to 125"));
        }
        self.write_frame(B0_FLAG_FIN | opcode, payload).await
    }

    async fn write_frame(&mut self, b0: u8, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 14);
        frame.push(b0);

        let mask_flag = if self.is_client { B1_FLAG_MASK } else { 0 };
        let length = payload.len() as u64;
        if length <= PAYLOAD_BYTE_MAX {
            frame.push(mask_flag | length as u8);
        } else if length <= u16::MAX as u64 {
            frame.push(mask_flag | PAYLOAD_SHORT);
            frame.extend_from_slice(&(length as u16).to_be_bytes());
        } else {
            frame.push(mask_flag | PAYLOAD_LONG);
            frame.extend_from_slice(&length.to_be_bytes());
        }

        if self.is_client {
            let key: [u8; 4] = rand::random();
            frame.extend_from_slice(&key);
            let start = frame.len();
            frame.extend_from_slice(payload);
            toggle_mask(&mut frame[start..], key);
        } else {
            frame.extend_from_slice(payload);
        }

        self.sink.write_all(&frame).await.map_err(Error::new_io)?;
        self.sink.flush().await.map_err(Error::new_io)?;
        Ok(())
    }
}

fn toggle_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= key[i % 4];
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

    async fn server_write(frames: Vec<(u8, Bytes)>, deflate: bool) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = WebSocketWriter::new(
                false,
                std::io::Cursor::new(&mut out),
                deflate.then(|| MessageDeflater::new(false)),
                0,
            );
            for (opcode, payload) in frames {
                writer.write_message(opcode, payload).await.unwrap();
            }
        }
        out
    }

    async fn client_read(raw: Vec<u8>, deflate: bool) -> Result<Frame> {
        let mut reader = WebSocketReader::new(
            true,
            std::io::Cursor::new(raw),
            None,
            deflate.then(|| MessageInflater::new(false)),
        );
        reader.next_frame().await
    }

    #[tokio::test]
    async fn round_trip_per_opcode_and_compression() {
        for deflate in [false, true] {
            for (opcode, payload) in [
                (OPCODE_TEXT, Bytes::from_static(b"hello")),
                (OPCODE_BINARY, Bytes::from_static(&[0u8, 1, 2, 255])),
                (OPCODE_TEXT, Bytes::from_static(b"")),
            ] {
                let raw = server_write(vec![(opcode, payload.clone())], deflate).await;
                let frame = client_read(raw, deflate).await.unwrap();
                match opcode {
                    OPCODE_TEXT => assert_eq!(
                        frame,
                        Frame::Text(String::from_utf8(payload.to_vec()).unwrap())
                    ),
                    _ => assert_eq!(frame, Frame::Binary(payload)),
                }
            }
        }
    }

    #[tokio::test]
    async fn masked_client_frames_read_by_server_reader() {
        let mut out = Vec::new();
        {
            let mut writer =
                WebSocketWriter::new(true, std::io::Cursor::new(&mut out), None, 1024);
            writer
                .write_message(OPCODE_TEXT, Bytes::from_static(b"masked payload"))
                .await
                .unwrap();
        }
        assert_eq!(out[1] & 0x80, 0x80); // MASK bit
        let mut reader =
            WebSocketReader::new(false, std::io::Cursor::new(out), None, None);
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Frame::Text("masked payload".to_string())
        );
    }

    #[tokio::test]
    async fn client_rejects_masked_server_frames() {
        let mut out = Vec::new();
        {
            let mut writer =
                WebSocketWriter::new(true, std::io::Cursor::new(&mut out), None, 1024);
            writer
                .write_message(OPCODE_TEXT, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let err = client_read(out, false).await.unwrap_err();
        assert!(err.to_string().contains("must not be masked"));
    }

    #[tokio::test]
    async fn compressed_hello_golden_frame() {
        let raw = server_write(vec![(OPCODE_TEXT, Bytes::from_static(b"Hello"))], true).await;
        // FIN|RSV1|text, length 7, then the stripped deflate block.
        assert_eq!(raw, hex("c107f248cdc9c90700"));
    }

    #[tokio::test]
    async fn fragmented_message_with_interleaved_ping() {
        // Hand-built: "Hel" (text, no FIN) + ping + "lo" (continuation, FIN).
        let mut raw = Vec::new();
        raw.extend_from_slice(&[0x01, 3]);
        raw.extend_from_slice(b"Hel");
        raw.extend_from_slice(&[0x89, 4]);
        raw.extend_from_slice(b"ping");
        raw.extend_from_slice(&[0x80, 2]);
        raw.extend_from_slice(b"lo");

        let mut reader =
            WebSocketReader::new(true, std::io::Cursor::new(raw), None, None);
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Frame::Ping(Bytes::from_static(b"ping"))
        );
        assert_eq!(reader.next_frame().await.unwrap(), Frame::Text("Hello".to_string()));
    }

    #[tokio::test]
    async fn close_frames() {
        // Empty close payload means "no status".
        let mut reader = WebSocketReader::new(
            true,
            std::io::Cursor::new(vec![0x88, 0x00]),
            None,
            None,
        );
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Frame::Close {
                code: CLOSE_NO_STATUS_CODE,
                reason: String::new()
            }
        );

        // One-byte close payload is malformed.
        let mut reader = WebSocketReader::new(
            true,
            std::io::Cursor::new(vec![0x88, 0x01, 0x03]),
            None,
            None,
        );
        assert!(reader.next_frame().await.is_err());

        // Code + reason.
        let mut raw = vec![0x88, 0x07];
        raw.extend_from_slice(&1000u16.to_be_bytes());
        raw.extend_from_slice(b"bye\xf0\x9f");
        raw.truncate(2 + 2 + 3);
        raw[1] = 5;
        let mut reader =
            WebSocketReader::new(true, std::io::Cursor::new(raw), None, None);
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Frame::Close {
                code: 1000,
                reason: "bye".to_string()
            }
        );
    }

    #[tokio::test]
    async fn control_frames_must_be_final_and_small() {
        // Non-FIN ping.
        let mut reader = WebSocketReader::new(
            true,
            std::io::Cursor::new(vec![0x09, 0x00]),
            None,
            None,
        );
        assert!(reader.next_frame().await.is_err());

        // Oversized ping (126 bytes).
        let mut raw = vec![0x89, 126, 0x00, 126];
        raw.extend_from_slice(&[0u8; 126]);
        let mut reader =
            WebSocketReader::new(true, std::io::Cursor::new(raw), None, None);
        assert!(reader.next_frame().await.is_err());
    }

    #[tokio::test]
    async fn unknown_opcodes_rejected() {
        let mut reader = WebSocketReader::new(
            true,
            std::io::Cursor::new(vec![0x83, 0x00]),
            None,
            None,
        );
        assert!(reader.next_frame().await.is_err());

        let mut reader = WebSocketReader::new(
            true,
            std::io::Cursor::new(vec![0x8b, 0x00]),
            None,
            None,
        );
        assert!(reader.next_frame().await.is_err());
    }

    #[test]
    fn close_code_validation() {
        assert!(validate_close_code(1000).is_ok());
        assert!(validate_close_code(4999).is_ok());
        for code in [0, 999, 5000, 1004, 1005, 1006, 1015] {
            let err = validate_close_code(code).unwrap_err();
            assert!(err.is_close_reserved(), "{}", code);
        }
        assert_eq!(
            validate_close_code(1005).unwrap_err().to_string(),
            "Code 1005 is reserved and may not be used."
        );
        assert_eq!(
            validate_close_code(0).unwrap_err().to_string(),
            "Code must be in range [1000,5000): 0"
        );
    }
}
