//! SETTINGS frames: the per-peer parameter set and its wire codec.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

use super::frame::MAX_FRAME_SIZE_LIMIT;

const HEADER_TABLE_SIZE: u16 = 0x1;
const ENABLE_PUSH: u16 = 0x2;
const MAX_CONCURRENT_STREAMS: u16 = 0x3;
const INITIAL_WINDOW_SIZE: u16 = 0x4;
const MAX_FRAME_SIZE: u16 = 0x5;
const MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// One peer's settings. Values hold their RFC 7540 defaults until a
/// SETTINGS frame (and only an acknowledged one, on the sending side)
/// replaces them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) header_table_size: u32,
    pub(crate) enable_push: bool,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: u32,
    pub(crate) max_frame_size: u32,
    pub(crate) max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            header_table_size: 4_096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: super::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: 16_384,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// The settings this client announces: push disabled, defaults
    /// otherwise.
    pub(crate) fn client_default() -> Settings {
        Settings {
            enable_push: false,
            ..Settings::default()
        }
    }

    /// Applies a received SETTINGS payload on top of these settings.
    pub(crate) fn apply(&mut self, mut payload: &[u8]) -> Result<()> {
        if payload.len() % 6 != 0 {
            return Err(Error::new_protocol("FRAME_SIZE_ERROR bad settings length"));
        }
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            match id {
                HEADER_TABLE_SIZE => self.header_table_size = value,
                ENABLE_PUSH => {
                    self.enable_push = match value {
                        0 => false,
                        1 => true,
                        _ => {
                            return Err(Error::new_protocol(
                                "PROTOCOL_ERROR bad SETTINGS_ENABLE_PUSH",
                            ))
                        }
                    }
                }
                MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > i32::MAX as u32 {
                        return Err(Error::new_protocol(
                            "FLOW_CONTROL_ERROR bad SETTINGS_INITIAL_WINDOW_SIZE",
                        ));
                    }
                    self.initial_window_size = value;
                }
                MAX_FRAME_SIZE => {
                    if !(16_384..=MAX_FRAME_SIZE_LIMIT).contains(&value) {
                        return Err(Error::new_protocol(
                            "PROTOCOL_ERROR bad SETTINGS_MAX_FRAME_SIZE",
                        ));
                    }
                    self.max_frame_size = value;
                }
                MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
                _ => {} // unknown settings are ignored
            }
        }
        Ok(())
    }

    /// Encodes the parameters that differ from the defaults.
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let defaults = Settings::default();
        let mut put = |id: u16, value: u32| {
            dst.put_u16(id);
            dst.put_u32(value);
        };
        if self.header_table_size != defaults.header_table_size {
            put(HEADER_TABLE_SIZE, self.header_table_size);
        }
        if self.enable_push != defaults.enable_push {
            put(ENABLE_PUSH, self.enable_push as u32);
        }
        if let Some(value) = self.max_concurrent_streams {
            put(MAX_CONCURRENT_STREAMS, value);
        }
        if self.initial_window_size != defaults.initial_window_size {
            put(INITIAL_WINDOW_SIZE, self.initial_window_size);
        }
        if self.max_frame_size != defaults.max_frame_size {
            put(MAX_FRAME_SIZE, self.max_frame_size);
        }
        if let Some(value) = self.max_header_list_size {
            put(MAX_HEADER_LIST_SIZE, value);
        }
    }
}
