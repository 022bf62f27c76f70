//! Flow-control windows.

use crate::error::{Error, Result};

/// The most a window may hold, per RFC 7540.
const MAX_WINDOW_SIZE: i64 = (1 << 31) - 1;

/// A send or receive window. May go negative when the peer shrinks
/// `SETTINGS_INITIAL_WINDOW_SIZE` mid-stream; writers stall until a
/// WINDOW_UPDATE brings it positive again.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FlowControl {
    available: i64,
}

impl FlowControl {
    pub(crate) fn new(initial: u32) -> FlowControl {
        FlowControl {
            available: initial as i64,
        }
    }

    pub(crate) fn available(&self) -> i64 {
        self.available
    }

    /// Grows the window from a WINDOW_UPDATE.
    pub(crate) fn grow(&mut self, increment: u32) -> Result<()> {
        let grown = self.available + increment as i64;
        if grown > MAX_WINDOW_SIZE {
            return Err(Error::new_protocol(
                "FLOW_CONTROL_ERROR window overflow",
            ));
        }
        self.available = grown;
        Ok(())
    }

    /// Consumes window for outgoing DATA.
    pub(crate) fn take(&mut self, amount: u32) {
        debug_assert!(self.available >= amount as i64);
        self.available -= amount as i64;
    }

    /// Applies a delta from a changed `SETTINGS_INITIAL_WINDOW_SIZE`.
    pub(crate) fn adjust(&mut self, delta: i64) {
        self.available += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_and_take() {
        let mut window = FlowControl::new(10);
        window.take(4);
        assert_eq!(window.available(), 6);
        window.grow(10).unwrap();
        assert_eq!(window.available(), 16);
    }

    #[test]
    fn overflow_is_an_error() {
        let mut window = FlowControl::new(u32::MAX >> 1);
        assert!(window.grow(u32::MAX >> 1).is_err());
    }

    #[test]
    fn settings_shrink_can_go_negative() {
        let mut window = FlowControl::new(100);
        window.adjust(-200);
        assert_eq!(window.available(), -100);
        window.grow(150).unwrap();
        assert_eq!(window.available(), 50);
    }
}
