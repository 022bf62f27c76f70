//! Per-stream state kept by the connection's demultiplexer.

use bytes::Bytes;
use tokio::sync::mpsc;

use super::flow::FlowControl;
use super::ErrorCode;

/// What the connection reader delivers onto a stream's event queue.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// A decoded HEADERS block (response head or informational).
    Headers {
        headers: Vec<(String, String)>,
        end_stream: bool,
    },
    /// A DATA frame's payload.
    Data { data: Bytes, end_stream: bool },
    /// A HEADERS block arriving after the response head: trailers.
    Trailers(Vec<(String, String)>),
    /// The peer reset the stream.
    Reset(ErrorCode),
    /// The connection died under the stream.
    ConnectionError(String),
}

/// The connection's book-keeping for one open stream.
pub(crate) struct StreamHandle {
    pub(crate) events: mpsc::UnboundedSender<StreamEvent>,
    pub(crate) send_window: FlowControl,
    /// Set once the response head (a non-informational HEADERS) arrived;
    /// later HEADERS blocks are trailers.
    pub(crate) headers_received: bool,
    pub(crate) local_closed: bool,
    pub(crate) remote_closed: bool,
    /// DATA bytes delivered to the queue but not yet consumed by the
    /// application. Released back to the connection window if the stream
    /// dies unread.
    pub(crate) delivered_unconsumed: u64,
    /// Consumed bytes not yet returned to the peer via WINDOW_UPDATE.
    pub(crate) unacked_consumed: u64,
}

impl StreamHandle {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<StreamEvent>,
        initial_window: u32,
    ) -> StreamHandle {
        StreamHandle {
            events,
            send_window: FlowControl::new(initial_window),
            headers_received: false,
            local_closed: false,
            remote_closed: false,
            delivered_unconsumed: 0,
            unacked_consumed: 0,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.local_closed && self.remote_closed
    }
}
