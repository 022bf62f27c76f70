//! The HTTP/2 connection: preface, a dedicated reader task that
//! demultiplexes frames onto per-stream queues, a mutex-serialized writer,
//! keepalive pings, and graceful GOAWAY shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};
use tracing::{debug, trace};

use crate::error::{Error, Result, TimeoutStage};
use crate::headers::Headers;
use crate::proto::{CancelHandle, Transport};
use crate::request::Request;
use crate::timeout::timed;

use super::flow::FlowControl;
use super::frame::{self, flags, FrameHeader, FRAME_HEADER_LEN};
use super::hpack;
use super::settings::Settings;
use super::stream::{StreamEvent, StreamHandle};
use super::{ErrorCode, CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE};

/// Return half the window once this many consumed bytes are unacked.
const WINDOW_UPDATE_THRESHOLD: u64 = (DEFAULT_INITIAL_WINDOW_SIZE / 2) as u64;

/// A handle to one HTTP/2 connection, cheaply cloneable. Dropping handles
/// does not close the connection; [`close`](H2Connection::close) does.
#[derive(Clone)]
pub(crate) struct H2Connection {
    shared: Arc<Shared>,
}

struct Shared {
    writer: TokioMutex<FrameWriter>,
    state: StdMutex<ConnState>,
    /// Signaled when any send window grows or the connection dies.
    window_notify: Notify,
    control: mpsc::UnboundedSender<Control>,
    cancel: CancelHandle,
}

struct ConnState {
    next_stream_id: u32,
    streams: HashMap<u32, StreamHandle>,
    send_window: FlowControl,
    conn_unacked_consumed: u64,
    peer_settings: Settings,
    local_settings: Settings,
    local_settings_acked: bool,
    goaway: Option<u32>,
    closed: bool,
    awaiting_pong: bool,
}

enum Control {
    Ping { ack: bool, payload: [u8; 8] },
    Rst { stream_id: u32, code: ErrorCode },
    WindowUpdate { stream_id: u32, increment: u32 },
    SettingsAck,
    GoAway { code: ErrorCode },
    /// Ends the control-writer task once the connection is dead.
    Shutdown,
}

struct FrameWriter {
    io: WriteHalf<Box<dyn Transport>>,
    encoder: hpack::Encoder,
    buf: BytesMut,
}

impl FrameWriter {
    async fn write_frame(
        &mut self,
        kind: u8,
        frame_flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> std::io::Result<()> {
        trace!(
            ">> frame kind={} flags={:#x} stream={} len={}",
            kind,
            frame_flags,
            stream_id,
            payload.len()
        );
        self.buf.clear();
        FrameHeader {
            length: payload.len() as u32,
            kind,
            flags: frame_flags,
            stream_id,
        }
        .encode(&mut self.buf);
        self.buf.extend_from_slice(payload);
        self.io.write_all(&self.buf).await?;
        self.io.flush().await
    }

    /// HPACK-encodes and writes a header block as HEADERS plus as many
    /// CONTINUATION frames as the peer's frame size requires.
    async fn write_headers(
        &mut self,
        stream_id: u32,
        headers: &[(String, String)],
        end_stream: bool,
        max_frame_size: usize,
    ) -> std::io::Result<()> {
        let mut block = Vec::new();
        self.encoder.encode(headers, &mut block);

        let mut first = true;
        let mut rest = &block[..];
        loop {
            let take = rest.len().min(max_frame_size);
            let (chunk, remaining) = rest.split_at(take);
            rest = remaining;
            let mut frame_flags = 0;
            if rest.is_empty() {
                frame_flags |= flags::END_HEADERS;
            }
            let kind = if first {
                if end_stream {
                    frame_flags |= flags::END_STREAM;
                }
                frame::HEADERS
            } else {
                frame::CONTINUATION
            };
            self.write_frame(kind, frame_flags, stream_id, chunk).await?;
            first = false;
            if rest.is_empty() {
                return Ok(());
            }
        }
    }
}

impl H2Connection {
    /// Sends the client preface and SETTINGS, then starts the reader,
    /// control-writer, and (optionally) keepalive tasks.
    pub(crate) async fn handshake(
        transport: Box<dyn Transport>,
        cancel: CancelHandle,
        ping_interval: Option<Duration>,
    ) -> Result<H2Connection> {
        let (read_half, mut write_half) = tokio::io::split(transport);

        let local_settings = Settings::client_default();
        let mut preface = BytesMut::from(CONNECTION_PREFACE);
        let mut settings_payload = BytesMut::new();
        local_settings.encode(&mut settings_payload);
        FrameHeader {
            length: settings_payload.len() as u32,
            kind: frame::SETTINGS,
            flags: 0,
            stream_id: 0,
        }
        .encode(&mut preface);
        preface.extend_from_slice(&settings_payload);
        write_half.write_all(&preface).await.map_err(Error::new_io)?;
        write_half.flush().await.map_err(Error::new_io)?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            writer: TokioMutex::new(FrameWriter {
                io: write_half,
                encoder: hpack::Encoder::new(),
                buf: BytesMut::new(),
            }),
            state: StdMutex::new(ConnState {
                next_stream_id: 1,
                streams: HashMap::new(),
                send_window: FlowControl::new(DEFAULT_INITIAL_WINDOW_SIZE),
                conn_unacked_consumed: 0,
                peer_settings: Settings::default(),
                local_settings,
                local_settings_acked: false,
                goaway: None,
                closed: false,
                awaiting_pong: false,
            }),
            window_notify: Notify::new(),
            control: control_tx,
            cancel,
        });

        tokio::spawn(run_control_writer(shared.clone(), control_rx));
        tokio::spawn(run_reader(shared.clone(), read_half));
        if let Some(interval) = ping_interval {
            tokio::spawn(run_keepalive(shared.clone(), interval));
        }

        Ok(H2Connection { shared })
    }

    /// Returns false once the connection saw GOAWAY, an error, or close.
    pub(crate) fn is_healthy(&self) -> bool {
        let state = self.lock_state();
        !state.closed && state.goaway.is_none() && !self.shared.cancel.is_canceled()
    }

    pub(crate) fn received_goaway(&self) -> bool {
        self.lock_state().goaway.is_some()
    }

    pub(crate) fn active_streams(&self) -> usize {
        self.lock_state().streams.len()
    }

    /// The peer's stream allocation bound, from its SETTINGS.
    pub(crate) fn max_concurrent_streams(&self) -> u32 {
        self.lock_state()
            .peer_settings
            .max_concurrent_streams
            .unwrap_or(u32::MAX)
    }

    /// Shuts the connection down: GOAWAY, cancel, fail every stream.
    pub(crate) fn close(&self, code: ErrorCode) {
        let _ = self.shared.control.send(Control::GoAway { code });
        fail_connection(&self.shared, format!("connection closed: {}", code));
        self.shared.cancel.cancel();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ConnState> {
        self.shared.state.lock().expect("h2 state lock")
    }

    /// Allocates a stream id and writes its HEADERS, both under the writer
    /// lock so ids reach the wire in increasing order.
    async fn open_stream(
        &self,
        headers: Vec<(String, String)>,
        end_stream: bool,
    ) -> Result<(u32, mpsc::UnboundedReceiver<StreamEvent>)> {
        let mut writer = self.shared.writer.lock().await;
        let (stream_id, events, max_frame_size) = {
            let mut state = self.lock_state();
            if state.closed || self.shared.cancel.is_canceled() {
                return Err(Error::new_io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "connection is closed",
                )));
            }
            if state.goaway.is_some() {
                // Peer is draining; new work must go elsewhere.
                return Err(Error::new_refused_stream());
            }
            let stream_id = state.next_stream_id;
            state.next_stream_id += 2;
            let (tx, rx) = mpsc::unbounded_channel();
            let initial_window = state.peer_settings.initial_window_size;
            let mut handle = StreamHandle::new(tx, initial_window);
            handle.local_closed = end_stream;
            state.streams.insert(stream_id, handle);
            (stream_id, rx, state.peer_settings.max_frame_size as usize)
        };
        trace!("opening stream {}", stream_id);
        if let Err(e) = writer
            .write_headers(stream_id, &headers, end_stream, max_frame_size)
            .await
        {
            self.lock_state().streams.remove(&stream_id);
            return Err(Error::new_io(e));
        }
        Ok((stream_id, events))
    }

    /// Writes DATA, blocking while the stream or connection window is
    /// empty. Wakes on WINDOW_UPDATE.
    async fn write_data(&self, stream_id: u32, mut data: &[u8], end_stream: bool) -> Result<()> {
        loop {
            // Register for window growth before inspecting the windows, so
            // an update landing in between still wakes us.
            let notified = self.shared.window_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let reserved = {
                let mut state = self.lock_state();
                let state = &mut *state;
                if state.closed {
                    return Err(Error::new_io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "connection is closed",
                    )));
                }
                let max_frame = state.peer_settings.max_frame_size as i64;
                let conn_window = state.send_window.available();
                let stream = match state.streams.get_mut(&stream_id) {
                    Some(stream) => stream,
                    None => return Err(Error::new_protocol("stream is closed")),
                };
                let allowed = conn_window
                    .min(stream.send_window.available())
                    .min(max_frame)
                    .min(data.len() as i64);
                if allowed > 0 {
                    let allowed = allowed as u32;
                    stream.send_window.take(allowed);
                    state.send_window.take(allowed);
                    Some(allowed as usize)
                } else if data.is_empty() {
                    Some(0)
                } else {
                    None
                }
            };

            match reserved {
                Some(len) => {
                    let (chunk, rest) = data.split_at(len);
                    data = rest;
                    let last = data.is_empty();
                    let frame_flags = if last && end_stream {
                        flags::END_STREAM
                    } else {
                        0
                    };
                    let mut writer = self.shared.writer.lock().await;
                    writer
                        .write_frame(frame::DATA, frame_flags, stream_id, chunk)
                        .await
                        .map_err(Error::new_io)?;
                    drop(writer);
                    if last {
                        if end_stream {
                            let mut state = self.lock_state();
                            if let Some(stream) = state.streams.get_mut(&stream_id) {
                                stream.local_closed = true;
                            }
                        }
                        return Ok(());
                    }
                }
                None => {
                    trace!("stream {} blocked on flow control", stream_id);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.shared.cancel.canceled() => return Err(Error::new_canceled()),
                    }
                }
            }
        }
    }

    async fn write_trailers(&self, stream_id: u32, trailers: Vec<(String, String)>) -> Result<()> {
        let max_frame_size = self.lock_state().peer_settings.max_frame_size as usize;
        let mut writer = self.shared.writer.lock().await;
        writer
            .write_headers(stream_id, &trailers, true, max_frame_size)
            .await
            .map_err(Error::new_io)?;
        let mut state = self.lock_state();
        if let Some(stream) = state.streams.get_mut(&stream_id) {
            stream.local_closed = true;
        }
        Ok(())
    }

    /// Records that the application consumed body bytes, replenishing
    /// receive windows once enough accumulate. Called after consumption,
    /// not on receipt, so the window exerts backpressure.
    fn consumed(&self, stream_id: u32, amount: u64) {
        let mut state = self.lock_state();
        state.conn_unacked_consumed += amount;
        if state.conn_unacked_consumed >= WINDOW_UPDATE_THRESHOLD {
            let increment = state.conn_unacked_consumed as u32;
            state.conn_unacked_consumed = 0;
            let _ = self.shared.control.send(Control::WindowUpdate {
                stream_id: 0,
                increment,
            });
        }
        if let Some(stream) = state.streams.get_mut(&stream_id) {
            stream.delivered_unconsumed = stream.delivered_unconsumed.saturating_sub(amount);
            if !stream.remote_closed {
                stream.unacked_consumed += amount;
                if stream.unacked_consumed >= WINDOW_UPDATE_THRESHOLD {
                    let increment = stream.unacked_consumed as u32;
                    stream.unacked_consumed = 0;
                    let _ = self.shared.control.send(Control::WindowUpdate {
                        stream_id,
                        increment,
                    });
                }
            }
        }
    }

    /// Cancels one stream from outside the codec (`Call::cancel`).
    pub(crate) fn reset_stream(&self, stream_id: u32) {
        self.reset(stream_id, ErrorCode::CANCEL);
    }

    /// Resets a stream (RST_STREAM) and forgets it.
    fn reset(&self, stream_id: u32, code: ErrorCode) {
        let _ = self.shared.control.send(Control::Rst { stream_id, code });
        self.forget(stream_id);
    }

    /// Removes a completed stream, releasing any window its queue held.
    fn forget(&self, stream_id: u32) {
        let mut state = self.lock_state();
        if let Some(stream) = state.streams.remove(&stream_id) {
            state.conn_unacked_consumed += stream.delivered_unconsumed;
            if state.conn_unacked_consumed >= WINDOW_UPDATE_THRESHOLD {
                let increment = state.conn_unacked_consumed as u32;
                state.conn_unacked_consumed = 0;
                let _ = self.shared.control.send(Control::WindowUpdate {
                    stream_id: 0,
                    increment,
                });
            }
        }
    }
}

async fn run_control_writer(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Control>) {
    while let Some(control) = rx.recv().await {
        let mut writer = shared.writer.lock().await;
        let result = match control {
            Control::Ping { ack, payload } => {
                let frame_flags = if ack { flags::ACK } else { 0 };
                writer.write_frame(frame::PING, frame_flags, 0, &payload).await
            }
            Control::Rst { stream_id, code } => {
                writer
                    .write_frame(frame::RST_STREAM, 0, stream_id, &code.0.to_be_bytes())
                    .await
            }
            Control::WindowUpdate {
                stream_id,
                increment,
            } => {
                writer
                    .write_frame(
                        frame::WINDOW_UPDATE,
                        0,
                        stream_id,
                        &(increment & 0x7fff_ffff).to_be_bytes(),
                    )
                    .await
            }
            Control::SettingsAck => {
                writer
                    .write_frame(frame::SETTINGS, flags::ACK, 0, &[])
                    .await
            }
            Control::GoAway { code } => {
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&0u32.to_be_bytes());
                payload.extend_from_slice(&code.0.to_be_bytes());
                writer.write_frame(frame::GOAWAY, 0, 0, &payload).await
            }
            Control::Shutdown => break,
        };
        if result.is_err() {
            break;
        }
    }
}

async fn run_keepalive(shared: Arc<Shared>, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    timer.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            _ = timer.tick() => {}
            _ = shared.cancel.canceled() => return,
        }
        let fail = {
            let mut state = shared.state.lock().expect("h2 state lock");
            if state.closed {
                return;
            }
            if state.awaiting_pong {
                true
            } else {
                state.awaiting_pong = true;
                false
            }
        };
        if fail {
            debug!("keepalive ping timed out");
            fail_connection(&shared, "sent ping but didn't receive pong".to_string());
            shared.cancel.cancel();
            return;
        }
        let _ = shared.control.send(Control::Ping {
            ack: false,
            payload: [0; 8],
        });
    }
}

async fn run_reader(shared: Arc<Shared>, mut io: ReadHalf<Box<dyn Transport>>) {
    let mut decoder = hpack::Decoder::new();
    let result = read_loop(&shared, &mut io, &mut decoder).await;
    let message = match &result {
        Ok(()) => "connection closed by peer".to_string(),
        Err(e) => e.to_string(),
    };
    debug!("h2 reader finished: {}", message);
    if result.is_err() {
        let _ = shared.control.send(Control::GoAway {
            code: ErrorCode::PROTOCOL_ERROR,
        });
    }
    fail_connection(&shared, message);
}

/// Marks the connection dead and fails every live stream exactly once.
fn fail_connection(shared: &Shared, message: String) {
    let mut state = shared.state.lock().expect("h2 state lock");
    if state.closed {
        return;
    }
    state.closed = true;
    for (_, stream) in state.streams.drain() {
        let _ = stream
            .events
            .send(StreamEvent::ConnectionError(message.clone()));
    }
    drop(state);
    shared.window_notify.notify_waiters();
    let _ = shared.control.send(Control::Shutdown);
}

async fn read_loop(
    shared: &Arc<Shared>,
    io: &mut ReadHalf<Box<dyn Transport>>,
    decoder: &mut hpack::Decoder,
) -> Result<()> {
    // A header block spanning CONTINUATION frames, being assembled.
    let mut continuation: Option<(FrameHeader, Vec<u8>)> = None;

    loop {
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        read_exact(io, &mut header_buf, &shared.cancel).await?;
        let header = FrameHeader::parse(&header_buf);
        trace!(
            "<< frame kind={} flags={:#x} stream={} len={}",
            header.kind,
            header.flags,
            header.stream_id,
            header.length
        );

        let max = shared
            .state
            .lock()
            .expect("h2 state lock")
            .local_settings
            .max_frame_size;
        if header.length > max {
            return Err(frame::frame_size_error("frame exceeds SETTINGS_MAX_FRAME_SIZE"));
        }
        let mut payload = BytesMut::zeroed(header.length as usize);
        read_exact(io, &mut payload, &shared.cancel).await?;

        if let Some((first, mut block)) = continuation.take() {
            // Only CONTINUATION for the same stream may interleave here.
            if header.kind != frame::CONTINUATION || header.stream_id != first.stream_id {
                return Err(Error::new_protocol(
                    "PROTOCOL_ERROR expected CONTINUATION frame",
                ));
            }
            block.extend_from_slice(&payload);
            if header.has_flag(flags::END_HEADERS) {
                deliver_headers(shared, decoder, &first, &block)?;
            } else {
                continuation = Some((first, block));
            }
            continue;
        }

        match header.kind {
            frame::DATA => handle_data(shared, &header, payload)?,
            frame::HEADERS => {
                let mut payload = payload;
                if header.has_flag(flags::PADDED) {
                    frame::strip_padding(&mut payload)?;
                }
                if header.has_flag(flags::PRIORITY) {
                    if payload.len() < 5 {
                        return Err(frame::frame_size_error("HEADERS too short for priority"));
                    }
                    payload.advance(5);
                }
                if header.has_flag(flags::END_HEADERS) {
                    deliver_headers(shared, decoder, &header, &payload)?;
                } else {
                    continuation = Some((header, payload.to_vec()));
                }
            }
            frame::PRIORITY => {}
            frame::RST_STREAM => {
                if payload.len() != 4 {
                    return Err(frame::frame_size_error("bad RST_STREAM length"));
                }
                let code = ErrorCode(u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]));
                debug!("stream {} reset by peer: {}", header.stream_id, code);
                let mut state = shared.state.lock().expect("h2 state lock");
                if let Some(stream) = state.streams.remove(&header.stream_id) {
                    state.conn_unacked_consumed += stream.delivered_unconsumed;
                    let _ = stream.events.send(StreamEvent::Reset(code));
                }
            }
            frame::SETTINGS => {
                if header.has_flag(flags::ACK) {
                    let mut state = shared.state.lock().expect("h2 state lock");
                    state.local_settings_acked = true;
                    continue;
                }
                let mut state = shared.state.lock().expect("h2 state lock");
                let old_window = state.peer_settings.initial_window_size;
                state.peer_settings.apply(&payload)?;
                let delta = state.peer_settings.initial_window_size as i64 - old_window as i64;
                if delta != 0 {
                    for stream in state.streams.values_mut() {
                        stream.send_window.adjust(delta);
                    }
                }
                drop(state);
                let _ = shared.control.send(Control::SettingsAck);
                shared.window_notify.notify_waiters();
            }
            frame::PUSH_PROMISE => {
                // Push is disabled in our SETTINGS; refuse defensively while
                // keeping the HPACK state coherent.
                let mut payload = payload;
                if header.has_flag(flags::PADDED) {
                    frame::strip_padding(&mut payload)?;
                }
                if payload.len() < 4 {
                    return Err(frame::frame_size_error("bad PUSH_PROMISE length"));
                }
                let promised = u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]) & 0x7fff_ffff;
                decoder.decode(&payload[4..])?;
                let _ = shared.control.send(Control::Rst {
                    stream_id: promised,
                    code: ErrorCode::REFUSED_STREAM,
                });
            }
            frame::PING => {
                if payload.len() != 8 {
                    return Err(frame::frame_size_error("bad PING length"));
                }
                if header.has_flag(flags::ACK) {
                    let mut state = shared.state.lock().expect("h2 state lock");
                    state.awaiting_pong = false;
                } else {
                    let mut echo = [0u8; 8];
                    echo.copy_from_slice(&payload);
                    let _ = shared.control.send(Control::Ping {
                        ack: true,
                        payload: echo,
                    });
                }
            }
            frame::GOAWAY => {
                if payload.len() < 8 {
                    return Err(frame::frame_size_error("bad GOAWAY length"));
                }
                let last_stream_id = u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]) & 0x7fff_ffff;
                let code = ErrorCode(u32::from_be_bytes([
                    payload[4], payload[5], payload[6], payload[7],
                ]));
                debug!("received GOAWAY last_stream={} {}", last_stream_id, code);
                let mut state = shared.state.lock().expect("h2 state lock");
                state.goaway = Some(last_stream_id);
                // Streams past the peer's cutoff never ran; they are safe
                // to retry elsewhere.
                let refused: Vec<u32> = state
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| *id > last_stream_id)
                    .collect();
                for id in refused {
                    if let Some(stream) = state.streams.remove(&id) {
                        let _ = stream
                            .events
                            .send(StreamEvent::Reset(ErrorCode::REFUSED_STREAM));
                    }
                }
            }
            frame::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(frame::frame_size_error("bad WINDOW_UPDATE length"));
                }
                let increment = u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]) & 0x7fff_ffff;
                if increment == 0 {
                    return Err(Error::new_protocol(
                        "PROTOCOL_ERROR zero window increment",
                    ));
                }
                let mut state = shared.state.lock().expect("h2 state lock");
                if header.stream_id == 0 {
                    state.send_window.grow(increment)?;
                } else if let Some(stream) = state.streams.get_mut(&header.stream_id) {
                    stream.send_window.grow(increment)?;
                }
                drop(state);
                shared.window_notify.notify_waiters();
            }
            _ => {} // unknown frame types are ignored
        }
    }
}

fn handle_data(shared: &Arc<Shared>, header: &FrameHeader, payload: BytesMut) -> Result<()> {
    let mut payload = payload;
    if header.has_flag(flags::PADDED) {
        frame::strip_padding(&mut payload)?;
    }
    if header.stream_id == 0 {
        return Err(Error::new_protocol("PROTOCOL_ERROR DATA on stream 0"));
    }
    let end_stream = header.has_flag(flags::END_STREAM);
    let len = payload.len() as u64;

    let mut state = shared.state.lock().expect("h2 state lock");
    if let Some(stream) = state.streams.get_mut(&header.stream_id) {
        stream.delivered_unconsumed += len;
        if end_stream {
            stream.remote_closed = true;
        }
        let _ = stream.events.send(StreamEvent::Data {
            data: payload.freeze(),
            end_stream,
        });
        // The stream stays in the table until its codec consumes the
        // queued events and forgets it; removal here would double-count
        // the window accounting.
        return Ok(());
    }
    // Data for a stream we already forgot: hand its window back
    // immediately so the connection doesn't stall.
    state.conn_unacked_consumed += len;
    if state.conn_unacked_consumed >= WINDOW_UPDATE_THRESHOLD {
        let increment = state.conn_unacked_consumed as u32;
        state.conn_unacked_consumed = 0;
        let _ = shared.control.send(Control::WindowUpdate {
            stream_id: 0,
            increment,
        });
    }
    Ok(())
}

fn deliver_headers(
    shared: &Arc<Shared>,
    decoder: &mut hpack::Decoder,
    header: &FrameHeader,
    block: &[u8],
) -> Result<()> {
    let headers = decoder.decode(block)?;
    let end_stream = header.has_flag(flags::END_STREAM);

    let mut state = shared.state.lock().expect("h2 state lock");
    let stream = match state.streams.get_mut(&header.stream_id) {
        Some(stream) => stream,
        None => return Ok(()), // forgotten stream; HPACK state already updated
    };
    let event = if stream.headers_received {
        StreamEvent::Trailers(headers)
    } else {
        // Informational heads don't finalize the stream's head.
        let code = headers
            .iter()
            .find(|(n, _)| n == ":status")
            .and_then(|(_, v)| v.parse::<u16>().ok());
        if !matches!(code, Some(c) if (100..200).contains(&c)) {
            stream.headers_received = true;
        }
        StreamEvent::Headers {
            headers,
            end_stream,
        }
    };
    if end_stream {
        stream.remote_closed = true;
    }
    let _ = stream.events.send(event);
    Ok(())
}

async fn read_exact(
    io: &mut ReadHalf<Box<dyn Transport>>,
    buf: &mut [u8],
    cancel: &CancelHandle,
) -> Result<()> {
    tokio::select! {
        read = io.read_exact(buf) => {
            read.map_err(Error::new_io)?;
            Ok(())
        }
        _ = cancel.canceled() => Err(Error::new_canceled()),
    }
}

// ===== impl Http2Codec =====

/// One exchange bound to one HTTP/2 stream.
pub(crate) struct Http2Codec {
    conn: H2Connection,
    stream_id: u32,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    read_timeout: Option<Duration>,
    trailers: Headers,
    remote_done: bool,
    has_body: bool,
    finished: bool,
}

impl std::fmt::Debug for Http2Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Codec")
            .field("stream_id", &self.stream_id)
            .field("remote_done", &self.remote_done)
            .field("has_body", &self.has_body)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Http2Codec {
    /// Opens a stream and sends the request head.
    pub(crate) async fn send_request(
        conn: &H2Connection,
        request: &Request,
        read_timeout: Option<Duration>,
    ) -> Result<Http2Codec> {
        let has_body = request.body().is_some();
        let headers = request_headers(request);
        let (stream_id, events) = conn.open_stream(headers, !has_body).await?;
        Ok(Http2Codec {
            conn: conn.clone(),
            stream_id,
            events,
            read_timeout,
            trailers: Headers::new(),
            remote_done: false,
            has_body,
            finished: false,
        })
    }

    pub(crate) fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub(crate) async fn write_request_body(&mut self, data: &[u8]) -> Result<()> {
        self.conn.write_data(self.stream_id, data, false).await
    }

    pub(crate) async fn finish_request(&mut self) -> Result<()> {
        if self.has_body {
            self.conn.write_data(self.stream_id, &[], true).await?;
        }
        Ok(())
    }

    /// Reads the response head. `Ok(None)` reports an interim 100 when the
    /// caller asked to expect one.
    pub(crate) async fn read_response_headers(
        &mut self,
        expect_continue: bool,
    ) -> Result<Option<(u16, Headers)>> {
        loop {
            let event = self.next_event().await?;
            match event {
                StreamEvent::Headers {
                    headers,
                    end_stream,
                } => {
                    let code = status_of(&headers)?;
                    if (100..200).contains(&code) {
                        if code == 100 && expect_continue {
                            return Ok(None);
                        }
                        continue;
                    }
                    self.remote_done = end_stream;
                    let mut builder = Headers::builder();
                    for (name, value) in headers {
                        if !name.starts_with(':') {
                            builder = builder.add_lenient_pair(&name, &value);
                        }
                    }
                    return Ok(Some((code, builder.build())));
                }
                StreamEvent::Data { .. } => {
                    return Err(Error::new_protocol("PROTOCOL_ERROR data before headers"));
                }
                StreamEvent::Trailers(_) => {
                    return Err(Error::new_protocol("PROTOCOL_ERROR trailers before headers"));
                }
                StreamEvent::Reset(code) => {
                    self.finished = true;
                    return Err(reset_error(code));
                }
                StreamEvent::ConnectionError(message) => {
                    self.finished = true;
                    return Err(connection_error(message));
                }
            }
        }
    }

    /// Reads the next body chunk, or `None` once the stream half-closes.
    pub(crate) async fn read_body_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.remote_done {
            self.finish_stream();
            return Ok(None);
        }
        let event = self.next_event().await?;
        match event {
            StreamEvent::Data { data, end_stream } => {
                self.conn.consumed(self.stream_id, data.len() as u64);
                if end_stream {
                    self.remote_done = true;
                    self.finish_stream();
                }
                if data.is_empty() && end_stream {
                    return Ok(None);
                }
                Ok(Some(data))
            }
            StreamEvent::Trailers(trailers) => {
                let mut builder = Headers::builder();
                for (name, value) in trailers {
                    builder = builder.add_lenient_pair(&name, &value);
                }
                self.trailers = builder.build();
                self.remote_done = true;
                self.finish_stream();
                Ok(None)
            }
            StreamEvent::Headers { .. } => {
                Err(Error::new_protocol("PROTOCOL_ERROR headers after body"))
            }
            StreamEvent::Reset(code) => {
                self.finished = true;
                Err(reset_error(code))
            }
            StreamEvent::ConnectionError(message) => {
                self.finished = true;
                Err(connection_error(message))
            }
        }
    }

    pub(crate) fn trailers(&self) -> Headers {
        self.trailers.clone()
    }

    /// Resets the stream if it is still live; used by `cancel` and by body
    /// closure before the body finished.
    pub(crate) fn cancel(&self) {
        if !self.finished {
            self.conn.reset(self.stream_id, ErrorCode::CANCEL);
        }
    }

    fn finish_stream(&mut self) {
        if !self.finished {
            self.finished = true;
            self.conn.forget(self.stream_id);
        }
    }

    async fn next_event(&mut self) -> Result<StreamEvent> {
        let events = &mut self.events;
        timed(TimeoutStage::Read, self.read_timeout, async move {
            events.recv().await.ok_or_else(|| {
                connection_error("connection is closed".to_string())
            })
        })
        .await
    }
}

fn status_of(headers: &[(String, String)]) -> Result<u16> {
    headers
        .iter()
        .find(|(n, _)| n == ":status")
        .and_then(|(_, v)| v.parse::<u16>().ok())
        .ok_or_else(|| Error::new_protocol("PROTOCOL_ERROR missing :status"))
}

fn reset_error(code: ErrorCode) -> Error {
    match code {
        ErrorCode::REFUSED_STREAM => Error::new_refused_stream(),
        ErrorCode::CANCEL => Error::new_canceled(),
        code => Error::new_protocol(format!("stream was reset: {}", code)),
    }
}

fn connection_error(message: String) -> Error {
    Error::new_io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, message))
}

/// Lowers a request into an HTTP/2 header list: pseudo-headers first, then
/// regular headers lowercased, with connection-specific headers dropped.
fn request_headers(request: &Request) -> Vec<(String, String)> {
    let url = request.url();
    let mut target = url.encoded_path();
    if let Some(query) = url.encoded_query() {
        target.push('?');
        target.push_str(&query);
    }
    let mut headers = vec![
        (":method".to_string(), request.method().as_str().to_string()),
        (":path".to_string(), target),
        (":scheme".to_string(), url.scheme().to_string()),
        (":authority".to_string(), url.host_header()),
    ];
    for (name, value) in request.headers().iter() {
        let lower = name.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "connection"
                | "host"
                | "keep-alive"
                | "proxy-connection"
                | "te"
                | "transfer-encoding"
                | "upgrade"
        ) {
            continue;
        }
        headers.push((lower, value.to_string()));
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::Url;

    /// Reads and discards the client preface plus its SETTINGS frame, then
    /// answers with empty SETTINGS.
    async fn accept_preface(server: &mut tokio::io::DuplexStream) {
        let mut preface = vec![0u8; CONNECTION_PREFACE.len()];
        server.read_exact(&mut preface).await.unwrap();
        assert_eq!(preface, CONNECTION_PREFACE);
        let header = read_frame_header(server).await;
        assert_eq!(header.kind, frame::SETTINGS);
        let mut payload = vec![0u8; header.length as usize];
        server.read_exact(&mut payload).await.unwrap();
        write_frame(server, frame::SETTINGS, 0, 0, &[]).await;
    }

    async fn read_frame_header(server: &mut tokio::io::DuplexStream) -> FrameHeader {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        server.read_exact(&mut buf).await.unwrap();
        FrameHeader::parse(&buf)
    }

    /// Reads frames until one of `kind`, skipping interleaved control
    /// frames (SETTINGS ACKs, WINDOW_UPDATEs).
    async fn read_frame_of_kind(
        server: &mut tokio::io::DuplexStream,
        kind: u8,
    ) -> (FrameHeader, Vec<u8>) {
        loop {
            let header = read_frame_header(server).await;
            let mut payload = vec![0u8; header.length as usize];
            server.read_exact(&mut payload).await.unwrap();
            if header.kind == kind {
                return (header, payload);
            }
        }
    }

    async fn write_frame(
        server: &mut tokio::io::DuplexStream,
        kind: u8,
        frame_flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) {
        let mut buf = BytesMut::new();
        FrameHeader {
            length: payload.len() as u32,
            kind,
            flags: frame_flags,
            stream_id,
        }
        .encode(&mut buf);
        buf.extend_from_slice(payload);
        server.write_all(&buf).await.unwrap();
    }

    fn get_request(path: &str) -> Request {
        Request::builder()
            .url(Url::parse(&format!("https://example.com{}", path)).unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn full_stream_round_trip() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let conn = H2Connection::handshake(Box::new(client), CancelHandle::new(), None)
            .await
            .unwrap();
        accept_preface(&mut server).await;

        let mut codec = Http2Codec::send_request(&conn, &get_request("/hello"), None)
            .await
            .unwrap();
        assert_eq!(codec.stream_id(), 1);

        // Server: read the HEADERS frame and decode the request head.
        let (header, block) = read_frame_of_kind(&mut server, frame::HEADERS).await;
        assert!(header.has_flag(flags::END_STREAM));
        let request_headers = hpack::Decoder::new().decode(&block).unwrap();
        assert!(request_headers.contains(&(":method".to_string(), "GET".to_string())));
        assert!(request_headers.contains(&(":path".to_string(), "/hello".to_string())));
        assert!(request_headers.contains(&(":scheme".to_string(), "https".to_string())));

        // Server: respond with headers and a body.
        let mut encoder = hpack::Encoder::new();
        let mut response_block = Vec::new();
        encoder.encode(
            &[
                (":status".to_string(), "200".to_string()),
                ("content-type".to_string(), "text/plain".to_string()),
            ],
            &mut response_block,
        );
        write_frame(&mut server, frame::HEADERS, flags::END_HEADERS, 1, &response_block).await;
        write_frame(&mut server, frame::DATA, flags::END_STREAM, 1, b"hi there").await;

        let (code, headers) = codec.read_response_headers(false).await.unwrap().unwrap();
        assert_eq!(code, 200);
        assert_eq!(headers.get("content-type"), Some("text/plain"));

        let mut body = Vec::new();
        while let Some(chunk) = codec.read_body_chunk().await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"hi there");
        assert_eq!(conn.active_streams(), 0);
    }

    #[tokio::test]
    async fn refused_stream_surfaces_as_retryable() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let conn = H2Connection::handshake(Box::new(client), CancelHandle::new(), None)
            .await
            .unwrap();
        accept_preface(&mut server).await;

        let mut codec = Http2Codec::send_request(&conn, &get_request("/"), None)
            .await
            .unwrap();
        let _ = read_frame_of_kind(&mut server, frame::HEADERS).await;

        write_frame(
            &mut server,
            frame::RST_STREAM,
            0,
            1,
            &ErrorCode::REFUSED_STREAM.0.to_be_bytes(),
        )
        .await;

        let err = codec.read_response_headers(false).await.unwrap_err();
        assert!(err.is_refused_stream());
    }

    #[tokio::test]
    async fn goaway_refuses_new_streams() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let conn = H2Connection::handshake(Box::new(client), CancelHandle::new(), None)
            .await
            .unwrap();
        accept_preface(&mut server).await;

        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&ErrorCode::NO_ERROR.0.to_be_bytes());
        write_frame(&mut server, frame::GOAWAY, 0, 0, &payload).await;

        // Wait until the reader has applied the GOAWAY.
        for _ in 0..100 {
            if conn.received_goaway() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(conn.received_goaway());
        assert!(!conn.is_healthy());
        let err = Http2Codec::send_request(&conn, &get_request("/"), None)
            .await
            .unwrap_err();
        assert!(err.is_refused_stream());
    }

    #[tokio::test]
    async fn unsolicited_ping_is_echoed() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let _conn = H2Connection::handshake(Box::new(client), CancelHandle::new(), None)
            .await
            .unwrap();
        accept_preface(&mut server).await;

        let payload = [1, 2, 3, 4, 5, 6, 7, 8];
        write_frame(&mut server, frame::PING, 0, 0, &payload).await;

        // Skip the client's SETTINGS ACK, then expect the PING ACK.
        loop {
            let header = read_frame_header(&mut server).await;
            let mut body = vec![0u8; header.length as usize];
            server.read_exact(&mut body).await.unwrap();
            if header.kind == frame::PING {
                assert!(header.has_flag(flags::ACK));
                assert_eq!(body, payload);
                break;
            }
        }
    }

    #[test]
    fn request_headers_lowering() {
        let request = Request::builder()
            .url(Url::parse("https://example.com/a?b=1").unwrap())
            .header("Accept", "*/*")
            .unwrap()
            .header("Connection", "keep-alive")
            .unwrap()
            .header("Host", "ignored.example.com")
            .unwrap()
            .build()
            .unwrap();
        let headers = request_headers(&request);
        assert_eq!(headers[0], (":method".to_string(), "GET".to_string()));
        assert_eq!(headers[1], (":path".to_string(), "/a?b=1".to_string()));
        assert_eq!(headers[2], (":scheme".to_string(), "https".to_string()));
        assert_eq!(
            headers[3],
            (":authority".to_string(), "example.com".to_string())
        );
        assert!(headers.iter().any(|(n, _)| n == "accept"));
        assert!(!headers.iter().any(|(n, _)| n == "connection"));
        assert!(!headers.iter().any(|(n, _)| n == "host"));
    }
}
