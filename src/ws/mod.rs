//! Client-side WebSockets, RFC 6455, with permessage-deflate (RFC 7692).
//!
//! The upgrade rides the ordinary call machinery; a 101 response hands the
//! raw connection over. Afterward a reader task and a writer task share the
//! socket: outgoing messages go through a bounded queue the writer drains,
//! pings run on their own cadence, and the close handshake walks
//! `OPEN -> SENT_CLOSE | RECEIVED_CLOSE -> CLOSED`.

pub(crate) mod deflate;
pub(crate) mod extension;
pub(crate) mod frame;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::client::call::Call;
use crate::client::conn::Connection;
use crate::client::Client;
use crate::error::{Error, Result, TimeoutStage};
use crate::proto::CancelHandle;
use crate::request::Request;
use crate::response::Response;

use self::deflate::{MessageDeflater, MessageInflater};
use self::extension::WebSocketExtensions;
use self::frame::{
    validate_close_code, Frame, WebSocketReader, WebSocketWriter, CLOSE_MESSAGE_MAX,
    CLOSE_UNSUPPORTED_EXTENSION, OPCODE_BINARY, OPCODE_TEXT,
};

const ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Aggregate size of queued outgoing messages before sends are refused.
const MAX_QUEUE_SIZE: usize = 16 * 1024 * 1024;

/// Messages below this size are never compressed.
const DEFAULT_MINIMUM_DEFLATE_SIZE: usize = 1024;

/// How long to await the peer's close frame after sending ours.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Receives WebSocket lifecycle events. All methods default to no-ops.
#[allow(unused_variables)]
pub trait WebSocketListener: Send + Sync + 'static {
    /// The handshake succeeded and messages may flow.
    fn on_open(&self, web_socket: &WebSocket, response: &Response) {}
    /// A complete text message arrived.
    fn on_text(&self, web_socket: &WebSocket, text: &str) {}
    /// A complete binary message arrived.
    fn on_binary(&self, web_socket: &WebSocket, bytes: &[u8]) {}
    /// The peer initiated (or acknowledged) the close handshake.
    fn on_closing(&self, web_socket: &WebSocket, code: u16, reason: &str) {}
    /// Both peers have closed; the transport is gone.
    fn on_closed(&self, web_socket: &WebSocket, code: u16, reason: &str) {}
    /// The socket died: handshake failure, protocol violation, IO error,
    /// cancellation, or an expired timer. Delivered at most once.
    fn on_failure(&self, web_socket: &WebSocket, error: &Error, response: Option<&Response>) {}
}

/// A full-duplex WebSocket handle. Cheap to clone.
#[derive(Clone)]
pub struct WebSocket {
    shared: Arc<WsShared>,
}

struct WsShared {
    client: Client,
    original_request: Request,
    listener: Arc<dyn WebSocketListener>,
    key: String,
    state: StdMutex<WsState>,
    writer_notify: Notify,
}

#[derive(Default)]
struct WsState {
    call: Option<Call>,
    queue_size: usize,
    messages: VecDeque<QueuedMessage>,
    pongs: VecDeque<Bytes>,
    enqueued_close: bool,
    sent_close: bool,
    received_close: Option<(u16, String)>,
    failed: bool,
    finished: bool,
    awaiting_pong: bool,
    received_pongs: u64,
    cancel: Option<CancelHandle>,
    connection: Option<Arc<Connection>>,
}

enum QueuedMessage {
    Text(String),
    Binary(Bytes),
    Close { code: u16, reason: String },
}

impl WebSocket {
    /// The request this socket was opened with.
    pub fn request(&self) -> &Request {
        &self.shared.original_request
    }

    /// The aggregate byte size of messages waiting to be written.
    pub fn queue_size(&self) -> usize {
        self.shared.lock().queue_size
    }

    /// Enqueues a text message. Returns false if the socket is closing,
    /// failed, or the outgoing queue is full.
    pub fn send_text(&self, text: &str) -> bool {
        self.send(QueuedMessage::Text(text.to_string()), text.len())
    }

    /// Enqueues a binary message. Returns false if the socket is closing,
    /// failed, or the outgoing queue is full.
    pub fn send_bytes(&self, bytes: Bytes) -> bool {
        let size = bytes.len();
        self.send(QueuedMessage::Binary(bytes), size)
    }

    fn send(&self, message: QueuedMessage, size: usize) -> bool {
        let mut state = self.shared.lock();
        if state.failed || state.finished || state.enqueued_close {
            return false;
        }
        if state.queue_size + size > MAX_QUEUE_SIZE {
            drop(state);
            // The peer isn't keeping up; walk away.
            let _ = self.close(1001, None);
            return false;
        }
        state.queue_size += size;
        state.messages.push_back(message);
        drop(state);
        self.shared.writer_notify.notify_waiters();
        true
    }

    /// Initiates the close handshake. Data messages enqueued after this are
    /// refused; pings and pongs still flow until the peer confirms.
    ///
    /// Errors on a reserved or out-of-range code, or a reason longer than
    /// 123 UTF-8 bytes. Returns false if a close was already enqueued or
    /// the socket is done.
    pub fn close(&self, code: u16, reason: Option<&str>) -> Result<bool> {
        validate_close_code(code)?;
        let reason = reason.unwrap_or("");
        if reason.len() > CLOSE_MESSAGE_MAX {
            return Err(Error::new_protocol(format!(
                "reason.size() > {}: {}",
                CLOSE_MESSAGE_MAX, reason
            )));
        }

        let mut state = self.shared.lock();
        if state.failed || state.finished || state.enqueued_close {
            return Ok(false);
        }
        state.enqueued_close = true;
        state.messages.push_back(QueuedMessage::Close {
            code,
            reason: reason.to_string(),
        });
        drop(state);
        self.shared.writer_notify.notify_waiters();

        // If the peer never confirms, tear the transport down.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let this = self.clone();
            handle.spawn(async move {
                tokio::time::sleep(CLOSE_TIMEOUT).await;
                let pending = !this.shared.lock().finished;
                if pending {
                    this.shared.fail(
                        &this,
                        Error::new_timeout(TimeoutStage::Read).with_message(format!(
                            "didn't receive the close frame within {}ms",
                            CLOSE_TIMEOUT.as_millis()
                        )),
                        None,
                    );
                }
            });
        }
        Ok(true)
    }

    /// Immediately and violently releases the socket, discarding queued
    /// messages.
    pub fn cancel(&self) {
        debug!("canceling web socket");
        let (call, cancel) = {
            let mut state = self.shared.lock();
            state.messages.clear();
            state.queue_size = 0;
            (state.call.clone(), state.cancel.clone())
        };
        if let Some(call) = call {
            call.cancel();
        }
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.shared.writer_notify.notify_waiters();
    }
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("url", &self.shared.original_request.url().redact())
            .finish()
    }
}

/// Starts the upgrade in the background and returns the handle.
pub(crate) fn connect(
    client: Client,
    request: Request,
    listener: Arc<dyn WebSocketListener>,
) -> WebSocket {
    let key = BASE64.encode(rand::random::<[u8; 16]>());
    let shared = Arc::new(WsShared {
        client,
        original_request: request,
        listener,
        key,
        state: StdMutex::new(WsState::default()),
        writer_notify: Notify::new(),
    });
    let web_socket = WebSocket {
        shared: shared.clone(),
    };
    let task_socket = web_socket.clone();
    tokio::spawn(async move {
        if let Err(e) = run_connect(&task_socket).await {
            task_socket.shared.fail(&task_socket, e, None);
        }
    });
    web_socket
}

impl WsShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, WsState> {
        self.state.lock().expect("web socket lock")
    }

    /// Tears down the transport and releases the connection. Idempotent.
    fn teardown(&self) {
        let (cancel, connection) = {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            (state.cancel.take(), state.connection.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(connection) = connection {
            connection.close();
            self.client.connection_pool().release(&connection);
        }
        self.writer_notify.notify_waiters();
    }

    /// Fails the socket, notifying the listener at most once.
    fn fail(&self, web_socket: &WebSocket, error: Error, response: Option<&Response>) {
        {
            let mut state = self.lock();
            if state.failed {
                return;
            }
            state.failed = true;
        }
        debug!("web socket failed: {}", error);
        self.teardown();
        self.listener.on_failure(web_socket, &error, response);
    }
}

async fn run_connect(web_socket: &WebSocket) -> Result<()> {
    let shared = &web_socket.shared;
    let request = &shared.original_request;

    if request.header("Sec-WebSocket-Extensions").is_some() {
        return Err(Error::new_protocol(
            "Sec-WebSocket-Extensions is managed by the web socket itself",
        ));
    }

    let upgrade_request = request
        .new_builder()
        .header("Upgrade", "websocket")?
        .header("Connection", "Upgrade")?
        .header("Sec-WebSocket-Key", &shared.key)?
        .header("Sec-WebSocket-Version", "13")?
        .header("Sec-WebSocket-Extensions", "permessage-deflate")?
        .build()?;

    let call = Call::new(shared.client.clone(), upgrade_request, true);
    shared.lock().call = Some(call.clone());

    let response = call.execute().await?;
    if let Err(e) = check_upgrade(&response, &shared.key) {
        shared.fail(web_socket, e, Some(&response));
        return Ok(());
    }

    let extensions = WebSocketExtensions::parse(response.headers());
    let (io, connection) = call.take_upgrade().await?;
    // The call machinery is done; the socket outlives any call deadline.
    call.mark_completed();
    let (transport, read_buf, cancel) = io.into_parts();
    {
        let mut state = shared.lock();
        state.cancel = Some(cancel);
        state.connection = Some(connection);
        state.call = None;
    }

    let (read_half, write_half) = tokio::io::split(transport);
    let timeouts = shared.client.timeouts();
    let mut writer = WebSocketWriter::new(
        true,
        write_half,
        extensions
            .per_message_deflate
            .then(|| MessageDeflater::new(extensions.client_no_context_takeover)),
        DEFAULT_MINIMUM_DEFLATE_SIZE,
    );

    if !extensions.is_valid() {
        // Tell the peer why before hanging up.
        let _ = writer
            .write_close(
                CLOSE_UNSUPPORTED_EXTENSION,
                b"unexpected Sec-WebSocket-Extensions",
            )
            .await;
        shared.fail(
            web_socket,
            Error::new_protocol(format!(
                "unexpected Sec-WebSocket-Extensions: {}",
                response.header("Sec-WebSocket-Extensions").unwrap_or("")
            )),
            Some(&response),
        );
        return Ok(());
    }

    let reader = WebSocketReader::new(
        true,
        Rewind::new(read_buf, read_half),
        timeouts.read,
        extensions
            .per_message_deflate
            .then(|| MessageInflater::new(extensions.server_no_context_takeover)),
    );

    shared.listener.on_open(web_socket, &response);
    drop(response);

    let reader_socket = web_socket.clone();
    tokio::spawn(async move { run_reader(reader_socket, reader).await });
    let writer_socket = web_socket.clone();
    tokio::spawn(async move { run_writer(writer_socket, writer, timeouts.ping).await });
    Ok(())
}

/// Validates the 101 response per RFC 6455 section 4.1.
fn check_upgrade(response: &Response, key: &str) -> Result<()> {
    if response.code() != 101 {
        return Err(Error::new_protocol(format!(
            "Expected HTTP 101 response but was '{} {}'",
            response.code(),
            response.message()
        )));
    }
    let connection = response.header("Connection").unwrap_or("");
    if !connection.eq_ignore_ascii_case("Upgrade")
        && !response.headers().contains_value("Connection", "Upgrade")
    {
        return Err(Error::new_protocol(format!(
            "Expected 'Connection' header value 'Upgrade' but was '{}'",
            connection
        )));
    }
    let upgrade = response.header("Upgrade").unwrap_or("");
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::new_protocol(format!(
            "Expected 'Upgrade' header value 'websocket' but was '{}'",
            upgrade
        )));
    }
    let expected = accept_header(key);
    let actual = response.header("Sec-WebSocket-Accept").unwrap_or("");
    if actual != expected {
        return Err(Error::new_protocol(format!(
            "Expected 'Sec-WebSocket-Accept' header value '{}' but was '{}'",
            expected, actual
        )));
    }
    Ok(())
}

fn accept_header(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(ACCEPT_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

async fn run_reader<R: AsyncRead + Unpin>(web_socket: WebSocket, mut reader: WebSocketReader<R>) {
    let shared = web_socket.shared.clone();
    loop {
        if shared.lock().finished {
            return;
        }
        match reader.next_frame().await {
            Ok(Frame::Text(text)) => shared.listener.on_text(&web_socket, &text),
            Ok(Frame::Binary(bytes)) => shared.listener.on_binary(&web_socket, &bytes),
            Ok(Frame::Ping(payload)) => {
                trace!("received ping");
                let mut state = shared.lock();
                if !state.finished {
                    state.pongs.push_back(payload);
                    drop(state);
                    shared.writer_notify.notify_waiters();
                }
            }
            Ok(Frame::Pong(_)) => {
                let mut state = shared.lock();
                state.awaiting_pong = false;
                state.received_pongs += 1;
            }
            Ok(Frame::Close { code, reason }) => {
                shared.listener.on_closing(&web_socket, code, &reason);
                let finish = {
                    let mut state = shared.lock();
                    state.received_close = Some((code, reason.clone()));
                    if state.sent_close {
                        true
                    } else {
                        // Reply in kind; the writer completes the handshake.
                        if !state.enqueued_close {
                            state.enqueued_close = true;
                            state.messages.push_back(QueuedMessage::Close {
                                code,
                                reason: reason.clone(),
                            });
                        }
                        false
                    }
                };
                if finish {
                    shared.teardown();
                    shared.listener.on_closed(&web_socket, code, &reason);
                    return;
                }
                shared.writer_notify.notify_waiters();
            }
            Err(e) => {
                if !shared.lock().finished {
                    shared.fail(&web_socket, e, None);
                }
                return;
            }
        }
    }
}

async fn run_writer<W: tokio::io::AsyncWrite + Unpin>(
    web_socket: WebSocket,
    mut writer: WebSocketWriter<W>,
    ping_interval: Option<Duration>,
) {
    let shared = web_socket.shared.clone();
    let mut ticker = ping_interval.map(tokio::time::interval);
    if let Some(ticker) = &mut ticker {
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick
    }

    loop {
        // Register before draining so a message enqueued mid-drain still
        // wakes the next wait.
        let notified = shared.writer_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !drain_queue(&web_socket, &mut writer).await {
            return;
        }
        match &mut ticker {
            Some(ticker) => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = ticker.tick() => {
                        if !write_ping(&web_socket, &mut writer, ping_interval.expect("interval")).await {
                            return;
                        }
                    }
                }
            }
            None => notified.await,
        }
    }
}

/// Writes everything queued. Returns false once the socket is done.
async fn drain_queue<W: tokio::io::AsyncWrite + Unpin>(
    web_socket: &WebSocket,
    writer: &mut WebSocketWriter<W>,
) -> bool {
    let shared = &web_socket.shared;
    loop {
        enum Job {
            Pong(Bytes),
            Message(QueuedMessage),
        }
        let job = {
            let mut state = shared.lock();
            if state.finished || state.failed {
                return false;
            }
            if let Some(payload) = state.pongs.pop_front() {
                Job::Pong(payload)
            } else if let Some(message) = state.messages.pop_front() {
                if let QueuedMessage::Text(text) = &message {
                    state.queue_size = state.queue_size.saturating_sub(text.len());
                } else if let QueuedMessage::Binary(bytes) = &message {
                    state.queue_size = state.queue_size.saturating_sub(bytes.len());
                }
                Job::Message(message)
            } else {
                return true;
            }
        };

        let result = match job {
            Job::Pong(payload) => writer.write_pong(&payload).await,
            Job::Message(QueuedMessage::Text(text)) => {
                writer
                    .write_message(OPCODE_TEXT, Bytes::from(text))
                    .await
            }
            Job::Message(QueuedMessage::Binary(bytes)) => {
                writer.write_message(OPCODE_BINARY, bytes).await
            }
            Job::Message(QueuedMessage::Close { code, reason }) => {
                let result = writer.write_close(code, reason.as_bytes()).await;
                if result.is_ok() {
                    let received = {
                        let mut state = shared.lock();
                        state.sent_close = true;
                        state.received_close.clone()
                    };
                    if let Some((code, reason)) = received {
                        // The peer closed first; our reply completes the
                        // handshake.
                        shared.teardown();
                        shared.listener.on_closed(web_socket, code, &reason);
                        return false;
                    }
                }
                result
            }
        };
        if let Err(e) = result {
            shared.fail(web_socket, e, None);
            return false;
        }
    }
}

/// Sends a keepalive ping, or fails the connection if the previous ping
/// was never answered.
async fn write_ping<W: tokio::io::AsyncWrite + Unpin>(
    web_socket: &WebSocket,
    writer: &mut WebSocketWriter<W>,
    interval: Duration,
) -> bool {
    let shared = &web_socket.shared;
    let failed_pong = {
        let mut state = shared.lock();
        if state.finished || state.failed {
            return false;
        }
        if state.awaiting_pong {
            Some(state.received_pongs)
        } else {
            state.awaiting_pong = true;
            None
        }
    };

    if let Some(received_pongs) = failed_pong {
        shared.fail(
            web_socket,
            Error::new_timeout(TimeoutStage::Ping).with_message(format!(
                "sent ping but didn't receive pong within {}ms (after {} successful ping/pongs)",
                interval.as_millis(),
                received_pongs
            )),
            None,
        );
        return false;
    }

    trace!("sending keepalive ping");
    if let Err(e) = writer.write_ping(&[]).await {
        shared.fail(web_socket, e, None);
        return false;
    }
    true
}

/// Serves buffered bytes left over from the HTTP response head before
/// reading from the upgraded transport.
struct Rewind<R> {
    pre: BytesMut,
    inner: R,
}

impl<R> Rewind<R> {
    fn new(pre: BytesMut, inner: R) -> Rewind<R> {
        Rewind { pre, inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Rewind<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.pre.is_empty() {
            let n = self.pre.len().min(buf.remaining());
            buf.put_slice(&self.pre.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_header_digest() {
        // RFC 6455 section 1.3 sample handshake.
        assert_eq!(
            accept_header("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_response_validation() {
        use crate::proto::Protocol;
        use crate::response::ResponseBuilder;
        use crate::url::Url;

        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let request = Request::get(Url::parse("http://example.com/chat").unwrap());
        let good = ResponseBuilder::new()
            .request(request.clone())
            .protocol(Protocol::Http11)
            .code(101)
            .header("Connection", "Upgrade")
            .unwrap()
            .header("Upgrade", "websocket")
            .unwrap()
            .header("Sec-WebSocket-Accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
            .unwrap()
            .build()
            .unwrap();
        assert!(check_upgrade(&good, key).is_ok());

        let wrong_code = ResponseBuilder::new()
            .request(request.clone())
            .protocol(Protocol::Http11)
            .code(200)
            .message("OK")
            .build()
            .unwrap();
        let err = check_upgrade(&wrong_code, key).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Expected HTTP 101 response but was '200 OK'"
        );

        let bad_accept = ResponseBuilder::new()
            .request(request)
            .protocol(Protocol::Http11)
            .code(101)
            .header("Connection", "Upgrade")
            .unwrap()
            .header("Upgrade", "websocket")
            .unwrap()
            .header("Sec-WebSocket-Accept", "bogus")
            .unwrap()
            .build()
            .unwrap();
        assert!(check_upgrade(&bad_accept, key).is_err());
    }

    #[tokio::test]
    async fn rewind_serves_buffered_bytes_first() {
        use tokio::io::AsyncReadExt;

        let pre = BytesMut::from(&b"pre"[..]);
        let mut rewind = Rewind::new(pre, std::io::Cursor::new(b"rest".to_vec()));
        let mut out = Vec::new();
        rewind.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"prerest");
    }

    #[test]
    fn close_code_and_reason_validation_at_the_api() {
        // Validation happens before any socket exists, so a bare handle is
        // enough.
        let client = Client::new();
        struct Quiet;
        impl WebSocketListener for Quiet {}
        let request = Request::get(crate::url::Url::parse("http://example.com/ws").unwrap());
        let shared = Arc::new(WsShared {
            client,
            original_request: request,
            listener: Arc::new(Quiet),
            key: String::new(),
            state: StdMutex::new(WsState::default()),
            writer_notify: Notify::new(),
        });
        let ws = WebSocket { shared };

        assert!(ws.close(1005, None).unwrap_err().is_close_reserved());
        assert!(ws.close(0, None).unwrap_err().is_close_reserved());
        let long = "X".repeat(124);
        let err = ws.close(1000, Some(&long)).unwrap_err();
        assert!(err.to_string().starts_with("reason.size() > 123:"));
    }
}
