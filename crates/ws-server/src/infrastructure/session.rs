//! Per-connection session: handshake, read loop, writer task and teardown.
//!
//! Each accepted TCP stream gets one session task, which owns the stream for
//! its whole life:
//!
//! 1. Register the connection (or answer `503` when the server is full).
//! 2. Read and validate the upgrade request (or answer `400`), then send
//!    `101 Switching Protocols`.
//! 3. Split the stream.  The write half goes to a dedicated writer task that
//!    drains the connection's outbound queue; the read half stays here.
//! 4. Decode frames, reassemble messages and dispatch them until the peer
//!    closes, something fails, or a close is requested through the
//!    connection's cancellation token.
//! 5. Tear down exactly once: flush a close frame, wait for the peer's close
//!    reply when the server spoke first, remove the registry entry, and
//!    report the end of the connection to the host.
//!
//! Callbacks for a connection always run on its session task, in the order
//! the frames arrived.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ws_core::protocol::handshake::{
    accept_response, find_request_end, parse_upgrade_request, reject_response, MAX_REQUEST_SIZE,
};
use ws_core::{
    decode_frame, DecodeLimits, Frame, HandshakeError, Incoming, MessageAssembler, Opcode,
};

use super::connection::{Connection, Outbound, SendError};
use super::registry::ConnectionRegistry;
use crate::application::dispatcher::EventDispatcher;
use crate::config::ServerConfig;
use crate::error::CloseCause;

/// How long a rejected connection is drained before it is dropped.
const REJECT_LINGER: Duration = Duration::from_millis(250);

/// Everything a session needs from its server.
#[derive(Debug)]
pub(crate) struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<EventDispatcher>,
}

/// Why a connection never reached the open phase.
#[derive(Debug, Error)]
pub(crate) enum HandshakeFailure {
    #[error(transparent)]
    Rejected(#[from] HandshakeError),
    #[error("transport error during handshake: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed before completing the handshake")]
    Eof,
    #[error("handshake timed out")]
    TimedOut,
    #[error("server shutting down")]
    Cancelled,
}

/// Text sent back when a client sends a binary message.
pub(crate) fn invalid_message_type_reply() -> String {
    serde_json::json!({ "ws_error": "Invalid WS Message Type" }).to_string()
}

// ── Session entry point ───────────────────────────────────────────────────────

/// Runs one connection from TCP accept to teardown.
pub(crate) async fn run_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
) {
    let config = Arc::clone(&ctx.config);
    let (tx, rx) = mpsc::channel(config.outbound_queue_capacity);
    let conn = Arc::new(Connection::new(peer, tx, shutdown.child_token()));

    if let Err(e) = ctx.registry.insert(Arc::clone(&conn)) {
        warn!(peer = %peer, "{e}; rejecting connection");
        reply_and_close(
            &mut stream,
            &reject_response(503, "Service Unavailable"),
            config.write_timeout(),
        )
        .await;
        return;
    }
    debug!(conn = %conn.id(), peer = %peer, "connection accepted");

    let leftover = match handshake(&mut stream, &conn, &config).await {
        Ok(rest) => rest,
        Err(failure) => {
            debug!(conn = %conn.id(), peer = %peer, "handshake failed: {failure}");
            if matches!(failure, HandshakeFailure::Rejected(_)) {
                reply_and_close(
                    &mut stream,
                    &reject_response(400, "Bad Request"),
                    config.write_timeout(),
                )
                .await;
            }
            discard(&ctx.registry, &conn);
            return;
        }
    };

    if let Err(e) = conn.mark_open() {
        debug!(conn = %conn.id(), "closed before open: {e}");
        discard(&ctx.registry, &conn);
        return;
    }
    conn.touch();
    info!(conn = %conn.id(), peer = %peer, "connection open");
    ctx.dispatcher.open(&peer.to_string());

    let (mut read_half, write_half) = stream.into_split();
    let mut buf = leftover;
    let writer = tokio::spawn(run_writer(
        write_half,
        rx,
        Arc::clone(&conn),
        config.write_timeout(),
    ));

    let cause = read_loop(&mut read_half, &mut buf, &conn, &ctx).await;
    teardown(&ctx, &conn, cause, writer, &mut read_half, &mut buf).await;
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Reads and answers the upgrade request.  Returns any bytes the client sent
/// after the request head; they are the start of the frame stream.
async fn handshake(
    stream: &mut TcpStream,
    conn: &Connection,
    config: &ServerConfig,
) -> Result<Vec<u8>, HandshakeFailure> {
    let (head, rest) = tokio::select! {
        _ = conn.cancelled() => return Err(HandshakeFailure::Cancelled),
        read = timeout(config.handshake_timeout(), read_request_head(stream)) => {
            read.map_err(|_| HandshakeFailure::TimedOut)??
        }
    };

    let request = parse_upgrade_request(&head)?;
    debug!(conn = %conn.id(), path = %request.path, "upgrade request valid");

    timeout(
        config.write_timeout(),
        stream.write_all(&accept_response(&request.key)),
    )
    .await
    .map_err(|_| HandshakeFailure::TimedOut)??;

    Ok(rest)
}

/// Reads until a blank line ends the request head.
///
/// Returns `(head, rest)` where `rest` holds bytes that arrived after it.
pub(crate) async fn read_request_head<R>(
    reader: &mut R,
) -> Result<(Vec<u8>, Vec<u8>), HandshakeFailure>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    loop {
        if let Some(end) = find_request_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_REQUEST_SIZE {
            return Err(HandshakeError::RequestTooLarge.into());
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeFailure::Eof);
        }
    }
}

/// Writes an HTTP error response and closes the stream.
///
/// Unread request bytes are drained for a short while first: closing a
/// socket with unread input makes the kernel send RST, which can destroy the
/// response before the client reads it.
async fn reply_and_close(stream: &mut TcpStream, response: &[u8], write_timeout: Duration) {
    let _ = timeout(write_timeout, stream.write_all(response)).await;
    let _ = timeout(write_timeout, stream.shutdown()).await;
    let mut scratch = [0u8; 1024];
    let _ = timeout(REJECT_LINGER, async {
        while matches!(stream.read(&mut scratch).await, Ok(n) if n > 0) {}
    })
    .await;
}

/// Drops a connection that never opened.  No callback fires.
fn discard(registry: &ConnectionRegistry, conn: &Connection) {
    conn.begin_close();
    registry.remove(conn.id());
    let _ = conn.finish_close();
}

// ── Writer task ───────────────────────────────────────────────────────────────

/// Sole owner of the write half.  Drains the outbound queue until the close
/// frame has been written or a write fails.
async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    conn: Arc<Connection>,
    write_timeout: Duration,
) {
    while let Some(item) = rx.recv().await {
        let (bytes, last) = match &item {
            Outbound::Data(bytes) => (bytes.as_slice(), false),
            Outbound::Close(bytes) => (bytes.as_slice(), true),
        };
        match timeout(write_timeout, writer.write_all(bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn = %conn.id(), "write failed: {e}");
                conn.request_close(CloseCause::Transport(e.to_string()));
                break;
            }
            Err(_) => {
                debug!(conn = %conn.id(), "write timed out");
                conn.request_close(CloseCause::Transport("write timed out".to_string()));
                break;
            }
        }
        if last {
            break;
        }
    }
    let _ = timeout(write_timeout, writer.shutdown()).await;
}

// ── Read loop ─────────────────────────────────────────────────────────────────

/// Decodes and handles frames until the connection must close.
async fn read_loop<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    conn: &Connection,
    ctx: &SessionContext,
) -> CloseCause
where
    R: AsyncRead + Unpin,
{
    let limits = DecodeLimits::server(ctx.config.max_message_size);
    let mut assembler = MessageAssembler::new(ctx.config.max_message_size);

    loop {
        // Handle every complete frame already buffered before reading more.
        loop {
            match decode_frame(buf, &limits) {
                Ok(Some((frame, consumed))) => {
                    buf.drain(..consumed);
                    conn.touch();
                    debug!(
                        conn = %conn.id(),
                        opcode = ?frame.opcode,
                        fin = frame.fin,
                        len = frame.payload.len(),
                        "frame received"
                    );
                    match assembler.push(frame) {
                        Ok(Some(incoming)) => {
                            let outcome = handle_incoming(incoming, conn, &ctx.dispatcher);
                            if let Some(cause) = outcome {
                                return cause;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => return CloseCause::Protocol(e),
                    }
                }
                Ok(None) => break,
                Err(e) => return CloseCause::Protocol(e),
            }
        }

        tokio::select! {
            biased;
            _ = conn.cancelled() => {
                return conn.close_cause().unwrap_or(CloseCause::ServerShutdown);
            }
            read = reader.read_buf(buf) => match read {
                Ok(0) => {
                    return CloseCause::Transport(
                        "connection closed without a close frame".to_string(),
                    );
                }
                Ok(_) => {}
                Err(e) => return CloseCause::Transport(e.to_string()),
            }
        }
    }
}

/// Acts on one complete message or control frame.  Returns `Some` when the
/// connection must close.
pub(crate) fn handle_incoming(
    incoming: Incoming,
    conn: &Connection,
    dispatcher: &EventDispatcher,
) -> Option<CloseCause> {
    let queued = match incoming {
        Incoming::Text(text) => {
            dispatcher.message(&text);
            Ok(())
        }
        Incoming::Binary(data) => {
            debug!(conn = %conn.id(), len = data.len(), "binary message rejected");
            conn.send_frame(&Frame::text(invalid_message_type_reply()))
        }
        Incoming::Ping(payload) => conn.send_frame(&Frame::pong(payload)),
        Incoming::Pong(_) => Ok(()),
        Incoming::Close(close) => {
            let (code, reason) = match close {
                Some((code, reason)) => (Some(code), reason),
                None => (None, String::new()),
            };
            return Some(CloseCause::PeerClosed { code, reason });
        }
    };
    match queued {
        Ok(()) => None,
        Err(SendError::Full) => Some(CloseCause::SlowConsumer),
        Err(SendError::Closed) => Some(
            conn.close_cause()
                .unwrap_or_else(|| CloseCause::Transport("writer stopped".to_string())),
        ),
    }
}

// ── Teardown ──────────────────────────────────────────────────────────────────

async fn teardown<R>(
    ctx: &SessionContext,
    conn: &Arc<Connection>,
    local: CloseCause,
    mut writer: JoinHandle<()>,
    reader: &mut R,
    buf: &mut Vec<u8>,
) where
    R: AsyncRead + Unpin,
{
    // A cause recorded by another task (watchdog, shutdown) takes precedence.
    conn.request_close(local.clone());
    let cause = conn.close_cause().unwrap_or(local);
    let claim = conn.begin_close();

    let close_frame = match &cause {
        CloseCause::Transport(_) => None,
        CloseCause::PeerClosed { code: None, .. } => Some(Frame::close_empty()),
        other => Some(Frame::close(other.close_code(), other.close_reason())),
    };
    let queued = close_frame.is_some_and(|frame| conn.send_close(&frame));
    if !queued {
        writer.abort();
    }
    let written = timeout(ctx.config.write_timeout(), &mut writer).await;
    if written.is_err() {
        debug!(conn = %conn.id(), "close frame not flushed in time");
        writer.abort();
    }
    let flushed = queued && matches!(written, Ok(Ok(())));

    // We spoke first: the handshake completes when the peer answers.
    if flushed && !cause.is_peer_close() {
        let limits = DecodeLimits::server(ctx.config.max_message_size);
        let answered =
            await_close_reply(reader, buf, &limits, ctx.config.write_timeout()).await;
        debug!(conn = %conn.id(), answered, "close handshake finished");
    }

    ctx.registry.remove(conn.id());
    if let Err(e) = conn.finish_close() {
        debug!(conn = %conn.id(), "{e}");
    }

    if claim.is_some_and(|c| c.was_open) {
        if cause.is_peer_close() {
            info!(conn = %conn.id(), peer = %conn.peer(), "connection closed by peer");
        } else {
            warn!(conn = %conn.id(), peer = %conn.peer(), %cause, "connection closed");
        }
        ctx.dispatcher.closed(&cause);
    }
}

/// Reads until the peer answers a close frame we sent.
///
/// Data frames are discarded.  Once the stream stops decoding (e.g. after the
/// protocol error that caused the close) the rest is drained as raw bytes.
/// Returns `true` if a close frame arrived, `false` on EOF, read error or
/// when `limit` elapses.
pub(crate) async fn await_close_reply<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limits: &DecodeLimits,
    limit: Duration,
) -> bool
where
    R: AsyncRead + Unpin,
{
    let wait = async {
        let mut framed = true;
        loop {
            while framed {
                match decode_frame(buf, limits) {
                    Ok(Some((frame, consumed))) => {
                        buf.drain(..consumed);
                        if frame.opcode == Opcode::Close {
                            return true;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => framed = false,
                }
            }
            if !framed {
                buf.clear();
            }
            match reader.read_buf(buf).await {
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }
        }
    };
    timeout(limit, wait).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio_test::io::Builder;
    use ws_core::{decode_frame, encode_frame, CloseCode};

    fn open_connection(queue: usize) -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue);
        let conn = Connection::new(
            "127.0.0.1:40010".parse().unwrap(),
            tx,
            CancellationToken::new(),
        );
        conn.mark_open().unwrap();
        (conn, rx)
    }

    fn sent_frame(rx: &mut mpsc::Receiver<Outbound>) -> Frame {
        match rx.try_recv().expect("a frame must be queued") {
            Outbound::Data(bytes) => {
                decode_frame(&bytes, &DecodeLimits::client(1 << 16))
                    .unwrap()
                    .unwrap()
                    .0
            }
            Outbound::Close(_) => panic!("unexpected close"),
        }
    }

    const MASK: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

    fn client_bytes(frame: Frame) -> Vec<u8> {
        encode_frame(&frame.masked(MASK))
    }

    #[tokio::test]
    async fn test_close_reply_ends_wait_and_skips_data_frames() {
        // Arrange: the peer was mid-send when our close went out
        let mut reader = Builder::new()
            .read(&client_bytes(Frame::text("in flight")))
            .read(&client_bytes(Frame::close(CloseCode::Normal, "")))
            .build();
        let mut buf = Vec::new();

        // Act
        let answered = await_close_reply(
            &mut reader,
            &mut buf,
            &DecodeLimits::server(1 << 16),
            Duration::from_secs(1),
        )
        .await;

        // Assert
        assert!(answered);
    }

    #[tokio::test]
    async fn test_close_reply_already_buffered_needs_no_read() {
        let mut reader = Builder::new().build();
        let mut buf = client_bytes(Frame::close_empty());

        let answered = await_close_reply(
            &mut reader,
            &mut buf,
            &DecodeLimits::server(1 << 16),
            Duration::from_secs(1),
        )
        .await;

        assert!(answered);
    }

    #[tokio::test]
    async fn test_undecodable_input_is_drained_until_eof() {
        // An unmasked frame left over from the protocol error, then EOF.
        let mut reader = Builder::new().read(b"\x02\x00\x00\x00").build();
        let mut buf = encode_frame(&Frame::text("unmasked"));

        let answered = await_close_reply(
            &mut reader,
            &mut buf,
            &DecodeLimits::server(1 << 16),
            Duration::from_secs(1),
        )
        .await;

        assert!(!answered);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_silent_peer_close_wait_is_bounded() {
        let (mut reader, _peer) = tokio::io::duplex(64);
        let mut buf = Vec::new();
        let started = std::time::Instant::now();

        let answered = await_close_reply(
            &mut reader,
            &mut buf,
            &DecodeLimits::server(1 << 16),
            Duration::from_millis(50),
        )
        .await;

        assert!(!answered);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_message_type_reply_text() {
        assert_eq!(
            invalid_message_type_reply(),
            r#"{"ws_error":"Invalid WS Message Type"}"#
        );
    }

    #[tokio::test]
    async fn test_read_request_head_across_several_reads() {
        // Arrange: the head arrives in two pieces, followed by frame bytes.
        let mut reader = Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: x\r\n")
            .read(b"Upgrade: websocket\r\n\r\n\x81\x80")
            .build();

        // Act
        let (head, rest) = read_request_head(&mut reader).await.unwrap();

        // Assert
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(rest, vec![0x81, 0x80]);
    }

    #[tokio::test]
    async fn test_read_request_head_eof_before_blank_line() {
        let mut reader = Builder::new().read(b"GET / HTTP/1.1\r\n").build();
        let err = read_request_head(&mut reader).await.unwrap_err();
        assert!(matches!(err, HandshakeFailure::Eof));
    }

    #[tokio::test]
    async fn test_read_request_head_rejects_oversized_head() {
        let chunk = vec![b'a'; MAX_REQUEST_SIZE + 1];
        let mut reader = Builder::new().read(&chunk).build();
        let err = read_request_head(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeFailure::Rejected(HandshakeError::RequestTooLarge)
        ));
    }

    #[test]
    fn test_text_is_dispatched() {
        let (conn, _rx) = open_connection(4);
        let dispatcher = EventDispatcher::new();
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        dispatcher.set_on_message(move |m| sink.lock().push(m.to_string()));

        let outcome = handle_incoming(Incoming::Text("hello".to_string()), &conn, &dispatcher);

        assert!(outcome.is_none());
        assert_eq!(*got.lock(), vec!["hello"]);
    }

    #[test]
    fn test_binary_gets_error_reply_and_no_dispatch() {
        let (conn, mut rx) = open_connection(4);
        let dispatcher = EventDispatcher::new();
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);
        dispatcher.set_on_message(move |_| *flag.lock() = true);

        let outcome = handle_incoming(Incoming::Binary(vec![1, 2, 3]), &conn, &dispatcher);

        assert!(outcome.is_none());
        assert!(!*called.lock());
        let reply = sent_frame(&mut rx);
        assert_eq!(reply.opcode, Opcode::Text);
        assert_eq!(reply.payload, invalid_message_type_reply().into_bytes());
    }

    #[test]
    fn test_ping_is_answered_with_matching_pong() {
        let (conn, mut rx) = open_connection(4);
        let dispatcher = EventDispatcher::new();

        handle_incoming(Incoming::Ping(b"beat".to_vec()), &conn, &dispatcher);

        let pong = sent_frame(&mut rx);
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"beat");
    }

    #[test]
    fn test_close_frame_ends_session_with_peer_cause() {
        let (conn, _rx) = open_connection(4);
        let dispatcher = EventDispatcher::new();

        let outcome = handle_incoming(
            Incoming::Close(Some((CloseCode::Normal, "done".to_string()))),
            &conn,
            &dispatcher,
        );

        assert_eq!(
            outcome,
            Some(CloseCause::PeerClosed {
                code: Some(CloseCode::Normal),
                reason: "done".to_string()
            })
        );
    }

    #[test]
    fn test_full_queue_on_pong_is_slow_consumer() {
        let (conn, _rx) = open_connection(1);
        let dispatcher = EventDispatcher::new();
        conn.send_frame(&Frame::text("backlog")).unwrap();

        let outcome = handle_incoming(Incoming::Ping(Vec::new()), &conn, &dispatcher);

        assert_eq!(outcome, Some(CloseCause::SlowConsumer));
    }
}
