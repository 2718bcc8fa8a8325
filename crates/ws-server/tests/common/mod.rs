//! Shared helpers for the ws-server integration tests.
//!
//! [`RawClient`] speaks the wire protocol directly through the `ws-core`
//! codec so tests can send frames a well-behaved client library never would
//! (orphan continuations, hand-made fragments, silence).

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use ws_core::{decode_frame, encode_frame, DecodeLimits, Frame};
use ws_server::{ServerConfig, WsServer};

pub const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];
pub const WAIT: Duration = Duration::from_secs(3);

/// Finds a port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Loopback config on a fresh port.
///
/// The write timeout also bounds how long the server waits for a close
/// reply, so it is kept short for clients that never answer.
pub fn test_config(max_connections: u32) -> ServerConfig {
    ServerConfig {
        max_connections,
        port: free_port(),
        bind_address: "127.0.0.1".to_string(),
        write_timeout_ms: 1000,
        ..ServerConfig::default()
    }
}

/// Builds a server from `config`, wires `events` to every callback and starts it.
pub async fn start_server(config: ServerConfig, events: &EventLog) -> Arc<WsServer> {
    let server = Arc::new(WsServer::with_config(config).expect("valid config"));
    events.attach(&server);
    server.listen().await.expect("listen");
    server
}

// ── Event recording ───────────────────────────────────────────────────────────

/// Records every callback invocation as `"<kind>:<arg>"`.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, server: &WsServer) {
        let log = self.clone();
        server.set_on_open(move |peer| log.push("open", peer));
        let log = self.clone();
        server.set_on_message(move |msg| log.push("message", msg));
        let log = self.clone();
        server.set_on_error(move |err| log.push("error", err));
    }

    pub fn push(&self, kind: &str, arg: &str) {
        self.events.lock().push(format!("{kind}:{arg}"));
    }

    pub fn all(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    /// Polls until at least `n` events start with `prefix`.
    pub async fn wait_for(&self, prefix: &str, n: usize) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.count(prefix) >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

// ── Raw protocol client ───────────────────────────────────────────────────────

pub struct RawClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RawClient {
    /// Connects and sends `request` verbatim.  Returns the client and the
    /// server's response head.
    pub async fn send_request(addr: SocketAddr, request: &str) -> (Self, String) {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(request.as_bytes()).await.expect("write request");
        let mut client = Self {
            stream,
            buf: Vec::new(),
        };
        let head = client.read_head().await;
        (client, head)
    }

    /// Connects and completes a valid upgrade.
    pub async fn connect(addr: SocketAddr) -> Self {
        let (client, head) = Self::send_request(addr, &upgrade_request(CLIENT_KEY)).await;
        assert!(
            head.starts_with("HTTP/1.1 101"),
            "expected 101 Switching Protocols, got {head:?}"
        );
        client
    }

    async fn read_head(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head: Vec<u8> = self.buf.drain(..pos + 4).collect();
                return String::from_utf8_lossy(&head).into_owned();
            }
            let n = timeout(WAIT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("response head in time")
                .expect("read response");
            if n == 0 {
                return String::from_utf8_lossy(&self.buf).into_owned();
            }
        }
    }

    /// Masks and sends one frame.
    pub async fn send(&mut self, frame: Frame) {
        let bytes = encode_frame(&frame.masked(MASK));
        self.stream.write_all(&bytes).await.expect("write frame");
    }

    /// Writes `bytes` as-is, e.g. a frame that was never masked.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write raw bytes");
    }

    pub async fn send_text(&mut self, text: &str) {
        self.send(Frame::text(text)).await;
    }

    /// Next server frame, or `None` on EOF or timeout.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Frame> {
        let limits = DecodeLimits::client(1 << 20);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some((frame, used)) = decode_frame(&self.buf, &limits).expect("valid server frame")
            {
                self.buf.drain(..used);
                return Some(frame);
            }
            match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                Ok(Ok(_)) => {}
            }
        }
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.recv_within(WAIT).await
    }

    /// Reads until EOF; `true` if the server closed the socket in time.
    pub async fn expect_eof(&mut self) -> bool {
        let mut scratch = [0u8; 256];
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => {}
                Err(_) => return false,
            }
        }
    }
}

pub fn upgrade_request(key: &str) -> String {
    format!(
        "GET /chat HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}
