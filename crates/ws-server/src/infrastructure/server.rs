//! ServerController: the embeddable server facade.
//!
//! [`WsServer`] owns the configuration and the host callbacks, and while
//! listening it owns the accept loop, the watchdog and every session task.
//!
//! # Lifecycle
//!
//! ```text
//! new ──► listen ──► (accept / watchdog / sessions running) ──► close
//!            ▲                                                   │
//!            └───────────────────────────────────────────────────┘
//! ```
//!
//! `close` is idempotent and a closed server may listen again; each `listen`
//! starts with an empty registry.  Dropping a listening server cancels its
//! tasks without waiting for them.
//!
//! # Threading
//!
//! Every method takes `&self`, so a `WsServer` can sit in an `Arc` and be
//! used from callbacks.  `broadcast` and the callback setters never await and
//! are safe to call from inside a callback.  `listen` and `close` are async
//! and must not be awaited from inside a callback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use ws_core::{encode_frame, Frame};

use super::connection::SendError;
use super::registry::ConnectionRegistry;
use super::session::{run_session, SessionContext};
use super::watchdog::run_watchdog;
use crate::application::dispatcher::EventDispatcher;
use crate::config::ServerConfig;
use crate::error::{CloseCause, ServerError};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Extra time granted to session tasks on shutdown beyond their close
/// handshake (one write timeout to flush, one to await the reply).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Outcome of a [`WsServer::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Open connections the message was queued on.
    pub delivered: usize,
    /// Open connections whose queue refused the message.
    pub failed: usize,
}

/// State that exists only while listening.
#[derive(Debug)]
struct Running {
    registry: Arc<ConnectionRegistry>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Embeddable WebSocket server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ws_server::WsServer;
///
/// # async fn run() -> Result<(), ws_server::ServerError> {
/// let server = Arc::new(WsServer::new(10, 3013)?);
///
/// let echo = Arc::downgrade(&server);
/// server.set_on_message(move |msg| {
///     if let Some(server) = echo.upgrade() {
///         let _ = server.broadcast(msg);
///     }
/// });
///
/// server.listen().await?;
/// // ... host main loop ...
/// server.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WsServer {
    config: RwLock<ServerConfig>,
    dispatcher: Arc<EventDispatcher>,
    // Serializes listen/close; never locked by sync methods.
    lifecycle: tokio::sync::Mutex<()>,
    running: RwLock<Option<Arc<Running>>>,
}

impl WsServer {
    /// Creates a server with the given limits and default settings.  No
    /// socket is bound yet.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if `max_connections` or `port` is 0.
    pub fn new(max_connections: u32, port: u16) -> Result<Self, ServerError> {
        Ok(Self::from_valid_config(ServerConfig::new(max_connections, port)?))
    }

    /// Creates a server from a full configuration.
    pub fn with_config(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: ServerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            dispatcher: Arc::new(EventDispatcher::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            running: RwLock::new(None),
        }
    }

    // ── Configuration ─────────────────────────────────────────────────────────

    /// Sets the watchdog period.  `Duration::ZERO` disables the watchdog.
    ///
    /// Only takes effect if called before [`listen`](Self::listen); later
    /// calls are ignored with a warning.
    pub fn set_watchdog_period(&self, period: Duration) {
        if self.is_listening() {
            warn!(
                period_ms = period.as_millis() as u64,
                "watchdog period change ignored while listening"
            );
            return;
        }
        self.config.write().watchdog_period_ms = period.as_millis() as u64;
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }

    // ── Callbacks ─────────────────────────────────────────────────────────────

    /// Called with the peer address (`ip:port`) when a handshake completes.
    pub fn set_on_open<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.dispatcher.set_on_open(callback);
    }

    /// Called with every non-empty text message.
    pub fn set_on_message<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.dispatcher.set_on_message(callback);
    }

    /// Called once when an open connection ends, with a diagnostic such as
    /// `"watchdog timeout"`, `"server shutdown"` or `"peer closed"`.
    pub fn set_on_error<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.dispatcher.set_on_error(callback);
    }

    /// Called with the peer's reason text on a clean peer close.  When set,
    /// clean closes no longer reach the error callback.
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.dispatcher.set_on_close(callback);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Binds the listener and starts accepting connections.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyListening`] if the server is listening.
    /// - [`ServerError::Bind`] if the address cannot be bound.
    pub async fn listen(&self) -> Result<(), ServerError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_listening() {
            return Err(ServerError::AlreadyListening);
        }

        let config = Arc::new(self.config());
        let addr = config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let registry = Arc::new(ConnectionRegistry::new(config.max_connections as usize));
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let ctx = Arc::new(SessionContext {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            dispatcher: Arc::clone(&self.dispatcher),
        });
        tracker.spawn(accept_loop(listener, ctx, shutdown.clone(), tracker.clone()));
        if let Some(period) = config.watchdog_period() {
            tracker.spawn(run_watchdog(
                Arc::clone(&registry),
                period,
                shutdown.clone(),
            ));
        }

        *self.running.write() = Some(Arc::new(Running {
            registry,
            local_addr,
            shutdown,
            tracker,
        }));
        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            watchdog_ms = config.watchdog_period_ms,
            "WebSocket server listening"
        );
        Ok(())
    }

    /// Stops the server.
    ///
    /// Stops accepting, stops the watchdog, closes every connection with
    /// status 1001 (each open one reports `"server shutdown"` through the
    /// error callback) and waits a bounded time for all tasks to finish.
    /// Calling it again, or on a server that never listened, does nothing.
    pub async fn close(&self) -> Result<(), ServerError> {
        let _guard = self.lifecycle.lock().await;
        let taken = self.running.write().take();
        let Some(running) = taken else {
            debug!("close called on a server that is not listening");
            return Ok(());
        };

        info!(
            connections = running.registry.len(),
            "WebSocket server shutting down"
        );
        running.registry.for_each(|conn| {
            conn.request_close(CloseCause::ServerShutdown);
        });
        running.shutdown.cancel();
        running.tracker.close();

        let grace = self.config.read().write_timeout() * 2 + SHUTDOWN_GRACE;
        if timeout(grace, running.tracker.wait()).await.is_err() {
            warn!(
                remaining = running.tracker.len(),
                "tasks still running after shutdown grace period"
            );
        }
        info!("WebSocket server stopped");
        Ok(())
    }

    // ── Broadcast ─────────────────────────────────────────────────────────────

    /// Queues `message` as a text frame on every open connection.
    ///
    /// The frame is encoded once.  A connection whose outbound queue is full
    /// is counted in `failed` and closed as a slow consumer; the others are
    /// unaffected.  Never waits.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotListening`] if the server is not listening.
    /// - [`ServerError::NoOpenConnections`] if no connection is open.
    pub fn broadcast(&self, message: &str) -> Result<BroadcastReport, ServerError> {
        let running = self.running.read().clone().ok_or(ServerError::NotListening)?;
        let bytes = Arc::new(encode_frame(&Frame::text(message)));

        let mut report = BroadcastReport::default();
        let mut open = 0usize;
        running.registry.for_each(|conn| {
            if !conn.is_open() {
                return;
            }
            open += 1;
            match conn.send_bytes(Arc::clone(&bytes)) {
                Ok(()) => report.delivered += 1,
                Err(SendError::Full) => {
                    warn!(conn = %conn.id(), "outbound queue full; evicting slow consumer");
                    conn.request_close(CloseCause::SlowConsumer);
                    report.failed += 1;
                }
                Err(SendError::Closed) => report.failed += 1,
            }
        });

        if open == 0 {
            return Err(ServerError::NoOpenConnections);
        }
        debug!(
            delivered = report.delivered,
            failed = report.failed,
            len = message.len(),
            "broadcast"
        );
        Ok(report)
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn is_listening(&self) -> bool {
        self.running.read().is_some()
    }

    /// Bound address while listening.  Useful with port 0 on the bind side
    /// of tests and for logging.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.read().as_ref().map(|r| r.local_addr)
    }

    /// Connections currently registered, including ones still handshaking.
    pub fn connection_count(&self) -> usize {
        self.running
            .read()
            .as_ref()
            .map_or(0, |r| r.registry.len())
    }

    /// Connections currently in the open phase.
    pub fn open_connection_count(&self) -> usize {
        self.running
            .read()
            .as_ref()
            .map_or(0, |r| r.registry.open_count())
    }
}

impl Drop for WsServer {
    /// Dropping a listening server stops it without waiting: sessions are
    /// told to close and the accept loop and watchdog exit on their own.
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            debug!("server dropped while listening; cancelling tasks");
            running.registry.for_each(|conn| {
                conn.request_close(CloseCause::ServerShutdown);
            });
            running.shutdown.cancel();
            running.tracker.close();
        }
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Accepts connections until `shutdown` is cancelled, spawning one session
/// task per connection on `tracker`.
async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("shutdown requested; stopping accept loop");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "TCP connection accepted");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, "set_nodelay failed: {e}");
                    }
                    tracker.spawn(run_session(
                        stream,
                        peer,
                        Arc::clone(&ctx),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    // Transient (e.g. too many open files): log and keep going.
                    error!("accept error: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}
