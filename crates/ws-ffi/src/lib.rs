//! # ws-ffi
//!
//! C ABI for the embeddable WebSocket server.  The declarations live in
//! `include/ws_server.h`; `c/c_server.c` is a small echo host written
//! against them.
//!
//! ## Safety
//!
//! Every function taking a `struct WSServer *` expects a pointer returned by
//! [`server_new`] and not yet passed to [`server_free`].  Strings passed in
//! must be NUL-terminated.  Strings passed to callbacks are only valid for
//! the duration of the call.
//!
//! ## Threading
//!
//! The library owns a multi-threaded Tokio runtime.  Callbacks run on its
//! worker threads, concurrently for different connections, so the `ctx`
//! pointer handed to them must tolerate that.  Inside a callback only
//! [`server_broadcaster`] and the setters may be called; [`server_listen`]
//! and [`server_close`] return an error there.
//!
//! ## Example (C)
//!
//! ```c
//! void on_message(void *ctx, const char *msg) {
//!     server_broadcaster((struct WSServer *)ctx, msg);
//! }
//!
//! int main(void) {
//!     struct WSServer *ws = server_new(10, 3013);
//!     server_set_on_message_cb(ws, ws, on_message);
//!     server_listen(ws);
//!     /* ... */
//!     server_close(ws);
//!     server_free(ws);
//! }
//! ```

#![allow(clippy::missing_safety_doc)] // Safety documented at module level

mod error;
mod runtime;

use std::borrow::Cow;
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::{debug, warn};
use ws_server::WsServer;

pub use error::FfiError;

/// Callback signature shared by every event: `(ctx, text)`.
pub type ServerCallback = Option<unsafe extern "C" fn(*mut c_void, *const c_char)>;

/// Opaque server handle.
pub struct WSServer {
    inner: WsServer,
}

// ── Callback adapter ──────────────────────────────────────────────────────────

/// A C function pointer plus the `ctx` it was registered with.
#[derive(Clone, Copy)]
struct HostCallback {
    ctx: *mut c_void,
    func: unsafe extern "C" fn(*mut c_void, *const c_char),
}

// The host promises `ctx` may be used from the runtime's worker threads.
unsafe impl Send for HostCallback {}
unsafe impl Sync for HostCallback {}

impl HostCallback {
    fn call(&self, text: &str) {
        let text = to_c_string(text);
        unsafe { (self.func)(self.ctx, text.as_ptr()) }
    }
}

/// Converts to a C string, dropping interior NULs rather than failing.
fn to_c_string(text: &str) -> CString {
    CString::new(text).unwrap_or_else(|e| {
        let mut bytes = e.into_vec();
        bytes.retain(|b| *b != 0);
        CString::new(bytes).unwrap_or_default()
    })
}

/// Messages reach C hosts newline-terminated.
fn with_trailing_newline(msg: &str) -> Cow<'_, str> {
    if msg.ends_with('\n') {
        Cow::Borrowed(msg)
    } else {
        Cow::Owned(format!("{msg}\n"))
    }
}

enum Event {
    Open,
    Message,
    Error,
}

unsafe fn set_callback(
    server: *const WSServer,
    ctx: *mut c_void,
    cb: ServerCallback,
    event: Event,
) {
    let Some(server) = server.as_ref() else {
        warn!("callback registration on a null server");
        return;
    };
    let Some(func) = cb else {
        // A null function pointer unregisters.
        match event {
            Event::Open => server.inner.set_on_open(|_| {}),
            Event::Message => server.inner.set_on_message(|_| {}),
            Event::Error => server.inner.set_on_error(|_| {}),
        }
        return;
    };
    let host = HostCallback { ctx, func };
    match event {
        Event::Open => server.inner.set_on_open(move |peer| host.call(peer)),
        Event::Message => server
            .inner
            .set_on_message(move |msg| host.call(&with_trailing_newline(msg))),
        Event::Error => server.inner.set_on_error(move |reason| host.call(reason)),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

unsafe fn server_ref<'a>(server: *const WSServer) -> Result<&'a WSServer, FfiError> {
    server.as_ref().ok_or(FfiError::NullPointer("server"))
}

unsafe fn listen(server: *const WSServer) -> Result<(), FfiError> {
    let s = server_ref(server)?;
    runtime::block_on(s.inner.listen())??;
    Ok(())
}

unsafe fn close(server: *const WSServer) -> Result<(), FfiError> {
    let s = server_ref(server)?;
    runtime::block_on(s.inner.close())??;
    Ok(())
}

unsafe fn broadcast(server: *const WSServer, msg: *const c_char) -> Result<(), FfiError> {
    let s = server_ref(server)?;
    if msg.is_null() {
        return Err(FfiError::NullPointer("msg"));
    }
    let text = CStr::from_ptr(msg)
        .to_str()
        .map_err(|_| FfiError::InvalidUtf8)?;
    s.inner.broadcast(text)?;
    Ok(())
}

fn status(result: Result<(), FfiError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            debug!("C API call failed: {e}");
            e.code()
        }
    }
}

// ── C API ─────────────────────────────────────────────────────────────────────

/// Library version.  The string is static; do not free it.
#[no_mangle]
pub extern "C" fn server_version() -> *const c_char {
    static VERSION: OnceLock<CString> = OnceLock::new();
    VERSION.get_or_init(|| to_c_string(ws_server::VERSION)).as_ptr()
}

/// Creates a server.  Returns NULL if `max_connections` or `port` is 0.
#[no_mangle]
pub extern "C" fn server_new(max_connections: u32, port: u16) -> *mut WSServer {
    match WsServer::new(max_connections, port) {
        Ok(inner) => Box::into_raw(Box::new(WSServer { inner })),
        Err(e) => {
            warn!("server_new: {e}");
            ptr::null_mut()
        }
    }
}

/// Sets the watchdog period in milliseconds (0 disables).  Only takes
/// effect before `server_listen`.
#[no_mangle]
pub unsafe extern "C" fn server_set_wdt_period(server: *mut WSServer, ms: u64) {
    match server_ref(server) {
        Ok(s) => s.inner.set_watchdog_period(Duration::from_millis(ms)),
        Err(e) => warn!("server_set_wdt_period: {e}"),
    }
}

/// Starts listening.  Returns 0 on success, < 0 on error.
#[no_mangle]
pub unsafe extern "C" fn server_listen(server: *mut WSServer) -> i32 {
    status(listen(server))
}

/// Stops the server and closes every connection.  Returns 0 on success
/// (including when already closed), < 0 on error.
#[no_mangle]
pub unsafe extern "C" fn server_close(server: *mut WSServer) -> i32 {
    status(close(server))
}

/// Sends `msg` to every open connection.  Returns 0 on success, < 0 when
/// the server is not listening, no client is connected, or `msg` is not
/// UTF-8.
#[no_mangle]
pub unsafe extern "C" fn server_broadcaster(server: *mut WSServer, msg: *const c_char) -> i32 {
    status(broadcast(server, msg))
}

/// Called with the peer address (`ip:port`) when a client connects.
#[no_mangle]
pub unsafe extern "C" fn server_set_on_open_cb(
    server: *mut WSServer,
    ctx: *mut c_void,
    cb: ServerCallback,
) {
    set_callback(server, ctx, cb, Event::Open);
}

/// Called with a reason such as `"watchdog timeout"` when a client
/// disconnects for any reason.
#[no_mangle]
pub unsafe extern "C" fn server_set_on_error_cb(
    server: *mut WSServer,
    ctx: *mut c_void,
    cb: ServerCallback,
) {
    set_callback(server, ctx, cb, Event::Error);
}

/// Called with every text message, newline-terminated.
#[no_mangle]
pub unsafe extern "C" fn server_set_on_message_cb(
    server: *mut WSServer,
    ctx: *mut c_void,
    cb: ServerCallback,
) {
    set_callback(server, ctx, cb, Event::Message);
}

/// Closes the server if needed and releases it.  NULL is ignored.
#[no_mangle]
pub unsafe extern "C" fn server_free(server: *mut WSServer) {
    if server.is_null() {
        return;
    }
    let server = Box::from_raw(server);
    if !server.inner.is_listening() {
        return;
    }
    match runtime::block_on(server.inner.close()) {
        Ok(_) => {}
        Err(FfiError::InsideRuntime) => {
            // Freed from a callback: finish the shutdown in the background.
            if let Ok(rt) = runtime::get_runtime() {
                rt.spawn(async move {
                    let _ = server.inner.close().await;
                });
            }
        }
        Err(e) => warn!("server_free: {e}"),
    }
}
