//! Tokio runtime owned by the library.
//!
//! C hosts have no async runtime, so the first call that needs one builds a
//! multi-threaded runtime and keeps it for the life of the process.  Server
//! tasks keep running on its worker threads between C calls.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::FfiError;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Returns the global runtime, building it on first use.
pub(crate) fn get_runtime() -> Result<&'static Runtime, FfiError> {
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let built = Builder::new_multi_thread()
        .enable_all()
        .thread_name("ws-ffi")
        .build()
        .map_err(FfiError::Runtime)?;
    // Another thread may have won the race; its runtime is kept and ours dropped.
    let _ = RUNTIME.set(built);
    RUNTIME.get().ok_or(FfiError::RuntimeUnavailable)
}

/// Runs `future` to completion on the global runtime.
///
/// Fails with [`FfiError::InsideRuntime`] when called from a runtime thread,
/// which is where every server callback runs.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output, FfiError> {
    if Handle::try_current().is_ok() {
        return Err(FfiError::InsideRuntime);
    }
    Ok(get_runtime()?.block_on(future))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_runtime_returns_same_instance() {
        let rt1 = get_runtime().unwrap();
        let rt2 = get_runtime().unwrap();
        assert!(std::ptr::eq(rt1, rt2));
    }

    #[test]
    fn test_block_on() {
        let result = block_on(async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            42
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_block_on_from_runtime_thread_is_refused() {
        let rt = get_runtime().unwrap();
        let nested = rt.block_on(async { block_on(async { 1 }) });
        assert!(matches!(nested, Err(FfiError::InsideRuntime)));
    }
}
