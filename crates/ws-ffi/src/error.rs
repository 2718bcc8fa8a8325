//! FFI error handling.
//!
//! Every fallible C entry point returns `0` on success and one of the
//! negative codes from [`FfiError::code`] on failure.

use thiserror::Error;
use ws_server::ServerError;

#[derive(Debug, Error)]
pub enum FfiError {
    #[error("null pointer passed for `{0}`")]
    NullPointer(&'static str),

    #[error("string argument is not valid UTF-8")]
    InvalidUtf8,

    /// Blocking calls (`server_listen`, `server_close`) cannot run on a
    /// runtime thread, i.e. from inside a server callback.
    #[error("blocking call made from inside a server callback")]
    InsideRuntime,

    #[error("failed to start the async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("async runtime unavailable")]
    RuntimeUnavailable,

    #[error(transparent)]
    Server(#[from] ServerError),
}

impl FfiError {
    /// The negative status code returned to C.
    pub fn code(&self) -> i32 {
        match self {
            FfiError::Server(_) => -1,
            FfiError::NullPointer(_) => -2,
            FfiError::InvalidUtf8 => -3,
            FfiError::InsideRuntime => -4,
            FfiError::Runtime(_) | FfiError::RuntimeUnavailable => -5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_code_is_negative_and_distinct_per_kind() {
        let codes = [
            FfiError::Server(ServerError::NotListening).code(),
            FfiError::NullPointer("server").code(),
            FfiError::InvalidUtf8.code(),
            FfiError::InsideRuntime.code(),
            FfiError::RuntimeUnavailable.code(),
        ];
        assert!(codes.iter().all(|c| *c < 0));
        let mut unique = codes.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_null_pointer_message_names_argument() {
        assert_eq!(
            FfiError::NullPointer("msg").to_string(),
            "null pointer passed for `msg`"
        );
    }
}
