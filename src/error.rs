//! Error taxonomy for the queue API
//!
//! Submit-time validation failures are synchronous and never consume a
//! request slot. Per-request I/O failures are not represented here at all:
//! they travel through the request's own completion callback as an
//! `io::Error`, so one failing operation cannot mask the completions of its
//! batch-mates. Only queue-level failures (bad arguments, a full queue,
//! engine breakage) surface as `QueueError`.

use std::io;

/// Result type used throughout the queue library
pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue-level error returned by the public API
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A parameter failed validation (zero/oversized depth, null or
    /// zero-length buffer, reap target out of range, double init).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// All `depth` request slots are occupied; reap completions to free one.
    #[error("queue full")]
    QueueFull,

    /// The kernel could not allocate the AIO context at init time.
    #[error("out of memory")]
    OutOfMemory,

    /// The backend has no readiness descriptor to offer.
    #[error("readiness notification not supported by this backend")]
    NotSupported,

    /// Unexpected backend failure, surfaced by the offending entry point.
    #[error("engine failure: {0}")]
    Engine(#[from] io::Error),
}

impl QueueError {
    /// The underlying OS error code, when one exists.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            QueueError::Engine(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_preserves_os_code() {
        let err = QueueError::from(io::Error::from_raw_os_error(libc::EBADF));
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        assert!(err.to_string().starts_with("engine failure"));
    }

    #[test]
    fn test_invalid_argument_message() {
        let err = QueueError::InvalidArgument("depth must be non-zero");
        assert_eq!(err.to_string(), "invalid argument: depth must be non-zero");
        assert_eq!(err.raw_os_error(), None);
    }
}
