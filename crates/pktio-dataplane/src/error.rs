//! Error types for the packet I/O core

use std::fmt;
use thiserror::Error;

/// Device-level error codes reported by a device manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Device id is not known to the manager
    NoSuchDevice,
    /// Queue id is outside the device's configured queues
    NoSuchQueue,
    /// Queue is already owned by another port handle
    QueueInUse,
    /// Device could not get a buffer for a received frame
    NoMbuf,
    /// Link is down
    LinkDown,
    /// Transmit queue stalled
    TxTimeout,
    /// Driver specific code
    Other(i32),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NoSuchDevice => f.write_str("no such device"),
            ErrorCode::NoSuchQueue => f.write_str("no such queue"),
            ErrorCode::QueueInUse => f.write_str("queue in use"),
            ErrorCode::NoMbuf => f.write_str("no mbuf"),
            ErrorCode::LinkDown => f.write_str("link down"),
            ErrorCode::TxTimeout => f.write_str("tx timeout"),
            ErrorCode::Other(code) => write!(f, "driver error {}", code),
        }
    }
}

/// Data plane error type
#[derive(Error, Debug)]
pub enum DataplaneError {
    /// No free buffer left in the pool
    #[error("buffer pool exhausted")]
    PoolExhausted,

    /// Ring has no free slot
    #[error("ring full")]
    Full,

    /// Ring or pool has nothing to hand out
    #[error("empty")]
    Empty,

    /// Contract violation on a buffer handle (double free, stale or foreign handle)
    #[error("invalid buffer handle {index}: {reason}")]
    InvalidHandle { index: u32, reason: &'static str },

    /// Error reported by the device manager
    #[error("device {device} error: {code}")]
    Device { device: u16, code: ErrorCode },

    /// Requested core does not exist
    #[error("core {0} out of range")]
    CoreOutOfRange(usize),

    /// Requested core is already in use
    #[error("core {0} busy")]
    CoreBusy(usize),

    /// No core can take another worker
    #[error("no cores available")]
    NoCores,

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DataplaneError {
    /// Whether the caller is expected to back off, drop or retry and carry on
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DataplaneError::PoolExhausted
                | DataplaneError::Full
                | DataplaneError::Empty
                | DataplaneError::Device { .. }
        )
    }

    pub(crate) fn invalid(index: u32, reason: &'static str) -> Self {
        DataplaneError::InvalidHandle { index, reason }
    }
}

/// Result type for the data plane
pub type DataplaneResult<T> = Result<T, DataplaneError>;

/// Rejected single-object enqueue. Carries the object back to the caller.
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Take back the object that did not fit
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ring full")
    }
}

impl<T> std::error::Error for Full<T> {}

impl<T> From<Full<T>> for DataplaneError {
    fn from(_: Full<T>) -> Self {
        DataplaneError::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(DataplaneError::PoolExhausted.is_recoverable());
        assert!(DataplaneError::Full.is_recoverable());
        assert!(DataplaneError::Empty.is_recoverable());
        assert!(DataplaneError::Device { device: 0, code: ErrorCode::LinkDown }.is_recoverable());
        assert!(!DataplaneError::invalid(3, "double free").is_recoverable());
        assert!(!DataplaneError::Config("x".into()).is_recoverable());
    }

    #[test]
    fn test_full_returns_object() {
        let err = Full(42u32);
        assert_eq!(err.to_string(), "ring full");
        assert_eq!(err.into_inner(), 42);
    }

    #[test]
    fn test_display() {
        let err = DataplaneError::Device { device: 2, code: ErrorCode::Other(-5) };
        assert_eq!(err.to_string(), "device 2 error: driver error -5");
    }
}
