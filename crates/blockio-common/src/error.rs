//! Error types for BlockIO
//!
//! Fallible setup paths (open, recovery, the driving loop) return [`Error`].
//! Per-operation failures never travel through this enum: they surface as
//! negative errno values in the operation's `retval`, see [`errno`].

use thiserror::Error;

/// Common result type for BlockIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for BlockIO
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("disk is full")]
    DiskFull,

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Errno values used for per-operation `retval` reporting.
///
/// Operation callbacks receive `retval >= 0` for success (byte count) or one
/// of these negated constants on failure.
pub mod errno {
    /// Invalid operation shape (alignment, bounds, version ordering)
    pub const EINVAL: i64 = libc::EINVAL as i64;
    /// Data device out of space
    pub const ENOSPC: i64 = libc::ENOSPC as i64;
    /// Version exists but is not in the required state
    pub const EBUSY: i64 = libc::EBUSY as i64;
    /// No such object version
    pub const ENOENT: i64 = libc::ENOENT as i64;
    /// I/O failure reported by the device
    pub const EIO: i64 = libc::EIO as i64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ChecksumMismatch {
            expected: 0xdeadbeef,
            actual: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xdeadbeef"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: Error = io.into();
        assert!(matches!(err, Error::DiskIo(_)));
    }
}
