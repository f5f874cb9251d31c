//! Error types for BlobIO
//!
//! One enum covers every terminal status a blob I/O can report. It is
//! `Clone` so the first failing sub-request can be kept on its logical
//! request and handed to the caller's completion.

use crate::types::ExtentId;
use thiserror::Error;

/// Common result type for BlobIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for BlobIO
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Validation errors
    #[error("request [{offset}, +{length}) spans more than two extents of {extent_size} bytes")]
    DataTooLarge {
        offset: u64,
        length: u64,
        extent_size: u64,
    },

    #[error("offset {offset} + length {length} exceeds blob size {size}")]
    OutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Resolution errors
    #[error("no route for {0}")]
    RouterNotFound(ExtentId),

    #[error("no raft group serving {0}")]
    RaftGroupNotFound(ExtentId),

    // Transport errors
    #[error("rpc failed: {0}")]
    RpcFailed(String),

    // Remote errors
    #[error("remote node returned status {code}")]
    Remote { code: i32 },

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    // Integrity errors
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // Lifecycle errors
    #[error("device closed")]
    DeviceClosed,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether a caller may reasonably reissue the request.
    ///
    /// The data path itself never retries; this only advises callers.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RpcFailed(_) | Self::RouterNotFound(_) | Self::RaftGroupNotFound(_)
        )
    }

    /// Whether the returned read buffer must be treated as untrustworthy
    #[must_use]
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::ShortRead { .. })
    }

    /// Stable numeric status, 0 being reserved for success
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::DataTooLarge { .. } => 1,
            Self::OutOfBounds { .. } => 2,
            Self::InvalidArgument(_) => 3,
            Self::RouterNotFound(_) => 10,
            Self::RaftGroupNotFound(_) => 11,
            Self::RpcFailed(_) => 20,
            Self::Remote { .. } => 30,
            Self::ShortRead { .. } => 31,
            Self::ChecksumMismatch { .. } => 40,
            Self::DeviceClosed => 50,
            Self::Internal(_) => 60,
            Self::Configuration(_) => 61,
        }
    }
}

/// Numeric status for a completed operation, 0 on success
#[must_use]
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}
