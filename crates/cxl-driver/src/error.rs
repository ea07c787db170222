//! Error types for CXL streaming operations

use crate::memory::PoolId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for CXL operations
pub type Result<T> = std::result::Result<T, CxlError>;

/// Errors that can occur while staging data and driving the accelerator
#[derive(Debug, Error)]
pub enum CxlError {
    /// Input file does not exist
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path that was opened
        path: PathBuf,
    },

    /// File ended before the requested number of bytes was read
    #[error("Short read from {path} at offset {offset}: expected {expected} bytes, got {got}")]
    ShortRead {
        /// File being read
        path: PathBuf,
        /// Offset the read started at
        offset: u64,
        /// Bytes requested
        expected: usize,
        /// Bytes actually available
        got: usize,
    },

    /// I/O error during file or device access
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// No contiguous run of the requested size in a memory pool
    #[error("Allocation of {bytes} bytes from {pool} failed: {reason}")]
    Allocation {
        /// Pool the request went to
        pool: PoolId,
        /// Requested size
        bytes: usize,
        /// Reason for failure
        reason: String,
    },

    /// Completion bit never set within the poll budget
    #[error("Device timeout at pass {pass}: no completion after {attempts} polls ({waited_ms}ms)")]
    DeviceTimeout {
        /// Pass that was in flight
        pass: u64,
        /// Polls performed
        attempts: u32,
        /// Approximate time spent waiting
        waited_ms: u64,
    },

    /// Caller cancelled while a batch was in flight
    #[error("Cancelled while waiting for pass {pass}")]
    Cancelled {
        /// Pass that was in flight
        pass: u64,
    },

    /// CSR region could not be mapped
    #[error("Register mapping failed: {reason}")]
    Mapping {
        /// Reason for failure
        reason: String,
    },

    /// Configuration cannot be used even after clamping
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Reason for rejection
        reason: String,
    },

    /// Report text is missing a field or has a malformed value
    #[error("Malformed report: {reason}")]
    ReportParse {
        /// Reason for failure
        reason: String,
    },

    /// Dataset file does not follow the expected layout
    #[error("Malformed dataset: {reason}")]
    Format {
        /// Reason for failure
        reason: String,
    },
}

impl CxlError {
    /// Create an allocation error
    pub fn allocation(pool: PoolId, bytes: usize, reason: impl Into<String>) -> Self {
        Self::Allocation {
            pool,
            bytes,
            reason: reason.into(),
        }
    }

    /// Create a mapping error
    pub fn mapping(reason: impl Into<String>) -> Self {
        Self::Mapping {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a report parse error
    pub fn report_parse(reason: impl Into<String>) -> Self {
        Self::ReportParse {
            reason: reason.into(),
        }
    }

    /// Create a dataset format error
    pub fn format(reason: impl Into<String>) -> Self {
        Self::Format {
            reason: reason.into(),
        }
    }

    /// Whether this error came from the device rather than the host
    pub const fn is_device(&self) -> bool {
        matches!(self, Self::DeviceTimeout { .. } | Self::Mapping { .. })
    }
}
