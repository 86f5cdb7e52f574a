//! Error types for RimIO
//!
//! This module defines the common error type used throughout the system.
//! All fallible operations return these as values; the engine never unwinds
//! on bad input.

use thiserror::Error;

/// Common result type for RimIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for RimIO
#[derive(Debug, Error)]
pub enum Error {
    // Caller errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid pool buffer format: {0}")]
    InvalidFormat(String),

    #[error("invalid map version: {given} (current {current})")]
    InvalidVersion { given: u32, current: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    // State-machine errors
    #[error("busy: {0}")]
    Busy(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    // Resource errors
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid format error
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a busy error
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Check if the caller may retry after other state transitions complete
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Process exit code for CLI wrappers
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) | Self::InvalidFormat(_) | Self::InvalidVersion { .. } => 2,
            Self::NotFound(_) => 3,
            Self::Busy(_) => 4,
            Self::NotSupported(_) => 5,
            Self::OutOfMemory(_) => 6,
            Self::Io(_) => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::busy("drain in flight").is_retryable());
        assert!(!Error::invalid_argument("bad opcode").is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::not_found("target 42").is_not_found());
        assert!(!Error::busy("x").is_not_found());
    }

    #[test]
    fn test_exit_codes_nonzero() {
        assert_ne!(Error::invalid_argument("x").exit_code(), 0);
        assert_ne!(Error::not_found("x").exit_code(), 0);
        assert_ne!(Error::busy("x").exit_code(), 0);
    }
}
