// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for Wiredancer host operations
//!
//! Only resource acquisition and caller mistakes are errors. Sideband
//! timeouts and DMA completion timeouts are soft outcomes on the diagnostic
//! paths and never surface here; [`WdError::Timeout`] is reserved for the
//! strict waits that callers opt into.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Wiredancer operations
pub type Result<T> = std::result::Result<T, WdError>;

/// Errors that can occur during Wiredancer operations
#[derive(Debug, Error)]
pub enum WdError {
    /// Device not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// PCIe or shell setup failed
    #[error("Device initialization failed: {reason}")]
    DeviceInit {
        /// Reason for failure
        reason: String,
    },

    /// Pinned memory could not be allocated, locked or mapped
    #[error("Pinned allocation of {size} bytes failed: {reason}")]
    AllocationFailed {
        /// Requested size in bytes
        size: usize,
        /// Reason for failure
        reason: String,
    },

    /// Caller passed arguments the hardware cannot express
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong
        reason: String,
    },

    /// Register transport failed (port read/write, BAR bounds)
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for failure
        reason: String,
    },

    /// Device is in an invalid state for the operation
    #[error("Device in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Strict wait expired
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl WdError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create a device initialization error
    pub fn device_init(reason: impl Into<String>) -> Self {
        Self::DeviceInit {
            reason: reason.into(),
        }
    }

    /// Create an allocation failed error
    pub fn allocation_failed(size: usize, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            size,
            reason: reason.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a timeout error
    #[allow(clippy::cast_possible_truncation)]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Whether the process can do nothing useful after this error.
    ///
    /// Allocation and device setup failures are fatal; everything else is
    /// local to the failing operation.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailed { .. } | Self::DeviceInit { .. } | Self::DeviceNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fatal_classification() {
        assert!(WdError::allocation_failed(4096, "mlock").is_fatal());
        assert!(WdError::device_init("no BAR").is_fatal());
        assert!(!WdError::timeout(Duration::from_millis(5)).is_fatal());
        assert!(!WdError::invalid_request("width").is_fatal());
    }

    #[test]
    fn timeout_message() {
        let e = WdError::timeout(Duration::from_micros(2500));
        assert_eq!(e.to_string(), "Operation timeout after 2ms");
    }
}
