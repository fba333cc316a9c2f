//! Error types for the mesh-proxy-ble crate.

use thiserror::Error;

/// How a failure should be treated by whoever is driving the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Retrying the same attempt cannot succeed; surface it to the caller.
    Terminal,
    /// The link may come up on a later attempt.
    Retryable,
    /// Affects a single call only; the link itself is still usable.
    PerCall,
}

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The platform refused access to the radio. The caller must request
    /// authorization again before retrying.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The link could not be established or was lost while being set up.
    #[error("Link failure (status {code})")]
    LinkFailure {
        /// Status code reported by the radio stack.
        code: i32,
    },

    /// The peer does not expose the mesh proxy service.
    #[error("Service not found: {uuid}")]
    ServiceMissing {
        /// The UUID of the service (or characteristic) that was missing.
        uuid: String,
    },

    /// Operation requires a ready link.
    #[error("Transport not ready (state: {state})")]
    NotReady {
        /// The state the transport was in when the call was made.
        state: String,
    },

    /// The radio stack refused to queue a write.
    #[error("Write rejected by the radio stack")]
    WriteRejected,

    /// Setup did not reach the ready state in time.
    #[error("Connection setup timed out")]
    SetupTimeout,

    /// No proxy node was discovered before the discovery timeout.
    #[error("No proxy node found")]
    ProxyNotFound,

    /// The fast path was requested but no proxy address has been saved.
    #[error("No saved proxy address")]
    NoSavedProxy,

    /// The external address store failed.
    #[error("Address store error: {reason}")]
    Storage {
        /// Description of the storage failure.
        reason: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error for retry decisions.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::LinkFailure { .. } | Self::SetupTimeout | Self::Bluetooth(_) => {
                FailureClass::Retryable
            }
            Self::WriteRejected | Self::NotReady { .. } => FailureClass::PerCall,
            _ => FailureClass::Terminal,
        }
    }

    /// Check if the supervisor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Retryable
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classes() {
        assert_eq!(Error::PermissionDenied.class(), FailureClass::Terminal);
        assert_eq!(
            Error::ServiceMissing {
                uuid: "1828".to_string()
            }
            .class(),
            FailureClass::Terminal
        );
        assert!(Error::LinkFailure { code: 133 }.is_retryable());
        assert!(Error::SetupTimeout.is_retryable());
        assert_eq!(Error::WriteRejected.class(), FailureClass::PerCall);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::LinkFailure { code: 8 }.to_string(),
            "Link failure (status 8)"
        );
    }
}
