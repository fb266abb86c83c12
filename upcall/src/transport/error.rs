//! Error types for the caller, consumer and lifecycle surfaces.

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::config::ConfigError;

/// Why a submitted command did not produce a reply.
///
/// Every variant maps to an I/O-class failure for the layer above; see
/// [`SubmitError::is_io_class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// No consumer is attached. Nothing was queued.
    #[error("no consumer attached")]
    NoConsumer,
    /// A staged deadline passed or the consumer detached.
    #[error("command timed out")]
    Timeout,
    /// The caller's interrupt fired. The command may still be in flight.
    #[error("interrupted while waiting for reply")]
    Interrupted,
    /// The transport shut down before the command resolved.
    #[error("transport shut down")]
    Cancelled,
}

impl SubmitError {
    /// Whether upper layers should surface this as a generic I/O error.
    #[must_use]
    pub const fn is_io_class(self) -> bool {
        match self {
            Self::NoConsumer | Self::Timeout | Self::Interrupted | Self::Cancelled => true,
        }
    }
}

/// Why a pull returned without a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PullError {
    /// The next frame needs more room than the buffer has. The command stays
    /// queued (or resumable) and can be pulled with a larger buffer.
    #[error("pull buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// This channel was detached.
    #[error("consumer channel detached")]
    Detached,
    /// The transport shut down.
    #[error("transport shut down")]
    Shutdown,
    /// The frame could not be encoded.
    #[error(transparent)]
    Frame(#[from] ProtocolError),
}

/// Why a consumer could not attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttachError {
    /// Another consumer channel is live.
    #[error("a consumer is already attached")]
    AlreadyAttached,
    /// The transport shut down.
    #[error("transport shut down")]
    Shutdown,
}

/// Error constructing a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// The timer thread could not be spawned.
    #[error("failed to spawn timer thread: {0}")]
    Spawn(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_errors_are_io_class() {
        for err in [
            SubmitError::NoConsumer,
            SubmitError::Timeout,
            SubmitError::Interrupted,
            SubmitError::Cancelled,
        ] {
            assert!(err.is_io_class(), "{err}");
        }
    }

    #[test]
    fn config_error_converts() {
        let err: TransportError = ConfigError::WheelSlots(3).into();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
        assert_eq!(
            err.to_string(),
            "invalid configuration: wheel slots must be a power of two, got 3"
        );
    }

    #[test]
    fn pull_error_reports_sizes() {
        let err = PullError::BufferTooSmall { need: 64, have: 16 };
        assert_eq!(err.to_string(), "pull buffer too small: need 64 bytes, have 16");
    }
}
