//! IPC error types
//!
//! Every operation in the service returns a [`Result`]. The kinds map onto
//! three recovery classes: configuration errors (caller defect, never
//! retry), capacity/transport errors (retry later or shed load), and buffer
//! provenance errors (a buffer was used by someone who does not own it).

use thiserror::Error;

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    /// Bad or missing argument, or a buffer used through the wrong path
    #[error("invalid configuration or argument")]
    InvalidConfig,

    /// Operation attempted before the instance/transport was initialized
    #[error("no backend attached to instance")]
    NoBackend,

    /// Fixed-capacity table (instances, endpoints) exhausted
    #[error("no space left in fixed-capacity table")]
    NoSpace,

    /// Buffer pool exhausted
    #[error("no free buffers in pool")]
    NoBuffers,

    /// Instance with this name is already open
    #[error("instance already open")]
    AlreadyOpen,

    /// Endpoint already holds its maximum number of unsent tx buffers
    #[error("tx buffer already reserved by this endpoint")]
    AlreadyReserved,

    /// Rx buffer is already held
    #[error("rx buffer already held")]
    AlreadyHeld,

    /// Rx buffer was already released
    #[error("rx buffer already released")]
    AlreadyReleased,

    /// Tx buffer was already dropped
    #[error("tx buffer already dropped")]
    AlreadyDropped,

    /// Transient transport congestion, safe to retry
    #[error("transport busy")]
    Busy,

    /// Message length out of bounds
    #[error("bad message length")]
    BadMessage,

    /// Requested buffer size exceeds the backend maximum
    #[error("requested size too large (max: {max} bytes)")]
    TooLarge { max: usize },

    /// Operation not implemented by this transport
    #[error("operation not supported")]
    NotSupported,

    /// Buffer was never handed out by this pool
    #[error("buffer not obtained from pool")]
    NotFromPool,

    /// Rx buffer was never held
    #[error("rx buffer not held")]
    NotHeld,

    /// Mailbox register access failed
    #[error("mailbox hardware fault")]
    HardwareFault,

    /// Endpoint has not completed the bind handshake
    #[error("endpoint not bound")]
    NotBound,

    /// A bounded wait expired
    #[error("timed out")]
    TimedOut,

    /// Received frame addressed to an endpoint that does not exist
    #[error("no endpoint at address {addr:#x}")]
    UnknownEndpoint { addr: u32 },
}

impl IpcError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpcError::Busy | IpcError::NoBuffers | IpcError::HardwareFault | IpcError::TimedOut
        )
    }

    /// Whether the error indicates a caller defect
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            IpcError::InvalidConfig
                | IpcError::AlreadyDropped
                | IpcError::AlreadyReleased
                | IpcError::NotFromPool
                | IpcError::NotHeld
        )
    }
}

pub type Result<T> = core::result::Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_retry_classes() {
        assert!(IpcError::Busy.is_retryable());
        assert!(IpcError::NoBuffers.is_retryable());
        assert!(!IpcError::InvalidConfig.is_retryable());
        assert!(IpcError::AlreadyDropped.is_config_error());
        assert!(!IpcError::NoSpace.is_config_error());
    }

    #[test]
    fn test_display_carries_context() {
        assert_eq!(
            IpcError::TooLarge { max: 496 }.to_string(),
            "requested size too large (max: 496 bytes)"
        );
        assert_eq!(
            IpcError::UnknownEndpoint { addr: 0x405 }.to_string(),
            "no endpoint at address 0x405"
        );
    }
}
