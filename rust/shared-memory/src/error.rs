//! Shared memory specific error types

use thiserror::Error;

/// Shared memory error types
#[derive(Error, Debug)]
pub enum SharedMemoryError {
    /// A named region or semaphore never appeared within the bounded wait
    #[error("Resource unavailable after {waited_ms}ms: {resource}")]
    ResourceUnavailable { resource: String, waited_ms: u64 },

    /// Requested sub-range (or slot index) does not fit inside its container
    #[error("Range out of bounds: {offset} + {len} exceeds {size}")]
    OutOfRange { offset: usize, len: usize, size: usize },

    /// Active slot index read from shared memory is outside the slot set
    #[error("Corrupted active slot index {index}, slot set has {slots} slots")]
    CorruptedIndex { index: i64, slots: usize },

    /// Acquire/release pairing of the handshake was broken
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Value array byte length does not match the slot
    #[error("Length mismatch: slot holds {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Slot layout cannot be built (slot count, zero-width elements)
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    /// A semaphore acquire exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Region or semaphore already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Region or semaphore name rejected before reaching the OS
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, SharedMemoryError>;

impl SharedMemoryError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            SharedMemoryError::Timeout(_) => true,
            SharedMemoryError::ResourceUnavailable { .. } => true,
            SharedMemoryError::Io(err) => {
                matches!(err.kind(),
                    std::io::ErrorKind::TimedOut |
                    std::io::ErrorKind::WouldBlock |
                    std::io::ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }

    /// Convert an errno returned by a platform call
    pub fn from_errno(errno: nix::errno::Errno, context: impl Into<String>) -> Self {
        SharedMemoryError::Platform(format!("{}: {}", context.into(), errno.desc()))
    }
}
