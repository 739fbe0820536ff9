//! Error types for the exchange channel and its run orchestration

use param_exchange_shm::SharedMemoryError;
use thiserror::Error;

/// Exchange error types
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Shared memory, semaphore or slot failure
    #[error(transparent)]
    Channel(#[from] SharedMemoryError),

    /// Malformed configuration line
    #[error("Configuration error at line {line}: {message}")]
    Config { line: usize, message: String },

    /// A key the run cannot proceed without
    #[error("Missing configuration key: {0}")]
    MissingKey(String),

    /// TOML configuration could not be parsed
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The peer exited before finishing the readiness handshake
    #[error("Peer process exited before it was ready (status {0:?})")]
    PeerExited(Option<i32>),

    /// Peer process could not be managed
    #[error("Peer error: {0}")]
    Peer(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, ExchangeError>;

impl ExchangeError {
    /// Build a configuration error for a line
    pub fn config(line: usize, message: impl Into<String>) -> Self {
        ExchangeError::Config {
            line,
            message: message.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExchangeError::Channel(err) => err.is_recoverable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_follows_channel_errors() {
        let timeout: ExchangeError = SharedMemoryError::Timeout("acquire /cpp_sem".into()).into();
        assert!(timeout.is_recoverable());

        let corrupted: ExchangeError = SharedMemoryError::CorruptedIndex { index: -1, slots: 3 }.into();
        assert!(!corrupted.is_recoverable());
        assert!(!ExchangeError::PeerExited(Some(1)).is_recoverable());
    }

    #[test]
    fn test_config_error_message() {
        let err = ExchangeError::config(4, "expected `key = value` or `key value`");
        assert_eq!(
            err.to_string(),
            "Configuration error at line 4: expected `key = value` or `key value`"
        );
    }
}
