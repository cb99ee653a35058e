//! Core error types for QuorumFS

use thiserror::Error;

/// Crate-level error for QuorumFS operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Consensus error: {source}")]
    Consensus {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Transport error: {source}")]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CoreError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn storage<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Storage { source: Box::new(error) }
    }

    pub fn consensus<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Consensus { source: Box::new(error) }
    }

    pub fn transport<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Transport { source: Box::new(error) }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }
}

/// Result type alias for QuorumFS operations.
pub type Result<T> = std::result::Result<T, CoreError>;
