//! Error types for the tile scheduler

use thiserror::Error;

/// Result type for scheduling operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Scheduling errors
///
/// All of these are detected before any instruction is issued for the
/// offending configuration; the tile sequencers themselves never fail.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Capacity exceeded: {message}")]
    CapacityError { message: String },

    #[error("Unsupported configuration: {message}")]
    Unsupported { message: String },

    #[error("Memory access error: {message}")]
    MemoryError { message: String },
}

impl SchedError {
    pub fn config(msg: impl Into<String>) -> Self {
        SchedError::ConfigError { message: msg.into() }
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        SchedError::CapacityError { message: msg.into() }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        SchedError::Unsupported { message: msg.into() }
    }

    pub fn memory(msg: impl Into<String>) -> Self {
        SchedError::MemoryError { message: msg.into() }
    }
}
