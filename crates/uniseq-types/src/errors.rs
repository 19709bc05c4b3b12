//! Error types for uniseq

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for uniseq operations
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum UniseqError {
    /// Configuration errors, raised while constructing a layer
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Call-time input validation errors
    #[error("Input validation error: {message}")]
    InputValidation { message: String },

    /// Collective communication errors
    #[error("Collective error: {message}")]
    Collective { message: String },

    /// Attention kernel errors
    #[error("Kernel error: {message}")]
    Kernel { message: String },

    /// Tensor backend errors
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Lane, token and buffer errors
    #[error("Runtime error: {message}")]
    Runtime { message: String },

    /// Unsupported operation errors
    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    IO { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl UniseqError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an input validation error
    pub fn input_validation(message: impl Into<String>) -> Self {
        Self::InputValidation {
            message: message.into(),
        }
    }

    /// Create a collective error
    pub fn collective(message: impl Into<String>) -> Self {
        Self::Collective {
            message: message.into(),
        }
    }

    /// Create a kernel error
    pub fn kernel(message: impl Into<String>) -> Self {
        Self::Kernel {
            message: message.into(),
        }
    }

    /// Create a backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error was raised while constructing a layer
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Check if this error was raised while validating call inputs
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::InputValidation { .. })
    }

    /// Check if this is a retryable error
    ///
    /// Collective and kernel failures leave partially written chunk buffers
    /// behind, so nothing raised by a forward pass is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::IO { .. })
    }
}

/// Conversion from std::io::Error
impl From<std::io::Error> for UniseqError {
    fn from(err: std::io::Error) -> Self {
        Self::io(format!("{}", err))
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for UniseqError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("{}", err))
    }
}

/// Conversion from candle_core::Error
impl From<candle_core::Error> for UniseqError {
    fn from(err: candle_core::Error) -> Self {
        Self::backend(format!("{}", err))
    }
}
