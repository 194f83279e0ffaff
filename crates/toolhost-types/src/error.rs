//! Error types shared across toolhost crates.

use thiserror::Error;

/// Errors from the server configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Server '{name}' is not configured")]
    NotFound { name: String },

    #[error("Invalid definition for server '{name}': {message}")]
    InvalidDefinition { name: String, message: String },

    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            name: name.into(),
            message: message.into(),
        }
    }
}
