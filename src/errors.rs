// Error handling infrastructure
// Custom error types using thiserror

use thiserror::Error;

/// Result type alias for reviewscope operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for reviewscope
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O operation errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network errors with an optional HTTP status
    #[error("Network error: {message}")]
    Network {
        message: String,
        status_code: Option<u16>,
    },

    /// The bounded retry budget for a transient failure was exhausted
    #[error("Retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    /// GitHub event sync ran off the paginated window without catching up.
    /// The caller must clear the repo cursor and re-run a full sync.
    #[error("Lost event sync for {project}; full re-sync required")]
    LostSync { project: String },

    /// Filter expression parse or validation errors
    #[error("Filter error: {message}")]
    Filter { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The operation was cancelled before completion
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            status_code: None,
        }
    }

    /// Create a network error with status code
    pub fn network_with_status(message: impl Into<String>, status_code: u16) -> Self {
        Self::Network {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Create a filter error
    pub fn filter(message: impl Into<String>) -> Self {
        Self::Filter {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for failures that a caller may retry without clearing state.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Network { .. }
                | Self::RetriesExhausted { .. }
                | Self::Cancelled
        )
    }
}
