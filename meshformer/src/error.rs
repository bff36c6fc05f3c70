//! Error types for meshformer

use thiserror::Error;

/// Result type alias using meshformer's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for meshformer operations
#[derive(Error, Debug)]
pub enum Error {
    /// Unsupported name, a shard count that does not divide a required
    /// dimension, or an incompatible feature combination. Raised when a
    /// model, plan or shape map is constructed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A checkpoint tensor disagrees with the shape implied by the
    /// configuration. Raised at load time; nothing is loaded.
    #[error("Shape mismatch for {path}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        path: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parameter not found: {0}")]
    MissingParameter(String),

    #[error("Collective failed: {0}")]
    Collective(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
