/// Unified error types for the Voice Wall client
use thiserror::Error;

/// Main error type for the client engine
#[derive(Error, Debug)]
pub enum WallError {
    /// A full reload or lookup query failed; the previous view is kept
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// A write was attempted and rejected; optimistic state is rolled back
    #[error("Could not save: {0}")]
    Persistence(String),

    /// A mutation was attempted without a session
    #[error("Sign in required: {0}")]
    AuthRequired(String),

    /// Local precondition failed before any remote call
    #[error("Validation error: {0}")]
    Validation(String),

    /// Single-row lookup found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Adapter-level failure (HTTP status, websocket, decoding)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WallError {
    /// Message shown in a view's transient banner
    pub fn banner(&self) -> String {
        match self {
            WallError::Fetch(msg)
            | WallError::Persistence(msg)
            | WallError::AuthRequired(msg)
            | WallError::Validation(msg)
            | WallError::NotFound(msg)
            | WallError::Transport(msg)
            | WallError::Config(msg) => msg.clone(),
            WallError::Io(e) => e.to_string(),
        }
    }

    /// Reclassify a transport failure raised during a reload
    pub fn into_fetch(self) -> Self {
        match self {
            WallError::Transport(msg) => WallError::Fetch(msg),
            other => other,
        }
    }

    /// Reclassify a transport failure raised during a write
    pub fn into_persistence(self) -> Self {
        match self {
            WallError::Transport(msg) | WallError::Fetch(msg) => WallError::Persistence(msg),
            other => other,
        }
    }
}

impl From<serde_json::Error> for WallError {
    fn from(e: serde_json::Error) -> Self {
        WallError::Transport(format!("Malformed row: {}", e))
    }
}

/// Result type alias for client operations
pub type WallResult<T> = Result<T, WallError>;
