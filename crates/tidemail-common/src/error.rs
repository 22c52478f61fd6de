//! Error types for Tidemail

use thiserror::Error;

/// Main error type for Tidemail
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed or missing client input. The message is shown to the caller as is.
    #[error("{0}")]
    Params(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Tidemail
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Params(_) => 400,
            Error::Auth(_) => 401,
            Error::NotFound(_) => 404,
            Error::Config(_)
            | Error::Database(_)
            | Error::Storage(_)
            | Error::Plugin(_)
            | Error::Delivery(_)
            | Error::Internal(_)
            | Error::Other(_) => 500,
        }
    }

    /// Returns the machine-readable error number used in API responses
    pub fn error_no(&self) -> i32 {
        match self {
            Error::Params(_) => 100,
            Error::Auth(_) => 403,
            Error::NotFound(_) => 404,
            _ => 500,
        }
    }

    /// Message that is safe to show to an external caller.
    ///
    /// Server-side failures are collapsed into an opaque text; the detail is
    /// only ever logged.
    pub fn public_message(&self) -> String {
        match self {
            Error::Params(msg) => msg.clone(),
            Error::Auth(_) => "authentication failed".to_string(),
            Error::NotFound(what) => format!("{} not found", what),
            _ => "server error".to_string(),
        }
    }

    /// Whether this error belongs to the client rather than the server
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", e))
    }
}
