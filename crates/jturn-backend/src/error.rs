//! Backend agent errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to connect to relay server at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("registration refused: {reason}")]
    Registration { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
