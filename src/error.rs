//! Error taxonomy for instrument operations.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Resource enumeration failed as a whole.
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("failed to open {address}: {message}")]
    Connect { address: String, message: String },
    #[error("failed to send {command:?}: {message}")]
    Write { command: String, message: String },
    #[error("query {command:?} failed: {message}")]
    Query { command: String, message: String },
    #[error("{action} timed out after {millis} ms")]
    Timeout { action: String, millis: u64 },
    /// Malformed numeric input, rejected before any transport call.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    /// Precondition (connection or protection interlock) not met.
    #[error("{0}")]
    Interlock(String),
    #[error("channel {0} is not part of the current discovery result")]
    UnknownChannel(String),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
