use std::fmt;
use std::io;
use thiserror::Error;

use super::types::{RfMode, TransceiverSeries};

/// Which protocol waiting window elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// No confirmation arrived in time
    Confirmation,
    /// No response arrived in time
    Response,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Confirmation => write!(f, "confirmation"),
            TimeoutKind::Response => write!(f, "response"),
        }
    }
}

/// Custom error types for the DPA runtime
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Waiting for {0} timeouted")]
    StateTimeouted(TimeoutKind),

    #[error("Internal state machine error: {0}")]
    Internal(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Unsupported transceiver series: {0:?}")]
    UnsupportedTransceiverSeries(TransceiverSeries),

    #[error("Unsupported RF mode: {0:?}")]
    UnsupportedRfMode(RfMode),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Runtime is shut down")]
    Shutdown,
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Creates a new dispatch error
    pub fn dispatch(msg: impl Into<String>) -> Self {
        Error::Dispatch(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Returns true for protocol timeouts, which the machine recovers from on its own
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::StateTimeouted(_))
    }
}

/// Failure attached to a single call request.
///
/// Unlike [`Error`] this is cheap to clone, so it can be kept in result
/// records and handed to any number of pollers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("dispatch failed after {attempts} attempt(s): {reason}")]
    Dispatch { attempts: u32, reason: String },

    #[error("confirmation did not arrive in time")]
    ConfirmationTimeout,

    #[error("response did not arrive in time")]
    ResponseTimeout,

    #[error("no response arrived before the idle request expired")]
    NoResponse,

    #[error("protocol layer failure: {0}")]
    Internal(String),
}

impl From<TimeoutKind> for ProcessingError {
    fn from(kind: TimeoutKind) -> Self {
        match kind {
            TimeoutKind::Confirmation => ProcessingError::ConfirmationTimeout,
            TimeoutKind::Response => ProcessingError::ResponseTimeout,
        }
    }
}
