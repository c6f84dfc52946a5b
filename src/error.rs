//! Custom error types for the application.
//!
//! This module defines the primary error type, `ScopeError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur while routing device messages and
//! serving remote calls.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment load failures and semantic validation
//!   failures of a loaded [`ScopeConfig`](crate::config::ScopeConfig).
//! - **`Io`** / **`Serial`**: raw I/O and serial port failures while opening transports.
//! - **`TransportClosed`** / **`ManagerStopped`**: systemic failures of a message
//!   manager. Every waiter blocked on a response observes one of these instead of
//!   hanging.
//! - **`Protocol`**: a well-formed response that carried a device error code. Raised
//!   only at the `wait()` that asked for it, with the raw response attached.
//! - **`AlreadyResolved`**: a response future was resolved twice (a programming error).
//! - **`NoSuchCommand`**, **`Arguments`**, **`Remote`**, **`Interrupted`**: RPC dispatch
//!   and client-side failures.
//!
//! Future payload errors must be observable by any number of readers, so they are
//! stored as the cloneable [`ResponseFailure`] and converted at the point of waiting.

use bytes::Bytes;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ScopeError>;

/// Primary error type for the crate.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// The configuration could not be loaded or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A loaded configuration failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(String),

    /// The transport went away while a response was still expected.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// A message was sent through a manager that has been stopped.
    #[error("Message manager '{0}' is not running")]
    ManagerStopped(String),

    /// A response future was resolved a second time.
    #[error("Response was already resolved")]
    AlreadyResolved,

    /// The device answered with an error code.
    #[error("{message}")]
    Protocol {
        /// Human readable description, including the intent of the request if known.
        message: String,
        /// The raw response that carried the error code.
        response: Bytes,
    },

    /// Conflicting or unsupported send options.
    #[error("Invalid message options: {0}")]
    InvalidOptions(String),

    /// The RPC command name is not registered.
    #[error("No such command: {0}")]
    NoSuchCommand(String),

    /// RPC arguments did not bind to the command's parameters.
    #[error("Argument error: {0}")]
    Arguments(String),

    /// The server replied with an error; the text is the server's.
    #[error("Remote error: {0}")]
    Remote(String),

    /// An interrupt stopped the call, or a wait inside it.
    #[error("Call was interrupted")]
    Interrupted,

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A length-prefixed or delimited frame was truncated or too large.
    #[error("Malformed frame: {0}")]
    Frame(String),

    /// Property subscription bookkeeping failed.
    #[error("Property error: {0}")]
    Property(String),
}

impl From<figment::Error> for ScopeError {
    fn from(err: figment::Error) -> Self {
        ScopeError::Config(Box::new(err))
    }
}

#[cfg(feature = "instrument_serial")]
impl From<serialport::Error> for ScopeError {
    fn from(err: serialport::Error) -> Self {
        ScopeError::Serial(err.to_string())
    }
}

/// Failure stored inside a resolved response future.
///
/// Unlike [`ScopeError`] this is `Clone`, so every reader of a future sees the
/// same failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFailure {
    /// The device answered with a nonzero error code.
    Protocol {
        /// Human readable description.
        message: String,
        /// The raw response.
        response: Bytes,
    },
    /// The owning manager shut down before a response arrived.
    TransportClosed(String),
}

impl From<ResponseFailure> for ScopeError {
    fn from(failure: ResponseFailure) -> Self {
        match failure {
            ResponseFailure::Protocol { message, response } => {
                ScopeError::Protocol { message, response }
            }
            ResponseFailure::TransportClosed(reason) => ScopeError::TransportClosed(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScopeError::NoSuchCommand("scope.stage.fly".to_string());
        assert_eq!(err.to_string(), "No such command: scope.stage.fly");
    }

    #[test]
    fn test_protocol_failure_keeps_payload() {
        let failure = ResponseFailure::Protocol {
            message: "Error from device: \"71123\"".into(),
            response: Bytes::from_static(b"71123"),
        };
        match ScopeError::from(failure) {
            ScopeError::Protocol { response, message } => {
                assert_eq!(&response[..], b"71123");
                assert!(message.contains("71123"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
