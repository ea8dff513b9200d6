//! Error hierarchy for the watch-and-decode engine.
//!
//! Errors fall into three operational classes:
//! - [`ConfigurationError`]: invalid pipeline setup, fatal to that pipeline
//! - [`StoreError`]: failures talking to the store, retried with backoff
//! - [`DecodeError`]: the destination shape and the store data disagree

use std::fmt::Display;

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pipeline setup failures, detected before any store call is made
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Store communication failures (network, unexpected responses)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Structural mismatch between the destination type and store data
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Layered settings could not be loaded or deserialized
    #[error(transparent)]
    Settings(#[from] ConfigError),

    /// Lifecycle operation issued in the wrong pipeline state
    #[error("Operation requires {expected} state but pipeline is {current}")]
    InvalidState {
        current: &'static str,
        expected: &'static str,
    },
}

impl Error {
    /// Store failures are transient: the watcher keeps retrying after them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Prefix must not be empty")]
    EmptyPrefix,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Connection refused, reset, DNS failure and similar
    #[error("Store transport failure: {0}")]
    Transport(String),

    /// Non-success status returned by the store
    #[error("Store responded with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Response could not be interpreted
    #[error("Invalid store response: {0}")]
    InvalidResponse(String),

    /// Store is reachable but refuses to serve (no leader, shutting down)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Cannot parse value {value:?} at key '{key}' as {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("Value at key '{key}' is not valid UTF-8")]
    InvalidUtf8 { key: String },

    #[error("Unsupported field kind '{kind}' at key '{key}'")]
    Unsupported { key: String, kind: &'static str },

    #[error("Error decoding key '{key}': {message}")]
    Field { key: String, message: String },

    /// A field was reached through more than one of its names (primary
    /// name and `#[serde(alias)]`s)
    #[error("Field '{field}' was decoded more than once")]
    DuplicateField { field: &'static str },

    #[error("{0}")]
    Custom(String),
}

impl DecodeError {
    /// Attaches key context to errors raised by serde visitors, which only
    /// carry a message.
    pub(crate) fn at_key(
        self,
        key: &str,
    ) -> Self {
        match self {
            DecodeError::Custom(message) => DecodeError::Field {
                key: key.to_string(),
                message,
            },
            other => other,
        }
    }
}

impl serde::de::Error for DecodeError {
    fn custom<T: Display>(msg: T) -> Self {
        DecodeError::Custom(msg.to_string())
    }

    fn duplicate_field(field: &'static str) -> Self {
        DecodeError::DuplicateField { field }
    }
}
