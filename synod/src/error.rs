//! # Summary
//!
//! This module defines the crate's error taxonomy. Nacks are protocol
//! signals, not errors: they drive retries inside the per-key actor and
//! never surface here. Decode errors are logged at the dispatcher and
//! never reach a client either; the remaining kinds are what `read` and
//! `write` can return.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A write was submitted with an empty value.
    #[error("invalid argument: write value must be non-empty")]
    InvalidArgument,

    /// Durable storage failed; the surrounding transition did not happen.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The configured operation timeout elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Inbound bytes did not decode to a known message.
    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Storage(error.to_string())
    }
}
