//! Library error type
//!
//! Compile and build failures are not errors: they come back as failed
//! [`ProcessResult`](crate::process::ProcessResult)s so their output can be
//! analyzed. Everything here either rejects a single operation (`Patch`) or
//! aborts the run.

use crate::patch::PatchError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The caller gave up. Never converted into a failure result.
    #[error("Operation was cancelled")]
    Cancelled,

    #[error("{operation} timed out after {secs}s", secs = .after.as_secs())]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Patch rejected: {0}")]
    Patch(#[from] PatchError),

    #[error("Agent run {run_id} ended with status '{status}'{detail}")]
    RunFailed {
        run_id: String,
        status: String,
        /// Either empty or `": <last error>"`.
        detail: String,
    },

    #[error("File indexing did not complete: {0}")]
    IndexingIncomplete(String),

    #[error("Agent response did not contain {0}")]
    MissingContent(String),

    #[error("No addressable errors found in {step} output")]
    NoAddressableErrors { step: String },

    #[error("Reached maximum of {0} iterations without a clean build")]
    MaxIterationsReached(usize),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub(crate) fn run_failed(
        run_id: impl Into<String>,
        status: impl Into<String>,
        last_error: Option<&str>,
    ) -> Self {
        Error::RunFailed {
            run_id: run_id.into(),
            status: status.into(),
            detail: last_error
                .filter(|d| !d.trim().is_empty())
                .map(|d| format!(": {}", d.trim()))
                .unwrap_or_default(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
