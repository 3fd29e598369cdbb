//! Error types for smc-client
//!
//! Every failure is scoped to one job, one stream or one evaluation cycle;
//! nothing here is fatal to the process.

use thiserror::Error;

/// Client error type
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network / transport failure (connect, timeout, body read)
    #[error("Network error: {0}")]
    Transport(String),

    /// Server answered with a non-success HTTP status
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Response did not have the expected shape
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Server reported the job as failed
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// Stream or job was stopped by the caller
    #[error("Cancelled")]
    Cancelled,

    /// Invalid caller input (empty upload, bad params, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// smc-common error
    #[error("Common error: {0}")]
    Common(#[from] smc_common::Error),
}

impl ClientError {
    /// Message suitable for a transient user notification
    ///
    /// Server-reported failures show the server's own message untouched.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::JobFailed(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Malformed(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Malformed(err.to_string())
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
