//! Error types for the agent client.
//!
//! Failures are split by how far they are allowed to travel:
//!
//! - **Fatal at construction**: [`CredentialError`], [`ConfigError`]
//! - **Per request**: [`AgentError`] (transport, status, mid-stream drops)
//! - **Per event**: never an error; a malformed record becomes
//!   [`StreamEvent::Malformed`](crate::stream::StreamEvent::Malformed) and the
//!   stream keeps going.

use std::path::PathBuf;

use thiserror::Error;

/// Key material could not be loaded or a token could not be signed.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read private key {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("failed to export public key: {0}")]
    PublicKey(String),

    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("invalid token timing: {0}")]
    InvalidTiming(String),
}

/// A single agent request failed before a full answer was assembled.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent API error {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("agent stream interrupted: {0}")]
    Stream(String),
}

impl AgentError {
    /// Transport-class failures; the caller may retry the whole request.
    pub fn is_transport(&self) -> bool {
        !matches!(self, AgentError::Credential(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Failures from the query-execution collaborator.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to connect to warehouse: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Execute(String),
}
