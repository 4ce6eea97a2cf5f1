//! Typed error hierarchy for the gatekeeper.
//!
//! One enum per failure class, matching how each class propagates:
//! - `ConfigError` — malformed config or CLI usage; fatal, exit 1
//! - `DbError` — build-db read/write; fatal at load, logged at save
//! - `FetchError` — transient master/sheriff/status fetch; skip and continue
//! - `StatusError` — tree-status write rejected; logged, run continues
//! - `MailError` — mailer rejected a payload; logged, other mails proceed

use thiserror::Error;

/// Gatekeeper config or CLI arguments are malformed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid section for master {master}: {message}")]
    InvalidSection { master: String, message: String },

    #[error("Master {0} is not present in the gatekeeper config")]
    UnknownMaster(String),

    #[error("{0}")]
    Usage(String),
}

/// Build-db persistence failures.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to read build db at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse build db at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write build db at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Transient failure talking to a master or sheriff endpoint.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected response from {url}: {message}")]
    BadResponse { url: String, message: String },
}

/// The tree-status service refused a read or write.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Tree status request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Tree status write to {url} rejected with HTTP {code}")]
    Rejected { url: String, code: u16 },

    #[error("Could not parse tree status from {url}")]
    Unparseable { url: String },
}

/// The mailer rejected a notification payload.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("Mailer request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Mailer at {url} returned HTTP {code}")]
    Rejected { url: String, code: u16 },
}
