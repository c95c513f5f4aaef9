//! Typed failures that callers need to match on.
//!
//! Component plumbing uses `anyhow` with context; these enums cover the
//! boundaries where the kind of failure matters to the caller.

use std::path::PathBuf;

use thiserror::Error;

/// Failure while reading or validating the YAML configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("YAML file '{0}' is empty")]
    Empty(PathBuf),

    #[error("failed to parse YAML file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reason a single-image prediction failed.
///
/// The HTTP contract collapses all of these into one `"Error"` label, but
/// the variants stay distinct in the logs.
#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("failed to load model from '{path}': {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("failed to decode image '{path}': {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model returned no predictions")]
    EmptyOutput,
}

/// Failure talking to the experiment tracking service.
#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("tracking request to '{endpoint}' failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("tracking service returned {status} for '{endpoint}': {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("unexpected tracking response: {0}")]
    Response(String),

    #[error("I/O error while uploading artifact: {0}")]
    Io(#[from] std::io::Error),
}
