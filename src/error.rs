//! Typed errors for the pipeline seams
//!
//! Only [`ConfigError`] is fatal. Everything else is contained by the
//! component that produces it: candidate errors drop the record, probe
//! errors become failed test results and storage errors are logged.

use std::io;
use thiserror::Error;

/// Invalid startup parameters
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },

    #[error("invalid URL for {field}: {url}")]
    InvalidUrl { field: &'static str, url: String },

    #[error("{0}")]
    Missing(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for environment variable {name}: {value}")]
    Env { name: &'static str, value: String },
}

/// Malformed candidate coming from an upstream source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CandidateError {
    #[error("missing host")]
    MissingHost,

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Failure while talking to the network through (or around) a candidate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unsupported proxy: {0}")]
    InvalidProxy(String),

    #[error("unexpected HTTP status: {0}")]
    Status(u16),

    #[error("unreadable response: {0}")]
    Body(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeError::Timeout
        } else if err.is_connect() {
            ProbeError::Connect(err.to_string())
        } else if err.is_body() || err.is_decode() {
            ProbeError::Body(err.to_string())
        } else if err.is_builder() {
            ProbeError::InvalidProxy(err.to_string())
        } else {
            ProbeError::Request(err.to_string())
        }
    }
}

/// Durable store read/write failure
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::OutOfRange {
            field: "max_workers",
            min: 1,
            max: 50,
            value: 0,
        };
        assert_eq!(err.to_string(), "max_workers must be between 1 and 50 (got 0)");

        let err = ConfigError::Missing("geo.mmdb_path is required".to_string());
        assert_eq!(err.to_string(), "geo.mmdb_path is required");
    }

    #[test]
    fn test_probe_error_display() {
        assert_eq!(ProbeError::Timeout.to_string(), "request timed out");
        assert_eq!(ProbeError::Status(407).to_string(), "unexpected HTTP status: 407");
    }
}
