//! Error types for the launch predictor

use thiserror::Error;

/// Errors that can occur while building, persisting or querying predictions
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("Malformed state blob: {0}")]
    Decode(String),

    #[error("Failed to encode state: {0}")]
    Encode(String),

    #[error("Unknown extractor type tag: {0}")]
    UnknownExtractor(String),

    #[error("Corrupt feature state: {0}")]
    CorruptState(String),

    #[error("Failed to parse input: {0}")]
    Parse(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid app identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Event log unavailable: {0}")]
    EventLog(String),

    #[error("Package query failed: {0}")]
    PackageQuery(String),

    #[error("Workspace query failed: {0}")]
    Workspace(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Prediction worker has stopped")]
    WorkerStopped,
}
