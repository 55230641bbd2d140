//! Error types for Booking Telemetry

use thiserror::Error;

/// Errors surfaced by the session engine.
///
/// None of these are fatal to the host flow: lifecycle errors are returned to
/// the caller as soft failures and logged.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("No tracking session in progress")]
    NotTracking,

    #[error("Session already active for run '{active}', refusing to start run '{requested}'")]
    RunKeyConflict { active: String, requested: String },

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse session document: {0}")]
    ParseError(String),

    #[error("Invalid timestamp '{value}' in field {field}")]
    InvalidTimestamp { field: String, value: String },

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

/// Errors raised while delivering an exported document.
///
/// These never escape the export service; they are recorded in the
/// [`DeliveryReport`](crate::delivery::DeliveryReport) instead.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Sink rejected document with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Delivery timed out after {0} ms")]
    Timeout(u64),

    #[error("Local save failed: {0}")]
    LocalSave(#[from] std::io::Error),
}
