use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter { directive: String, reason: String },

    #[error("Tracing initialization failed: {0}")]
    TracingError(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
