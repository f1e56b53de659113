//! Structured logging setup shared by the authorization workspace
//!
//! Output is either human-readable (development) or one JSON object per line
//! (production). `RUST_LOG` overrides the configured level when set.
//!
//! # Example
//!
//! ```rust
//! use telemetry::{init_tracing, LogFormat, TelemetryConfig};
//!
//! let config = TelemetryConfig {
//!     level: "zanzibar_core=debug".to_string(),
//!     format: LogFormat::Json,
//! };
//! init_tracing(&config).ok();
//! tracing::info!(revision = 1, "Engine ready");
//! ```

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directives used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| TelemetryError::InvalidFilter {
            directive: self.level.clone(),
            reason: e.to_string(),
        })
    }
}

/// Install the global subscriber.
///
/// Fails if one is already installed, so tests may call it repeatedly and
/// ignore the error.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init(),
    };
    installed.map_err(|e| TelemetryError::TracingError(e.to_string()))
}

/// Quiet subscriber for tests, writing through the test harness capture
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
