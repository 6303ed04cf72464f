//! # Sync Telemetry
//!
//! Logging setup shared by the sync engine's binaries and test harnesses.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sync_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let _guard = init_telemetry(TelemetryConfig::from_env()).expect("Failed to init telemetry");
//!     // Structured logs are now emitted
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SYNC_SERVICE_NAME` | `client-sync` | Service name in logs |
//! | `SYNC_LOG_LEVEL` | `info` | Log level filter (`RUST_LOG` also honoured) |
//! | `SYNC_JSON_LOGS` | `false` | JSON output (defaults on inside containers) |
//! | `SYNC_CONSOLE_OUTPUT` | `true` | Disable to silence all output |

#![warn(missing_docs)]

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::init_logging;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The log filter directive could not be parsed
    #[error("Invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber was installed earlier in this process
    #[error("Failed to install subscriber: {0}")]
    AlreadyInitialized(String),
}

/// Initialize logging.
///
/// Returns a guard that should be held for the lifetime of the application;
/// dropping it logs the shutdown.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    init_logging(&config)?;

    tracing::info!(service = %config.service_name, "Telemetry initialized");

    Ok(TelemetryGuard {
        service_name: config.service_name,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    service_name: String,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry");
    }
}
