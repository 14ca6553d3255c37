//! Logging setup for Brokerline services.
//!
//! Every binary calls [`install`] once at startup. Output format and filter
//! come from the environment (`LOG_FORMAT`, `RUST_LOG`).

use anyhow::Result;

mod config;
mod tracing_init;

pub use config::TelemetryConfig;
pub use tracing_init::{init_telemetry, telemetry_installed};

/// Installs the process-wide subscriber configured from the environment.
pub fn install(service_name: &str) -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(service_name))
}
