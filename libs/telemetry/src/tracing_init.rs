use std::sync::OnceLock;

use anyhow::Result;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{DEFAULT_FILTER, TelemetryConfig};

static INIT: OnceLock<String> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops; a subscriber
/// installed by someone else (e.g. a test harness) is left in place.
pub fn init_telemetry(cfg: TelemetryConfig) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let fmt_layer = if cfg.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let env_filter =
        EnvFilter::try_new(&cfg.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    INIT.set(cfg.service_name.clone()).ok();
    if installed {
        tracing::info!(service = %cfg.service_name, json = cfg.json_logs, "telemetry installed");
    }
    Ok(())
}

/// Service name passed to the first successful [`init_telemetry`] call.
pub fn telemetry_installed() -> Option<&'static str> {
    INIT.get().map(String::as_str)
}
