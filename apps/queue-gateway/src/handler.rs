use std::sync::Arc;

use brokerline_bus::{Envelope, SharedHandler};
use serde_json::Value;
use tracing::info;

/// Handler the gateway subscribes with: logs each delivered envelope and
/// accepts it.
pub fn logging_handler() -> SharedHandler {
    Arc::new(|envelope: Envelope| async move {
        let payload = envelope
            .payload
            .map(Value::Object)
            .unwrap_or(Value::Null);
        info!(
            message_type = %envelope.kind,
            message_id = envelope.message_id.as_deref().unwrap_or(""),
            correlation_id = envelope.correlation_id.as_deref().unwrap_or(""),
            payload = %payload,
            "processing message"
        );
        anyhow::Ok(())
    })
}
