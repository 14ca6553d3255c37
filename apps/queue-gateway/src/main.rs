use anyhow::Result;
use brokerline_gateway::config::GatewayConfig;
use brokerline_gateway::run;
use brokerline_telemetry::install as init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("queue-gateway")?;

    let config = GatewayConfig::from_env()?;
    run(config).await
}
