use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use anyhow::{Context, Result};
use brokerline_bus::QueueConfig;

pub const BIND_ADDR_ENV: &str = "GATEWAY_BIND_ADDR";
pub const PORT_ENV: &str = "PORT";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub queue: QueueConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup(BIND_ADDR_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let ip = IpAddr::from_str(bind_addr.trim()).context("invalid gateway bind addr")?;
        let port = match lookup(PORT_ENV).filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid {PORT_ENV} value {raw:?}"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            queue: QueueConfig::from_lookup(&lookup),
        })
    }
}
