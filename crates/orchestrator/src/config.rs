//! Environment-driven configuration, following the `Config::from_env`
//! pattern this codebase's `sim_orchestrator` uses: every field sourced from
//! an env var with a documented default, parsed with `.context(...)`.

use anyhow::Context;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub rest_listen_addr: SocketAddr,
    pub grpc_listen_addr: SocketAddr,
    pub metrics_listen_addr: SocketAddr,
    /// The URL agents should reach, baked into provisioned VMs.
    pub orchestrator_public_endpoint: String,
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
    pub default_command_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            rest_listen_addr: std::env::var("ORCHESTRATOR_REST_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:5000".into())
                .parse()
                .context("Failed to parse ORCHESTRATOR_REST_LISTEN_ADDR")?,
            grpc_listen_addr: std::env::var("ORCHESTRATOR_GRPC_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:50051".into())
                .parse()
                .context("Failed to parse ORCHESTRATOR_GRPC_LISTEN_ADDR")?,
            metrics_listen_addr: std::env::var("ORCHESTRATOR_METRICS_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9091".into())
                .parse()
                .context("Failed to parse ORCHESTRATOR_METRICS_LISTEN_ADDR")?,
            orchestrator_public_endpoint: std::env::var("ORCHESTRATOR_PUBLIC_ENDPOINT")
                .unwrap_or_else(|_| "http://127.0.0.1:50051".into()),
            heartbeat_interval: Duration::from_secs(
                std::env::var("HEARTBEAT_INTERVAL_S")
                    .unwrap_or_else(|_| "30".into())
                    .parse()
                    .context("Failed to parse HEARTBEAT_INTERVAL_S")?,
            ),
            stale_threshold: Duration::from_secs(
                std::env::var("STALE_THRESHOLD_S")
                    .unwrap_or_else(|_| "120".into())
                    .parse()
                    .context("Failed to parse STALE_THRESHOLD_S")?,
            ),
            default_command_timeout: Duration::from_secs(
                std::env::var("DEFAULT_COMMAND_TIMEOUT_S")
                    .unwrap_or_else(|_| "300".into())
                    .parse()
                    .context("Failed to parse DEFAULT_COMMAND_TIMEOUT_S")?,
            ),
            sweep_interval: Duration::from_secs(
                std::env::var("SWEEP_INTERVAL_S")
                    .unwrap_or_else(|_| "30".into())
                    .parse()
                    .context("Failed to parse SWEEP_INTERVAL_S")?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        for var in [
            "ORCHESTRATOR_REST_LISTEN_ADDR",
            "ORCHESTRATOR_GRPC_LISTEN_ADDR",
            "ORCHESTRATOR_METRICS_LISTEN_ADDR",
            "ORCHESTRATOR_PUBLIC_ENDPOINT",
            "HEARTBEAT_INTERVAL_S",
            "STALE_THRESHOLD_S",
            "DEFAULT_COMMAND_TIMEOUT_S",
            "SWEEP_INTERVAL_S",
        ] {
            std::env::remove_var(var);
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.rest_listen_addr.port(), 5000);
        assert_eq!(config.grpc_listen_addr.port(), 50051);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(120));
        assert_eq!(config.default_command_timeout, Duration::from_secs(300));
    }
}
