use std::{collections::HashSet, time::Duration};

use anyhow::{anyhow, Result};
use data_model::{CellPresence, RestartPolicyConfig};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use lrp_utils::{Backoff, RetryPolicy};
use processor::{convergence_processor::duration_secs, ConvergenceConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOCAL_ENV: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    Rocksdb {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConvergenceSettings {
    #[serde(flatten)]
    pub processor: ConvergenceConfig,
    /// A crash after running this long resets the crash count.
    #[serde(with = "duration_secs")]
    pub crash_reset_timeout: Duration,
    pub restart_policy: RestartPolicyConfig,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            processor: ConvergenceConfig::default(),
            crash_reset_timeout: Duration::from_secs(5 * 60),
            restart_policy: RestartPolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_metrics: bool,
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317.
    pub endpoint: Option<String>,
    #[serde(with = "duration_secs")]
    pub metrics_interval: Duration,
    pub instance_id: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub storage: StorageConfig,
    pub convergence: ConvergenceSettings,
    /// Cells known to the static registry.
    pub cells: Vec<CellPresence>,
    pub auctioneer_url: String,
    /// Applied to stop calls made while retiring extra instances.
    pub retirement: RetryPolicy,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            storage: StorageConfig::default(),
            convergence: ConvergenceSettings::default(),
            cells: Vec::new(),
            auctioneer_url: "http://127.0.0.1:9016".to_string(),
            retirement: RetryPolicy::new(
                3,
                Backoff::Exponential {
                    initial_ms: 100,
                    max_ms: 2_000,
                    jitter: true,
                },
            ),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let convergence = &self.convergence.processor;
        if convergence.interval.is_zero() {
            return Err(anyhow!("convergence interval must be positive"));
        }
        if convergence.run_timeout.is_zero() {
            return Err(anyhow!("convergence run timeout must be positive"));
        }
        if convergence.workers == 0 {
            return Err(anyhow!("convergence needs at least one worker"));
        }
        if let StorageConfig::Rocksdb { path } = &self.storage {
            if path.is_empty() {
                return Err(anyhow!("rocksdb storage needs a path"));
            }
        }
        if reqwest::Url::parse(&self.auctioneer_url).is_err() {
            return Err(anyhow!("invalid auctioneer url: {}", self.auctioneer_url));
        }
        let mut cell_ids = HashSet::new();
        for cell in &self.cells {
            if !cell_ids.insert(&cell.cell_id) {
                return Err(anyhow!("cell {} is listed twice", cell.cell_id));
            }
            if reqwest::Url::parse(&cell.rep_address).is_err() {
                return Err(anyhow!(
                    "invalid address for cell {}: {}",
                    cell.cell_id,
                    cell.rep_address
                ));
            }
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}
