use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::Parser;
use service::Service;

mod clients;
mod config;
mod service;
mod tracing;
use crate::tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => {
            let path = path
                .to_str()
                .ok_or_else(|| anyhow!("config path is not valid utf-8"))?;
            config::ServerConfig::from_path(path).context("Failed to load config")?
        }
        None => config::ServerConfig::default(),
    };

    let tracer_provider = setup_tracing(&config)?;
    let result = start_convergence(config).await;

    // export traces before shutdown
    if let Some(tracer_provider) = tracer_provider {
        if let Err(err) = tracer_provider.shutdown() {
            ::tracing::error!("Error shutting down tracer provider: {:?}", err);
        }
    }
    result
}

#[::tracing::instrument(skip(config), fields(env = config.env, instance_id = config.instance_id()))]
async fn start_convergence(config: config::ServerConfig) -> anyhow::Result<()> {
    let mut service = Service::new(config)
        .await
        .context("Failed to create service")?;
    service.start().await.context("Convergence service stopped")
}
