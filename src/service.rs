use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Context, Result};
use data_model::DefaultRestartPolicy;
use lrp_utils::SystemClock;
use metrics::init_provider;
use processor::ConvergenceProcessor;
use state_store::{
    ActualLrpInstanceEvent,
    EventHub,
    MemoryStore,
    RocksDBStore,
    StateStore,
    StateStoreConfig,
    VersionedStore,
};
use tokio::{
    signal,
    sync::{broadcast, watch},
};
use tracing::{debug, error, info, warn};

use crate::{
    clients::{HttpAuctioneerClient, HttpCellClient, StaticCellRegistry},
    config::{ServerConfig, StorageConfig},
};

pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub state_store: Arc<StateStore>,
    pub events: EventHub,
    pub convergence: Arc<ConvergenceProcessor>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_ref(),
            config.telemetry.metrics_interval,
            config.telemetry.instance_id.as_ref(),
            env!("CARGO_PKG_VERSION"),
        )?;
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let db: Arc<dyn VersionedStore> = match &config.storage {
            StorageConfig::Memory => {
                warn!("using the in-memory state store, records are lost on restart");
                Arc::new(MemoryStore::new())
            }
            StorageConfig::Rocksdb { path } => Arc::new(
                RocksDBStore::open(Path::new(path)).context("error opening state store")?,
            ),
        };
        let state_store = Arc::new(StateStore::new(
            db,
            Arc::new(SystemClock),
            Arc::new(DefaultRestartPolicy::new(config.convergence.restart_policy)),
            StateStoreConfig {
                crash_reset_timeout: config.convergence.crash_reset_timeout,
                ..Default::default()
            },
        ));
        let events = EventHub::default();

        let convergence = Arc::new(ConvergenceProcessor::with_cell_client(
            state_store.clone(),
            events.clone(),
            Arc::new(StaticCellRegistry::new(config.cells.clone())),
            Arc::new(HttpAuctioneerClient::new(&config.auctioneer_url)?),
            Arc::new(HttpCellClient::new()?),
            config.retirement,
            config.convergence.processor.clone(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            state_store,
            events,
            convergence,
        })
    }

    /// Runs until a shutdown signal arrives or convergence hits an
    /// unrecoverable error, which is returned.
    pub async fn start(&mut self) -> Result<()> {
        let events = self.events.subscribe_instances();
        let shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move { log_instance_events(events, shutdown_rx).await });

        let convergence = self.convergence.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let mut fatal_rx = self.convergence.subscribe_fatal();
        let convergence_task = tokio::spawn(async move {
            convergence.start(shutdown_rx).await;
        });
        info!(
            interval_secs = self.config.convergence.processor.interval.as_secs(),
            cells = self.config.cells.len(),
            "convergence started"
        );

        let fatal = tokio::select! {
            _ = shutdown_signal() => {
                info!("signal received, shutting down gracefully");
                None
            }
            fatal = fatal_rx.wait_for(Option::is_some) => {
                fatal.ok().and_then(|fatal| fatal.clone())
            }
        };

        let _ = self.shutdown_tx.send(());
        if let Err(err) = convergence_task.await {
            error!("convergence task failed: {err}");
        }
        match fatal {
            Some(fatal) => Err(anyhow!("convergence stopped: {fatal}")),
            None => Ok(()),
        }
    }
}

async fn log_instance_events(
    mut events: broadcast::Receiver<ActualLrpInstanceEvent>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ActualLrpInstanceEvent::Crashed(crash)) => info!(
                    process_guid = crash.key.process_guid,
                    index = crash.key.index,
                    crash_count = crash.crash_count,
                    reason = crash.crash_reason,
                    "lrp crashed"
                ),
                Ok(event) => debug!(?event, "lrp instance event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "instance event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::test_objects::tests::mock_desired_lrp;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_service_opens_rocksdb_store() -> Result<()> {
        let dir = TempDir::new()?;
        let config = ServerConfig {
            storage: StorageConfig::Rocksdb {
                path: dir.path().join("state").display().to_string(),
            },
            ..Default::default()
        };
        let service = Service::new(config).await?;

        service
            .state_store
            .desire_lrp(&mock_desired_lrp("p", "d", 1))
            .await?;
        service.state_store.upsert_domain("d", Duration::ZERO).await?;
        assert_eq!(service.state_store.desired_lrp("p").await?.instances, 1);
        Ok(())
    }
}
