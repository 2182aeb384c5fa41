use std::{sync::Arc, time::Duration};

use data_model::{ActualLrp, CellSet};
use metrics::{timed, ConvergenceMetrics, Timer};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use state_store::{Error, EventHub, StateStore};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    calculator::{calculate_convergence, ScheduledLrp},
    collaborators::{Auctioneer, CellClient, CellRegistry},
    gatherer::{ConvergenceGatherer, GatherCounts},
    placement::StartRequester,
    resolver::{ConvergenceResolver, StartRequestBatch},
    retirer::{ActualLrpRetirer, Retirement},
    work_pool::WorkPool,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConvergenceConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Budget of a single run. A run that exceeds it is abandoned and the
    /// next tick starts over.
    #[serde(with = "duration_secs")]
    pub run_timeout: Duration,
    pub workers: usize,
    #[serde(with = "duration_secs")]
    pub stale_unclaimed_duration: Duration,
    /// Age after which a desired half without its partner is deleted.
    #[serde(with = "duration_secs")]
    pub desired_grace_period: Duration,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            run_timeout: Duration::from_secs(60),
            workers: 20,
            stale_unclaimed_duration: Duration::from_secs(30),
            desired_grace_period: Duration::from_secs(60),
        }
    }
}

pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Everything one convergence run saw and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub counts: GatherCounts,
    pub missing_lrps: u64,
    pub lrps_on_missing_cells: u64,
    pub extra_lrps: u64,
    pub restartable_crashed_lrps: u64,
    pub stale_unclaimed_lrps: u64,
    pub evacuating_lrps_on_missing_cells: u64,
    pub created: u64,
    pub restarted: u64,
    pub unclaimed_on_missing_cells: u64,
    pub removed_evacuating: u64,
    pub retired: u64,
    pub start_requests: u64,
    pub failures: u64,
}

pub struct ConvergenceProcessor {
    store: Arc<StateStore>,
    events: EventHub,
    gatherer: ConvergenceGatherer,
    resolver: ConvergenceResolver,
    retirer: Arc<ActualLrpRetirer>,
    starts: StartRequester,
    pool: WorkPool,
    config: ConvergenceConfig,
    metrics: ConvergenceMetrics,
    fatal_tx: watch::Sender<Option<String>>,
}

impl ConvergenceProcessor {
    pub fn new(
        store: Arc<StateStore>,
        events: EventHub,
        cell_registry: Arc<dyn CellRegistry>,
        auctioneer: Arc<dyn Auctioneer>,
        retirer: ActualLrpRetirer,
        config: ConvergenceConfig,
    ) -> Self {
        let pool = WorkPool::new(config.workers);
        let (fatal_tx, _) = watch::channel(None);
        Self {
            gatherer: ConvergenceGatherer::new(
                store.clone(),
                cell_registry,
                pool,
                config.desired_grace_period,
            ),
            resolver: ConvergenceResolver::new(store.clone(), events.clone(), pool),
            retirer: Arc::new(retirer),
            starts: StartRequester::new(store.clone(), auctioneer),
            store,
            events,
            pool,
            config,
            metrics: ConvergenceMetrics::new(),
            fatal_tx,
        }
    }

    /// Convenience constructor wiring the retirer from a cell client.
    pub fn with_cell_client(
        store: Arc<StateStore>,
        events: EventHub,
        cell_registry: Arc<dyn CellRegistry>,
        auctioneer: Arc<dyn Auctioneer>,
        cell_client: Arc<dyn CellClient>,
        retirement_retry: lrp_utils::RetryPolicy,
        config: ConvergenceConfig,
    ) -> Self {
        let retirer = ActualLrpRetirer::new(
            store.clone(),
            events.clone(),
            cell_client,
            retirement_retry,
        );
        Self::new(store, events, cell_registry, auctioneer, retirer, config)
    }

    /// Carries the error that stopped the loop.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.run_with_budget().await {
                        break;
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!("convergence processor shutting down");
                    break;
                }
            }
        }
    }

    /// Returns false once the loop must stop.
    async fn run_with_budget(&self) -> bool {
        let labels = |outcome: &'static str| [KeyValue::new("outcome", outcome)];
        match tokio::time::timeout(self.config.run_timeout, self.converge()).await {
            Ok(Ok(report)) => {
                self.metrics.runs.add(1, &labels("success"));
                debug!(?report, "convergence run finished");
                true
            }
            Ok(Err(err)) if err.is_unrecoverable() => {
                self.metrics.runs.add(1, &labels("fatal"));
                error!("convergence hit an unrecoverable error: {err}");
                self.fatal_tx.send_replace(Some(err.to_string()));
                false
            }
            Ok(Err(err)) => {
                self.metrics.runs.add(1, &labels("error"));
                error!("convergence run failed: {err}");
                true
            }
            Err(_) => {
                self.metrics.runs.add(1, &labels("timeout"));
                warn!(
                    timeout_secs = self.config.run_timeout.as_secs(),
                    "convergence run exceeded its budget"
                );
                true
            }
        }
    }

    /// One gather, calculate and resolve pass, followed by the start
    /// requests, the missing cell handling and the retirements it produced.
    #[tracing::instrument(skip_all)]
    pub async fn converge(&self) -> Result<ConvergenceReport, Error> {
        let _run_timer = Timer::start_with_labels(&self.metrics.run_duration, &[]);
        let now = self.store.now();
        let mut report = ConvergenceReport::default();

        let gathered = {
            let labels = [KeyValue::new("phase", "gather")];
            let _timer = Timer::start_with_labels(&self.metrics.phase_duration, &labels);
            self.gatherer.gather(now).await?
        };
        self.record_gauges(&gathered.counts);
        self.metrics
            .pruned_records
            .add(gathered.counts.pruned_records, &[]);

        let changes = {
            let labels = [KeyValue::new("phase", "calculate")];
            let _timer = Timer::start_with_labels(&self.metrics.phase_duration, &labels);
            calculate_convergence(
                &gathered.input,
                self.store.restart_policy().as_ref(),
                now,
                self.config.stale_unclaimed_duration,
            )
        };
        for (kind, count) in changes.counts() {
            self.metrics
                .discrepancies
                .add(count as u64, &[KeyValue::new("kind", kind)]);
        }
        report.counts = gathered.counts;
        report.missing_lrps = changes.missing_lrps.len() as u64;
        report.lrps_on_missing_cells = changes.lrps_on_missing_cells.len() as u64;
        report.extra_lrps = changes.extra_lrps.len() as u64;
        report.restartable_crashed_lrps = changes.restartable_crashed_lrps.len() as u64;
        report.stale_unclaimed_lrps = changes.stale_unclaimed_lrps.len() as u64;
        report.evacuating_lrps_on_missing_cells =
            changes.evacuating_lrps_on_missing_cells.len() as u64;
        let cells = Arc::new(gathered.input.cells);

        let outcome = {
            let labels = [KeyValue::new("phase", "resolve")];
            let _timer = Timer::start_with_labels(&self.metrics.phase_duration, &labels);
            self.resolver.resolve(changes).await?
        };
        report.created = outcome.created;
        report.restarted = outcome.restarted;
        report.removed_evacuating = outcome.removed_evacuating;
        report.failures = outcome.failures;

        let phase_duration = &self.metrics.phase_duration;
        let (missing_cells, retired) = tokio::join!(
            timed(
                self.handle_missing_cells(outcome.lrps_on_missing_cells),
                |elapsed| {
                    phase_duration.record(
                        elapsed.as_secs_f64(),
                        &[KeyValue::new("phase", "missing_cells")],
                    )
                },
            ),
            timed(self.retire(outcome.keys_to_retire, cells), |elapsed| {
                phase_duration.record(elapsed.as_secs_f64(), &[KeyValue::new("phase", "retire")])
            }),
        );
        let (missing_cell_starts, unclaimed, missing_cell_failures) = missing_cells?;
        let (retired, retire_failures) = retired?;
        report.unclaimed_on_missing_cells = unclaimed;
        report.retired = retired;
        report.failures += missing_cell_failures + retire_failures;

        let mut starts = outcome.start_requests;
        starts.extend(missing_cell_starts);
        report.start_requests = self.starts.submit(starts).await as u64;
        self.metrics
            .start_requests
            .add(report.start_requests, &[]);
        self.metrics.retired_lrps.add(report.retired, &[]);

        info!(
            missing = report.missing_lrps,
            on_missing_cells = report.lrps_on_missing_cells,
            extra = report.extra_lrps,
            restartable = report.restartable_crashed_lrps,
            stale_unclaimed = report.stale_unclaimed_lrps,
            start_requests = report.start_requests,
            retired = report.retired,
            failures = report.failures,
            "convergence run complete"
        );
        Ok(report)
    }

    fn record_gauges(&self, counts: &GatherCounts) {
        for (state, count) in [
            ("unclaimed", counts.unclaimed),
            ("claimed", counts.claimed),
            ("running", counts.running),
            ("crashed", counts.crashed),
            ("evacuating", counts.evacuating),
            ("suspect", counts.suspect),
        ] {
            self.metrics
                .actual_lrps
                .record(count, &[KeyValue::new("state", state)]);
        }
        self.metrics
            .desired_lrps
            .record(counts.desired_lrps, &[KeyValue::new("kind", "lrps")]);
        self.metrics
            .desired_lrps
            .record(counts.desired_instances, &[KeyValue::new("kind", "instances")]);
    }

    /// Unclaims instances whose cell vanished so they get placed again.
    async fn handle_missing_cells(
        &self,
        lrps: Vec<ScheduledLrp>,
    ) -> Result<(StartRequestBatch, u64, u64), Error> {
        let tasks = lrps.into_iter().map(|scheduled| {
            let store = self.store.clone();
            let events = self.events.clone();
            async move {
                let key = &scheduled.lrp.key;
                let Some(instance_key) = scheduled.lrp.instance_key.as_ref() else {
                    return Ok(None);
                };
                let lrps = store
                    .actual_lrps_for_index(&key.process_guid, key.index)
                    .await?;
                match store.unclaim_actual_lrp(key, Some(instance_key)).await {
                    Ok(change) if change.is_noop() => Ok(None),
                    Ok(change) => {
                        events.record_change(change.before.as_ref(), change.after.as_ref(), &lrps);
                        Ok(Some((scheduled.scheduling_info.clone(), key.index)))
                    }
                    Err(err) if err.is_not_found() || matches!(err, Error::InvalidTransition { .. }) => {
                        debug!(process_guid = key.process_guid, index = key.index, "lrp moved on before it was unclaimed");
                        Ok(None)
                    }
                    Err(err) => {
                        warn!(process_guid = key.process_guid, index = key.index, "failed to unclaim lrp on missing cell: {err}");
                        Err(err)
                    }
                }
            }
        });

        let results = self.pool.run("missing_cells", tasks).await;
        let mut starts = StartRequestBatch::default();
        let mut unclaimed = 0;
        let mut failures = results.panicked as u64;
        for result in results.outputs {
            match result {
                Ok(Some((scheduling_info, index))) => {
                    unclaimed += 1;
                    starts.add(&scheduling_info, index);
                }
                Ok(None) => {}
                Err(err) if err.is_unrecoverable() => return Err(err),
                Err(_) => failures += 1,
            }
        }
        Ok((starts, unclaimed, failures))
    }

    async fn retire(&self, lrps: Vec<ActualLrp>, cells: Arc<CellSet>) -> Result<(u64, u64), Error> {
        let tasks = lrps.into_iter().map(|lrp| {
            let retirer = self.retirer.clone();
            let cells = cells.clone();
            async move { retirer.retire(&lrp, &cells).await }
        });

        let results = self.pool.run("retire", tasks).await;
        let mut retired = 0;
        let mut failures = results.panicked as u64;
        for result in results.outputs {
            match result {
                Ok(Retirement::Removed | Retirement::Stopped) => retired += 1,
                Ok(Retirement::AlreadyGone) => {}
                Err(err) if err.is_unrecoverable() => return Err(err),
                Err(err) => {
                    warn!("failed to retire lrp: {err}");
                    failures += 1;
                }
            }
        }
        Ok((retired, failures))
    }
}
