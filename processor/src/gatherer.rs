use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    sync::Arc,
    time::Duration,
};

use data_model::{
    ActualLrp,
    ActualLrpState,
    CellSet,
    DesiredLrpSchedulingInfo,
    DomainSet,
    Presence,
};
use lrp_utils::elapsed_since;
use state_store::{Error, StateStore, Table, Version};
use tracing::{debug, info, warn};

use crate::{collaborators::CellRegistry, work_pool::WorkPool};

/// Snapshot of the fleet that one convergence run works from.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceInput {
    /// Every process guid with a desired or an actual record.
    pub process_guids: BTreeSet<String>,
    pub desired: BTreeMap<String, DesiredLrpSchedulingInfo>,
    pub actual: BTreeMap<String, BTreeMap<u32, Vec<ActualLrp>>>,
    pub domains: DomainSet,
    pub cells: CellSet,
}

impl ConvergenceInput {
    pub fn add_actual(&mut self, lrp: ActualLrp) {
        self.process_guids.insert(lrp.key.process_guid.clone());
        self.actual
            .entry(lrp.key.process_guid.clone())
            .or_default()
            .entry(lrp.key.index)
            .or_default()
            .push(lrp);
    }

    pub fn add_desired(&mut self, scheduling_info: DesiredLrpSchedulingInfo) {
        self.process_guids
            .insert(scheduling_info.process_guid.clone());
        self.desired
            .insert(scheduling_info.process_guid.clone(), scheduling_info);
    }
}

/// Tallies of one gather pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatherCounts {
    pub unclaimed: u64,
    pub claimed: u64,
    pub running: u64,
    pub crashed: u64,
    pub evacuating: u64,
    pub suspect: u64,
    pub desired_lrps: u64,
    pub desired_instances: u64,
    pub invalid_records: u64,
    pub orphaned_records: u64,
    pub pruned_records: u64,
}

impl GatherCounts {
    fn count(&mut self, lrp: &ActualLrp) {
        match lrp.presence {
            Presence::Evacuating => self.evacuating += 1,
            Presence::Suspect => self.suspect += 1,
            Presence::Ordinary => match lrp.state {
                ActualLrpState::Unclaimed => self.unclaimed += 1,
                ActualLrpState::Claimed => self.claimed += 1,
                ActualLrpState::Running => self.running += 1,
                ActualLrpState::Crashed => self.crashed += 1,
            },
        }
    }
}

#[derive(Debug)]
pub struct Gathered {
    pub input: ConvergenceInput,
    pub counts: GatherCounts,
}

struct PruneTarget {
    table: Table,
    key: String,
    version: Version,
}

pub struct ConvergenceGatherer {
    store: Arc<StateStore>,
    cell_registry: Arc<dyn CellRegistry>,
    pool: WorkPool,
    desired_grace_period: Duration,
}

impl ConvergenceGatherer {
    pub fn new(
        store: Arc<StateStore>,
        cell_registry: Arc<dyn CellRegistry>,
        pool: WorkPool,
        desired_grace_period: Duration,
    ) -> Self {
        Self {
            store,
            cell_registry,
            pool,
            desired_grace_period,
        }
    }

    /// Reads every actual and desired record, the fresh domains and the live
    /// cells. Invalid records are deleted instead of being returned, and so
    /// are desired halves that lost their partner longer than the grace
    /// period ago.
    #[tracing::instrument(skip_all)]
    pub async fn gather(&self, now: u64) -> Result<Gathered, Error> {
        let (actual, scheduling_infos, run_infos, domains, cells) = tokio::try_join!(
            self.store.scan_actual_lrps(),
            self.store.scan_desired_scheduling_infos(),
            self.store.scan_desired_run_infos(),
            self.store.fresh_domains(now),
            async { self.cell_registry.list_cells().await.map_err(Error::from) },
        )?;

        let mut counts = GatherCounts::default();
        let mut prune = Vec::new();
        for invalid in actual
            .invalid
            .into_iter()
            .chain(scheduling_infos.invalid)
            .chain(run_infos.invalid)
        {
            counts.invalid_records += 1;
            prune.push(PruneTarget {
                table: invalid.table,
                key: invalid.key,
                version: invalid.version,
            });
        }

        let mut input = ConvergenceInput {
            domains,
            cells,
            ..Default::default()
        };

        let run_info_guids: HashSet<String> = run_infos
            .records
            .iter()
            .map(|(run_info, _)| run_info.process_guid.clone())
            .collect();
        let scheduling_guids: HashSet<String> = scheduling_infos
            .records
            .iter()
            .map(|(info, _)| info.process_guid.clone())
            .collect();

        for (scheduling_info, version) in scheduling_infos.records {
            if !run_info_guids.contains(&scheduling_info.process_guid) &&
                self.is_orphan_expired(scheduling_info.created_at, now)
            {
                counts.orphaned_records += 1;
                prune.push(PruneTarget {
                    table: Table::DesiredSchedulingInfos,
                    key: scheduling_info.key(),
                    version,
                });
                continue;
            }
            counts.desired_lrps += 1;
            counts.desired_instances += scheduling_info.instances as u64;
            input.add_desired(scheduling_info);
        }
        for (run_info, version) in &run_infos.records {
            if !scheduling_guids.contains(&run_info.process_guid) &&
                self.is_orphan_expired(run_info.created_at, now)
            {
                counts.orphaned_records += 1;
                prune.push(PruneTarget {
                    table: Table::DesiredRunInfos,
                    key: run_info.key(),
                    version: *version,
                });
            }
        }

        for (lrp, _) in actual.records {
            counts.count(&lrp);
            input.add_actual(lrp);
        }

        counts.pruned_records = self.prune(prune).await?;
        info!(
            desired_lrps = counts.desired_lrps,
            unclaimed = counts.unclaimed,
            claimed = counts.claimed,
            running = counts.running,
            crashed = counts.crashed,
            evacuating = counts.evacuating,
            invalid = counts.invalid_records,
            orphaned = counts.orphaned_records,
            cells = input.cells.len(),
            domains = input.domains.len(),
            "gathered convergence input"
        );
        Ok(Gathered { input, counts })
    }

    fn is_orphan_expired(&self, created_at: u64, now: u64) -> bool {
        elapsed_since(created_at, now) > self.desired_grace_period
    }

    async fn prune(&self, targets: Vec<PruneTarget>) -> Result<u64, Error> {
        if targets.is_empty() {
            return Ok(0);
        }
        let tasks = targets.into_iter().map(|target| {
            let store = self.store.clone();
            async move {
                let result = store
                    .prune(target.table, &target.key, target.version)
                    .await;
                (target, result)
            }
        });

        let mut pruned = 0;
        for (target, result) in self.pool.run("prune", tasks).await.outputs {
            match result {
                Ok(true) => {
                    debug!(table = %target.table, key = target.key, "pruned record");
                    pruned += 1;
                }
                Ok(false) => {}
                Err(err) if err.is_unrecoverable() => return Err(err),
                Err(err) => {
                    warn!(table = %target.table, key = target.key, "failed to prune record: {err}");
                }
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use bytes::Bytes;
    use data_model::test_objects::tests::{
        mock_actual_lrp,
        mock_cell,
        mock_desired_lrp,
        TEST_CELL,
        TEST_DOMAIN,
    };
    use state_store::{
        test_state_store::{TestStateStore, TEST_NOW},
        VersionedStore,
    };

    use super::*;
    use crate::test_collaborators::FakeCellRegistry;

    fn gatherer(test: &TestStateStore, registry: FakeCellRegistry) -> ConvergenceGatherer {
        ConvergenceGatherer::new(
            test.store.clone(),
            Arc::new(registry),
            WorkPool::new(4),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_gather_builds_input_and_counts() -> Result<()> {
        let test = TestStateStore::new();
        test.store
            .desire_lrp(&mock_desired_lrp("p", TEST_DOMAIN, 3))
            .await?;
        test.store.upsert_domain(TEST_DOMAIN, Duration::ZERO).await?;
        for (index, state) in [
            (0, ActualLrpState::Running),
            (1, ActualLrpState::Claimed),
            (2, ActualLrpState::Unclaimed),
        ] {
            test.store
                .insert_actual_lrp(mock_actual_lrp("p", index, state, TEST_CELL))
                .await?;
        }

        let gathered = gatherer(&test, FakeCellRegistry::with_cells([mock_cell(TEST_CELL)]))
            .gather(TEST_NOW)
            .await?;

        assert_eq!(gathered.counts.running, 1);
        assert_eq!(gathered.counts.claimed, 1);
        assert_eq!(gathered.counts.unclaimed, 1);
        assert_eq!(gathered.counts.desired_lrps, 1);
        assert_eq!(gathered.counts.desired_instances, 3);
        assert!(gathered.input.process_guids.contains("p"));
        assert_eq!(gathered.input.actual["p"].len(), 3);
        assert!(gathered.input.domains.contains(TEST_DOMAIN));
        assert!(gathered.input.cells.has_cell_id(&TEST_CELL.into()));
        Ok(())
    }

    #[tokio::test]
    async fn test_gather_prunes_invalid_records() -> Result<()> {
        let test = TestStateStore::new();
        test.store
            .insert_actual_lrp(mock_actual_lrp("p", 0, ActualLrpState::Unclaimed, ""))
            .await?;
        test.db
            .create(Table::ActualLrps, "p/bogus", Bytes::from_static(b"{not json"))
            .await?;

        let gathered = gatherer(&test, FakeCellRegistry::default())
            .gather(TEST_NOW)
            .await?;
        assert_eq!(gathered.counts.invalid_records, 1);
        assert_eq!(gathered.counts.pruned_records, 1);
        assert_eq!(gathered.counts.unclaimed, 1);

        let scan = test.store.scan_actual_lrps().await?;
        assert!(scan.invalid.is_empty());
        assert_eq!(scan.records.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_orphaned_desired_halves() -> Result<()> {
        let test = TestStateStore::new();
        let old = mock_desired_lrp("old", TEST_DOMAIN, 1);
        test.store.desire_lrp(&old).await?;
        let mut fresh = mock_desired_lrp("fresh", TEST_DOMAIN, 1);
        fresh.created_at = TEST_NOW;
        test.store.desire_lrp(&fresh).await?;

        // Leave both run infos without their scheduling info.
        for guid in ["old", "fresh"] {
            let stored = test.db.read(Table::DesiredSchedulingInfos, guid).await?;
            test.db
                .compare_and_delete(Table::DesiredSchedulingInfos, guid, stored.version)
                .await?;
        }

        let gathered = gatherer(&test, FakeCellRegistry::default())
            .gather(TEST_NOW)
            .await?;
        assert_eq!(gathered.counts.orphaned_records, 1);
        assert_eq!(gathered.counts.pruned_records, 1);
        assert_eq!(gathered.counts.desired_lrps, 0);

        let run_infos = test.store.scan_desired_run_infos().await?;
        assert_eq!(run_infos.records.len(), 1);
        assert_eq!(run_infos.records[0].0.process_guid, "fresh");
        Ok(())
    }

    #[tokio::test]
    async fn test_orphaned_scheduling_infos() -> Result<()> {
        let test = TestStateStore::new();
        test.store
            .desire_lrp(&mock_desired_lrp("old", TEST_DOMAIN, 1))
            .await?;
        let mut fresh = mock_desired_lrp("fresh", TEST_DOMAIN, 2);
        fresh.created_at = TEST_NOW;
        test.store.desire_lrp(&fresh).await?;

        // Leave both scheduling infos without their run info.
        for guid in ["old", "fresh"] {
            let stored = test.db.read(Table::DesiredRunInfos, guid).await?;
            test.db
                .compare_and_delete(Table::DesiredRunInfos, guid, stored.version)
                .await?;
        }

        let gathered = gatherer(&test, FakeCellRegistry::default())
            .gather(TEST_NOW)
            .await?;
        assert_eq!(gathered.counts.orphaned_records, 1);
        assert_eq!(gathered.counts.pruned_records, 1);
        assert_eq!(gathered.counts.desired_lrps, 1);
        assert_eq!(gathered.counts.desired_instances, 2);
        assert!(gathered.input.desired.contains_key("fresh"));
        assert!(!gathered.input.process_guids.contains("old"));

        let scheduling_infos = test.store.scan_desired_scheduling_infos().await?;
        assert_eq!(scheduling_infos.records.len(), 1);
        assert_eq!(scheduling_infos.records[0].0.process_guid, "fresh");
        Ok(())
    }
}
