use std::{collections::BTreeMap, sync::Arc};

use data_model::{ActualLrp, DesiredLrpSchedulingInfo, LrpStartRequest, Presence};
use state_store::{Error, EventHub, StateStore};
use tracing::{debug, info, warn};

use crate::{
    calculator::{ConvergenceChanges, MissingLrp, ScheduledLrp},
    work_pool::WorkPool,
};

/// Start requests grouped by process guid.
#[derive(Debug, Default)]
pub struct StartRequestBatch {
    requests: BTreeMap<String, (DesiredLrpSchedulingInfo, Vec<u32>)>,
}

impl StartRequestBatch {
    pub fn add(&mut self, scheduling_info: &DesiredLrpSchedulingInfo, index: u32) {
        self.requests
            .entry(scheduling_info.process_guid.clone())
            .or_insert_with(|| (scheduling_info.clone(), Vec::new()))
            .1
            .push(index);
    }

    pub fn extend(&mut self, other: StartRequestBatch) {
        for (_, (scheduling_info, indices)) in other.requests {
            for index in indices {
                self.add(&scheduling_info, index);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn into_requests(self) -> Vec<LrpStartRequest> {
        self.requests
            .into_values()
            .map(|(scheduling_info, indices)| LrpStartRequest::new(&scheduling_info, indices))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ResolveOutcome {
    pub start_requests: StartRequestBatch,
    /// Extra instances, to be handed to the retirer.
    pub keys_to_retire: Vec<ActualLrp>,
    /// Placed instances whose cell vanished, for the caller to unclaim.
    pub lrps_on_missing_cells: Vec<ScheduledLrp>,
    pub created: u64,
    pub restarted: u64,
    pub removed_evacuating: u64,
    pub failures: u64,
}

enum Action {
    CreateMissing(MissingLrp),
    RestartCrashed(ScheduledLrp),
    RemoveEvacuating(ActualLrp),
}

enum Applied {
    Created(DesiredLrpSchedulingInfo, u32),
    Restarted(DesiredLrpSchedulingInfo, u32),
    RemovedEvacuating,
    Skipped,
}

pub struct ConvergenceResolver {
    store: Arc<StateStore>,
    events: EventHub,
    pool: WorkPool,
}

impl ConvergenceResolver {
    pub fn new(store: Arc<StateStore>, events: EventHub, pool: WorkPool) -> Self {
        Self {
            store,
            events,
            pool,
        }
    }

    /// Applies the store side of `changes`. A failing key is logged and
    /// counted; it does not stop the others. Only an unrecoverable store
    /// error fails the whole call.
    #[tracing::instrument(skip_all)]
    pub async fn resolve(&self, changes: ConvergenceChanges) -> Result<ResolveOutcome, Error> {
        let mut outcome = ResolveOutcome {
            keys_to_retire: changes.extra_lrps,
            lrps_on_missing_cells: changes.lrps_on_missing_cells,
            ..Default::default()
        };
        for stale in &changes.stale_unclaimed_lrps {
            outcome
                .start_requests
                .add(&stale.scheduling_info, stale.lrp.key.index);
        }

        let actions = changes
            .missing_lrps
            .into_iter()
            .map(Action::CreateMissing)
            .chain(
                changes
                    .restartable_crashed_lrps
                    .into_iter()
                    .map(Action::RestartCrashed),
            )
            .chain(
                changes
                    .evacuating_lrps_on_missing_cells
                    .into_iter()
                    .map(Action::RemoveEvacuating),
            );
        let tasks = actions.map(|action| {
            let store = self.store.clone();
            let events = self.events.clone();
            async move { apply(&store, &events, action).await }
        });

        let results = self.pool.run("resolve", tasks).await;
        outcome.failures += results.panicked as u64;
        let mut unrecoverable = None;
        for result in results.outputs {
            match result {
                Ok(Applied::Created(scheduling_info, index)) => {
                    outcome.created += 1;
                    outcome.start_requests.add(&scheduling_info, index);
                }
                Ok(Applied::Restarted(scheduling_info, index)) => {
                    outcome.restarted += 1;
                    outcome.start_requests.add(&scheduling_info, index);
                }
                Ok(Applied::RemovedEvacuating) => outcome.removed_evacuating += 1,
                Ok(Applied::Skipped) => {}
                Err(err) => {
                    outcome.failures += 1;
                    if err.is_unrecoverable() {
                        unrecoverable = Some(err);
                    }
                }
            }
        }
        if let Some(err) = unrecoverable {
            return Err(err);
        }

        info!(
            created = outcome.created,
            restarted = outcome.restarted,
            removed_evacuating = outcome.removed_evacuating,
            to_retire = outcome.keys_to_retire.len(),
            on_missing_cells = outcome.lrps_on_missing_cells.len(),
            failures = outcome.failures,
            "resolved convergence changes"
        );
        Ok(outcome)
    }
}

async fn apply(store: &StateStore, events: &EventHub, action: Action) -> Result<Applied, Error> {
    match action {
        Action::CreateMissing(missing) => {
            let key = &missing.key;
            let lrps = store
                .actual_lrps_for_index(&key.process_guid, key.index)
                .await?;
            match store.create_unclaimed_actual_lrp(key).await {
                Ok(change) => {
                    events.record_change(None, change.after.as_ref(), &lrps);
                    Ok(Applied::Created(missing.scheduling_info, key.index))
                }
                Err(Error::AlreadyExists { .. }) => {
                    debug!(process_guid = key.process_guid, index = key.index, "missing lrp was created concurrently");
                    Ok(Applied::Skipped)
                }
                Err(err) => {
                    warn!(process_guid = key.process_guid, index = key.index, "failed to create missing lrp: {err}");
                    Err(err)
                }
            }
        }
        Action::RestartCrashed(crashed) => {
            let key = &crashed.lrp.key;
            let lrps = store
                .actual_lrps_for_index(&key.process_guid, key.index)
                .await?;
            match store.unclaim_actual_lrp(key, None).await {
                Ok(change) => {
                    events.record_change(change.before.as_ref(), change.after.as_ref(), &lrps);
                    Ok(Applied::Restarted(crashed.scheduling_info, key.index))
                }
                Err(err) if err.is_not_found() || matches!(err, Error::InvalidTransition { .. }) => {
                    debug!(process_guid = key.process_guid, index = key.index, "crashed lrp changed since it was gathered: {err}");
                    Ok(Applied::Skipped)
                }
                Err(err) => {
                    warn!(process_guid = key.process_guid, index = key.index, "failed to restart crashed lrp: {err}");
                    Err(err)
                }
            }
        }
        Action::RemoveEvacuating(lrp) => {
            let key = &lrp.key;
            let lrps = store
                .actual_lrps_for_index(&key.process_guid, key.index)
                .await?;
            match store
                .remove_actual_lrp(
                    &key.process_guid,
                    key.index,
                    Presence::Evacuating,
                    lrp.instance_key.as_ref(),
                )
                .await
            {
                Ok(change) => {
                    events.record_change(change.before.as_ref(), None, &lrps);
                    Ok(Applied::RemovedEvacuating)
                }
                Err(err) if err.is_not_found() => Ok(Applied::Skipped),
                Err(err) => {
                    warn!(process_guid = key.process_guid, index = key.index, "failed to remove evacuating lrp: {err}");
                    Err(err)
                }
            }
        }
    }
}
