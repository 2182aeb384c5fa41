use std::sync::Arc;

use data_model::{ActualLrp, CellSet};
use lrp_utils::{retry_with_policy, RetryPolicy};
use state_store::{Error, EventHub, StateStore};
use tracing::{debug, info, warn};

use crate::collaborators::{CellClient, CellClientError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Retirement {
    /// The record was deleted.
    Removed,
    /// The owning cell was asked to stop the container.
    Stopped,
    /// Someone else got there first.
    AlreadyGone,
}

/// Retires extra instances. Unplaced records are deleted; placed ones are
/// stopped on their cell, which reports back through evacuation or removal.
pub struct ActualLrpRetirer {
    store: Arc<StateStore>,
    events: EventHub,
    cell_client: Arc<dyn CellClient>,
    retry: RetryPolicy,
}

impl ActualLrpRetirer {
    pub fn new(
        store: Arc<StateStore>,
        events: EventHub,
        cell_client: Arc<dyn CellClient>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            events,
            cell_client,
            retry,
        }
    }

    #[tracing::instrument(skip_all, fields(process_guid = %lrp.key.process_guid, index = lrp.key.index))]
    pub async fn retire(&self, lrp: &ActualLrp, cells: &CellSet) -> Result<Retirement, Error> {
        let (Some(instance_key), true) = (lrp.instance_key.as_ref(), lrp.is_placed()) else {
            return self.remove(lrp).await;
        };
        let Some(cell) = cells.get(&instance_key.cell_id) else {
            debug!(cell_id = %instance_key.cell_id, "cell is gone, treating the lrp as stopped");
            return self.remove(lrp).await;
        };

        let stopped = retry_with_policy(
            &self.retry,
            |err: &CellClientError| !err.is_not_found(),
            |attempt| async move {
                let result = self
                    .cell_client
                    .stop_lrp(cell, &lrp.key, instance_key)
                    .await;
                if let Err(err) = &result {
                    if !err.is_not_found() {
                        warn!(attempt, cell_id = %cell.cell_id, "failed to stop lrp: {err:#}");
                    }
                }
                result
            },
        )
        .await;
        match stopped {
            Ok(()) => {
                info!(cell_id = %cell.cell_id, "asked cell to stop extra lrp");
                Ok(Retirement::Stopped)
            }
            Err(err) if err.is_not_found() => {
                debug!(cell_id = %cell.cell_id, "cell does not know the lrp, treating it as stopped");
                self.remove(lrp).await
            }
            Err(err) => Err(Error::from(anyhow::Error::new(err))),
        }
    }

    async fn remove(&self, lrp: &ActualLrp) -> Result<Retirement, Error> {
        let key = &lrp.key;
        let lrps = self
            .store
            .actual_lrps_for_index(&key.process_guid, key.index)
            .await?;
        match self
            .store
            .remove_actual_lrp(
                &key.process_guid,
                key.index,
                lrp.presence,
                lrp.instance_key.as_ref(),
            )
            .await
        {
            Ok(change) => {
                self.events
                    .record_change(change.before.as_ref(), None, &lrps);
                info!("removed extra lrp");
                Ok(Retirement::Removed)
            }
            Err(err) if err.is_not_found() => Ok(Retirement::AlreadyGone),
            Err(err) => Err(err),
        }
    }
}
