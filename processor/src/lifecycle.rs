use std::sync::Arc;

use data_model::{
    ActualLrp,
    ActualLrpInstanceKey,
    ActualLrpKey,
    ActualLrpNetInfo,
    Presence,
};
use state_store::{ActualLrpChange, Error, EventHub, StateStore};

use crate::placement::StartRequester;

/// Entry point for the live traffic of cells: every transition is applied
/// to the store and its events are emitted.
pub struct ActualLrpLifecycleController {
    store: Arc<StateStore>,
    events: EventHub,
    starts: StartRequester,
}

impl ActualLrpLifecycleController {
    pub fn new(store: Arc<StateStore>, events: EventHub, starts: StartRequester) -> Self {
        Self {
            store,
            events,
            starts,
        }
    }

    fn emit(&self, lrps: &[ActualLrp], change: &ActualLrpChange) {
        self.events
            .record_change(change.before.as_ref(), change.after.as_ref(), lrps);
    }

    async fn index_lrps(&self, process_guid: &str, index: u32) -> Result<Vec<ActualLrp>, Error> {
        self.store.actual_lrps_for_index(process_guid, index).await
    }

    pub async fn claim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<ActualLrpChange, Error> {
        let lrps = self.index_lrps(&key.process_guid, key.index).await?;
        let change = self.store.claim_actual_lrp(key, instance_key).await?;
        self.emit(&lrps, &change);
        Ok(change)
    }

    pub async fn start_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
    ) -> Result<ActualLrpChange, Error> {
        let lrps = self.index_lrps(&key.process_guid, key.index).await?;
        let change = self
            .store
            .start_actual_lrp(key, instance_key, net_info)
            .await?;
        self.emit(&lrps, &change);
        Ok(change)
    }

    /// A crash the restart policy restarts right away is also submitted for
    /// placement.
    pub async fn crash_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<ActualLrpChange, Error> {
        let lrps = self.index_lrps(&key.process_guid, key.index).await?;
        let outcome = self
            .store
            .crash_actual_lrp(key, instance_key, reason)
            .await?;
        self.emit(&lrps, &outcome.change);
        self.events.emit_crash(outcome.crashed);
        if outcome.restarted {
            self.starts.request_start(key).await;
        }
        Ok(outcome.change)
    }

    pub async fn fail_actual_lrp(
        &self,
        key: &ActualLrpKey,
        placement_error: &str,
    ) -> Result<ActualLrpChange, Error> {
        let lrps = self.index_lrps(&key.process_guid, key.index).await?;
        let change = self.store.fail_actual_lrp(key, placement_error).await?;
        self.emit(&lrps, &change);
        Ok(change)
    }

    /// Hands the slot back for placement.
    pub async fn unclaim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<ActualLrpChange, Error> {
        let lrps = self.index_lrps(&key.process_guid, key.index).await?;
        let change = self
            .store
            .unclaim_actual_lrp(key, Some(instance_key))
            .await?;
        if !change.is_noop() {
            self.emit(&lrps, &change);
            self.starts.request_start(key).await;
        }
        Ok(change)
    }

    pub async fn remove_actual_lrp(
        &self,
        process_guid: &str,
        index: u32,
        instance_key: Option<&ActualLrpInstanceKey>,
    ) -> Result<ActualLrpChange, Error> {
        let lrps = self.index_lrps(process_guid, index).await?;
        let change = self
            .store
            .remove_actual_lrp(process_guid, index, Presence::Ordinary, instance_key)
            .await?;
        self.emit(&lrps, &change);
        Ok(change)
    }
}
