//! Moves instances off a draining cell.
//!
//! A draining cell reports each of its containers through one of the
//! `evacuate_*` calls. The Ordinary record is handed back for a fresh
//! placement while the container keeps serving as the Evacuating copy, so the
//! slot never has zero or two authoritative replicas. Removing a record that
//! another actor already removed counts as success.

use std::sync::Arc;

use data_model::{
    ActualLrp,
    ActualLrpInstanceKey,
    ActualLrpKey,
    ActualLrpNetInfo,
    ActualLrpState,
    Presence,
};
use state_store::{record_change, ActualLrpChange, Error, EventHub, StateStore, Table};
use tracing::{debug, info};

use crate::placement::StartRequester;

/// Whether the draining cell should keep the container running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum KeepContainer {
    Keep,
    Release,
}

fn find(lrps: &[ActualLrp], presence: Presence) -> Option<&ActualLrp> {
    lrps.iter().find(|lrp| lrp.presence == presence)
}

fn owned_by(lrps: &[ActualLrp], presence: Presence, instance_key: &ActualLrpInstanceKey) -> bool {
    find(lrps, presence).is_some_and(|lrp| lrp.has_instance_key(instance_key))
}

fn is_superseded(err: &Error) -> bool {
    err.is_not_found() || matches!(err, Error::InvalidTransition { .. })
}

pub struct EvacuationController {
    store: Arc<StateStore>,
    events: EventHub,
    starts: StartRequester,
}

impl EvacuationController {
    pub fn new(store: Arc<StateStore>, events: EventHub, starts: StartRequester) -> Self {
        Self {
            store,
            events,
            starts,
        }
    }

    async fn index_lrps(&self, key: &ActualLrpKey) -> Result<Vec<ActualLrp>, Error> {
        self.store
            .actual_lrps_for_index(&key.process_guid, key.index)
            .await
    }

    /// Emits the events of `change` and applies it to `lrps`.
    fn apply(&self, lrps: &mut Vec<ActualLrp>, change: &ActualLrpChange) {
        self.events
            .record_change(change.before.as_ref(), change.after.as_ref(), lrps);
        *lrps = record_change(change.before.as_ref(), change.after.as_ref(), lrps);
    }

    /// Removes the record of `presence` owned by `instance_key`. Returns
    /// false when it was already gone.
    async fn remove(
        &self,
        lrps: &mut Vec<ActualLrp>,
        key: &ActualLrpKey,
        presence: Presence,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<bool, Error> {
        match self
            .store
            .remove_actual_lrp(&key.process_guid, key.index, presence, Some(instance_key))
            .await
        {
            Ok(change) => {
                self.apply(lrps, &change);
                Ok(true)
            }
            Err(err) if err.is_not_found() => {
                debug!(%presence, "actual lrp already removed");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn unclaim_and_restart(
        &self,
        lrps: &mut Vec<ActualLrp>,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), Error> {
        match self.store.unclaim_actual_lrp(key, Some(instance_key)).await {
            Ok(change) => {
                self.apply(lrps, &change);
                self.starts.request_start(key).await;
                Ok(())
            }
            Err(err) if is_superseded(&err) => {
                debug!("ordinary lrp moved on before it was unclaimed: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn evacuate(
        &self,
        lrps: &mut Vec<ActualLrp>,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
    ) -> Result<(), Error> {
        let change = self
            .store
            .evacuate_actual_lrp(key, instance_key, net_info)
            .await?;
        self.apply(lrps, &change);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index, instance = %instance_key))]
    pub async fn evacuate_claimed(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<KeepContainer, Error> {
        let mut lrps = self.index_lrps(key).await?;
        for presence in [Presence::Evacuating, Presence::Suspect] {
            if owned_by(&lrps, presence, instance_key) {
                self.remove(&mut lrps, key, presence, instance_key).await?;
                return Ok(KeepContainer::Release);
            }
        }
        if owned_by(&lrps, Presence::Ordinary, instance_key) {
            self.unclaim_and_restart(&mut lrps, key, instance_key)
                .await?;
        }
        info!("evacuated claimed lrp");
        Ok(KeepContainer::Release)
    }

    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index, instance = %instance_key))]
    pub async fn evacuate_running(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
    ) -> Result<KeepContainer, Error> {
        let mut lrps = self.index_lrps(key).await?;

        let desired_removed = match self.store.desired_scheduling_info(&key.process_guid).await {
            Ok(scheduling_info) => key.index >= scheduling_info.instances,
            Err(err) if err.is_not_found() => true,
            Err(err) => return Err(err),
        };
        let replaced = find(&lrps, Presence::Ordinary).is_some_and(|ordinary| {
            !ordinary.has_instance_key(instance_key) &&
                matches!(
                    ordinary.state,
                    ActualLrpState::Running | ActualLrpState::Crashed
                )
        });
        if desired_removed || replaced {
            if owned_by(&lrps, Presence::Evacuating, instance_key) {
                self.remove(&mut lrps, key, Presence::Evacuating, instance_key)
                    .await?;
            }
            info!(desired_removed, replaced, "evacuated running lrp is no longer needed");
            return Ok(KeepContainer::Release);
        }

        let ordinary = find(&lrps, Presence::Ordinary).cloned();
        match ordinary {
            Some(ordinary) if ordinary.has_instance_key(instance_key) && ordinary.is_placed() => {
                self.evacuate(&mut lrps, key, instance_key, net_info)
                    .await?;
                self.unclaim_and_restart(&mut lrps, key, instance_key)
                    .await?;
                info!("evacuating running lrp");
                Ok(KeepContainer::Keep)
            }
            _ if owned_by(&lrps, Presence::Evacuating, instance_key) => {
                self.evacuate(&mut lrps, key, instance_key, net_info)
                    .await?;
                Ok(KeepContainer::Keep)
            }
            _ if owned_by(&lrps, Presence::Suspect, instance_key) => {
                self.evacuate(&mut lrps, key, instance_key, net_info)
                    .await?;
                self.remove(&mut lrps, key, Presence::Suspect, instance_key)
                    .await?;
                info!("evacuating suspect lrp");
                Ok(KeepContainer::Keep)
            }
            Some(ordinary) if ordinary.cell_id() == Some(&instance_key.cell_id) => {
                Ok(KeepContainer::Release)
            }
            _ => match self.evacuate(&mut lrps, key, instance_key, net_info).await {
                Ok(()) => Ok(KeepContainer::Keep),
                Err(Error::InvalidTransition { .. }) => {
                    debug!("another instance is already evacuating this slot");
                    Ok(KeepContainer::Release)
                }
                Err(err) => Err(err),
            },
        }
    }

    /// A crashed container is never kept. A crash reported by an instance
    /// that no longer owns the ordinary record leaves that record alone.
    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index, instance = %instance_key))]
    pub async fn evacuate_crashed(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<KeepContainer, Error> {
        let mut lrps = self.index_lrps(key).await?;
        if owned_by(&lrps, Presence::Evacuating, instance_key) {
            self.remove(&mut lrps, key, Presence::Evacuating, instance_key)
                .await?;
        }

        match self.store.crash_actual_lrp(key, instance_key, reason).await {
            Ok(outcome) => {
                self.apply(&mut lrps, &outcome.change);
                self.events.emit_crash(outcome.crashed);
                if outcome.restarted {
                    self.starts.request_start(key).await;
                }
            }
            Err(err) if is_superseded(&err) => {
                debug!("ordinary lrp is not owned by the crashed instance: {err}");
            }
            Err(err) => return Err(err),
        }
        info!(reason, "evacuated crashed lrp");
        Ok(KeepContainer::Release)
    }

    /// Removes whichever record the stopped container backed. Fails with
    /// NotFound when none of them belongs to `instance_key`.
    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index, instance = %instance_key))]
    pub async fn evacuate_stopped(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<(), Error> {
        let mut lrps = self.index_lrps(key).await?;
        for presence in [Presence::Evacuating, Presence::Suspect, Presence::Ordinary] {
            if owned_by(&lrps, presence, instance_key) {
                self.remove(&mut lrps, key, presence, instance_key).await?;
                info!(%presence, "removed stopped lrp");
                return Ok(());
            }
        }
        Err(Error::not_found(
            Table::ActualLrps,
            &ActualLrp::key_from(&key.process_guid, key.index, Presence::Ordinary),
        ))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use data_model::test_objects::tests::{
        mock_actual_lrp,
        mock_desired_lrp,
        mock_evacuating_lrp,
        mock_instance_key,
        mock_net_info,
        TEST_DOMAIN,
    };
    use state_store::test_state_store::TestStateStore;

    use super::*;
    use crate::test_collaborators::FakeAuctioneer;

    struct Harness {
        test: TestStateStore,
        auctioneer: FakeAuctioneer,
        controller: EvacuationController,
    }

    async fn harness(instances: u32) -> Result<Harness> {
        let test = TestStateStore::new();
        if instances > 0 {
            test.store
                .desire_lrp(&mock_desired_lrp("p", TEST_DOMAIN, instances))
                .await?;
        }
        let auctioneer = FakeAuctioneer::default();
        let controller = EvacuationController::new(
            test.store.clone(),
            EventHub::default(),
            StartRequester::new(test.store.clone(), Arc::new(auctioneer.clone())),
        );
        Ok(Harness {
            test,
            auctioneer,
            controller,
        })
    }

    async fn lrp(h: &Harness, presence: Presence) -> Result<Option<ActualLrp>> {
        match h.test.store.actual_lrp("p", 0, presence).await {
            Ok(lrp) => Ok(Some(lrp)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[tokio::test]
    async fn test_claimed_is_handed_back() -> Result<()> {
        let h = harness(1).await?;
        let lrp = mock_actual_lrp("p", 0, ActualLrpState::Claimed, "cell-a");
        h.test.store.insert_actual_lrp(lrp.clone()).await?;

        let keep = h
            .controller
            .evacuate_claimed(&lrp.key, &mock_instance_key("cell-a"))
            .await?;
        assert_eq!(keep, KeepContainer::Release);
        let ordinary = lrp_or_fail(&h, Presence::Ordinary).await?;
        assert_eq!(ordinary.state, ActualLrpState::Unclaimed);
        assert_eq!(h.auctioneer.requests().await.len(), 1);
        Ok(())
    }

    async fn lrp_or_fail(h: &Harness, presence: Presence) -> Result<ActualLrp> {
        lrp(h, presence)
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing {presence} lrp"))
    }

    #[tokio::test]
    async fn test_claimed_with_evacuating_copy_removes_copy() -> Result<()> {
        let h = harness(1).await?;
        h.test
            .store
            .insert_actual_lrp(mock_actual_lrp("p", 0, ActualLrpState::Claimed, "cell-b"))
            .await?;
        let evacuating = mock_evacuating_lrp("p", 0, "cell-a");
        h.test.store.insert_actual_lrp(evacuating.clone()).await?;

        let keep = h
            .controller
            .evacuate_claimed(&evacuating.key, &mock_instance_key("cell-a"))
            .await?;
        assert_eq!(keep, KeepContainer::Release);
        assert!(lrp(&h, Presence::Evacuating).await?.is_none());
        assert_eq!(
            lrp_or_fail(&h, Presence::Ordinary).await?.state,
            ActualLrpState::Claimed
        );
        assert!(h.auctioneer.requests().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_running_evacuation_dance_is_idempotent() -> Result<()> {
        let h = harness(1).await?;
        let running = mock_actual_lrp("p", 0, ActualLrpState::Running, "cell-a");
        h.test.store.insert_actual_lrp(running.clone()).await?;
        let instance_key = mock_instance_key("cell-a");

        for _ in 0..2 {
            let keep = h
                .controller
                .evacuate_running(&running.key, &instance_key, &mock_net_info())
                .await?;
            assert_eq!(keep, KeepContainer::Keep);

            let evacuating = lrp_or_fail(&h, Presence::Evacuating).await?;
            assert!(evacuating.has_instance_key(&instance_key));
            assert_eq!(evacuating.net_info, mock_net_info());

            // The slot is never served twice by this instance.
            let ordinary = lrp_or_fail(&h, Presence::Ordinary).await?;
            assert_eq!(ordinary.state, ActualLrpState::Unclaimed);
            assert!(!ordinary.has_instance_key(&instance_key));
        }
        assert_eq!(h.auctioneer.requests().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_running_retry_unclaims_after_copy_was_written() -> Result<()> {
        let h = harness(1).await?;
        let running = mock_actual_lrp("p", 0, ActualLrpState::Running, "cell-a");
        h.test.store.insert_actual_lrp(running.clone()).await?;
        // An earlier attempt wrote the copy but failed before unclaiming.
        h.test
            .store
            .insert_actual_lrp(mock_evacuating_lrp("p", 0, "cell-a"))
            .await?;
        let instance_key = mock_instance_key("cell-a");

        let keep = h
            .controller
            .evacuate_running(&running.key, &instance_key, &mock_net_info())
            .await?;
        assert_eq!(keep, KeepContainer::Keep);
        assert!(lrp_or_fail(&h, Presence::Evacuating)
            .await?
            .has_instance_key(&instance_key));
        let ordinary = lrp_or_fail(&h, Presence::Ordinary).await?;
        assert_eq!(ordinary.state, ActualLrpState::Unclaimed);
        assert!(!ordinary.has_instance_key(&instance_key));
        assert_eq!(h.auctioneer.requests().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_running_released_once_replaced() -> Result<()> {
        let h = harness(1).await?;
        h.test
            .store
            .insert_actual_lrp(mock_actual_lrp("p", 0, ActualLrpState::Running, "cell-b"))
            .await?;
        let evacuating = mock_evacuating_lrp("p", 0, "cell-a");
        h.test.store.insert_actual_lrp(evacuating.clone()).await?;

        let keep = h
            .controller
            .evacuate_running(&evacuating.key, &mock_instance_key("cell-a"), &mock_net_info())
            .await?;
        assert_eq!(keep, KeepContainer::Release);
        assert!(lrp(&h, Presence::Evacuating).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_running_released_without_desired() -> Result<()> {
        let h = harness(0).await?;
        let running = mock_actual_lrp("p", 0, ActualLrpState::Running, "cell-a");
        h.test.store.insert_actual_lrp(running.clone()).await?;

        let keep = h
            .controller
            .evacuate_running(&running.key, &mock_instance_key("cell-a"), &mock_net_info())
            .await?;
        assert_eq!(keep, KeepContainer::Release);
        assert!(lrp(&h, Presence::Evacuating).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_running_without_ordinary_creates_copy() -> Result<()> {
        let h = harness(1).await?;
        let key = data_model::ActualLrpKey::new("p", 0, TEST_DOMAIN);

        let keep = h
            .controller
            .evacuate_running(&key, &mock_instance_key("cell-a"), &mock_net_info())
            .await?;
        assert_eq!(keep, KeepContainer::Keep);
        assert!(lrp(&h, Presence::Evacuating).await?.is_some());
        assert!(lrp(&h, Presence::Ordinary).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_crashed_removes_copy_and_restarts() -> Result<()> {
        let h = harness(1).await?;
        let running = mock_actual_lrp("p", 0, ActualLrpState::Running, "cell-a");
        h.test.store.insert_actual_lrp(running.clone()).await?;
        let mut crashes = h.controller.events.subscribe_instances();

        let keep = h
            .controller
            .evacuate_crashed(&running.key, &mock_instance_key("cell-a"), "oom")
            .await?;
        assert_eq!(keep, KeepContainer::Release);
        let ordinary = lrp_or_fail(&h, Presence::Ordinary).await?;
        assert_eq!(ordinary.state, ActualLrpState::Unclaimed);
        assert_eq!(ordinary.crash_count, 1);
        assert_eq!(h.auctioneer.requests().await.len(), 1);

        let mut saw_crash = false;
        while let Ok(event) = crashes.try_recv() {
            saw_crash |= matches!(event, state_store::ActualLrpInstanceEvent::Crashed(_));
        }
        assert!(saw_crash);
        Ok(())
    }

    #[tokio::test]
    async fn test_crash_from_stale_instance_is_released_without_restart() -> Result<()> {
        let h = harness(1).await?;
        let running = mock_actual_lrp("p", 0, ActualLrpState::Running, "cell-b");
        h.test.store.insert_actual_lrp(running.clone()).await?;

        let keep = h
            .controller
            .evacuate_crashed(&running.key, &mock_instance_key("cell-a"), "oom")
            .await?;
        assert_eq!(keep, KeepContainer::Release);
        let ordinary = lrp_or_fail(&h, Presence::Ordinary).await?;
        assert_eq!(ordinary.state, ActualLrpState::Running);
        assert_eq!(ordinary.crash_count, 0);
        assert!(ordinary.has_instance_key(&mock_instance_key("cell-b")));
        assert!(h.auctioneer.requests().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stopped_removes_matching_variant_only() -> Result<()> {
        let h = harness(1).await?;
        h.test
            .store
            .insert_actual_lrp(mock_actual_lrp("p", 0, ActualLrpState::Running, "cell-b"))
            .await?;
        let evacuating = mock_evacuating_lrp("p", 0, "cell-a");
        h.test.store.insert_actual_lrp(evacuating.clone()).await?;

        let err = h
            .controller
            .evacuate_stopped(&evacuating.key, &mock_instance_key("cell-c"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(lrp(&h, Presence::Evacuating).await?.is_some());

        h.controller
            .evacuate_stopped(&evacuating.key, &mock_instance_key("cell-a"))
            .await?;
        assert!(lrp(&h, Presence::Evacuating).await?.is_none());
        assert!(lrp(&h, Presence::Ordinary).await?.is_some());
        Ok(())
    }
}
