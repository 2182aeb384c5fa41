//! Validated state transitions of actual LRP records.
//!
//! Every transition reads the record and its version, checks the transition
//! table on [`ActualLrp::allows_transition_to`], and writes the new record
//! with compare-and-swap. A lost race surfaces as a retryable
//! [`Error::Conflict`]; the caller decides whether to try again. Each
//! transition returns the record before and after the change, and a
//! transition that changes nothing returns two equal records.

use data_model::{
    ActualLrp,
    ActualLrpFilter,
    ActualLrpGroup,
    ActualLrpInstanceKey,
    ActualLrpKey,
    ActualLrpNetInfo,
    ActualLrpState,
    Presence,
};
use lrp_utils::elapsed_since;
use tracing::{debug, info};

use crate::{events::ActualLrpCrashedEvent, Error, Scan, StateStore, Table, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualLrpChange {
    pub before: Option<ActualLrp>,
    pub after: Option<ActualLrp>,
}

impl ActualLrpChange {
    fn unchanged(lrp: ActualLrp) -> Self {
        Self {
            before: Some(lrp.clone()),
            after: Some(lrp),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashOutcome {
    pub change: ActualLrpChange,
    /// The restart policy demoted the record straight back to Unclaimed.
    pub restarted: bool,
    pub crashed: ActualLrpCrashedEvent,
}

fn invalid_transition(lrp: &ActualLrp, to: &str) -> Error {
    Error::InvalidTransition {
        key: lrp.store_key(),
        from: lrp.state.to_string(),
        to: to.to_string(),
    }
}

fn checked(lrp: ActualLrp) -> Result<ActualLrp, Error> {
    let key = lrp.store_key();
    lrp.validate()
        .map_err(|source| Error::invalid_record(Table::ActualLrps, &key, source))?;
    Ok(lrp)
}

impl StateStore {
    async fn actual_lrp_with_version(
        &self,
        process_guid: &str,
        index: u32,
        presence: Presence,
    ) -> Result<(ActualLrp, Version), Error> {
        let key = ActualLrp::key_from(process_guid, index, presence);
        self.read_record(Table::ActualLrps, &key).await
    }

    /// Next revision of `lrp` with its version tag incremented.
    fn revise(&self, lrp: &ActualLrp) -> ActualLrp {
        let mut next = lrp.clone();
        next.version.increment();
        next
    }

    async fn write_revision(
        &self,
        version: Version,
        before: ActualLrp,
        after: ActualLrp,
    ) -> Result<ActualLrpChange, Error> {
        let after = checked(after)?;
        self.swap_record(Table::ActualLrps, &after.store_key(), version, &after)
            .await?;
        Ok(ActualLrpChange {
            before: Some(before),
            after: Some(after),
        })
    }

    async fn write_new(&self, lrp: ActualLrp) -> Result<ActualLrpChange, Error> {
        let lrp = checked(lrp)?;
        self.create_record(Table::ActualLrps, &lrp.store_key(), &lrp)
            .await?;
        Ok(ActualLrpChange {
            before: None,
            after: Some(lrp),
        })
    }

    pub async fn actual_lrp(
        &self,
        process_guid: &str,
        index: u32,
        presence: Presence,
    ) -> Result<ActualLrp, Error> {
        let (lrp, _) = self
            .actual_lrp_with_version(process_guid, index, presence)
            .await?;
        Ok(lrp)
    }

    /// Every record of one index, ordered by presence. Invalid records are
    /// skipped.
    pub async fn actual_lrps_for_index(
        &self,
        process_guid: &str,
        index: u32,
    ) -> Result<Vec<ActualLrp>, Error> {
        let prefix = ActualLrp::key_prefix_for_index(process_guid, index);
        let scan: Scan<ActualLrp> = self.scan(Table::ActualLrps, &prefix).await?;
        let mut lrps: Vec<ActualLrp> = scan.records.into_iter().map(|(lrp, _)| lrp).collect();
        lrps.sort_by_key(|lrp| lrp.presence);
        Ok(lrps)
    }

    pub async fn actual_lrp_group(
        &self,
        process_guid: &str,
        index: u32,
    ) -> Result<ActualLrpGroup, Error> {
        let lrps = self.actual_lrps_for_index(process_guid, index).await?;
        Ok(ActualLrpGroup::resolve(&lrps))
    }

    /// Records matching `filter`, ordered by process guid, index and
    /// presence.
    pub async fn actual_lrps(&self, filter: &ActualLrpFilter) -> Result<Vec<ActualLrp>, Error> {
        let prefix = match (&filter.process_guid, filter.index) {
            (Some(guid), Some(index)) => ActualLrp::key_prefix_for_index(guid, index),
            (Some(guid), None) => ActualLrp::key_prefix_for_process(guid),
            (None, _) => String::new(),
        };
        let scan: Scan<ActualLrp> = self.scan(Table::ActualLrps, &prefix).await?;
        let mut lrps: Vec<ActualLrp> = scan
            .records
            .into_iter()
            .map(|(lrp, _)| lrp)
            .filter(|lrp| filter.matches(lrp))
            .collect();
        lrps.sort_by(|a, b| {
            (&a.key.process_guid, a.key.index, a.presence)
                .cmp(&(&b.key.process_guid, b.key.index, b.presence))
        });
        Ok(lrps)
    }

    /// Every actual record with its version, invalid ones reported apart.
    pub async fn scan_actual_lrps(&self) -> Result<Scan<ActualLrp>, Error> {
        self.scan(Table::ActualLrps, "").await
    }

    /// Writes a record as is. Used to seed records that no transition
    /// produces, like Suspect copies.
    pub async fn insert_actual_lrp(&self, lrp: ActualLrp) -> Result<ActualLrpChange, Error> {
        self.write_new(lrp).await
    }

    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn create_unclaimed_actual_lrp(
        &self,
        key: &ActualLrpKey,
    ) -> Result<ActualLrpChange, Error> {
        let lrp = ActualLrp::new_unclaimed(key.clone(), self.now());
        let change = self.write_new(lrp).await?;
        info!("created unclaimed actual lrp");
        Ok(change)
    }

    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index, instance = %instance_key))]
    pub async fn claim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
    ) -> Result<ActualLrpChange, Error> {
        let (lrp, version) = self
            .actual_lrp_with_version(&key.process_guid, key.index, Presence::Ordinary)
            .await?;

        if lrp.key == *key &&
            lrp.state == ActualLrpState::Claimed &&
            lrp.has_instance_key(instance_key)
        {
            debug!("actual lrp already claimed by this instance");
            return Ok(ActualLrpChange::unchanged(lrp));
        }
        if !lrp.allows_transition_to(key, Some(instance_key), ActualLrpState::Claimed) {
            return Err(invalid_transition(&lrp, ActualLrpState::Claimed.as_ref()));
        }

        let mut next = self.revise(&lrp);
        next.state = ActualLrpState::Claimed;
        next.instance_key = Some(instance_key.clone());
        next.net_info = ActualLrpNetInfo::default();
        next.placement_error = None;
        next.since = self.now();
        let change = self.write_revision(version, lrp, next).await?;
        info!("claimed actual lrp");
        Ok(change)
    }

    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index, instance = %instance_key))]
    pub async fn start_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
    ) -> Result<ActualLrpChange, Error> {
        let (lrp, version) = match self
            .actual_lrp_with_version(&key.process_guid, key.index, Presence::Ordinary)
            .await
        {
            Ok(found) => found,
            Err(err) if err.is_not_found() => {
                let mut lrp = ActualLrp::new_unclaimed(key.clone(), self.now());
                lrp.state = ActualLrpState::Running;
                lrp.instance_key = Some(instance_key.clone());
                lrp.net_info = net_info.clone();
                let change = self.write_new(lrp).await?;
                info!("created running actual lrp");
                return Ok(change);
            }
            Err(err) => return Err(err),
        };

        if lrp.key == *key &&
            lrp.state == ActualLrpState::Running &&
            lrp.has_instance_key(instance_key) &&
            lrp.net_info == *net_info
        {
            debug!("actual lrp already running with this instance");
            return Ok(ActualLrpChange::unchanged(lrp));
        }
        if !lrp.allows_transition_to(key, Some(instance_key), ActualLrpState::Running) {
            return Err(invalid_transition(&lrp, ActualLrpState::Running.as_ref()));
        }

        let mut next = self.revise(&lrp);
        next.state = ActualLrpState::Running;
        next.instance_key = Some(instance_key.clone());
        next.net_info = net_info.clone();
        next.placement_error = None;
        next.since = self.now();
        let change = self.write_revision(version, lrp, next).await?;
        info!("started actual lrp");
        Ok(change)
    }

    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index, instance = %instance_key))]
    pub async fn crash_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        reason: &str,
    ) -> Result<CrashOutcome, Error> {
        let (lrp, version) = self
            .actual_lrp_with_version(&key.process_guid, key.index, Presence::Ordinary)
            .await?;
        if !lrp.allows_transition_to(key, Some(instance_key), ActualLrpState::Crashed) {
            return Err(invalid_transition(&lrp, ActualLrpState::Crashed.as_ref()));
        }

        let now = self.now();
        let ran_long_enough = lrp.state == ActualLrpState::Running &&
            elapsed_since(lrp.since, now) > self.config.crash_reset_timeout;
        let crash_count = if ran_long_enough {
            1
        } else {
            lrp.crash_count.saturating_add(1)
        };

        let mut next = self.revise(&lrp);
        next.state = ActualLrpState::Crashed;
        next.instance_key = None;
        next.net_info = ActualLrpNetInfo::default();
        next.crash_count = crash_count;
        next.crash_reason = Some(reason.to_string());
        next.since = now;

        let restarted = self.restart_policy.should_restart_immediately(crash_count);
        if restarted {
            next.state = ActualLrpState::Unclaimed;
        }

        let change = self.write_revision(version, lrp, next).await?;
        info!(crash_count, restarted, reason, "crashed actual lrp");
        Ok(CrashOutcome {
            change,
            restarted,
            crashed: ActualLrpCrashedEvent {
                key: key.clone(),
                instance_key: instance_key.clone(),
                crash_count,
                crash_reason: reason.to_string(),
                since: now,
            },
        })
    }

    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn fail_actual_lrp(
        &self,
        key: &ActualLrpKey,
        placement_error: &str,
    ) -> Result<ActualLrpChange, Error> {
        let (lrp, version) = self
            .actual_lrp_with_version(&key.process_guid, key.index, Presence::Ordinary)
            .await?;
        if lrp.key != *key || lrp.state != ActualLrpState::Unclaimed {
            return Err(invalid_transition(&lrp, "PlacementFailed"));
        }

        let mut next = self.revise(&lrp);
        next.placement_error = Some(placement_error.to_string());
        let change = self.write_revision(version, lrp, next).await?;
        info!(placement_error, "failed to place actual lrp");
        Ok(change)
    }

    /// Returns a record to Unclaimed. Claimed and Running records need the
    /// owning instance key; a Crashed record is unclaimed without one, which
    /// is how convergence restarts it.
    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index))]
    pub async fn unclaim_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: Option<&ActualLrpInstanceKey>,
    ) -> Result<ActualLrpChange, Error> {
        let (lrp, version) = self
            .actual_lrp_with_version(&key.process_guid, key.index, Presence::Ordinary)
            .await?;
        if lrp.key == *key && lrp.state == ActualLrpState::Unclaimed {
            debug!("actual lrp already unclaimed");
            return Ok(ActualLrpChange::unchanged(lrp));
        }
        if !lrp.allows_transition_to(key, instance_key, ActualLrpState::Unclaimed) {
            return Err(invalid_transition(&lrp, ActualLrpState::Unclaimed.as_ref()));
        }

        let mut next = self.revise(&lrp);
        next.state = ActualLrpState::Unclaimed;
        next.instance_key = None;
        next.net_info = ActualLrpNetInfo::default();
        next.since = self.now();
        let change = self.write_revision(version, lrp, next).await?;
        info!("unclaimed actual lrp");
        Ok(change)
    }

    /// Deletes a record. When an instance key is given it must own the
    /// record, otherwise the record counts as not found.
    #[tracing::instrument(skip_all, fields(process_guid = %process_guid, index = index, presence = %presence))]
    pub async fn remove_actual_lrp(
        &self,
        process_guid: &str,
        index: u32,
        presence: Presence,
        instance_key: Option<&ActualLrpInstanceKey>,
    ) -> Result<ActualLrpChange, Error> {
        let (lrp, version) = self
            .actual_lrp_with_version(process_guid, index, presence)
            .await?;
        if let Some(instance_key) = instance_key {
            if !lrp.has_instance_key(instance_key) {
                debug!(instance = %instance_key, "actual lrp owned by another instance");
                return Err(Error::not_found(Table::ActualLrps, &lrp.store_key()));
            }
        }

        self.delete_record(Table::ActualLrps, &lrp.store_key(), version)
            .await?;
        info!("removed actual lrp");
        Ok(ActualLrpChange {
            before: Some(lrp),
            after: None,
        })
    }

    /// Creates or refreshes the Evacuating copy of an instance that keeps
    /// running on a draining cell.
    #[tracing::instrument(skip_all, fields(process_guid = %key.process_guid, index = key.index, instance = %instance_key))]
    pub async fn evacuate_actual_lrp(
        &self,
        key: &ActualLrpKey,
        instance_key: &ActualLrpInstanceKey,
        net_info: &ActualLrpNetInfo,
    ) -> Result<ActualLrpChange, Error> {
        let (lrp, version) = match self
            .actual_lrp_with_version(&key.process_guid, key.index, Presence::Evacuating)
            .await
        {
            Ok(found) => found,
            Err(err) if err.is_not_found() => {
                let mut lrp = ActualLrp::new_unclaimed(key.clone(), self.now());
                lrp.state = ActualLrpState::Running;
                lrp.presence = Presence::Evacuating;
                lrp.instance_key = Some(instance_key.clone());
                lrp.net_info = net_info.clone();
                let change = self.write_new(lrp).await?;
                info!("created evacuating actual lrp");
                return Ok(change);
            }
            Err(err) => return Err(err),
        };

        if lrp.key != *key || !lrp.has_instance_key(instance_key) {
            return Err(invalid_transition(&lrp, Presence::Evacuating.as_ref()));
        }
        if lrp.net_info == *net_info {
            return Ok(ActualLrpChange::unchanged(lrp));
        }

        let mut next = self.revise(&lrp);
        next.net_info = net_info.clone();
        next.since = self.now();
        let change = self.write_revision(version, lrp, next).await?;
        info!("refreshed evacuating actual lrp");
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use data_model::{
        test_objects::tests::{
            mock_actual_lrp,
            mock_actual_lrp_key,
            mock_instance_key,
            mock_net_info,
            TEST_DOMAIN,
        },
        CellId,
    };

    use super::*;
    use crate::test_state_store::TestStateStore;

    async fn seed_unclaimed(test: &TestStateStore) -> Result<ActualLrpKey> {
        let key = mock_actual_lrp_key("guid", 0);
        test.store.create_unclaimed_actual_lrp(&key).await?;
        Ok(key)
    }

    #[tokio::test]
    async fn test_claim_then_start() -> Result<()> {
        let test = TestStateStore::new();
        let key = seed_unclaimed(&test).await?;
        let instance_key = mock_instance_key("cell-1");

        let change = test.store.claim_actual_lrp(&key, &instance_key).await?;
        let claimed = change.after.clone().unwrap();
        assert_eq!(claimed.state, ActualLrpState::Claimed);
        assert_eq!(claimed.version.index, 1);
        assert_eq!(
            claimed.version.epoch,
            change.before.as_ref().unwrap().version.epoch
        );

        // Claiming again with the same identity changes nothing.
        let again = test.store.claim_actual_lrp(&key, &instance_key).await?;
        assert!(again.is_noop());

        let started = test
            .store
            .start_actual_lrp(&key, &instance_key, &mock_net_info())
            .await?;
        let running = started.after.unwrap();
        assert_eq!(running.state, ActualLrpState::Running);
        assert_eq!(running.net_info, mock_net_info());
        assert_eq!(running.version.index, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_with_other_identity_is_rejected() -> Result<()> {
        let test = TestStateStore::new();
        let key = seed_unclaimed(&test).await?;
        test.store
            .claim_actual_lrp(&key, &mock_instance_key("cell-1"))
            .await?;
        let before = test.store.actual_lrp("guid", 0, Presence::Ordinary).await?;

        let err = test
            .store
            .claim_actual_lrp(&key, &mock_instance_key("cell-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(
            test.store.actual_lrp("guid", 0, Presence::Ordinary).await?,
            before
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_start_is_idempotent() -> Result<()> {
        let test = TestStateStore::new();
        let key = mock_actual_lrp_key("guid", 3);
        let instance_key = mock_instance_key("cell-1");

        let created = test
            .store
            .start_actual_lrp(&key, &instance_key, &mock_net_info())
            .await?;
        assert!(created.before.is_none());

        let again = test
            .store
            .start_actual_lrp(&key, &instance_key, &mock_net_info())
            .await?;
        assert!(again.is_noop());
        assert_eq!(again.after, created.after);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_rejects_running_on_other_identity() -> Result<()> {
        let test = TestStateStore::new();
        let key = mock_actual_lrp_key("guid", 0);
        test.store
            .start_actual_lrp(&key, &mock_instance_key("cell-1"), &mock_net_info())
            .await?;
        let before = test.store.actual_lrp("guid", 0, Presence::Ordinary).await?;

        let err = test
            .store
            .start_actual_lrp(&key, &mock_instance_key("cell-2"), &mock_net_info())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(
            test.store.actual_lrp("guid", 0, Presence::Ordinary).await?,
            before
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_crash_restarts_immediately_then_stays_crashed() -> Result<()> {
        let test = TestStateStore::new();
        let key = mock_actual_lrp_key("guid", 0);
        let instance_key = mock_instance_key("cell-1");

        for expected_count in 1..=3 {
            test.store
                .start_actual_lrp(&key, &instance_key, &mock_net_info())
                .await?;
            let outcome = test
                .store
                .crash_actual_lrp(&key, &instance_key, "oom")
                .await?;
            assert!(outcome.restarted);
            let after = outcome.change.after.unwrap();
            assert_eq!(after.state, ActualLrpState::Unclaimed);
            assert_eq!(after.crash_count, expected_count);
            assert_eq!(outcome.crashed.crash_count, expected_count);
        }

        test.store
            .start_actual_lrp(&key, &instance_key, &mock_net_info())
            .await?;
        let outcome = test
            .store
            .crash_actual_lrp(&key, &instance_key, "oom")
            .await?;
        assert!(!outcome.restarted);
        let after = outcome.change.after.unwrap();
        assert_eq!(after.state, ActualLrpState::Crashed);
        assert_eq!(after.crash_count, 4);
        assert_eq!(after.crash_reason.as_deref(), Some("oom"));
        assert!(after.instance_key.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_crash_count_resets_after_running_long_enough() -> Result<()> {
        let test = TestStateStore::new();
        let key = mock_actual_lrp_key("guid", 0);
        let instance_key = mock_instance_key("cell-1");

        let mut lrp = mock_actual_lrp("guid", 0, ActualLrpState::Running, "cell-1");
        lrp.crash_count = 3;
        lrp.since = test.store.now();
        test.store.insert_actual_lrp(lrp).await?;

        test.clock.advance(Duration::from_secs(10 * 60));
        let outcome = test
            .store
            .crash_actual_lrp(&key, &instance_key, "exit 1")
            .await?;
        assert_eq!(outcome.crashed.crash_count, 1);
        assert!(outcome.restarted);
        Ok(())
    }

    #[tokio::test]
    async fn test_crash_count_grows_when_crashing_quickly() -> Result<()> {
        let test = TestStateStore::new();
        let key = mock_actual_lrp_key("guid", 0);
        let instance_key = mock_instance_key("cell-1");

        let mut lrp = mock_actual_lrp("guid", 0, ActualLrpState::Running, "cell-1");
        lrp.crash_count = 3;
        lrp.since = test.store.now();
        test.store.insert_actual_lrp(lrp).await?;

        test.clock.advance(Duration::from_secs(60));
        let outcome = test
            .store
            .crash_actual_lrp(&key, &instance_key, "exit 1")
            .await?;
        assert_eq!(outcome.crashed.crash_count, 4);
        assert!(!outcome.restarted);
        Ok(())
    }

    #[tokio::test]
    async fn test_crash_with_other_identity_leaves_record_unchanged() -> Result<()> {
        let test = TestStateStore::new();
        let key = mock_actual_lrp_key("guid", 0);
        test.store
            .start_actual_lrp(&key, &mock_instance_key("cell-1"), &mock_net_info())
            .await?;
        let before = test.store.actual_lrp("guid", 0, Presence::Ordinary).await?;

        let err = test
            .store
            .crash_actual_lrp(&key, &mock_instance_key("cell-2"), "oom")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(
            test.store.actual_lrp("guid", 0, Presence::Ordinary).await?,
            before
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_fail_only_from_unclaimed() -> Result<()> {
        let test = TestStateStore::new();
        let key = seed_unclaimed(&test).await?;

        let change = test.store.fail_actual_lrp(&key, "no capacity").await?;
        assert_eq!(
            change.after.unwrap().placement_error.as_deref(),
            Some("no capacity")
        );

        test.store
            .claim_actual_lrp(&key, &mock_instance_key("cell-1"))
            .await?;
        let err = test
            .store
            .fail_actual_lrp(&key, "no capacity")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_unclaim() -> Result<()> {
        let test = TestStateStore::new();
        let key = seed_unclaimed(&test).await?;
        let instance_key = mock_instance_key("cell-1");

        assert!(test
            .store
            .unclaim_actual_lrp(&key, Some(&instance_key))
            .await?
            .is_noop());

        test.store
            .start_actual_lrp(&key, &instance_key, &mock_net_info())
            .await?;
        let err = test
            .store
            .unclaim_actual_lrp(&key, Some(&mock_instance_key("cell-2")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let change = test
            .store
            .unclaim_actual_lrp(&key, Some(&instance_key))
            .await?;
        let after = change.after.unwrap();
        assert_eq!(after.state, ActualLrpState::Unclaimed);
        assert!(after.instance_key.is_none());
        assert!(after.net_info.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_checks_identity() -> Result<()> {
        let test = TestStateStore::new();
        let key = mock_actual_lrp_key("guid", 0);
        test.store
            .start_actual_lrp(&key, &mock_instance_key("cell-1"), &mock_net_info())
            .await?;

        let err = test
            .store
            .remove_actual_lrp("guid", 0, Presence::Ordinary, Some(&mock_instance_key("cell-2")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let change = test
            .store
            .remove_actual_lrp("guid", 0, Presence::Ordinary, Some(&mock_instance_key("cell-1")))
            .await?;
        assert!(change.after.is_none());
        assert!(test
            .store
            .actual_lrp("guid", 0, Presence::Ordinary)
            .await
            .unwrap_err()
            .is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_evacuate_creates_then_refreshes() -> Result<()> {
        let test = TestStateStore::new();
        let key = mock_actual_lrp_key("guid", 0);
        let instance_key = mock_instance_key("cell-1");

        let created = test
            .store
            .evacuate_actual_lrp(&key, &instance_key, &mock_net_info())
            .await?;
        let evacuating = created.after.unwrap();
        assert_eq!(evacuating.presence, Presence::Evacuating);
        assert_eq!(evacuating.state, ActualLrpState::Running);

        let again = test
            .store
            .evacuate_actual_lrp(&key, &instance_key, &mock_net_info())
            .await?;
        assert!(again.is_noop());

        let mut moved = mock_net_info();
        moved.address = "10.0.0.2".to_string();
        let refreshed = test
            .store
            .evacuate_actual_lrp(&key, &instance_key, &moved)
            .await?;
        assert_eq!(refreshed.after.unwrap().net_info, moved);

        let err = test
            .store
            .evacuate_actual_lrp(&key, &mock_instance_key("cell-2"), &moved)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_reads_are_ordered_and_filtered() -> Result<()> {
        let test = TestStateStore::new();
        for (guid, index, cell) in [("b", 0, "cell-1"), ("a", 10, "cell-2"), ("a", 2, "cell-1")] {
            test.store
                .start_actual_lrp(
                    &mock_actual_lrp_key(guid, index),
                    &mock_instance_key(cell),
                    &mock_net_info(),
                )
                .await?;
        }
        test.store
            .evacuate_actual_lrp(
                &mock_actual_lrp_key("a", 2),
                &mock_instance_key("cell-1"),
                &mock_net_info(),
            )
            .await?;

        let all = test.store.actual_lrps(&ActualLrpFilter::default()).await?;
        let order: Vec<(String, u32, Presence)> = all
            .iter()
            .map(|lrp| (lrp.key.process_guid.clone(), lrp.key.index, lrp.presence))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 2, Presence::Ordinary),
                ("a".to_string(), 2, Presence::Evacuating),
                ("a".to_string(), 10, Presence::Ordinary),
                ("b".to_string(), 0, Presence::Ordinary),
            ]
        );

        let on_cell = test
            .store
            .actual_lrps(&ActualLrpFilter {
                cell_id: Some(CellId::from("cell-1")),
                domain: Some(TEST_DOMAIN.to_string()),
                ..Default::default()
            })
            .await?;
        assert_eq!(on_cell.len(), 3);

        let group = test.store.actual_lrp_group("a", 2).await?;
        assert!(group.instance.is_some());
        assert!(group.evacuating.is_some());
        Ok(())
    }
}
