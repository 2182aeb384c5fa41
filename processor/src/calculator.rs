//! Pure diff between desired and actual state.

use std::time::Duration;

use data_model::{
    ActualLrp,
    ActualLrpKey,
    ActualLrpState,
    DesiredLrpSchedulingInfo,
    Presence,
    RestartPolicy,
};
use lrp_utils::elapsed_since;
use tracing::debug;

use crate::gatherer::ConvergenceInput;

/// An actual record together with the scheduling info of its process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledLrp {
    pub scheduling_info: DesiredLrpSchedulingInfo,
    pub lrp: ActualLrp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingLrp {
    pub scheduling_info: DesiredLrpSchedulingInfo,
    pub key: ActualLrpKey,
}

/// Every discrepancy found by one calculation. An instance appears in at
/// most one list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergenceChanges {
    pub missing_lrps: Vec<MissingLrp>,
    pub lrps_on_missing_cells: Vec<ScheduledLrp>,
    pub extra_lrps: Vec<ActualLrp>,
    pub restartable_crashed_lrps: Vec<ScheduledLrp>,
    pub stale_unclaimed_lrps: Vec<ScheduledLrp>,
    pub evacuating_lrps_on_missing_cells: Vec<ActualLrp>,
}

impl ConvergenceChanges {
    pub fn is_empty(&self) -> bool {
        self.missing_lrps.is_empty() &&
            self.lrps_on_missing_cells.is_empty() &&
            self.extra_lrps.is_empty() &&
            self.restartable_crashed_lrps.is_empty() &&
            self.stale_unclaimed_lrps.is_empty() &&
            self.evacuating_lrps_on_missing_cells.is_empty()
    }

    /// Discrepancy counts keyed by a stable name, for logs and metrics.
    pub fn counts(&self) -> [(&'static str, usize); 6] {
        [
            ("missing_lrp", self.missing_lrps.len()),
            ("lrp_on_missing_cell", self.lrps_on_missing_cells.len()),
            ("extra_lrp", self.extra_lrps.len()),
            ("restartable_crashed_lrp", self.restartable_crashed_lrps.len()),
            ("stale_unclaimed_lrp", self.stale_unclaimed_lrps.len()),
            (
                "evacuating_lrp_on_missing_cell",
                self.evacuating_lrps_on_missing_cells.len(),
            ),
        ]
    }
}

/// Compares the snapshot against the desired state. Only the Ordinary
/// record of a slot is checked for the missing cell, extra index, crash and
/// stale categories; a Suspect record stands in for a slot that has no
/// Ordinary record. Evacuating copies are only checked for a missing cell.
pub fn calculate_convergence(
    input: &ConvergenceInput,
    restart_policy: &dyn RestartPolicy,
    now: u64,
    stale_unclaimed_duration: Duration,
) -> ConvergenceChanges {
    let mut changes = ConvergenceChanges::default();

    for process_guid in &input.process_guids {
        let desired = input.desired.get(process_guid);
        let indices = input.actual.get(process_guid);

        if let Some(desired) = desired {
            if input.domains.contains(&desired.domain) {
                for index in 0..desired.instances {
                    let occupied = indices
                        .and_then(|indices| indices.get(&index))
                        .is_some_and(|lrps| {
                            lrps.iter()
                                .any(|lrp| lrp.presence != Presence::Evacuating)
                        });
                    if !occupied {
                        changes.missing_lrps.push(MissingLrp {
                            scheduling_info: desired.clone(),
                            key: ActualLrpKey::new(process_guid, index, &desired.domain),
                        });
                    }
                }
            }
        }

        let Some(indices) = indices else {
            continue;
        };
        for lrps in indices.values() {
            for lrp in lrps {
                match lrp.presence {
                    Presence::Evacuating => {
                        if is_on_missing_cell(input, lrp) {
                            changes.evacuating_lrps_on_missing_cells.push(lrp.clone());
                        }
                    }
                    Presence::Suspect => {}
                    Presence::Ordinary => classify_ordinary(
                        input,
                        desired,
                        lrp,
                        restart_policy,
                        now,
                        stale_unclaimed_duration,
                        &mut changes,
                    ),
                }
            }
        }
    }

    debug!(counts = ?changes.counts(), "calculated convergence changes");
    changes
}

fn is_on_missing_cell(input: &ConvergenceInput, lrp: &ActualLrp) -> bool {
    lrp.cell_id()
        .is_some_and(|cell_id| !input.cells.has_cell_id(cell_id))
}

fn classify_ordinary(
    input: &ConvergenceInput,
    desired: Option<&DesiredLrpSchedulingInfo>,
    lrp: &ActualLrp,
    restart_policy: &dyn RestartPolicy,
    now: u64,
    stale_unclaimed_duration: Duration,
    changes: &mut ConvergenceChanges,
) {
    let fresh_domain = input.domains.contains(&lrp.key.domain);
    let Some(desired) = desired else {
        if fresh_domain {
            changes.extra_lrps.push(lrp.clone());
        }
        return;
    };
    let scheduled = || ScheduledLrp {
        scheduling_info: desired.clone(),
        lrp: lrp.clone(),
    };

    if lrp.is_placed() && is_on_missing_cell(input, lrp) {
        changes.lrps_on_missing_cells.push(scheduled());
        return;
    }
    if lrp.key.index >= desired.instances {
        if fresh_domain {
            changes.extra_lrps.push(lrp.clone());
        }
        return;
    }
    match lrp.state {
        ActualLrpState::Crashed
            if restart_policy.should_restart(now, lrp.since, lrp.crash_count) =>
        {
            changes.restartable_crashed_lrps.push(scheduled());
        }
        ActualLrpState::Unclaimed
            if elapsed_since(lrp.since, now) > stale_unclaimed_duration =>
        {
            changes.stale_unclaimed_lrps.push(scheduled());
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use data_model::{
        test_objects::tests::{mock_actual_lrp, mock_cell, mock_desired_lrp, mock_evacuating_lrp},
        CellSet,
        DefaultRestartPolicy,
    };

    use super::*;

    const NOW: u64 = 10_000_000;
    const STALE: Duration = Duration::from_secs(30);

    fn input(domains: &[&str], cells: &[&str]) -> ConvergenceInput {
        ConvergenceInput {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            cells: cells.iter().map(|c| mock_cell(c)).collect::<CellSet>(),
            ..Default::default()
        }
    }

    fn desire(input: &mut ConvergenceInput, guid: &str, domain: &str, instances: u32) {
        input.add_desired(mock_desired_lrp(guid, domain, instances).scheduling_info());
    }

    fn calculate(input: &ConvergenceInput) -> ConvergenceChanges {
        calculate_convergence(input, &DefaultRestartPolicy::default(), NOW, STALE)
    }

    #[test]
    fn test_missing_indices_without_cells() -> Result<()> {
        let mut input = input(&["d"], &[]);
        desire(&mut input, "p", "d", 2);

        let changes = calculate(&input);
        let indices: Vec<u32> = changes.missing_lrps.iter().map(|m| m.key.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(changes.missing_lrps[0].key.domain, "d");
        assert_eq!(changes.missing_lrps.len(), 2);
        assert!(changes.extra_lrps.is_empty());
        Ok(())
    }

    #[test]
    fn test_evacuating_copy_does_not_fill_a_slot() -> Result<()> {
        let mut input = input(&["test-domain"], &["cell-a"]);
        desire(&mut input, "p", "test-domain", 1);
        input.add_actual(mock_evacuating_lrp("p", 0, "cell-a"));

        let changes = calculate(&input);
        assert_eq!(changes.missing_lrps.len(), 1);
        assert!(changes.evacuating_lrps_on_missing_cells.is_empty());
        Ok(())
    }

    #[test]
    fn test_claimed_on_vanished_cell_is_only_missing_cell() -> Result<()> {
        let mut input = input(&["test-domain"], &[]);
        desire(&mut input, "p", "test-domain", 1);
        input.add_actual(mock_actual_lrp("p", 0, ActualLrpState::Claimed, "X"));

        let changes = calculate(&input);
        assert_eq!(changes.lrps_on_missing_cells.len(), 1);
        assert_eq!(
            changes.lrps_on_missing_cells[0].lrp.cell_id(),
            Some(&"X".into())
        );
        assert!(changes.missing_lrps.is_empty());
        assert!(changes.extra_lrps.is_empty());
        assert!(changes.stale_unclaimed_lrps.is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_cell_wins_over_extra_index() -> Result<()> {
        let mut input = input(&["test-domain"], &[]);
        desire(&mut input, "p", "test-domain", 1);
        input.add_actual(mock_actual_lrp("p", 0, ActualLrpState::Running, "X"));
        input.add_actual(mock_actual_lrp("p", 3, ActualLrpState::Running, "X"));

        let changes = calculate(&input);
        assert_eq!(changes.lrps_on_missing_cells.len(), 2);
        assert!(changes.extra_lrps.is_empty());
        Ok(())
    }

    #[test]
    fn test_extra_indices_need_a_fresh_domain() -> Result<()> {
        let mut fresh = input(&["test-domain"], &["cell-a"]);
        desire(&mut fresh, "p", "test-domain", 1);
        fresh.add_actual(mock_actual_lrp("p", 0, ActualLrpState::Running, "cell-a"));
        fresh.add_actual(mock_actual_lrp("p", 1, ActualLrpState::Running, "cell-a"));
        fresh.add_actual(mock_actual_lrp("undesired", 0, ActualLrpState::Running, "cell-a"));

        let changes = calculate(&fresh);
        let extra: Vec<(&str, u32)> = changes
            .extra_lrps
            .iter()
            .map(|lrp| (lrp.key.process_guid.as_str(), lrp.key.index))
            .collect();
        assert_eq!(extra, vec![("p", 1), ("undesired", 0)]);

        let mut stale = fresh.clone();
        stale.domains.clear();
        let changes = calculate(&stale);
        assert!(changes.extra_lrps.is_empty());
        assert!(changes.missing_lrps.is_empty());
        Ok(())
    }

    #[test]
    fn test_stale_domain_still_restarts_crashes() -> Result<()> {
        let mut input = input(&[], &["cell-a"]);
        desire(&mut input, "p", "test-domain", 2);
        // First crash restarts without backoff.
        input.add_actual(mock_actual_lrp("p", 0, ActualLrpState::Crashed, ""));

        let changes = calculate(&input);
        assert_eq!(changes.restartable_crashed_lrps.len(), 1);
        assert!(changes.missing_lrps.is_empty());
        Ok(())
    }

    #[test]
    fn test_crash_backoff_and_stale_unclaimed() -> Result<()> {
        let mut input = input(&["test-domain"], &["cell-a"]);
        desire(&mut input, "p", "test-domain", 3);

        let mut backing_off = mock_actual_lrp("p", 0, ActualLrpState::Crashed, "");
        backing_off.crash_count = 5;
        backing_off.since = NOW - 1_000;
        input.add_actual(backing_off);

        let mut fresh_unclaimed = mock_actual_lrp("p", 1, ActualLrpState::Unclaimed, "");
        fresh_unclaimed.since = NOW - 1_000;
        input.add_actual(fresh_unclaimed);

        // since = 1000, long before NOW.
        input.add_actual(mock_actual_lrp("p", 2, ActualLrpState::Unclaimed, ""));

        let changes = calculate(&input);
        assert!(changes.restartable_crashed_lrps.is_empty());
        assert_eq!(changes.stale_unclaimed_lrps.len(), 1);
        assert_eq!(changes.stale_unclaimed_lrps[0].lrp.key.index, 2);
        Ok(())
    }

    #[test]
    fn test_evacuating_on_missing_cell() -> Result<()> {
        let mut input = input(&["test-domain"], &["cell-a"]);
        desire(&mut input, "p", "test-domain", 1);
        input.add_actual(mock_actual_lrp("p", 0, ActualLrpState::Running, "cell-a"));
        input.add_actual(mock_evacuating_lrp("p", 0, "gone"));

        let changes = calculate(&input);
        assert_eq!(changes.evacuating_lrps_on_missing_cells.len(), 1);
        assert!(changes.lrps_on_missing_cells.is_empty());
        Ok(())
    }

    #[test]
    fn test_calculation_is_pure() -> Result<()> {
        let mut input = input(&["test-domain"], &[]);
        desire(&mut input, "p", "test-domain", 2);
        input.add_actual(mock_actual_lrp("p", 0, ActualLrpState::Claimed, "X"));
        let snapshot = format!("{input:?}");

        let first = calculate(&input);
        let second = calculate(&input);
        assert_eq!(first, second);
        assert_eq!(format!("{input:?}"), snapshot);
        Ok(())
    }
}
