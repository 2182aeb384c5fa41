//! Lifecycle events derived from the records of one index before and after a
//! mutation.
//!
//! Two vocabularies are produced from the same pair of record sets: the
//! legacy group vocabulary, where the instance and evacuating slots of a
//! group are reported separately, and the single-instance vocabulary, keyed
//! by presence.

use std::collections::BTreeMap;

use data_model::{
    ActualLrp,
    ActualLrpGroup,
    ActualLrpInstanceKey,
    ActualLrpKey,
    Presence,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActualLrpGroupEvent {
    Created(ActualLrpGroup),
    Changed {
        before: ActualLrpGroup,
        after: ActualLrpGroup,
    },
    Removed(ActualLrpGroup),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualLrpCrashedEvent {
    pub key: ActualLrpKey,
    pub instance_key: ActualLrpInstanceKey,
    pub crash_count: u32,
    pub crash_reason: String,
    pub since: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActualLrpInstanceEvent {
    Created(ActualLrp),
    Changed { before: ActualLrp, after: ActualLrp },
    Removed(ActualLrp),
    Crashed(ActualLrpCrashedEvent),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActualLrpEvents {
    pub group: Vec<ActualLrpGroupEvent>,
    pub instance: Vec<ActualLrpInstanceEvent>,
}

impl ActualLrpEvents {
    pub fn is_empty(&self) -> bool {
        self.group.is_empty() && self.instance.is_empty()
    }

    pub fn extend(&mut self, other: ActualLrpEvents) {
        self.group.extend(other.group);
        self.instance.extend(other.instance);
    }
}

/// Applies a single record change to the records of an index and returns the
/// resulting set. Records are matched by presence.
pub fn record_change(
    before: Option<&ActualLrp>,
    after: Option<&ActualLrp>,
    lrps: &[ActualLrp],
) -> Vec<ActualLrp> {
    let presence = before.or(after).map(|lrp| lrp.presence);
    let mut changed: Vec<ActualLrp> = lrps
        .iter()
        .filter(|lrp| Some(lrp.presence) != presence)
        .cloned()
        .collect();
    if let Some(after) = after {
        changed.push(after.clone());
    }
    changed.sort_by_key(|lrp| lrp.presence);
    changed
}

/// Computes the events separating two sets of records for one index. Equal
/// sets, version tags included, produce no events.
pub fn calculate_events(before: &[ActualLrp], after: &[ActualLrp]) -> ActualLrpEvents {
    ActualLrpEvents {
        group: calculate_group_events(before, after),
        instance: calculate_instance_events(before, after),
    }
}

fn by_presence(lrps: &[ActualLrp]) -> BTreeMap<Presence, &ActualLrp> {
    lrps.iter().map(|lrp| (lrp.presence, lrp)).collect()
}

fn calculate_instance_events(before: &[ActualLrp], after: &[ActualLrp]) -> Vec<ActualLrpInstanceEvent> {
    let before = by_presence(before);
    let after = by_presence(after);

    let mut presences: Vec<Presence> = before.keys().chain(after.keys()).copied().collect();
    presences.sort();
    presences.dedup();

    let mut events = Vec::new();
    for presence in presences {
        match (before.get(&presence), after.get(&presence)) {
            (None, Some(created)) => {
                events.push(ActualLrpInstanceEvent::Created((*created).clone()));
            }
            (Some(removed), None) => {
                events.push(ActualLrpInstanceEvent::Removed((*removed).clone()));
            }
            (Some(b), Some(a)) if b != a => {
                let replaced = matches!(
                    (&b.instance_key, &a.instance_key),
                    (Some(bk), Some(ak)) if bk != ak
                );
                if replaced {
                    events.push(ActualLrpInstanceEvent::Removed((*b).clone()));
                    events.push(ActualLrpInstanceEvent::Created((*a).clone()));
                } else {
                    events.push(ActualLrpInstanceEvent::Changed {
                        before: (*b).clone(),
                        after: (*a).clone(),
                    });
                }
            }
            _ => {}
        }
    }
    events
}

fn instance_slot(group: &ActualLrpGroup) -> ActualLrpGroup {
    ActualLrpGroup {
        instance: group.instance.clone(),
        evacuating: None,
    }
}

fn evacuating_slot(group: &ActualLrpGroup) -> ActualLrpGroup {
    ActualLrpGroup {
        instance: None,
        evacuating: group.evacuating.clone(),
    }
}

fn calculate_group_events(before: &[ActualLrp], after: &[ActualLrp]) -> Vec<ActualLrpGroupEvent> {
    let before = ActualLrpGroup::resolve(before);
    let after = ActualLrpGroup::resolve(after);

    let slots: [fn(&ActualLrpGroup) -> ActualLrpGroup; 2] = [instance_slot, evacuating_slot];
    let mut events = Vec::new();
    for slot in slots {
        let before = slot(&before);
        let after = slot(&after);
        match (before.is_empty(), after.is_empty()) {
            (true, false) => events.push(ActualLrpGroupEvent::Created(after)),
            (false, true) => events.push(ActualLrpGroupEvent::Removed(before)),
            (false, false) if before != after => {
                events.push(ActualLrpGroupEvent::Changed { before, after })
            }
            _ => {}
        }
    }
    events
}

/// Best effort fan-out of events. Sending never blocks: slow subscribers
/// lag and lose the oldest events, and events without subscribers are
/// dropped.
#[derive(Debug, Clone)]
pub struct EventHub {
    group_tx: broadcast::Sender<ActualLrpGroupEvent>,
    instance_tx: broadcast::Sender<ActualLrpInstanceEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (group_tx, _) = broadcast::channel(capacity);
        let (instance_tx, _) = broadcast::channel(capacity);
        Self {
            group_tx,
            instance_tx,
        }
    }

    pub fn subscribe_groups(&self) -> broadcast::Receiver<ActualLrpGroupEvent> {
        self.group_tx.subscribe()
    }

    pub fn subscribe_instances(&self) -> broadcast::Receiver<ActualLrpInstanceEvent> {
        self.instance_tx.subscribe()
    }

    pub fn emit(&self, events: ActualLrpEvents) {
        for event in events.group {
            trace!(?event, "emitting group event");
            let _ = self.group_tx.send(event);
        }
        for event in events.instance {
            trace!(?event, "emitting instance event");
            let _ = self.instance_tx.send(event);
        }
    }

    pub fn emit_crash(&self, event: ActualLrpCrashedEvent) {
        let _ = self.instance_tx.send(ActualLrpInstanceEvent::Crashed(event));
    }

    /// Computes and emits the events for one record change within an index.
    pub fn record_change(
        &self,
        before: Option<&ActualLrp>,
        after: Option<&ActualLrp>,
        lrps: &[ActualLrp],
    ) -> ActualLrpEvents {
        let changed = record_change(before, after, lrps);
        let events = calculate_events(lrps, &changed);
        self.emit(events.clone());
        events
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
