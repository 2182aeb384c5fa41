pub mod restart_policy;
pub mod test_objects;

use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display},
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use lrp_utils::get_epoch_time_in_ms;
pub use restart_policy::{DefaultRestartPolicy, RestartPolicy, RestartPolicyConfig};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter};

/// Separator used when building store keys. Process guids and domains must
/// not contain it.
pub const KEY_SEPARATOR: char = '/';

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct CellId(String);

impl Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CellId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CellId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies one desired slot of a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActualLrpKey {
    pub process_guid: String,
    pub index: u32,
    pub domain: String,
}

impl ActualLrpKey {
    pub fn new(process_guid: &str, index: u32, domain: &str) -> Self {
        Self {
            process_guid: process_guid.to_string(),
            index,
            domain: domain.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("process_guid", &self.process_guid)?;
        validate_identifier("domain", &self.domain)?;
        Ok(())
    }
}

impl Display for ActualLrpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.process_guid, self.index, self.domain)
    }
}

/// Identifies one concrete attempt at filling a slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActualLrpInstanceKey {
    pub instance_guid: String,
    pub cell_id: CellId,
}

impl ActualLrpInstanceKey {
    pub fn new(instance_guid: &str, cell_id: &str) -> Self {
        Self {
            instance_guid: instance_guid.to_string(),
            cell_id: CellId::from(cell_id),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_guid.is_empty() {
            return Err(anyhow!("instance_guid cannot be empty"));
        }
        if self.cell_id.get().is_empty() {
            return Err(anyhow!("cell_id cannot be empty"));
        }
        Ok(())
    }
}

impl Display for ActualLrpInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance_guid, self.cell_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct PortMapping {
    pub container_port: u32,
    pub host_port: u32,
}

/// Where a running instance can be reached. The default value means the
/// instance is not running yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct ActualLrpNetInfo {
    pub address: String,
    pub instance_address: String,
    pub ports: Vec<PortMapping>,
}

impl ActualLrpNetInfo {
    pub fn new(address: &str, instance_address: &str, ports: Vec<PortMapping>) -> Self {
        Self {
            address: address.to_string(),
            instance_address: instance_address.to_string(),
            ports,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.address.is_empty() && self.instance_address.is_empty() && self.ports.is_empty()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    AsRefStr,
    EnumIter,
)]
pub enum ActualLrpState {
    #[default]
    Unclaimed,
    Claimed,
    Running,
    Crashed,
}

/// Role a record plays for its slot. At most one record of each presence
/// exists per [`ActualLrpKey`].
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum::Display,
    AsRefStr,
    EnumIter,
)]
pub enum Presence {
    #[default]
    Ordinary,
    Evacuating,
    Suspect,
}

/// Version stamped on every record. The epoch is fixed when the record is
/// created, the index grows by one with every successful write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VersionTag {
    pub epoch: String,
    pub index: u32,
}

impl VersionTag {
    pub fn new() -> Self {
        Self {
            epoch: uuid::Uuid::new_v4().to_string(),
            index: 0,
        }
    }

    pub fn increment(&mut self) {
        self.index += 1;
    }
}

impl Default for VersionTag {
    fn default() -> Self {
        Self::new()
    }
}

/// One concrete runtime attempt fulfilling a desired slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(skip))]
pub struct ActualLrp {
    pub key: ActualLrpKey,
    pub instance_key: Option<ActualLrpInstanceKey>,
    pub net_info: ActualLrpNetInfo,
    pub state: ActualLrpState,
    pub presence: Presence,
    pub crash_count: u32,
    pub crash_reason: Option<String>,
    pub placement_error: Option<String>,
    /// Epoch milliseconds of the last state change.
    pub since: u64,
    pub version: VersionTag,
}

impl ActualLrpBuilder {
    pub fn build(&self) -> Result<ActualLrp> {
        let key = self
            .key
            .clone()
            .ok_or(anyhow!("actual lrp key is required"))?;
        Ok(ActualLrp {
            key,
            instance_key: self.instance_key.clone().unwrap_or_default(),
            net_info: self.net_info.clone().unwrap_or_default(),
            state: self.state.unwrap_or_default(),
            presence: self.presence.unwrap_or_default(),
            crash_count: self.crash_count.unwrap_or_default(),
            crash_reason: self.crash_reason.clone().unwrap_or_default(),
            placement_error: self.placement_error.clone().unwrap_or_default(),
            since: self.since.unwrap_or_else(get_epoch_time_in_ms),
            version: self.version.clone().unwrap_or_default(),
        })
    }
}

impl ActualLrp {
    pub fn new_unclaimed(key: ActualLrpKey, since: u64) -> Self {
        Self {
            key,
            instance_key: None,
            net_info: ActualLrpNetInfo::default(),
            state: ActualLrpState::Unclaimed,
            presence: Presence::Ordinary,
            crash_count: 0,
            crash_reason: None,
            placement_error: None,
            since,
            version: VersionTag::new(),
        }
    }

    pub fn store_key(&self) -> String {
        ActualLrp::key_from(&self.key.process_guid, self.key.index, self.presence)
    }

    pub fn key_from(process_guid: &str, index: u32, presence: Presence) -> String {
        format!(
            "{}{}",
            ActualLrp::key_prefix_for_index(process_guid, index),
            presence.as_ref()
        )
    }

    pub fn key_prefix_for_process(process_guid: &str) -> String {
        format!("{process_guid}{KEY_SEPARATOR}")
    }

    pub fn key_prefix_for_index(process_guid: &str, index: u32) -> String {
        // Zero padded so that a prefix scan lists indices in numeric order.
        format!("{process_guid}{KEY_SEPARATOR}{index:010}{KEY_SEPARATOR}")
    }

    pub fn cell_id(&self) -> Option<&CellId> {
        self.instance_key.as_ref().map(|k| &k.cell_id)
    }

    pub fn has_instance_key(&self, instance_key: &ActualLrpInstanceKey) -> bool {
        self.instance_key.as_ref() == Some(instance_key)
    }

    /// Whether the record is assigned to a cell, i.e. Claimed or Running.
    pub fn is_placed(&self) -> bool {
        matches!(
            self.state,
            ActualLrpState::Claimed | ActualLrpState::Running
        )
    }

    /// Single table governing every state change. `instance_key` is the
    /// identity requested by the caller; `None` asks for an anonymous
    /// transition, which only restarts a Crashed record.
    pub fn allows_transition_to(
        &self,
        key: &ActualLrpKey,
        instance_key: Option<&ActualLrpInstanceKey>,
        new_state: ActualLrpState,
    ) -> bool {
        if self.key != *key {
            return false;
        }
        let same_instance = instance_key.is_some() && self.instance_key.as_ref() == instance_key;

        use ActualLrpState::*;
        match (self.state, new_state) {
            (Unclaimed, Unclaimed) => instance_key.is_none(),
            (Unclaimed, Claimed) | (Unclaimed, Running) => instance_key.is_some(),
            (Unclaimed, Crashed) => false,

            (Claimed, Unclaimed) => same_instance,
            (Claimed, Claimed) => same_instance,
            (Claimed, Running) => instance_key.is_some(),
            (Claimed, Crashed) => same_instance,

            (Running, Unclaimed) => same_instance,
            (Running, Claimed) => false,
            (Running, Running) => same_instance,
            (Running, Crashed) => same_instance,

            (Crashed, Unclaimed) => instance_key.is_none(),
            (Crashed, Claimed) | (Crashed, Running) | (Crashed, Crashed) => false,
        }
    }

    /// Structural checks applied to every record read from the store.
    pub fn validate(&self) -> Result<()> {
        self.key.validate()?;
        if self.version.epoch.is_empty() {
            return Err(anyhow!("version epoch cannot be empty"));
        }
        match self.state {
            ActualLrpState::Unclaimed | ActualLrpState::Crashed => {
                if self.instance_key.is_some() {
                    return Err(anyhow!(
                        "{} actual lrp cannot have an instance key",
                        self.state
                    ));
                }
                if !self.net_info.is_empty() {
                    return Err(anyhow!("{} actual lrp cannot have net info", self.state));
                }
            }
            ActualLrpState::Claimed => {
                let instance_key = self
                    .instance_key
                    .as_ref()
                    .ok_or(anyhow!("claimed actual lrp requires an instance key"))?;
                instance_key.validate()?;
                if !self.net_info.is_empty() {
                    return Err(anyhow!("claimed actual lrp cannot have net info"));
                }
            }
            ActualLrpState::Running => {
                let instance_key = self
                    .instance_key
                    .as_ref()
                    .ok_or(anyhow!("running actual lrp requires an instance key"))?;
                instance_key.validate()?;
            }
        }
        if self.state == ActualLrpState::Crashed && self.crash_reason.is_none() {
            return Err(anyhow!("crashed actual lrp requires a crash reason"));
        }
        if self.presence == Presence::Evacuating && self.state != ActualLrpState::Running {
            return Err(anyhow!("evacuating actual lrp must be running"));
        }
        Ok(())
    }
}

/// Legacy view of a slot: the instance record and the evacuating record
/// travel together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ActualLrpGroup {
    pub instance: Option<ActualLrp>,
    pub evacuating: Option<ActualLrp>,
}

impl ActualLrpGroup {
    /// The Suspect record takes the instance slot when there is no Ordinary
    /// record or the Ordinary record is not Running yet.
    pub fn resolve(lrps: &[ActualLrp]) -> Self {
        let find = |presence: Presence| lrps.iter().find(|lrp| lrp.presence == presence);
        let ordinary = find(Presence::Ordinary);
        let suspect = find(Presence::Suspect);
        let instance = match (ordinary, suspect) {
            (Some(ordinary), Some(suspect)) => {
                if ordinary.state == ActualLrpState::Running {
                    Some(ordinary)
                } else {
                    Some(suspect)
                }
            }
            (Some(ordinary), None) => Some(ordinary),
            (None, suspect) => suspect,
        };
        Self {
            instance: instance.cloned(),
            evacuating: find(Presence::Evacuating).cloned(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instance.is_none() && self.evacuating.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ActualLrpFilter {
    pub domain: Option<String>,
    pub cell_id: Option<CellId>,
    pub process_guid: Option<String>,
    pub index: Option<u32>,
}

impl ActualLrpFilter {
    pub fn matches(&self, lrp: &ActualLrp) -> bool {
        if let Some(domain) = &self.domain {
            if lrp.key.domain != *domain {
                return false;
            }
        }
        if let Some(cell_id) = &self.cell_id {
            if lrp.cell_id() != Some(cell_id) {
                return false;
            }
        }
        if let Some(process_guid) = &self.process_guid {
            if lrp.key.process_guid != *process_guid {
                return false;
            }
        }
        if let Some(index) = self.index {
            if lrp.key.index != index {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct DesiredLrpResource {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub max_pids: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunAction {
    pub path: String,
    pub args: Vec<String>,
    pub user: String,
}

/// The half of a desired record needed to schedule instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DesiredLrpSchedulingInfo {
    pub process_guid: String,
    pub domain: String,
    pub log_guid: String,
    pub instances: u32,
    pub annotation: String,
    pub root_fs: String,
    pub resource: DesiredLrpResource,
    pub placement_tags: Vec<String>,
    pub version: VersionTag,
    pub created_at: u64,
}

impl DesiredLrpSchedulingInfo {
    pub fn key(&self) -> String {
        self.process_guid.clone()
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("process_guid", &self.process_guid)?;
        validate_identifier("domain", &self.domain)?;
        if self.root_fs.is_empty() {
            return Err(anyhow!("root_fs cannot be empty"));
        }
        Ok(())
    }

    pub fn apply_update(&mut self, update: &DesiredLrpUpdate) {
        if let Some(instances) = update.instances {
            self.instances = instances;
        }
        if let Some(annotation) = &update.annotation {
            self.annotation = annotation.clone();
        }
    }
}

/// The half of a desired record needed to run an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DesiredLrpRunInfo {
    pub process_guid: String,
    pub domain: String,
    pub action: RunAction,
    pub env: Vec<EnvironmentVariable>,
    pub ports: Vec<u32>,
    pub start_timeout_ms: u64,
    pub created_at: u64,
}

impl DesiredLrpRunInfo {
    pub fn key(&self) -> String {
        self.process_guid.clone()
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("process_guid", &self.process_guid)?;
        validate_identifier("domain", &self.domain)?;
        if self.action.path.is_empty() {
            return Err(anyhow!("action path cannot be empty"));
        }
        Ok(())
    }
}

fn default_created_at() -> u64 {
    get_epoch_time_in_ms()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
pub struct DesiredLrp {
    #[builder(setter(into))]
    pub process_guid: String,
    #[builder(setter(into))]
    pub domain: String,
    #[builder(setter(into), default)]
    pub log_guid: String,
    #[builder(default = "1")]
    pub instances: u32,
    #[builder(setter(into), default)]
    pub annotation: String,
    #[builder(setter(into))]
    pub root_fs: String,
    #[builder(default)]
    pub resource: DesiredLrpResource,
    #[builder(default)]
    pub placement_tags: Vec<String>,
    pub action: RunAction,
    #[builder(default)]
    pub env: Vec<EnvironmentVariable>,
    #[builder(default)]
    pub ports: Vec<u32>,
    #[builder(default)]
    pub start_timeout_ms: u64,
    #[builder(default)]
    pub version: VersionTag,
    #[builder(default = "default_created_at()")]
    pub created_at: u64,
}

impl DesiredLrp {
    pub fn from_parts(scheduling_info: DesiredLrpSchedulingInfo, run_info: DesiredLrpRunInfo) -> Self {
        Self {
            process_guid: scheduling_info.process_guid,
            domain: scheduling_info.domain,
            log_guid: scheduling_info.log_guid,
            instances: scheduling_info.instances,
            annotation: scheduling_info.annotation,
            root_fs: scheduling_info.root_fs,
            resource: scheduling_info.resource,
            placement_tags: scheduling_info.placement_tags,
            action: run_info.action,
            env: run_info.env,
            ports: run_info.ports,
            start_timeout_ms: run_info.start_timeout_ms,
            version: scheduling_info.version,
            created_at: scheduling_info.created_at,
        }
    }

    pub fn scheduling_info(&self) -> DesiredLrpSchedulingInfo {
        DesiredLrpSchedulingInfo {
            process_guid: self.process_guid.clone(),
            domain: self.domain.clone(),
            log_guid: self.log_guid.clone(),
            instances: self.instances,
            annotation: self.annotation.clone(),
            root_fs: self.root_fs.clone(),
            resource: self.resource.clone(),
            placement_tags: self.placement_tags.clone(),
            version: self.version.clone(),
            created_at: self.created_at,
        }
    }

    pub fn run_info(&self) -> DesiredLrpRunInfo {
        DesiredLrpRunInfo {
            process_guid: self.process_guid.clone(),
            domain: self.domain.clone(),
            action: self.action.clone(),
            env: self.env.clone(),
            ports: self.ports.clone(),
            start_timeout_ms: self.start_timeout_ms,
            created_at: self.created_at,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduling_info().validate()?;
        self.run_info().validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DesiredLrpUpdate {
    pub instances: Option<u32>,
    pub annotation: Option<String>,
}

impl DesiredLrpUpdate {
    pub fn is_empty(&self) -> bool {
        self.instances.is_none() && self.annotation.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DesiredLrpFilter {
    pub domain: Option<String>,
    pub process_guids: Vec<String>,
}

impl DesiredLrpFilter {
    pub fn matches(&self, info: &DesiredLrpSchedulingInfo) -> bool {
        if let Some(domain) = &self.domain {
            if info.domain != *domain {
                return false;
            }
        }
        self.process_guids.is_empty() || self.process_guids.contains(&info.process_guid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CellCapacity {
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub containers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellPresence {
    pub cell_id: CellId,
    pub rep_address: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub capacity: CellCapacity,
}

/// Snapshot of the live cells, taken once per convergence run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CellSet(HashMap<CellId, CellPresence>);

impl CellSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cell: CellPresence) {
        self.0.insert(cell.cell_id.clone(), cell);
    }

    pub fn has_cell_id(&self, cell_id: &CellId) -> bool {
        self.0.contains_key(cell_id)
    }

    pub fn get(&self, cell_id: &CellId) -> Option<&CellPresence> {
        self.0.get(cell_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<CellPresence> for CellSet {
    fn from_iter<I: IntoIterator<Item = CellPresence>>(iter: I) -> Self {
        let mut set = CellSet::new();
        for cell in iter {
            set.add(cell);
        }
        set
    }
}

/// Domains whose owner asserted freshness recently.
pub type DomainSet = HashSet<String>;

/// Freshness marker written by a domain owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainMarker {
    pub domain: String,
    /// Zero means the marker never expires.
    pub expires_at: u64,
}

impl DomainMarker {
    pub fn is_fresh(&self, now: u64) -> bool {
        self.expires_at == 0 || self.expires_at > now
    }
}

/// Request for the placement service to start the given indices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LrpStartRequest {
    pub process_guid: String,
    pub domain: String,
    pub scheduling_info: DesiredLrpSchedulingInfo,
    pub indices: Vec<u32>,
}

impl LrpStartRequest {
    pub fn new(scheduling_info: &DesiredLrpSchedulingInfo, indices: Vec<u32>) -> Self {
        let mut indices = indices;
        indices.sort_unstable();
        indices.dedup();
        Self {
            process_guid: scheduling_info.process_guid.clone(),
            domain: scheduling_info.domain.clone(),
            scheduling_info: scheduling_info.clone(),
            indices,
        }
    }
}

fn validate_identifier(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(anyhow!("{name} cannot be empty"));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(anyhow!("{name} cannot contain '{KEY_SEPARATOR}': {value}"));
    }
    Ok(())
}
