/// The topology state machine
///
/// [`TopologyDescription`] is a plain value. Every heartbeat result is folded in
/// with [`TopologyDescription::update`]; the owning [`Topology`](super::Topology)
/// serializes those calls and publishes the result as an immutable snapshot.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use bson::oid::ObjectId;
use tracing::{debug, info, warn};

use crate::core::{NodeDescription, NodeRole, ServerAddress};

/// Oldest wire version this client can talk to
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;
/// Newest wire version this client can talk to
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyType {
    Unknown,
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
}

impl TopologyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyType::Unknown => "Unknown",
            TopologyType::Single => "Single",
            TopologyType::ReplicaSetNoPrimary => "ReplicaSetNoPrimary",
            TopologyType::ReplicaSetWithPrimary => "ReplicaSetWithPrimary",
            TopologyType::Sharded => "Sharded",
        }
    }

    pub fn is_replica_set(&self) -> bool {
        matches!(
            self,
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary
        )
    }
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authoritative view of the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDescription {
    topology_type: TopologyType,
    set_name: Option<String>,
    max_set_version: Option<i64>,
    max_election_id: Option<ObjectId>,
    /// Node whose primary claim established the recorded maximum
    epoch_holder: Option<ServerAddress>,
    servers: BTreeMap<ServerAddress, NodeDescription>,
    compatibility_error: Option<String>,
    heartbeat_frequency: Duration,
    local_threshold: Duration,
    version: u64,
}

impl TopologyDescription {
    /// Initial description: every seed Unknown. A single seed without a set
    /// name, or a direct connection, starts as Single.
    pub fn new(
        seeds: Vec<ServerAddress>,
        set_name: Option<String>,
        direct_connection: bool,
        heartbeat_frequency: Duration,
        local_threshold: Duration,
    ) -> Self {
        let topology_type = if direct_connection || (seeds.len() == 1 && set_name.is_none()) {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        };

        let servers = seeds
            .into_iter()
            .map(|address| (address.clone(), NodeDescription::unknown(address)))
            .collect();

        Self {
            topology_type,
            set_name,
            max_set_version: None,
            max_election_id: None,
            epoch_holder: None,
            servers,
            compatibility_error: None,
            heartbeat_frequency,
            local_threshold,
            version: 0,
        }
    }

    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn max_set_version(&self) -> Option<i64> {
        self.max_set_version
    }

    pub fn max_election_id(&self) -> Option<ObjectId> {
        self.max_election_id
    }

    pub fn compatibility_error(&self) -> Option<&str> {
        self.compatibility_error.as_deref()
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_frequency
    }

    pub fn local_threshold(&self) -> Duration {
        self.local_threshold
    }

    /// Incremented on every update that changed the description
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn servers(&self) -> impl Iterator<Item = &NodeDescription> {
        self.servers.values()
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&NodeDescription> {
        self.servers.get(address)
    }

    pub fn contains(&self, address: &ServerAddress) -> bool {
        self.servers.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn primary(&self) -> Option<&NodeDescription> {
        self.servers.values().find(|s| s.role == NodeRole::RsPrimary)
    }

    pub fn has_primary(&self) -> bool {
        self.primary().is_some()
    }

    pub fn nodes_with_role(&self, role: NodeRole) -> impl Iterator<Item = &NodeDescription> {
        self.servers.values().filter(move |s| s.role == role)
    }

    /// Fold one heartbeat result into the description. Returns whether anything
    /// changed. Reports for addresses no longer in the topology are ignored.
    pub fn update(&mut self, description: NodeDescription) -> bool {
        if !self.servers.contains_key(&description.address) {
            debug!(
                "Ignoring description of {} which is no longer part of the topology",
                description.address
            );
            return false;
        }

        let before = self.clone();
        let address = description.address.clone();
        let role = description.role;
        self.servers.insert(address.clone(), description.clone());

        match self.topology_type {
            TopologyType::Single => self.update_single(&description),
            TopologyType::Unknown => match role {
                NodeRole::Unknown | NodeRole::RsGhost => {}
                NodeRole::Standalone => self.update_unknown_with_standalone(&address),
                NodeRole::Router => {
                    if self.set_name.is_some() {
                        self.servers.remove(&address);
                    } else {
                        self.topology_type = TopologyType::Sharded;
                    }
                }
                NodeRole::RsPrimary => self.update_rs_from_primary(&description),
                NodeRole::RsSecondary | NodeRole::RsArbiter | NodeRole::RsOther => {
                    self.topology_type = TopologyType::ReplicaSetNoPrimary;
                    self.update_rs_without_primary(&description);
                }
            },
            TopologyType::Sharded => match role {
                NodeRole::Unknown | NodeRole::Router => {}
                _ => {
                    warn!("Removing {} ({}) from sharded topology", address, role);
                    self.servers.remove(&address);
                }
            },
            TopologyType::ReplicaSetNoPrimary => match role {
                NodeRole::Unknown | NodeRole::RsGhost => {}
                NodeRole::Standalone | NodeRole::Router => {
                    warn!("Removing {} ({}) from replica set topology", address, role);
                    self.servers.remove(&address);
                }
                NodeRole::RsPrimary => self.update_rs_from_primary(&description),
                NodeRole::RsSecondary | NodeRole::RsArbiter | NodeRole::RsOther => {
                    self.update_rs_without_primary(&description)
                }
            },
            TopologyType::ReplicaSetWithPrimary => match role {
                NodeRole::Unknown | NodeRole::RsGhost => self.check_if_has_primary(),
                NodeRole::Standalone | NodeRole::Router => {
                    warn!("Removing {} ({}) from replica set topology", address, role);
                    self.servers.remove(&address);
                    self.check_if_has_primary();
                }
                NodeRole::RsPrimary => self.update_rs_from_primary(&description),
                NodeRole::RsSecondary | NodeRole::RsArbiter | NodeRole::RsOther => {
                    self.update_rs_with_primary_from_member(&description)
                }
            },
        }

        self.update_compatibility();

        let changed = *self != before;
        if changed {
            self.version += 1;
            if self.topology_type != before.topology_type {
                info!(
                    "Topology changed from {} to {}",
                    before.topology_type, self.topology_type
                );
            }
        }
        changed
    }

    /// Mark a node Unknown after a failed heartbeat or operation
    pub fn mark_unknown<S: Into<String>>(&mut self, address: &ServerAddress, error: S) -> bool {
        self.update(NodeDescription::unknown_with_error(address.clone(), error))
    }

    fn update_single(&mut self, description: &NodeDescription) {
        if let Some(expected) = &self.set_name {
            if description.is_available() && description.set_name.as_ref() != Some(expected) {
                let error = format!(
                    "node reports set name {:?} but {} was expected",
                    description.set_name, expected
                );
                self.reset_node(description, error);
            }
        }
    }

    fn update_unknown_with_standalone(&mut self, address: &ServerAddress) {
        if self.set_name.is_some() {
            warn!("Removing standalone {} from replica set topology", address);
            self.servers.remove(address);
            return;
        }
        info!("{} is a standalone; dropping other seeds", address);
        self.topology_type = TopologyType::Single;
        self.servers.retain(|a, _| a == address);
    }

    /// Record the reported set name, or reset the node when it disagrees
    fn accept_set_name(&mut self, description: &NodeDescription) -> bool {
        match &self.set_name {
            None => {
                self.set_name = description.set_name.clone();
                true
            }
            Some(expected) if description.set_name.as_ref() != Some(expected) => {
                let error = format!(
                    "node reports set name {:?} but {} was expected",
                    description.set_name, expected
                );
                warn!("Ignoring report from {}: {}", description.address, error);
                self.reset_node(description, error);
                false
            }
            Some(_) => true,
        }
    }

    fn update_rs_from_primary(&mut self, description: &NodeDescription) {
        let address = &description.address;
        if !self.accept_set_name(description) {
            self.check_if_has_primary();
            return;
        }

        if let Some((set_version, election_id)) = description.election_epoch() {
            if let (Some(max_version), Some(max_id)) = (self.max_set_version, self.max_election_id) {
                let incoming = (set_version, election_id.bytes());
                let recorded = (max_version, max_id.bytes());
                let stale = incoming < recorded
                    || (incoming == recorded && self.epoch_holder.as_ref() != Some(address));
                if stale {
                    let error = format!(
                        "stale primary claim (setVersion {}, electionId {}) below recorded (setVersion {}, electionId {})",
                        set_version, election_id, max_version, max_id
                    );
                    warn!("Demoting {}: {}", address, error);
                    self.reset_node(description, error);
                    self.check_if_has_primary();
                    return;
                }
            }
            self.max_election_id = Some(election_id);
            self.epoch_holder = Some(address.clone());
        }
        // a setVersion without an electionId still raises the maximum
        if let Some(set_version) = description.set_version {
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }

        let demoted: Vec<ServerAddress> = self
            .servers
            .values()
            .filter(|s| s.role == NodeRole::RsPrimary && &s.address != address)
            .map(|s| s.address.clone())
            .collect();
        for old in demoted {
            info!("{} superseded by new primary {}", old, address);
            let mut unknown = NodeDescription::unknown_with_error(old.clone(), "superseded by a newer primary");
            unknown.last_update_time = description.last_update_time;
            self.servers.insert(old, unknown);
        }

        let members: BTreeSet<&ServerAddress> = description.hosts.iter().collect();
        for member in &description.hosts {
            if !self.servers.contains_key(member) {
                info!("Discovered replica set member {} via primary {}", member, address);
                self.servers
                    .insert(member.clone(), NodeDescription::unknown(member.clone()));
            }
        }
        self.servers.retain(|a, _| members.contains(a));

        self.check_if_has_primary();
    }

    fn update_rs_without_primary(&mut self, description: &NodeDescription) {
        if !self.accept_set_name(description) {
            return;
        }

        for member in &description.hosts {
            if !self.servers.contains_key(member) {
                debug!("Discovered replica set member {} via {}", member, description.address);
                self.servers
                    .insert(member.clone(), NodeDescription::unknown(member.clone()));
            }
        }

        if description.me.as_ref().is_some_and(|me| me != &description.address) {
            warn!(
                "Removing {}: member reports itself as {:?}",
                description.address, description.me
            );
            self.servers.remove(&description.address);
        }
    }

    fn update_rs_with_primary_from_member(&mut self, description: &NodeDescription) {
        if self.accept_set_name(description)
            && description.me.as_ref().is_some_and(|me| me != &description.address)
        {
            self.servers.remove(&description.address);
        }
        self.check_if_has_primary();
    }

    fn check_if_has_primary(&mut self) {
        self.topology_type = if self.has_primary() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Keep the slot but reset it to Unknown, stamped with the report's time
    fn reset_node(&mut self, description: &NodeDescription, error: String) {
        let mut unknown = NodeDescription::unknown_with_error(description.address.clone(), error);
        unknown.last_update_time = description.last_update_time;
        self.servers.insert(description.address.clone(), unknown);
    }

    fn update_compatibility(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .filter(|s| s.is_available())
            .find_map(|s| {
                if s.min_wire_version > MAX_SUPPORTED_WIRE_VERSION {
                    Some(format!(
                        "{} requires wire version {}, but this client only supports up to {}",
                        s.address, s.min_wire_version, MAX_SUPPORTED_WIRE_VERSION
                    ))
                } else if s.max_wire_version < MIN_SUPPORTED_WIRE_VERSION {
                    Some(format!(
                        "{} reports wire version {}, but this client requires at least {}",
                        s.address, s.max_wire_version, MIN_SUPPORTED_WIRE_VERSION
                    ))
                } else {
                    None
                }
            });
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ type: {}", self.topology_type)?;
        if let Some(name) = &self.set_name {
            write!(f, ", set: {}", name)?;
        }
        write!(f, ", servers: [")?;
        for (i, server) in self.servers.values().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", server.address, server.role)?;
            if let Some(error) = &server.error {
                write!(f, " ({})", error)?;
            }
        }
        write!(f, "] }}")
    }
}
