/// Server selection
///
/// Pure functions over a [`TopologyDescription`] snapshot. Waiting for a
/// suitable node and the selection deadline live in
/// [`Topology::select_server`](crate::topology::Topology::select_server).
pub mod read_preference;

use std::fmt;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::core::{NodeDescription, NodeRole, ServerAddress};
use crate::error::{RutaError, RutaResult};
use crate::topology::{TopologyDescription, TopologyType};

pub use read_preference::{parse_tag_set, ReadPreference, ReadPreferenceMode, TagSet};

/// What an operation needs from the node it runs on
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionCriteria {
    ReadPreference(ReadPreference),
    /// Writable node: the primary, a router or a standalone
    Write,
}

impl SelectionCriteria {
    pub fn read_preference(&self) -> Option<&ReadPreference> {
        match self {
            SelectionCriteria::ReadPreference(pref) => Some(pref),
            SelectionCriteria::Write => None,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(pref: ReadPreference) -> Self {
        SelectionCriteria::ReadPreference(pref)
    }
}

impl fmt::Display for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionCriteria::ReadPreference(pref) => write!(f, "read preference {}", pref),
            SelectionCriteria::Write => f.write_str("writable server"),
        }
    }
}

/// Pick one address, or `None` when nothing is eligible right now.
///
/// `deprioritized` nodes are skipped on sharded topologies when another
/// router qualifies.
pub fn select_server(
    topology: &TopologyDescription,
    criteria: &SelectionCriteria,
    deprioritized: &[ServerAddress],
) -> RutaResult<Option<ServerAddress>> {
    let mut candidates = suitable_servers(topology, criteria)?;

    if topology.topology_type() == TopologyType::Sharded && !deprioritized.is_empty() {
        let preferred: Vec<&NodeDescription> = candidates
            .iter()
            .copied()
            .filter(|s| !deprioritized.contains(&s.address))
            .collect();
        if !preferred.is_empty() {
            candidates = preferred;
        }
    }

    Ok(candidates
        .choose(&mut rand::thread_rng())
        .map(|s| s.address.clone()))
}

/// Every node eligible under `criteria`, after the latency window
pub fn suitable_servers<'a>(
    topology: &'a TopologyDescription,
    criteria: &SelectionCriteria,
) -> RutaResult<Vec<&'a NodeDescription>> {
    if let Some(error) = topology.compatibility_error() {
        return Err(RutaError::Incompatible {
            message: error.to_string(),
        });
    }
    if let SelectionCriteria::ReadPreference(pref) = criteria {
        pref.validate(topology.heartbeat_frequency())?;
    }

    let candidates = match topology.topology_type() {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single => topology.servers().filter(|s| s.is_available()).collect(),
        TopologyType::Sharded => topology
            .servers()
            .filter(|s| s.role == NodeRole::Router)
            .collect(),
        TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => match criteria {
            SelectionCriteria::Write => topology.nodes_with_role(NodeRole::RsPrimary).collect(),
            SelectionCriteria::ReadPreference(pref) => replica_set_candidates(topology, pref),
        },
    };

    Ok(latency_window(candidates, topology.local_threshold()))
}

fn replica_set_candidates<'a>(
    topology: &'a TopologyDescription,
    pref: &ReadPreference,
) -> Vec<&'a NodeDescription> {
    let primary: Vec<&NodeDescription> = topology.nodes_with_role(NodeRole::RsPrimary).collect();
    let secondaries = || {
        let secondaries = topology.nodes_with_role(NodeRole::RsSecondary).collect();
        filter_by_tags(filter_by_staleness(topology, secondaries, pref), pref.tag_sets())
    };

    match pref.mode() {
        ReadPreferenceMode::Primary => primary,
        ReadPreferenceMode::PrimaryPreferred => {
            if primary.is_empty() {
                secondaries()
            } else {
                primary
            }
        }
        ReadPreferenceMode::Secondary => secondaries(),
        ReadPreferenceMode::SecondaryPreferred => {
            let matching = secondaries();
            if matching.is_empty() {
                primary
            } else {
                matching
            }
        }
        ReadPreferenceMode::Nearest => {
            let members = topology
                .servers()
                .filter(|s| matches!(s.role, NodeRole::RsPrimary | NodeRole::RsSecondary))
                .collect();
            filter_by_tags(filter_by_staleness(topology, members, pref), pref.tag_sets())
        }
    }
}

/// Drop secondaries whose estimated lag exceeds the bound. Primaries always pass.
fn filter_by_staleness<'a>(
    topology: &TopologyDescription,
    candidates: Vec<&'a NodeDescription>,
    pref: &ReadPreference,
) -> Vec<&'a NodeDescription> {
    let Some(max_staleness) = pref.max_staleness() else {
        return candidates;
    };
    let max_staleness_ms = max_staleness.as_millis() as i64;

    candidates
        .into_iter()
        .filter(|s| {
            s.role != NodeRole::RsSecondary
                || estimated_staleness_ms(topology, s).map_or(true, |lag| lag <= max_staleness_ms)
        })
        .collect()
}

/// Replication lag estimate for a secondary, in milliseconds
pub fn estimated_staleness_ms(topology: &TopologyDescription, secondary: &NodeDescription) -> Option<i64> {
    let heartbeat_ms = topology.heartbeat_frequency().as_millis() as i64;
    let last_write = secondary.last_write_date?;

    match topology.primary() {
        Some(primary) => {
            let primary_write = primary.last_write_date?;
            let update_gap = signed_millis_between(primary.last_update_time, secondary.last_update_time);
            Some(update_gap - (last_write - primary_write) + heartbeat_ms)
        }
        None => {
            let freshest = topology
                .nodes_with_role(NodeRole::RsSecondary)
                .filter_map(|s| s.last_write_date)
                .max()?;
            Some(freshest - last_write + heartbeat_ms)
        }
    }
}

/// `later - earlier` in milliseconds, negative when `later` is the earlier instant
fn signed_millis_between(earlier: Instant, later: Instant) -> i64 {
    if later >= earlier {
        later.duration_since(earlier).as_millis() as i64
    } else {
        -(earlier.duration_since(later).as_millis() as i64)
    }
}

/// First tag set with any match wins
fn filter_by_tags<'a>(candidates: Vec<&'a NodeDescription>, tag_sets: &[TagSet]) -> Vec<&'a NodeDescription> {
    if tag_sets.is_empty() {
        return candidates;
    }
    for tag_set in tag_sets {
        let matching: Vec<&NodeDescription> = candidates
            .iter()
            .copied()
            .filter(|s| s.matches_tag_set(tag_set))
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    Vec::new()
}

fn latency_window(candidates: Vec<&NodeDescription>, local_threshold: Duration) -> Vec<&NodeDescription> {
    let rtt = |s: &NodeDescription| s.round_trip_time.unwrap_or(Duration::ZERO);
    let Some(fastest) = candidates.iter().map(|s| rtt(s)).min() else {
        return candidates;
    };
    let limit = fastest + local_threshold;
    candidates.into_iter().filter(|s| rtt(s) <= limit).collect()
}
