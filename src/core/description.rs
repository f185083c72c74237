/// Node roles and the immutable per-node description produced by each heartbeat
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use bson::oid::ObjectId;
use bson::{Bson, Document};

use super::ServerAddress;
use crate::error::{bson_as_i32, bson_as_i64, RutaError, RutaResult};

/// Role a node reported in its last heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Not yet checked, or the last heartbeat failed
    Unknown,
    Standalone,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    /// Hidden, starting up, recovering or otherwise not electable
    RsOther,
    /// Replica set member that has not been initiated yet
    RsGhost,
    /// Query router of a sharded cluster
    Router,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Unknown => "Unknown",
            NodeRole::Standalone => "Standalone",
            NodeRole::RsPrimary => "RSPrimary",
            NodeRole::RsSecondary => "RSSecondary",
            NodeRole::RsArbiter => "RSArbiter",
            NodeRole::RsOther => "RSOther",
            NodeRole::RsGhost => "RSGhost",
            NodeRole::Router => "Router",
        }
    }

    /// Roles that serve reads or writes
    pub fn is_data_bearing(&self) -> bool {
        match self {
            NodeRole::Standalone | NodeRole::RsPrimary | NodeRole::RsSecondary | NodeRole::Router => {
                true
            }
            NodeRole::Unknown | NodeRole::RsArbiter | NodeRole::RsOther | NodeRole::RsGhost => {
                false
            }
        }
    }

    /// Roles that carry replica set metadata
    pub fn is_replica_set_member(&self) -> bool {
        matches!(
            self,
            NodeRole::RsPrimary
                | NodeRole::RsSecondary
                | NodeRole::RsArbiter
                | NodeRole::RsOther
                | NodeRole::RsGhost
        )
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one node. Replaced wholesale on every heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescription {
    pub address: ServerAddress,
    pub role: NodeRole,
    pub set_name: Option<String>,
    pub set_version: Option<i64>,
    pub election_id: Option<ObjectId>,
    pub tags: BTreeMap<String, String>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    /// Reported members: hosts, passives and arbiters
    pub hosts: Vec<ServerAddress>,
    /// Primary as seen by the reporting member
    pub primary: Option<ServerAddress>,
    /// Address the member knows itself by
    pub me: Option<ServerAddress>,
    /// Smoothed round-trip time of the monitoring heartbeat
    pub round_trip_time: Option<Duration>,
    pub last_update_time: Instant,
    /// Last write applied by the member, milliseconds since the epoch
    pub last_write_date: Option<i64>,
    /// Error from the most recent failed heartbeat
    pub error: Option<String>,
}

impl NodeDescription {
    /// A node that has not answered a heartbeat yet
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            role: NodeRole::Unknown,
            set_name: None,
            set_version: None,
            election_id: None,
            tags: BTreeMap::new(),
            min_wire_version: 0,
            max_wire_version: 0,
            hosts: Vec::new(),
            primary: None,
            me: None,
            round_trip_time: None,
            last_update_time: Instant::now(),
            last_write_date: None,
            error: None,
        }
    }

    /// A node whose last heartbeat or operation failed
    pub fn unknown_with_error<S: Into<String>>(address: ServerAddress, error: S) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::unknown(address)
        }
    }

    /// Build a description from a successful hello/isMaster reply
    pub fn from_hello(
        address: ServerAddress,
        reply: &Document,
        round_trip_time: Option<Duration>,
    ) -> RutaResult<Self> {
        if let Some(error) = RutaError::from_reply(reply) {
            return Err(error);
        }

        let set_name = reply.get_str("setName").ok().map(str::to_string);
        let writable = get_bool(reply, "isWritablePrimary") || get_bool(reply, "ismaster");

        let role = if reply.get_str("msg").ok() == Some("isdbgrid") {
            NodeRole::Router
        } else if set_name.is_some() {
            if get_bool(reply, "hidden") {
                NodeRole::RsOther
            } else if writable {
                NodeRole::RsPrimary
            } else if get_bool(reply, "secondary") {
                NodeRole::RsSecondary
            } else if get_bool(reply, "arbiterOnly") {
                NodeRole::RsArbiter
            } else {
                NodeRole::RsOther
            }
        } else if get_bool(reply, "isreplicaset") {
            NodeRole::RsGhost
        } else {
            NodeRole::Standalone
        };

        let mut hosts = Vec::new();
        for key in ["hosts", "passives", "arbiters"] {
            if let Ok(list) = reply.get_array(key) {
                for host in list.iter().filter_map(Bson::as_str) {
                    match ServerAddress::parse(host) {
                        Ok(parsed) if !hosts.contains(&parsed) => hosts.push(parsed),
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Node {} reported invalid member {}: {}", address, host, e),
                    }
                }
            }
        }

        let tags = reply
            .get_document("tags")
            .map(|tags| {
                tags.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let last_write_date = reply
            .get_document("lastWrite")
            .ok()
            .and_then(|lw| lw.get("lastWriteDate"))
            .and_then(|date| match date {
                Bson::DateTime(dt) => Some(dt.timestamp_millis()),
                other => bson_as_i64(other),
            });

        Ok(Self {
            role,
            set_name,
            set_version: reply.get("setVersion").and_then(bson_as_i64),
            election_id: reply.get_object_id("electionId").ok(),
            tags,
            min_wire_version: reply.get("minWireVersion").and_then(bson_as_i32).unwrap_or(0),
            max_wire_version: reply.get("maxWireVersion").and_then(bson_as_i32).unwrap_or(0),
            hosts,
            primary: reply
                .get_str("primary")
                .ok()
                .and_then(|p| ServerAddress::parse(p).ok()),
            me: reply.get_str("me").ok().and_then(|m| ServerAddress::parse(m).ok()),
            round_trip_time,
            last_update_time: Instant::now(),
            last_write_date,
            error: None,
            address,
        })
    }

    pub fn is_available(&self) -> bool {
        self.role != NodeRole::Unknown
    }

    /// `(setVersion, electionId)` when both were reported
    pub fn election_epoch(&self) -> Option<(i64, ObjectId)> {
        match (self.set_version, self.election_id) {
            (Some(version), Some(id)) => Some((version, id)),
            _ => None,
        }
    }

    pub fn matches_tag_set(&self, tag_set: &BTreeMap<String, String>) -> bool {
        tag_set
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|tag| tag == v))
    }
}

fn get_bool(doc: &Document, key: &str) -> bool {
    match doc.get(key) {
        Some(Bson::Boolean(b)) => *b,
        Some(other) => bson_as_i32(other).is_some_and(|v| v != 0),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    #[test]
    fn test_primary_hello() {
        let election_id = ObjectId::new();
        let reply = doc! {
            "ok": 1.0,
            "isWritablePrimary": true,
            "setName": "rs",
            "setVersion": 3,
            "electionId": election_id,
            "hosts": ["a:27017", "b:27017"],
            "passives": ["c:27017"],
            "arbiters": ["d:27017"],
            "tags": { "dc": "east" },
            "minWireVersion": 0,
            "maxWireVersion": 21,
            "me": "a:27017",
            "lastWrite": { "lastWriteDate": bson::DateTime::from_millis(1_000) },
        };

        let desc = NodeDescription::from_hello(addr("a"), &reply, Some(Duration::from_millis(4)))
            .unwrap();
        assert_eq!(desc.role, NodeRole::RsPrimary);
        assert_eq!(desc.set_name.as_deref(), Some("rs"));
        assert_eq!(desc.election_epoch(), Some((3, election_id)));
        assert_eq!(desc.hosts.len(), 4);
        assert_eq!(desc.tags.get("dc").map(String::as_str), Some("east"));
        assert_eq!(desc.max_wire_version, 21);
        assert_eq!(desc.last_write_date, Some(1_000));
        assert_eq!(desc.me, Some(addr("a")));
    }

    #[test]
    fn test_role_detection() {
        let cases = [
            (doc! { "ok": 1, "ismaster": true, "msg": "isdbgrid" }, NodeRole::Router),
            (doc! { "ok": 1, "ismaster": true }, NodeRole::Standalone),
            (doc! { "ok": 1, "ismaster": false, "isreplicaset": true }, NodeRole::RsGhost),
            (doc! { "ok": 1, "setName": "rs", "secondary": true }, NodeRole::RsSecondary),
            (doc! { "ok": 1, "setName": "rs", "arbiterOnly": true }, NodeRole::RsArbiter),
            (
                doc! { "ok": 1, "setName": "rs", "secondary": true, "hidden": true },
                NodeRole::RsOther,
            ),
            (doc! { "ok": 1, "setName": "rs" }, NodeRole::RsOther),
        ];

        for (reply, expected) in cases {
            let desc = NodeDescription::from_hello(addr("a"), &reply, None).unwrap();
            assert_eq!(desc.role, expected, "reply {}", reply);
        }
    }

    #[test]
    fn test_failed_hello_is_an_error() {
        let reply = doc! { "ok": 0, "code": 13, "errmsg": "unauthorized" };
        assert!(NodeDescription::from_hello(addr("a"), &reply, None).is_err());
    }

    #[test]
    fn test_tag_matching() {
        let mut desc = NodeDescription::unknown(addr("a"));
        desc.tags.insert("dc".to_string(), "east".to_string());
        desc.tags.insert("rack".to_string(), "1".to_string());

        let mut east = BTreeMap::new();
        east.insert("dc".to_string(), "east".to_string());
        assert!(desc.matches_tag_set(&east));
        assert!(desc.matches_tag_set(&BTreeMap::new()));

        east.insert("rack".to_string(), "2".to_string());
        assert!(!desc.matches_tag_set(&east));
    }
}
