/// Process-wide accounting of live connections and monitored nodes
///
/// Disabled by default. When enabled, every connection and every node
/// monitor registers itself for its lifetime so tests can assert that
/// nothing leaks after a topology change or shutdown.
use fnv::FnvHashMap;
use lazy_static::lazy_static;
use std::sync::Mutex;

use crate::core::ServerAddress;

#[derive(Default)]
struct Registry {
    enabled: bool,
    connections: FnvHashMap<ServerAddress, usize>,
    nodes: FnvHashMap<ServerAddress, usize>,
}

#[derive(Clone, Copy)]
enum Kind {
    Connection,
    Node,
}

impl Registry {
    fn counts(&mut self, kind: Kind) -> &mut FnvHashMap<ServerAddress, usize> {
        match kind {
            Kind::Connection => &mut self.connections,
            Kind::Node => &mut self.nodes,
        }
    }

    /// Count one more object. False while disabled.
    fn register(&mut self, kind: Kind, address: &ServerAddress) -> bool {
        if !self.enabled {
            return false;
        }
        *self.counts(kind).entry(address.clone()).or_insert(0) += 1;
        true
    }

    fn release(&mut self, kind: Kind, address: &ServerAddress) {
        let map = self.counts(kind);
        if let Some(count) = map.get_mut(address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(address);
            }
        }
    }

    fn disable(&mut self) {
        self.enabled = false;
        self.connections.clear();
        self.nodes.clear();
    }

    fn total(&self, kind: Kind) -> usize {
        match kind {
            Kind::Connection => self.connections.values().sum(),
            Kind::Node => self.nodes.values().sum(),
        }
    }

    fn count(&self, kind: Kind, address: &ServerAddress) -> usize {
        let map = match kind {
            Kind::Connection => &self.connections,
            Kind::Node => &self.nodes,
        };
        map.get(address).copied().unwrap_or(0)
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

fn with_registry<T>(f: impl FnOnce(&mut Registry) -> T) -> T {
    let mut registry = match REGISTRY.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut registry)
}

/// Start counting. Objects created before this call are not counted.
pub fn enable() {
    with_registry(|r| r.enabled = true);
}

/// Stop counting and forget all counts
pub fn disable() {
    with_registry(Registry::disable);
}

pub fn is_enabled() -> bool {
    with_registry(|r| r.enabled)
}

pub fn open_connections() -> usize {
    with_registry(|r| r.total(Kind::Connection))
}

pub fn open_connections_to(address: &ServerAddress) -> usize {
    with_registry(|r| r.count(Kind::Connection, address))
}

pub fn open_nodes() -> usize {
    with_registry(|r| r.total(Kind::Node))
}

pub fn is_node_open(address: &ServerAddress) -> bool {
    with_registry(|r| r.count(Kind::Node, address) > 0)
}

/// Registered for as long as it lives
struct Tracker {
    kind: Kind,
    address: Option<ServerAddress>,
}

impl Tracker {
    fn new(kind: Kind, address: &ServerAddress) -> Self {
        let registered = with_registry(|r| r.register(kind, address));
        Self {
            kind,
            address: registered.then(|| address.clone()),
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Some(address) = self.address.take() {
            with_registry(|r| r.release(self.kind, &address));
        }
    }
}

/// Held by every [`Connection`](crate::core::Connection)
pub(crate) struct ConnectionTracker {
    _inner: Tracker,
}

impl ConnectionTracker {
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            _inner: Tracker::new(Kind::Connection, address),
        }
    }
}

/// Held by every running node monitor
pub(crate) struct NodeTracker {
    _inner: Tracker,
}

impl NodeTracker {
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            _inner: Tracker::new(Kind::Node, address),
        }
    }
}
