/// Live topology
///
/// [`Topology`] owns the authoritative [`TopologyDescription`], one monitor
/// per known node and the lazily created connection pools. Updates from
/// monitors and from failed operations go through a single mutex; every
/// accepted change is published as an immutable snapshot on a watch
/// channel, so readers always see a complete pre- or post-update view.
pub mod description;
pub mod events;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::core::handshake::Handshaker;
use crate::core::{Connector, NodeDescription, ServerAddress};
use crate::error::{RutaError, RutaResult};
use crate::monitor::{self, MonitorHandle, MonitorListener, MonitorOptions};
use crate::pool::{ConnectionPool, PoolEvent, PoolOptions, PoolPublisher};
use crate::selection::{self, SelectionCriteria};
use crate::ClientOptions;

pub use description::{
    TopologyDescription, TopologyType, MAX_SUPPORTED_WIRE_VERSION, MIN_SUPPORTED_WIRE_VERSION,
};
pub use events::SdamEvent;
use events::SdamPublisher;

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 1024;

struct Server {
    monitor: MonitorHandle,
    pool: Option<ConnectionPool>,
}

struct TopologyState {
    description: TopologyDescription,
    servers: HashMap<ServerAddress, Server>,
    closed: bool,
}

struct TopologyInner {
    state: Mutex<TopologyState>,
    publisher: watch::Sender<Arc<TopologyDescription>>,
    sdam_events: SdamPublisher,
    pool_events: PoolPublisher,
    connector: Arc<dyn Connector>,
    handshaker: Arc<Handshaker>,
    pool_options: PoolOptions,
    monitor_options: MonitorOptions,
    server_selection_timeout: Duration,
    this: Weak<TopologyInner>,
}

/// Shared handle to the live topology
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

impl Topology {
    /// Start monitoring every seed. Must be called inside a tokio runtime.
    pub fn new(options: &ClientOptions, connector: Arc<dyn Connector>) -> Self {
        let description = TopologyDescription::new(
            options.seeds.clone(),
            options.replica_set.clone(),
            options.direct_connection,
            options.monitor.heartbeat_frequency,
            options.local_threshold,
        );
        let (publisher, _) = watch::channel(Arc::new(description.clone()));
        let handshaker = Arc::new(Handshaker::new(
            options.app_name.as_deref(),
            options.credential.as_ref(),
        ));

        let inner = Arc::new_cyclic(|this| TopologyInner {
            state: Mutex::new(TopologyState {
                description,
                servers: HashMap::new(),
                closed: false,
            }),
            publisher,
            sdam_events: SdamPublisher::new(EVENT_CAPACITY),
            pool_events: PoolPublisher::new(EVENT_CAPACITY),
            connector,
            handshaker,
            pool_options: options.pool.clone(),
            monitor_options: options.monitor.clone(),
            server_selection_timeout: options.server_selection_timeout,
            this: this.clone(),
        });

        {
            let mut state = inner.lock();
            inner.reconcile(&mut state);
        }
        info!("Topology started with seeds {:?}", options.seeds);
        Self { inner }
    }

    /// Current snapshot
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.inner.publisher.borrow().clone()
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<TopologyDescription>> {
        self.inner.publisher.subscribe()
    }

    /// Heartbeat, node and topology change events from now on
    pub fn subscribe_sdam_events(&self) -> broadcast::Receiver<SdamEvent> {
        self.inner.sdam_events.subscribe()
    }

    /// Events from every connection pool of this topology from now on
    pub fn subscribe_pool_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.pool_events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn server_selection_timeout(&self) -> Duration {
        self.inner.server_selection_timeout
    }

    /// Wake every monitor for an early heartbeat
    pub fn request_immediate_check(&self) {
        let state = self.inner.lock();
        for server in state.servers.values() {
            server.monitor.request_check();
        }
    }

    /// Fold a node description into the topology. Returns whether it changed.
    pub fn update(&self, description: NodeDescription) -> bool {
        self.inner.update(description)
    }

    /// Wait until `predicate` holds for a published snapshot
    pub async fn wait_for<F>(&self, limit: Duration, predicate: F) -> Option<Arc<TopologyDescription>>
    where
        F: Fn(&TopologyDescription) -> bool,
    {
        let mut receiver = self.subscribe();
        let waiting = async {
            loop {
                let snapshot = receiver.borrow_and_update().clone();
                if predicate(&snapshot) {
                    return Some(snapshot);
                }
                if receiver.changed().await.is_err() {
                    return None;
                }
            }
        };
        timeout(limit, waiting).await.ok().flatten()
    }

    /// Select a node within the configured selection timeout
    pub async fn select_server(&self, criteria: &SelectionCriteria) -> RutaResult<ServerAddress> {
        let deadline = Instant::now() + self.inner.server_selection_timeout;
        self.select_server_until(criteria, deadline, &[]).await
    }

    /// Select a node, re-reading the live snapshot on every change until
    /// `deadline`
    pub async fn select_server_until(
        &self,
        criteria: &SelectionCriteria,
        deadline: Instant,
        deprioritized: &[ServerAddress],
    ) -> RutaResult<ServerAddress> {
        let started = Instant::now();
        let mut receiver = self.subscribe();

        loop {
            if self.is_closed() {
                return Err(RutaError::Shutdown);
            }
            let snapshot = receiver.borrow_and_update().clone();
            if let Some(address) = selection::select_server(&snapshot, criteria, deprioritized)? {
                debug!("Selected {} for {}", address, criteria);
                return Ok(address);
            }

            self.request_immediate_check();
            match timeout_at(deadline, receiver.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(RutaError::Shutdown),
                Err(_) => {
                    let topology = self.description();
                    return Err(RutaError::ServerSelectionTimeout {
                        message: format!(
                            "no server matching {} after {:?}, topology {}",
                            criteria,
                            started.elapsed(),
                            topology
                        ),
                        topology,
                    });
                }
            }
        }
    }

    /// Pool for a node, created on first use
    pub fn pool(&self, address: &ServerAddress) -> RutaResult<ConnectionPool> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(RutaError::Shutdown);
        }
        let Some(server) = state.servers.get_mut(address) else {
            return Err(RutaError::network(
                io::ErrorKind::NotConnected,
                format!("{} is no longer part of the topology", address),
            ));
        };

        if let Some(pool) = &server.pool {
            return Ok(pool.clone());
        }

        let pool = ConnectionPool::new(
            address.clone(),
            self.inner.pool_options.clone(),
            Arc::clone(&self.inner.connector),
            Arc::clone(&self.inner.handshaker),
            self.inner.pool_events.clone(),
        );
        server.pool = Some(pool.clone());
        drop(state);

        debug!("Created connection pool for {}", address);
        if self.inner.pool_options.min_size > 0 {
            let background = pool.clone();
            tokio::spawn(async move {
                if let Err(e) = background.populate().await {
                    warn!("Failed to populate pool for {}: {}", background.address(), e);
                }
            });
        }
        Ok(pool)
    }

    /// React to an operation failure on `address`. Errors on connections
    /// older than the pool's current generation are ignored.
    pub fn handle_application_error(&self, address: &ServerAddress, generation: u64, error: &RutaError) {
        if !error.invalidates_node() {
            return;
        }

        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        let Some(server) = state.servers.get(address) else {
            return;
        };

        if let Some(pool) = &server.pool {
            if pool.generation() > generation {
                debug!(
                    "Ignoring error from stale connection to {} (generation {}): {}",
                    address, generation, error
                );
                return;
            }
            if error.is_network() || error.is_shutting_down() {
                pool.clear();
            }
        }
        server.monitor.request_check();

        warn!("Marking {} unknown after operation error: {}", address, error);
        let description = NodeDescription::unknown_with_error(address.clone(), error.to_string());
        self.inner.apply(&mut state, description);
    }

    /// Stop monitors, then close every pool
    pub async fn close(&self) {
        let (monitors, pools) = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let mut monitors = Vec::new();
            let mut pools = Vec::new();
            for (_, server) in state.servers.drain() {
                monitors.push(server.monitor);
                pools.extend(server.pool);
            }
            (monitors, pools)
        };
        // wake selectors so they observe the shutdown
        self.inner.publisher.send_modify(|_| {});

        let addresses: Vec<ServerAddress> = monitors.iter().map(|m| m.address().clone()).collect();
        join_all(monitors.into_iter().map(MonitorHandle::shutdown)).await;
        for pool in &pools {
            pool.close();
        }
        for address in addresses {
            self.inner.sdam_events.publish(SdamEvent::ServerClosed { address });
        }
        self.inner.sdam_events.publish(SdamEvent::TopologyClosed);
        info!("Topology closed");
    }
}

impl TopologyInner {
    fn lock(&self) -> MutexGuard<'_, TopologyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn update(&self, description: NodeDescription) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        self.apply(&mut state, description)
    }

    fn apply(&self, state: &mut TopologyState, description: NodeDescription) -> bool {
        let address = description.address.clone();
        let previous_node = state.description.server(&address).cloned();
        if !state.description.update(description) {
            return false;
        }
        self.reconcile(state);
        let new = Arc::new(state.description.clone());
        let previous = self.publisher.send_replace(Arc::clone(&new));

        if self.sdam_events.is_active() {
            let changed_node = new.server(&address).filter(|node| Some(*node) != previous_node.as_ref());
            if let (Some(previous_node), Some(node)) = (previous_node, changed_node) {
                self.sdam_events.publish(SdamEvent::ServerDescriptionChanged {
                    address,
                    previous: Box::new(previous_node),
                    new: Box::new(node.clone()),
                });
            }
            self.sdam_events
                .publish(SdamEvent::TopologyDescriptionChanged { previous, new });
        }
        true
    }

    /// Start monitors for new members and tear down removed ones
    fn reconcile(&self, state: &mut TopologyState) {
        let removed: Vec<ServerAddress> = state
            .servers
            .keys()
            .filter(|address| !state.description.contains(address))
            .cloned()
            .collect();
        for address in removed {
            if let Some(server) = state.servers.remove(&address) {
                info!("{} left the topology", address);
                if let Some(pool) = server.pool {
                    pool.close();
                }
                self.sdam_events.publish(SdamEvent::ServerClosed { address });
            }
        }

        let added: Vec<ServerAddress> = state
            .description
            .addresses()
            .filter(|address| !state.servers.contains_key(*address))
            .cloned()
            .collect();
        for address in added {
            debug!("Starting monitor for {}", address);
            let listener: Weak<dyn MonitorListener> = self.this.clone();
            let monitor = monitor::spawn(
                address.clone(),
                self.monitor_options.clone(),
                Arc::clone(&self.connector),
                Arc::clone(&self.handshaker),
                listener,
                self.sdam_events.clone(),
            );
            self.sdam_events.publish(SdamEvent::ServerOpening {
                address: address.clone(),
            });
            state.servers.insert(address, Server { monitor, pool: None });
        }
    }
}

impl MonitorListener for TopologyInner {
    fn on_heartbeat_success(&self, description: NodeDescription) {
        self.update(description);
    }

    fn on_heartbeat_failure(&self, address: &ServerAddress, error: &RutaError) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if let Some(pool) = state.servers.get(address).and_then(|s| s.pool.as_ref()) {
            pool.clear();
        }
        let description = NodeDescription::unknown_with_error(address.clone(), error.to_string());
        self.apply(&mut state, description);
    }
}
