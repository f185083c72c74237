/// Ruta - topology-aware client core for MongoDB replica sets and sharded clusters
///
/// Ruta discovers and monitors a cluster, keeps a bounded connection pool per
/// node and routes every operation to a node that satisfies its read or write
/// requirements, retrying once across failovers.
///
/// The moving parts, leaves first:
/// 1. [`core`]: connections, the OP_MSG codec, handshakes and node descriptions
/// 2. [`pool`]: per-node connection pools
/// 3. [`monitor`]: one background heartbeat loop per node
/// 4. [`topology`]: the discovery state machine and its live owner
/// 5. [`selection`]: read preferences and server selection
/// 6. [`executor`]: command execution, retries, command events and cursors
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod pool;
pub mod selection;
pub mod topology;
pub mod utils;

#[cfg(test)]
mod mock;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::{Config, CredentialConfig, TlsConfig};
use crate::core::{Connector, TcpConnector};
use crate::executor::events::CommandEvent;
use crate::monitor::MonitorOptions;
use crate::pool::{PoolEvent, PoolOptions};

pub use crate::core::{NodeDescription, NodeRole, ServerAddress};
pub use crate::error::{RutaError, RutaResult};
pub use crate::executor::cursor::{Cursor, CursorBatch, Namespace};
pub use crate::selection::{ReadPreference, ReadPreferenceMode, SelectionCriteria};
pub use crate::topology::{SdamEvent, Topology, TopologyDescription, TopologyType};

/// Buffered command events per subscriber before the slowest one lags
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Flat client configuration, composed from the per-component options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub seeds: Vec<ServerAddress>,
    pub replica_set: Option<String>,
    pub direct_connection: bool,
    pub app_name: Option<String>,
    pub credential: Option<CredentialConfig>,
    pub tls: TlsConfig,
    pub retry_reads: bool,
    pub retry_writes: bool,
    pub pool: PoolOptions,
    pub monitor: MonitorOptions,
    pub server_selection_timeout: Duration,
    pub local_threshold: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let config = Config::default();
        Self {
            seeds: vec![ServerAddress::new("localhost", utils::DEFAULT_PORT)],
            replica_set: None,
            direct_connection: false,
            app_name: None,
            credential: None,
            tls: TlsConfig::default(),
            retry_reads: true,
            retry_writes: true,
            pool: PoolOptions::from_config(&config.pool),
            monitor: MonitorOptions::from_config(&config.monitor),
            server_selection_timeout: config.selection.server_selection_timeout(),
            local_threshold: config.selection.local_threshold(),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> RutaResult<Self> {
        config.validate()?;
        Ok(Self {
            seeds: config.seed_addresses()?,
            replica_set: config.cluster.replica_set.clone(),
            direct_connection: config.cluster.direct_connection,
            app_name: config.cluster.app_name.clone(),
            credential: config.cluster.credential.clone(),
            tls: config.cluster.tls.clone(),
            retry_reads: config.cluster.retry_reads,
            retry_writes: config.cluster.retry_writes,
            pool: PoolOptions::from_config(&config.pool),
            monitor: MonitorOptions::from_config(&config.monitor),
            server_selection_timeout: config.selection.server_selection_timeout(),
            local_threshold: config.selection.local_threshold(),
        })
    }

    /// Parse a `mongodb://` connection string
    pub fn parse(uri: &str) -> RutaResult<Self> {
        Self::from_config(&Config::from_uri(uri)?)
    }

    pub fn validate(&self) -> RutaResult<()> {
        if self.seeds.is_empty() {
            return Err(RutaError::invalid_argument("at least one seed is required"));
        }
        if self.direct_connection && self.seeds.len() != 1 {
            return Err(RutaError::invalid_argument(
                "a direct connection requires exactly one seed",
            ));
        }
        if self.pool.max_size == 0 || self.pool.min_size > self.pool.max_size {
            return Err(RutaError::invalid_argument(format!(
                "invalid pool bounds: min {} max {}",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.monitor.min_heartbeat_frequency > self.monitor.heartbeat_frequency {
            return Err(RutaError::invalid_argument(
                "minimum heartbeat frequency cannot exceed the heartbeat frequency",
            ));
        }
        Ok(())
    }
}

pub(crate) struct ClientInner {
    pub(crate) topology: Topology,
    pub(crate) options: ClientOptions,
    pub(crate) events: broadcast::Sender<CommandEvent>,
}

/// Entry point: owns the topology and executes commands against it.
/// Cheap to clone.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Connect over TCP (and TLS when configured). Must be called inside a
    /// tokio runtime.
    pub fn with_options(options: ClientOptions) -> RutaResult<Self> {
        let connector = TcpConnector::from_config(&options.tls)?;
        Self::with_connector(options, Arc::new(connector))
    }

    /// Use a custom transport
    pub fn with_connector(options: ClientOptions, connector: Arc<dyn Connector>) -> RutaResult<Self> {
        options.validate()?;
        let topology = Topology::new(&options, connector);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        info!(
            "Client created for {} seed(s), replica set {:?}",
            options.seeds.len(),
            options.replica_set
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                topology,
                options,
                events,
            }),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Current topology snapshot
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.inner.topology.description()
    }

    /// Subscribe to started/succeeded/failed command events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CommandEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe to heartbeat and topology change events
    pub fn subscribe_sdam_events(&self) -> broadcast::Receiver<SdamEvent> {
        self.inner.topology.subscribe_sdam_events()
    }

    /// Subscribe to connection pool events
    pub fn subscribe_pool_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.topology.subscribe_pool_events()
    }

    pub async fn select_server(&self, criteria: &SelectionCriteria) -> RutaResult<ServerAddress> {
        self.inner.topology.select_server(criteria).await
    }

    /// Stop monitoring and close every pool
    pub async fn shutdown(&self) {
        self.inner.topology.close().await;
    }
}
