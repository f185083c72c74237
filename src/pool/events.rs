/// Connection pool events
use std::fmt;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::core::ServerAddress;

/// Why a pooled connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClosedReason {
    /// Created before the last clear
    Stale,
    /// Idle for longer than the max idle time
    Idle,
    /// Failed or interrupted mid-request
    Error,
    PoolClosed,
}

impl ConnectionClosedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionClosedReason::Stale => "stale",
            ConnectionClosedReason::Idle => "idle",
            ConnectionClosedReason::Error => "error",
            ConnectionClosedReason::PoolClosed => "poolClosed",
        }
    }
}

/// Why a check-out failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutFailedReason {
    Timeout,
    ConnectionError,
    PoolClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    ConnectionCreated {
        address: ServerAddress,
        connection_id: u64,
    },
    /// Handshake finished, the connection can carry operations
    ConnectionReady {
        address: ServerAddress,
        connection_id: u64,
        duration: Duration,
    },
    ConnectionCheckedOut {
        address: ServerAddress,
        connection_id: u64,
    },
    ConnectionCheckOutFailed {
        address: ServerAddress,
        reason: CheckOutFailedReason,
    },
    ConnectionCheckedIn {
        address: ServerAddress,
        connection_id: u64,
    },
    ConnectionClosed {
        address: ServerAddress,
        connection_id: u64,
        reason: ConnectionClosedReason,
    },
    PoolCleared {
        address: ServerAddress,
        generation: u64,
    },
    PoolClosed {
        address: ServerAddress,
    },
}

impl PoolEvent {
    pub fn address(&self) -> &ServerAddress {
        match self {
            PoolEvent::ConnectionCreated { address, .. }
            | PoolEvent::ConnectionReady { address, .. }
            | PoolEvent::ConnectionCheckedOut { address, .. }
            | PoolEvent::ConnectionCheckOutFailed { address, .. }
            | PoolEvent::ConnectionCheckedIn { address, .. }
            | PoolEvent::ConnectionClosed { address, .. }
            | PoolEvent::PoolCleared { address, .. }
            | PoolEvent::PoolClosed { address } => address,
        }
    }
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEvent::ConnectionCreated { address, connection_id } => {
                write!(f, "connection {} to {} created", connection_id, address)
            }
            PoolEvent::ConnectionReady {
                address,
                connection_id,
                duration,
            } => write!(f, "connection {} to {} ready in {:?}", connection_id, address, duration),
            PoolEvent::ConnectionCheckedOut { address, connection_id } => {
                write!(f, "connection {} to {} checked out", connection_id, address)
            }
            PoolEvent::ConnectionCheckOutFailed { address, reason } => {
                write!(f, "check out from {} failed: {:?}", address, reason)
            }
            PoolEvent::ConnectionCheckedIn { address, connection_id } => {
                write!(f, "connection {} to {} checked in", connection_id, address)
            }
            PoolEvent::ConnectionClosed {
                address,
                connection_id,
                reason,
            } => write!(
                f,
                "connection {} to {} closed ({})",
                connection_id,
                address,
                reason.as_str()
            ),
            PoolEvent::PoolCleared { address, generation } => {
                write!(f, "pool for {} cleared (generation {})", address, generation)
            }
            PoolEvent::PoolClosed { address } => write!(f, "pool for {} closed", address),
        }
    }
}

/// Sending half shared by every pool of a topology
#[derive(Debug, Clone)]
pub(crate) struct PoolPublisher {
    sender: broadcast::Sender<PoolEvent>,
}

impl PoolPublisher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, event: PoolEvent) {
        if self.sender.receiver_count() > 0 {
            let _ = self.sender.send(event);
        }
    }
}
