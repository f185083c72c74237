/// Topology monitoring events
///
/// Monitors report every heartbeat they start and finish. The topology
/// reports nodes it starts or stops monitoring and every accepted change to
/// a node or to the topology as a whole.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use tokio::sync::broadcast;

use crate::core::{NodeDescription, ServerAddress};
use crate::error::RutaError;

use super::TopologyDescription;

#[derive(Debug, Clone)]
pub enum SdamEvent {
    ServerOpening {
        address: ServerAddress,
    },
    ServerClosed {
        address: ServerAddress,
    },
    ServerHeartbeatStarted {
        address: ServerAddress,
        awaited: bool,
    },
    ServerHeartbeatSucceeded {
        address: ServerAddress,
        duration: Duration,
        reply: Document,
    },
    ServerHeartbeatFailed {
        address: ServerAddress,
        duration: Duration,
        error: RutaError,
    },
    ServerDescriptionChanged {
        address: ServerAddress,
        previous: Box<NodeDescription>,
        new: Box<NodeDescription>,
    },
    TopologyDescriptionChanged {
        previous: Arc<TopologyDescription>,
        new: Arc<TopologyDescription>,
    },
    TopologyClosed,
}

impl SdamEvent {
    /// Node the event concerns, if any
    pub fn address(&self) -> Option<&ServerAddress> {
        match self {
            SdamEvent::ServerOpening { address }
            | SdamEvent::ServerClosed { address }
            | SdamEvent::ServerHeartbeatStarted { address, .. }
            | SdamEvent::ServerHeartbeatSucceeded { address, .. }
            | SdamEvent::ServerHeartbeatFailed { address, .. }
            | SdamEvent::ServerDescriptionChanged { address, .. } => Some(address),
            SdamEvent::TopologyDescriptionChanged { .. } | SdamEvent::TopologyClosed => None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(
            self,
            SdamEvent::ServerHeartbeatStarted { .. }
                | SdamEvent::ServerHeartbeatSucceeded { .. }
                | SdamEvent::ServerHeartbeatFailed { .. }
        )
    }
}

impl fmt::Display for SdamEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdamEvent::ServerOpening { address } => write!(f, "monitoring {}", address),
            SdamEvent::ServerClosed { address } => write!(f, "stopped monitoring {}", address),
            SdamEvent::ServerHeartbeatStarted { address, .. } => write!(f, "heartbeat to {}", address),
            SdamEvent::ServerHeartbeatSucceeded { address, duration, .. } => {
                write!(f, "heartbeat to {} succeeded in {:?}", address, duration)
            }
            SdamEvent::ServerHeartbeatFailed {
                address,
                duration,
                error,
            } => write!(f, "heartbeat to {} failed after {:?}: {}", address, duration, error),
            SdamEvent::ServerDescriptionChanged { address, previous, new } => {
                write!(f, "{} changed from {} to {}", address, previous.role, new.role)
            }
            SdamEvent::TopologyDescriptionChanged { previous, new } => write!(
                f,
                "topology changed from {} to {}",
                previous.topology_type(),
                new.topology_type()
            ),
            SdamEvent::TopologyClosed => write!(f, "topology closed"),
        }
    }
}

/// Sending half shared by the topology and its monitors. Events are
/// dropped when nobody subscribes.
#[derive(Debug, Clone)]
pub(crate) struct SdamPublisher {
    sender: broadcast::Sender<SdamEvent>,
}

impl SdamPublisher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SdamEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    pub(crate) fn publish(&self, event: SdamEvent) {
        if self.is_active() {
            let _ = self.sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let publisher = SdamPublisher::new(8);
        publisher.publish(SdamEvent::TopologyClosed);
        assert!(!publisher.is_active());

        let mut events = publisher.subscribe();
        let address = ServerAddress::new("sdam-a", 27017);
        publisher.publish(SdamEvent::ServerHeartbeatStarted {
            address: address.clone(),
            awaited: false,
        });

        let event = events.recv().await.unwrap();
        assert!(event.is_heartbeat());
        assert_eq!(event.address(), Some(&address));
        assert_eq!(event.to_string(), "heartbeat to sdam-a:27017");
    }
}
