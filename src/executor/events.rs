/// Command monitoring events
///
/// Every command sent by the executor produces a `Started` event followed by
/// exactly one `Succeeded` or `Failed` event with the same request id.
/// Commands belonging to one logical operation (a find and its getMores, or
/// a write and its retry) share an operation id.
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bson::Document;

use crate::core::ServerAddress;
use crate::error::RutaError;

static OPERATION_ID: AtomicI64 = AtomicI64::new(1);

pub(crate) fn next_operation_id() -> i64 {
    OPERATION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone)]
pub struct CommandStartedEvent {
    pub command: Document,
    pub command_name: String,
    pub database: String,
    pub request_id: i32,
    pub operation_id: i64,
    pub address: ServerAddress,
    pub connection_id: u64,
}

#[derive(Debug, Clone)]
pub struct CommandSucceededEvent {
    pub reply: Document,
    pub command_name: String,
    pub request_id: i32,
    pub operation_id: i64,
    pub address: ServerAddress,
    pub connection_id: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct CommandFailedEvent {
    pub error: RutaError,
    pub command_name: String,
    pub request_id: i32,
    pub operation_id: i64,
    pub address: ServerAddress,
    pub connection_id: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub enum CommandEvent {
    Started(CommandStartedEvent),
    Succeeded(CommandSucceededEvent),
    Failed(CommandFailedEvent),
}

impl CommandEvent {
    pub fn request_id(&self) -> i32 {
        match self {
            CommandEvent::Started(e) => e.request_id,
            CommandEvent::Succeeded(e) => e.request_id,
            CommandEvent::Failed(e) => e.request_id,
        }
    }

    pub fn operation_id(&self) -> i64 {
        match self {
            CommandEvent::Started(e) => e.operation_id,
            CommandEvent::Succeeded(e) => e.operation_id,
            CommandEvent::Failed(e) => e.operation_id,
        }
    }

    pub fn command_name(&self) -> &str {
        match self {
            CommandEvent::Started(e) => &e.command_name,
            CommandEvent::Succeeded(e) => &e.command_name,
            CommandEvent::Failed(e) => &e.command_name,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        match self {
            CommandEvent::Started(e) => &e.address,
            CommandEvent::Succeeded(e) => &e.address,
            CommandEvent::Failed(e) => &e.address,
        }
    }
}

impl fmt::Display for CommandEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandEvent::Started(e) => write!(
                f,
                "started {} on {} (request {}, operation {})",
                e.command_name, e.address, e.request_id, e.operation_id
            ),
            CommandEvent::Succeeded(e) => write!(
                f,
                "succeeded {} on {} in {:?} (request {}, operation {})",
                e.command_name, e.address, e.duration, e.request_id, e.operation_id
            ),
            CommandEvent::Failed(e) => write!(
                f,
                "failed {} on {} in {:?} (request {}, operation {}): {}",
                e.command_name, e.address, e.duration, e.request_id, e.operation_id, e.error
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_operation_ids_increase() {
        let first = next_operation_id();
        let second = next_operation_id();
        assert!(second > first);
    }

    #[test]
    fn test_accessors_and_display() {
        let event = CommandEvent::Failed(CommandFailedEvent {
            error: RutaError::protocol("bad reply"),
            command_name: "find".to_string(),
            request_id: 7,
            operation_id: 3,
            address: ServerAddress::new("a", 27017),
            connection_id: 1,
            duration: Duration::from_millis(2),
        });
        assert_eq!(event.request_id(), 7);
        assert_eq!(event.operation_id(), 3);
        assert_eq!(event.command_name(), "find");
        assert!(event.to_string().contains("bad reply"));

        let started = CommandEvent::Started(CommandStartedEvent {
            command: doc! { "ping": 1 },
            command_name: "ping".to_string(),
            database: "admin".to_string(),
            request_id: 8,
            operation_id: 4,
            address: ServerAddress::new("a", 27017),
            connection_id: 1,
        });
        assert_eq!(started.address().port(), 27017);
    }
}
