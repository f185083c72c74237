/// Operation executor
///
/// Selects a node, checks out a pooled connection, sends the command and
/// classifies the outcome. Network and state-change errors are reported to
/// the topology; retryable operations get one more attempt against a freshly
/// selected node within the same selection deadline.
pub mod cursor;
pub mod events;

use std::time::Instant as StdInstant;

use bson::{doc, Document};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use self::events::{
    next_operation_id, CommandEvent, CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent,
};
use crate::core::wire::next_request_id;
use crate::core::{Connection, NodeRole, ServerAddress};
use crate::error::{RutaError, RutaResult};
use crate::selection::{ReadPreference, ReadPreferenceMode, SelectionCriteria};
use crate::topology::TopologyType;
use crate::Client;

/// Which retry rule applies to an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retry {
    Never,
    Read,
    Write,
}

impl Retry {
    fn allows(&self, error: &RutaError) -> bool {
        match self {
            Retry::Never => false,
            Retry::Read => error.is_retryable_read(),
            Retry::Write => error.is_retryable_write(),
        }
    }
}

pub(crate) struct Operation<'a> {
    pub db: &'a str,
    pub command: Document,
    pub criteria: SelectionCriteria,
    pub retry: Retry,
}

/// Reply together with where it came from
pub(crate) struct Executed {
    pub reply: Document,
    pub address: ServerAddress,
    pub operation_id: i64,
}

impl Client {
    /// Run a command once, without retry
    pub async fn run_command(
        &self,
        db: &str,
        command: Document,
        criteria: SelectionCriteria,
    ) -> RutaResult<Document> {
        let operation = Operation {
            db,
            command,
            criteria,
            retry: Retry::Never,
        };
        Ok(self.execute(operation).await?.reply)
    }

    /// Run a read, retried once when `retry_reads` is enabled
    pub async fn run_read_command(
        &self,
        db: &str,
        command: Document,
        read_preference: ReadPreference,
    ) -> RutaResult<Document> {
        let operation = Operation {
            db,
            command,
            criteria: SelectionCriteria::ReadPreference(read_preference),
            retry: if self.inner.options.retry_reads {
                Retry::Read
            } else {
                Retry::Never
            },
        };
        Ok(self.execute(operation).await?.reply)
    }

    /// Run a write on a writable node, retried once when `retry_writes` is
    /// enabled
    pub async fn run_write_command(&self, db: &str, command: Document) -> RutaResult<Document> {
        let operation = Operation {
            db,
            command,
            criteria: SelectionCriteria::Write,
            retry: if self.inner.options.retry_writes {
                Retry::Write
            } else {
                Retry::Never
            },
        };
        Ok(self.execute(operation).await?.reply)
    }

    pub(crate) async fn execute(&self, operation: Operation<'_>) -> RutaResult<Executed> {
        let topology = self.topology();
        let deadline = Instant::now() + topology.server_selection_timeout();
        let operation_id = next_operation_id();

        let address = topology
            .select_server_until(&operation.criteria, deadline, &[])
            .await?;
        let first = self
            .execute_on(
                &address,
                operation.db,
                operation.command.clone(),
                Some(&operation.criteria),
                operation_id,
            )
            .await;
        let error = match first {
            Ok(reply) => {
                return Ok(Executed {
                    reply,
                    address,
                    operation_id,
                })
            }
            Err(error) => error,
        };

        if !operation.retry.allows(&error) {
            return Err(error);
        }

        let deprioritized = if self.description().topology_type() == TopologyType::Sharded {
            vec![address.clone()]
        } else {
            Vec::new()
        };
        let retry_address = match topology
            .select_server_until(&operation.criteria, deadline, &deprioritized)
            .await
        {
            Ok(retry_address) => retry_address,
            Err(selection_error) => {
                debug!(
                    "No server available to retry after '{}': {}",
                    error, selection_error
                );
                return Err(error);
            }
        };

        info!("Retrying on {} after error on {}: {}", retry_address, address, error);
        let reply = self
            .execute_on(
                &retry_address,
                operation.db,
                operation.command,
                Some(&operation.criteria),
                operation_id,
            )
            .await?;
        Ok(Executed {
            reply,
            address: retry_address,
            operation_id,
        })
    }

    /// One attempt on a known node. Failures are reported to the topology.
    pub(crate) async fn execute_on(
        &self,
        address: &ServerAddress,
        db: &str,
        command: Document,
        criteria: Option<&SelectionCriteria>,
        operation_id: i64,
    ) -> RutaResult<Document> {
        let topology = self.topology();
        let pool = topology.pool(address)?;
        let mut conn = match pool.check_out().await {
            Ok(conn) => conn,
            Err(error) => {
                topology.handle_application_error(address, pool.generation(), &error);
                return Err(error);
            }
        };

        let generation = conn.generation();
        let command = self.prepare_command(command, db, address, criteria);
        let result = self.send_monitored(&mut conn, db, command, operation_id).await;
        if let Err(error) = &result {
            topology.handle_application_error(address, generation, error);
        }
        result
    }

    /// Add `$db` and, where the node needs it, `$readPreference`
    fn prepare_command(
        &self,
        mut command: Document,
        db: &str,
        address: &ServerAddress,
        criteria: Option<&SelectionCriteria>,
    ) -> Document {
        command.insert("$db", db);

        let Some(pref) = criteria.and_then(SelectionCriteria::read_preference) else {
            return command;
        };
        let topology = self.description();
        let is_router = topology
            .server(address)
            .is_some_and(|s| s.role == NodeRole::Router);

        match topology.topology_type() {
            TopologyType::Sharded if pref.mode() != ReadPreferenceMode::Primary => {
                command.insert("$readPreference", pref.to_document());
            }
            TopologyType::Single if is_router && pref.mode() != ReadPreferenceMode::Primary => {
                command.insert("$readPreference", pref.to_document());
            }
            // a direct connection must be able to read from a secondary
            TopologyType::Single if !is_router => {
                command.insert("$readPreference", doc! { "mode": "primaryPreferred" });
            }
            _ => {}
        }
        command
    }

    async fn send_monitored(
        &self,
        conn: &mut Connection,
        db: &str,
        command: Document,
        operation_id: i64,
    ) -> RutaResult<Document> {
        let request_id = next_request_id();
        let command_name = command.keys().next().cloned().unwrap_or_default();
        debug!(
            "Sending {} to {} on connection {}",
            command_name,
            conn.address(),
            conn.id()
        );

        let in_flight = (self.inner.events.receiver_count() > 0).then(|| {
            let _ = self.inner.events.send(CommandEvent::Started(CommandStartedEvent {
                command: command.clone(),
                command_name: command_name.clone(),
                database: db.to_string(),
                request_id,
                operation_id,
                address: conn.address().clone(),
                connection_id: conn.id(),
            }));
            InFlightCommand {
                events: &self.inner.events,
                command_name,
                request_id,
                operation_id,
                address: conn.address().clone(),
                connection_id: conn.id(),
                started: StdInstant::now(),
                finished: false,
            }
        });

        let result = conn
            .send_command(request_id, command)
            .await
            .and_then(|reply| match RutaError::from_reply(&reply) {
                Some(error) => Err(error),
                None => Ok(reply),
            });

        if let Some(in_flight) = in_flight {
            match &result {
                Ok(reply) => in_flight.succeeded(reply),
                Err(error) => in_flight.failed(error.clone()),
            }
        }
        result
    }
}

/// A started command awaiting its completion event. Dropped unfinished,
/// it reports the command as failed.
struct InFlightCommand<'a> {
    events: &'a broadcast::Sender<CommandEvent>,
    command_name: String,
    request_id: i32,
    operation_id: i64,
    address: ServerAddress,
    connection_id: u64,
    started: StdInstant,
    finished: bool,
}

impl InFlightCommand<'_> {
    fn succeeded(mut self, reply: &Document) {
        self.finished = true;
        let _ = self.events.send(CommandEvent::Succeeded(CommandSucceededEvent {
            reply: reply.clone(),
            command_name: std::mem::take(&mut self.command_name),
            request_id: self.request_id,
            operation_id: self.operation_id,
            address: self.address.clone(),
            connection_id: self.connection_id,
            duration: self.started.elapsed(),
        }));
    }

    fn failed(mut self, error: RutaError) {
        self.finished = true;
        self.send_failed(error);
    }

    fn send_failed(&mut self, error: RutaError) {
        let _ = self.events.send(CommandEvent::Failed(CommandFailedEvent {
            error,
            command_name: std::mem::take(&mut self.command_name),
            request_id: self.request_id,
            operation_id: self.operation_id,
            address: self.address.clone(),
            connection_id: self.connection_id,
            duration: self.started.elapsed(),
        }));
    }
}

impl Drop for InFlightCommand<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.send_failed(RutaError::internal("command cancelled before a reply arrived"));
        }
    }
}
