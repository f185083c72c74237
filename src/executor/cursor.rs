/// Cursor protocol: an initial batch from find/aggregate, getMore against the
/// node that opened the cursor, killCursors when abandoned early.
use std::collections::VecDeque;
use std::fmt;

use bson::{doc, Bson, Document};
use futures::stream::{self, Stream};
use tracing::debug;

use super::events::next_operation_id;
use super::{Operation, Retry};
use crate::core::ServerAddress;
use crate::error::{bson_as_i64, RutaError, RutaResult};
use crate::selection::{ReadPreference, SelectionCriteria};
use crate::Client;

/// A `db.collection` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new<D: Into<String>, C: Into<String>>(db: D, collection: C) -> Self {
        Self {
            db: db.into(),
            collection: collection.into(),
        }
    }

    /// Split at the first dot; collection names may contain more
    pub fn parse(ns: &str) -> RutaResult<Self> {
        match ns.split_once('.') {
            Some((db, collection)) if !db.is_empty() && !collection.is_empty() => {
                Ok(Self::new(db, collection))
            }
            _ => Err(RutaError::invalid_argument(format!("invalid namespace '{}'", ns))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

/// One batch of results plus the id to continue from (0 when exhausted)
#[derive(Debug, Clone)]
pub struct CursorBatch {
    pub id: i64,
    pub namespace: Namespace,
    pub documents: Vec<Document>,
}

impl CursorBatch {
    pub(crate) fn from_reply(reply: &Document, fallback: &Namespace) -> RutaResult<Self> {
        let cursor = reply
            .get_document("cursor")
            .map_err(|_| RutaError::protocol("reply has no cursor document"))?;
        let id = cursor
            .get("id")
            .and_then(bson_as_i64)
            .ok_or_else(|| RutaError::protocol("cursor reply has no id"))?;
        let namespace = match cursor.get_str("ns") {
            Ok(ns) => Namespace::parse(ns)?,
            Err(_) => fallback.clone(),
        };
        let batch = cursor
            .get_array("firstBatch")
            .or_else(|_| cursor.get_array("nextBatch"))
            .map_err(|_| RutaError::protocol("cursor reply has no batch"))?;
        let documents = batch
            .iter()
            .map(|value| match value {
                Bson::Document(document) => Ok(document.clone()),
                other => Err(RutaError::protocol(format!(
                    "cursor batch holds a non-document value: {}",
                    other
                ))),
            })
            .collect::<RutaResult<Vec<_>>>()?;

        Ok(Self {
            id,
            namespace,
            documents,
        })
    }
}

impl Client {
    /// Run a cursor-producing read (find, aggregate, listCollections) and
    /// wrap the first batch
    pub async fn open_cursor(
        &self,
        db: &str,
        command: Document,
        read_preference: ReadPreference,
    ) -> RutaResult<Cursor> {
        let fallback = Namespace::new(
            db,
            command
                .values()
                .next()
                .and_then(Bson::as_str)
                .unwrap_or("$cmd"),
        );
        let batch_size = command.get("batchSize").and_then(bson_as_i64);
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
        let executed = self.execute(operation).await?;
        let batch = CursorBatch::from_reply(&executed.reply, &fallback)?;

        Ok(Cursor {
            client: self.clone(),
            address: executed.address,
            namespace: batch.namespace,
            id: batch.id,
            buffer: batch.documents.into(),
            batch_size,
            operation_id: executed.operation_id,
        })
    }

    /// Fetch the next batch from the node that owns the cursor. Never retried.
    pub async fn get_more(
        &self,
        address: &ServerAddress,
        namespace: &Namespace,
        cursor_id: i64,
        batch_size: Option<i64>,
    ) -> RutaResult<CursorBatch> {
        self.get_more_in(address, namespace, cursor_id, batch_size, next_operation_id())
            .await
    }

    pub(crate) async fn get_more_in(
        &self,
        address: &ServerAddress,
        namespace: &Namespace,
        cursor_id: i64,
        batch_size: Option<i64>,
        operation_id: i64,
    ) -> RutaResult<CursorBatch> {
        let mut command = doc! {
            "getMore": cursor_id,
            "collection": namespace.collection.as_str(),
        };
        if let Some(batch_size) = batch_size {
            command.insert("batchSize", batch_size);
        }
        let reply = self
            .execute_on(address, &namespace.db, command, None, operation_id)
            .await?;
        CursorBatch::from_reply(&reply, namespace)
    }

    /// Release server-side cursors
    pub async fn kill_cursors(
        &self,
        address: &ServerAddress,
        namespace: &Namespace,
        cursor_ids: &[i64],
    ) -> RutaResult<()> {
        self.kill_cursors_in(address, namespace, cursor_ids, next_operation_id())
            .await
    }

    async fn kill_cursors_in(
        &self,
        address: &ServerAddress,
        namespace: &Namespace,
        cursor_ids: &[i64],
        operation_id: i64,
    ) -> RutaResult<()> {
        let command = doc! {
            "killCursors": namespace.collection.as_str(),
            "cursors": cursor_ids.to_vec(),
        };
        self.execute_on(address, &namespace.db, command, None, operation_id)
            .await?;
        Ok(())
    }
}

/// Iterates a server-side cursor. Every getMore goes to the node that
/// opened it. Dropping a cursor that is not exhausted kills it in the
/// background.
pub struct Cursor {
    client: Client,
    address: ServerAddress,
    namespace: Namespace,
    id: i64,
    buffer: VecDeque<Document>,
    batch_size: Option<i64>,
    operation_id: i64,
}

impl Cursor {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Documents received but not yet returned
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.id == 0 && self.buffer.is_empty()
    }

    /// Batch size requested by subsequent getMores
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub async fn next(&mut self) -> RutaResult<Option<Document>> {
        loop {
            if let Some(document) = self.buffer.pop_front() {
                return Ok(Some(document));
            }
            if self.id == 0 {
                return Ok(None);
            }
            self.fetch_more().await?;
        }
    }

    async fn fetch_more(&mut self) -> RutaResult<()> {
        let batch = self
            .client
            .get_more_in(
                &self.address,
                &self.namespace,
                self.id,
                self.batch_size,
                self.operation_id,
            )
            .await?;
        self.id = batch.id;
        self.buffer.extend(batch.documents);
        Ok(())
    }

    /// Stream the remaining documents. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = RutaResult<Document>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut cursor = state?;
            match cursor.next().await {
                Ok(Some(document)) => Some((Ok(document), Some(cursor))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Kill the cursor now instead of on drop
    pub async fn kill(mut self) -> RutaResult<()> {
        let id = std::mem::replace(&mut self.id, 0);
        self.buffer.clear();
        if id == 0 {
            return Ok(());
        }
        self.client
            .kill_cursors_in(&self.address, &self.namespace, &[id], self.operation_id)
            .await
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("namespace", &self.namespace)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime to kill cursor {} on {}", self.id, self.address);
            return;
        };

        let client = self.client.clone();
        let address = self.address.clone();
        let namespace = self.namespace.clone();
        let id = self.id;
        let operation_id = self.operation_id;
        handle.spawn(async move {
            if let Err(e) = client
                .kill_cursors_in(&address, &namespace, &[id], operation_id)
                .await
            {
                debug!("Failed to kill cursor {} on {}: {}", id, address, e);
            }
        });
    }
}
