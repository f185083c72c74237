/// In-memory cluster for tests
///
/// Every node answers OP_MSG commands over a tokio duplex stream. Roles are
/// driven by the hello document the test installs, and failures can be
/// scripted per command.
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use tokio::io::DuplexStream;

use crate::core::connection::AsyncStream;
use crate::core::wire::{next_request_id, Message, DEFAULT_MAX_MESSAGE_SIZE};
use crate::core::{Connector, ServerAddress};
use crate::error::{bson_as_i64, RutaError, RutaResult};

/// Scripted one-shot failure for the next matching command
#[derive(Debug, Clone)]
pub enum Failure {
    /// Drop the stream without replying
    CloseConnection,
    /// Reply `ok: 0` with this code and message
    Error(i32, String),
    /// Never reply
    Hang,
    /// Reply normally, but to a request id that was never sent
    Misaddressed,
}

enum Action {
    Reply(Document),
    Misaddressed(Document),
    Close,
    Hang,
}

struct MockCursor {
    batch_size: usize,
    remaining: VecDeque<Document>,
}

struct MockNode {
    hello: Document,
    reachable: bool,
    connections: usize,
    failures: HashMap<String, VecDeque<Failure>>,
    commands: HashMap<String, usize>,
    collections: HashMap<String, Vec<Document>>,
    cursors: HashMap<i64, MockCursor>,
    next_cursor_id: i64,
}

impl MockNode {
    fn new(hello: Document) -> Self {
        Self {
            hello,
            reachable: true,
            connections: 0,
            failures: HashMap::new(),
            commands: HashMap::new(),
            collections: HashMap::new(),
            cursors: HashMap::new(),
            next_cursor_id: 1_000,
        }
    }

    fn writable(&self) -> bool {
        self.hello.get_bool("isWritablePrimary").unwrap_or(false)
            || self.hello.get_str("msg").ok() == Some("isdbgrid")
    }

    fn execute(&mut self, name: &str, command: &Document) -> Document {
        match name {
            "hello" => {
                let mut reply = self.hello.clone();
                reply.insert("ok", 1);
                reply.insert("helloOk", true);
                reply
            }
            "ping" => doc! { "ok": 1 },
            "insert" => self.insert(command),
            "find" => self.find(command),
            "getMore" => self.get_more(command),
            "killCursors" => self.kill_cursors(command),
            other => error_reply(59, &format!("no such command: '{}'", other)),
        }
    }

    fn insert(&mut self, command: &Document) -> Document {
        if !self.writable() {
            return error_reply(10107, "not master");
        }
        let collection = command.get_str("insert").unwrap_or_default().to_string();
        let documents: Vec<Document> = command
            .get_array("documents")
            .map(|docs| docs.iter().filter_map(|d| d.as_document().cloned()).collect())
            .unwrap_or_default();
        let n = documents.len() as i32;
        self.collections.entry(collection).or_default().extend(documents);
        doc! { "ok": 1, "n": n }
    }

    fn find(&mut self, command: &Document) -> Document {
        let collection = command.get_str("find").unwrap_or_default();
        let db = command.get_str("$db").unwrap_or("test");
        let batch_size = command
            .get("batchSize")
            .and_then(bson_as_i64)
            .map(|n| n as usize)
            .unwrap_or(101);

        let mut remaining: VecDeque<Document> = self
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
            .into();
        let take = batch_size.min(remaining.len());
        let first_batch: Vec<Document> = remaining.drain(..take).collect();

        let id = if remaining.is_empty() {
            0
        } else {
            self.next_cursor_id += 1;
            self.cursors.insert(self.next_cursor_id, MockCursor { batch_size, remaining });
            self.next_cursor_id
        };

        doc! {
            "ok": 1,
            "cursor": { "id": id, "ns": format!("{}.{}", db, collection), "firstBatch": first_batch },
        }
    }

    fn get_more(&mut self, command: &Document) -> Document {
        let id = command.get("getMore").and_then(bson_as_i64).unwrap_or(0);
        let db = command.get_str("$db").unwrap_or("test");
        let collection = command.get_str("collection").unwrap_or_default();

        let Some(cursor) = self.cursors.get_mut(&id) else {
            return error_reply(43, &format!("cursor id {} not found", id));
        };
        let batch_size = command
            .get("batchSize")
            .and_then(bson_as_i64)
            .map(|n| n as usize)
            .unwrap_or(cursor.batch_size);
        let take = batch_size.min(cursor.remaining.len());
        let next_batch: Vec<Document> = cursor.remaining.drain(..take).collect();
        let next_id = if cursor.remaining.is_empty() {
            self.cursors.remove(&id);
            0
        } else {
            id
        };

        doc! {
            "ok": 1,
            "cursor": { "id": next_id, "ns": format!("{}.{}", db, collection), "nextBatch": next_batch },
        }
    }

    fn kill_cursors(&mut self, command: &Document) -> Document {
        let ids: Vec<i64> = command
            .get_array("cursors")
            .map(|ids| ids.iter().filter_map(bson_as_i64).collect())
            .unwrap_or_default();
        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for id in ids {
            if self.cursors.remove(&id).is_some() {
                killed.push(Bson::Int64(id));
            } else {
                not_found.push(Bson::Int64(id));
            }
        }
        doc! { "ok": 1, "cursorsKilled": killed, "cursorsNotFound": not_found }
    }
}

fn error_reply(code: i32, message: &str) -> Document {
    doc! { "ok": 0, "code": code, "errmsg": message }
}

/// Commands are counted and scripted under one name for all hello spellings
fn command_name(command: &Document) -> String {
    match command.keys().next().map(String::as_str) {
        Some("hello") | Some("isMaster") | Some("ismaster") => "hello".to_string(),
        Some(name) => name.to_string(),
        None => String::new(),
    }
}

#[derive(Default)]
struct MockState {
    nodes: HashMap<ServerAddress, MockNode>,
}

impl MockState {
    fn respond(&mut self, address: &ServerAddress, command: &Document) -> Action {
        let Some(node) = self.nodes.get_mut(address) else {
            return Action::Close;
        };
        if !node.reachable {
            return Action::Close;
        }

        let name = command_name(command);
        *node.commands.entry(name.clone()).or_insert(0) += 1;

        if let Some(failure) = node.failures.get_mut(&name).and_then(VecDeque::pop_front) {
            return match failure {
                Failure::CloseConnection => Action::Close,
                Failure::Error(code, message) => Action::Reply(error_reply(code, &message)),
                Failure::Hang => Action::Hang,
                Failure::Misaddressed => Action::Misaddressed(node.execute(&name, command)),
            };
        }
        Action::Reply(node.execute(&name, command))
    }
}

/// Shared handle to the simulated cluster
#[derive(Clone, Default)]
pub struct MockCluster {
    inner: Arc<Mutex<MockState>>,
}

fn parse(address: &str) -> ServerAddress {
    ServerAddress::parse(address).expect("valid mock address")
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    fn with_node<T>(&self, address: &str, f: impl FnOnce(&mut MockNode) -> T) -> T {
        let mut state = self.inner.lock().unwrap();
        let node = state
            .nodes
            .get_mut(&parse(address))
            .unwrap_or_else(|| panic!("no mock node {}", address));
        f(node)
    }

    pub fn add_node(&self, address: &str, hello: Document) {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .insert(parse(address), MockNode::new(hello));
    }

    /// Change what the node reports from its next heartbeat on
    pub fn set_hello(&self, address: &str, hello: Document) {
        self.with_node(address, |node| node.hello = hello);
    }

    /// Unreachable nodes refuse connections and drop open streams on the next request
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        self.with_node(address, |node| node.reachable = reachable);
    }

    pub fn fail_command(&self, address: &str, command: &str, failure: Failure) {
        let name = match command {
            "isMaster" | "ismaster" => "hello",
            other => other,
        };
        self.with_node(address, |node| {
            node.failures
                .entry(name.to_string())
                .or_default()
                .push_back(failure)
        });
    }

    pub fn insert_documents(&self, address: &str, collection: &str, documents: Vec<Document>) {
        self.with_node(address, |node| {
            node.collections
                .entry(collection.to_string())
                .or_default()
                .extend(documents)
        });
    }

    pub fn command_count(&self, address: &str, command: &str) -> usize {
        self.with_node(address, |node| node.commands.get(command).copied().unwrap_or(0))
    }

    pub fn connection_count(&self, address: &str) -> usize {
        self.with_node(address, |node| node.connections)
    }

    pub fn open_cursors(&self, address: &str) -> usize {
        self.with_node(address, |node| node.cursors.len())
    }
}

#[async_trait]
impl Connector for MockCluster {
    async fn connect(&self, address: &ServerAddress) -> RutaResult<Box<dyn AsyncStream>> {
        {
            let mut state = self.inner.lock().unwrap();
            match state.nodes.get_mut(address) {
                Some(node) if node.reachable => node.connections += 1,
                _ => {
                    return Err(RutaError::network(
                        io::ErrorKind::ConnectionRefused,
                        format!("connection to {} refused", address),
                    ))
                }
            }
        }

        let (client, server) = tokio::io::duplex(1 << 16);
        tokio::spawn(serve(self.inner.clone(), address.clone(), server));
        Ok(Box::new(client))
    }
}

async fn serve(state: Arc<Mutex<MockState>>, address: ServerAddress, mut stream: DuplexStream) {
    loop {
        let request = match Message::read_from(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await {
            Ok(request) => request,
            Err(_) => return,
        };

        let action = state.lock().unwrap().respond(&address, &request.document);
        let (response_to, reply) = match action {
            Action::Reply(reply) => (request.request_id, reply),
            Action::Misaddressed(reply) => (request.request_id.wrapping_add(1), reply),
            Action::Close => return,
            Action::Hang => {
                std::future::pending::<()>().await;
                return;
            }
        };

        let message = Message::reply_to(next_request_id(), response_to, reply);
        if message.write_to(&mut stream).await.is_err() {
            return;
        }
    }
}

/// Hello replies for each role
pub mod hello {
    use bson::oid::ObjectId;
    use bson::{doc, Document};

    /// Deterministic election id ordered by `n`
    pub fn election_id(n: u8) -> ObjectId {
        let mut bytes = [0u8; 12];
        bytes[11] = n;
        ObjectId::from_bytes(bytes)
    }

    fn base() -> Document {
        doc! {
            "ok": 1,
            "helloOk": true,
            "minWireVersion": 0,
            "maxWireVersion": 21,
            "maxMessageSizeBytes": 48_000_000,
        }
    }

    fn host_list(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    pub fn standalone() -> Document {
        let mut reply = base();
        reply.insert("isWritablePrimary", true);
        reply
    }

    pub fn router() -> Document {
        let mut reply = standalone();
        reply.insert("msg", "isdbgrid");
        reply
    }

    pub fn ghost() -> Document {
        let mut reply = base();
        reply.insert("isWritablePrimary", false);
        reply.insert("isreplicaset", true);
        reply
    }

    pub fn primary(set: &str, hosts: &[&str], set_version: i64, election_id: ObjectId) -> Document {
        let mut reply = base();
        reply.insert("isWritablePrimary", true);
        reply.insert("secondary", false);
        reply.insert("setName", set);
        reply.insert("setVersion", set_version);
        reply.insert("electionId", election_id);
        reply.insert("hosts", host_list(hosts));
        reply
    }

    pub fn secondary(set: &str, hosts: &[&str]) -> Document {
        let mut reply = base();
        reply.insert("isWritablePrimary", false);
        reply.insert("secondary", true);
        reply.insert("setName", set);
        reply.insert("hosts", host_list(hosts));
        reply
    }

    pub fn arbiter(set: &str, hosts: &[&str]) -> Document {
        let mut reply = base();
        reply.insert("isWritablePrimary", false);
        reply.insert("arbiterOnly", true);
        reply.insert("setName", set);
        reply.insert("hosts", host_list(hosts));
        reply
    }

    pub fn with_tags(mut reply: Document, tags: &[(&str, &str)]) -> Document {
        let mut doc = Document::new();
        for (k, v) in tags {
            doc.insert(*k, *v);
        }
        reply.insert("tags", doc);
        reply
    }

    pub fn with_last_write(mut reply: Document, millis: i64) -> Document {
        reply.insert(
            "lastWrite",
            doc! { "lastWriteDate": bson::DateTime::from_millis(millis) },
        );
        reply
    }

    pub fn with_wire_versions(mut reply: Document, min: i32, max: i32) -> Document {
        reply.insert("minWireVersion", min);
        reply.insert("maxWireVersion", max);
        reply
    }

    pub fn with_me(mut reply: Document, me: &str) -> Document {
        reply.insert("me", me);
        reply
    }
}
