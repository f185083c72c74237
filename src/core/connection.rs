/// Node connections and the transport seam
///
/// A [`Connection`] owns one stream to one node and runs strictly one
/// request at a time. Streams come from a [`Connector`]; production code uses
/// [`TcpConnector`], tests plug in an in-memory cluster.
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bson::Document;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::tls::TlsWrapper;
use super::wire::{Message, DEFAULT_MAX_MESSAGE_SIZE};
use super::ServerAddress;
use crate::config::TlsConfig;
use crate::diagnostics::ConnectionTracker;
use crate::error::{RutaError, RutaResult};

/// Byte stream to a node
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Opens byte streams to nodes
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &ServerAddress) -> RutaResult<Box<dyn AsyncStream>>;
}

/// TCP connector with optional TLS
#[derive(Clone, Default)]
pub struct TcpConnector {
    tls: Option<TlsWrapper>,
}

impl TcpConnector {
    pub fn new(tls: Option<TlsWrapper>) -> Self {
        Self { tls }
    }

    pub fn from_config(config: &TlsConfig) -> RutaResult<Self> {
        let tls = if config.enabled {
            Some(TlsWrapper::from_config(config)?)
        } else {
            None
        };
        Ok(Self::new(tls))
    }

    /// Configure the socket for request/response traffic
    fn configure_stream(stream: &TcpStream) -> Result<(), io::Error> {
        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(120));
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        Ok(())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &ServerAddress) -> RutaResult<Box<dyn AsyncStream>> {
        let stream = TcpStream::connect((address.host(), address.port())).await?;
        if let Err(e) = Self::configure_stream(&stream) {
            warn!("Failed to configure stream to {}: {}", address, e);
        }

        match &self.tls {
            Some(tls) => Ok(Box::new(tls.wrap(address, stream).await?)),
            None => Ok(Box::new(stream)),
        }
    }
}

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One transport channel to one node
pub struct Connection {
    id: u64,
    address: ServerAddress,
    generation: u64,
    stream: BufStream<Box<dyn AsyncStream>>,
    closed: bool,
    pending_requests: usize,
    hello_ok: bool,
    max_wire_version: i32,
    created_at: Instant,
    last_used: Instant,
    socket_timeout: Option<Duration>,
    max_message_size: usize,
    _tracker: ConnectionTracker,
}

impl Connection {
    /// Open a connection within `connect_timeout`. No handshake is performed.
    pub async fn connect(
        connector: &dyn Connector,
        address: &ServerAddress,
        generation: u64,
        connect_timeout: Duration,
    ) -> RutaResult<Self> {
        debug!("Connecting to {}", address);
        let stream = match timeout(connect_timeout, connector.connect(address)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RutaError::network(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out after {:?}", address, connect_timeout),
                ))
            }
        };
        Ok(Self::from_stream(address.clone(), generation, stream))
    }

    pub fn from_stream(address: ServerAddress, generation: u64, stream: Box<dyn AsyncStream>) -> Self {
        let now = Instant::now();
        Self {
            id: CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            _tracker: ConnectionTracker::new(&address),
            address,
            generation,
            stream: BufStream::new(stream),
            closed: false,
            pending_requests: 0,
            hello_ok: false,
            max_wire_version: 0,
            created_at: now,
            last_used: now,
            socket_timeout: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// A request was written but its reply never fully read
    pub fn has_pending_request(&self) -> bool {
        self.pending_requests > 0
    }

    pub fn hello_ok(&self) -> bool {
        self.hello_ok
    }

    pub fn max_wire_version(&self) -> i32 {
        self.max_wire_version
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn set_socket_timeout(&mut self, socket_timeout: Option<Duration>) {
        self.socket_timeout = socket_timeout;
    }

    pub(crate) fn record_handshake(&mut self, hello_ok: bool, max_wire_version: i32, max_message_size: usize) {
        self.hello_ok = hello_ok;
        self.max_wire_version = max_wire_version;
        self.max_message_size = max_message_size;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn close(&mut self) {
        if !self.closed {
            debug!("Closing connection {} to {}", self.id, self.address);
            self.closed = true;
        }
    }

    /// Send one command and wait for its reply. Any failure closes the connection.
    pub async fn send_command(&mut self, request_id: i32, command: Document) -> RutaResult<Document> {
        if self.closed {
            return Err(RutaError::network(
                io::ErrorKind::NotConnected,
                format!("connection {} to {} is closed", self.id, self.address),
            ));
        }

        self.pending_requests += 1;
        let result = self.round_trip(Message::new(request_id, command)).await;
        self.pending_requests -= 1;

        match result {
            Ok(reply) => {
                self.last_used = Instant::now();
                Ok(reply)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    async fn round_trip(&mut self, message: Message) -> RutaResult<Document> {
        message.write_to(&mut self.stream).await?;

        let read = Message::read_from(&mut self.stream, self.max_message_size);
        let reply = match self.socket_timeout {
            Some(limit) => timeout(limit, read).await.map_err(|_| {
                RutaError::network(
                    io::ErrorKind::TimedOut,
                    format!("no reply from {} within {:?}", self.address, limit),
                )
            })??,
            None => read.await?,
        };

        if reply.response_to != message.request_id {
            return Err(RutaError::protocol(format!(
                "reply responds to request {} but {} was sent",
                reply.response_to, message.request_id
            )));
        }
        Ok(reply.document)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("closed", &self.closed)
            .field("pending_requests", &self.pending_requests)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Hands out one pre-made stream
    struct OneShotConnector(Mutex<Option<DuplexStream>>);

    #[async_trait]
    impl Connector for OneShotConnector {
        async fn connect(&self, _address: &ServerAddress) -> RutaResult<Box<dyn AsyncStream>> {
            match self.0.lock().unwrap().take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(RutaError::network(io::ErrorKind::ConnectionRefused, "used")),
            }
        }
    }

    struct NeverConnector;

    #[async_trait]
    impl Connector for NeverConnector {
        async fn connect(&self, _address: &ServerAddress) -> RutaResult<Box<dyn AsyncStream>> {
            std::future::pending().await
        }
    }

    fn address() -> ServerAddress {
        ServerAddress::new("conn-test", 27017)
    }

    async fn connected(respond: impl FnOnce(Message) -> Option<Message> + Send + 'static) -> Connection {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            if let Ok(request) = Message::read_from(&mut server, DEFAULT_MAX_MESSAGE_SIZE).await {
                if let Some(reply) = respond(request) {
                    let _ = reply.write_to(&mut server).await;
                }
            }
        });
        let connector = OneShotConnector(Mutex::new(Some(client)));
        Connection::connect(&connector, &address(), 0, Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_command() {
        let mut conn = connected(|req| {
            Some(Message::reply_to(99, req.request_id, doc! { "ok": 1, "echo": req.document }))
        })
        .await;

        let reply = conn.send_command(41, doc! { "ping": 1 }).await.unwrap();
        assert_eq!(reply.get_document("echo").unwrap(), &doc! { "ping": 1 });
        assert!(!conn.is_closed());
        assert!(!conn.has_pending_request());
    }

    #[tokio::test]
    async fn test_scripted_exchange() {
        let request = Message::new(12, doc! { "ping": 1 }).encode().unwrap();
        let reply = Message::reply_to(13, 12, doc! { "ok": 1 }).encode().unwrap();
        let stream = tokio_test::io::Builder::new().write(&request).read(&reply).build();
        let mut conn = Connection::from_stream(address(), 3, Box::new(stream));

        let reply = conn.send_command(12, doc! { "ping": 1 }).await.unwrap();
        assert_eq!(reply.get_i32("ok").unwrap(), 1);
        assert_eq!(conn.generation(), 3);
    }

    #[tokio::test]
    async fn test_mismatched_reply_closes_connection() {
        let mut conn = connected(|req| Some(Message::reply_to(1, req.request_id + 1, doc! { "ok": 1 }))).await;

        let result = conn.send_command(5, doc! { "ping": 1 }).await;
        assert!(matches!(result, Err(RutaError::Protocol(_))));
        assert!(conn.is_closed());

        let result = conn.send_command(6, doc! { "ping": 1 }).await;
        assert!(matches!(result, Err(RutaError::Network(_))));
    }

    #[tokio::test]
    async fn test_peer_hangup_is_network_error() {
        let mut conn = connected(|_| None).await;
        let result = conn.send_command(5, doc! { "ping": 1 }).await;
        assert!(matches!(result, Err(RutaError::Network(_))));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_socket_timeout() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut conn = Connection::from_stream(address(), 0, Box::new(client));
        conn.set_socket_timeout(Some(Duration::from_millis(20)));

        let result = conn.send_command(5, doc! { "ping": 1 }).await;
        assert!(matches!(result, Err(RutaError::Network(e)) if e.kind() == io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let result = Connection::connect(&NeverConnector, &address(), 0, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(RutaError::Network(_))));
    }

    #[tokio::test]
    async fn test_cancelled_request_leaves_pending_marker() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut conn = Connection::from_stream(address(), 0, Box::new(client));

        let send = conn.send_command(5, doc! { "ping": 1 });
        let _ = timeout(Duration::from_millis(20), send).await;
        assert!(conn.has_pending_request());
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::default();
        let result = connector.connect(&ServerAddress::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(RutaError::Network(_))));
    }

    #[tokio::test]
    async fn test_tcp_connector_success() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let connector = TcpConnector::default();
        assert!(connector.connect(&ServerAddress::new("127.0.0.1", port)).await.is_ok());
    }
}
