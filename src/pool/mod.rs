/// Per-node connection pool
///
/// The pool bounds the number of operation connections to one node. Idle,
/// checked-out and in-creation connections together never exceed
/// `max_size`; callers beyond that wait on a bounded queue. `clear()` bumps
/// the pool generation so every connection created before it is closed
/// instead of being reused.
pub mod events;

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fnv::FnvHashSet;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::core::connection::{Connection, Connector};
use crate::core::handshake::Handshaker;
use crate::core::ServerAddress;
use crate::error::{RutaError, RutaResult};

pub use events::{CheckOutFailedReason, ConnectionClosedReason, PoolEvent};
pub(crate) use events::PoolPublisher;

/// Pool limits and timeouts
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_size: usize,
    pub min_size: usize,
    pub max_idle_time: Option<Duration>,
    pub wait_queue_timeout: Duration,
    pub connect_timeout: Duration,
    pub socket_timeout: Option<Duration>,
}

impl PoolOptions {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            max_size: config.max_size,
            min_size: config.min_size,
            max_idle_time: config.max_idle_time(),
            wait_queue_timeout: config.wait_queue_timeout(),
            connect_timeout: config.connect_timeout(),
            socket_timeout: config.socket_timeout(),
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default())
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub checked_out: usize,
    /// Connections being established
    pub pending: usize,
    pub waiters: usize,
    pub generation: u64,
    pub max_size: usize,
    pub closed: bool,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.idle + self.checked_out + self.pending
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    checked_out: FnvHashSet<u64>,
    pending: usize,
    waiters: usize,
    generation: u64,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.pending
    }
}

struct PoolInner {
    address: ServerAddress,
    options: PoolOptions,
    connector: Arc<dyn Connector>,
    handshaker: Arc<Handshaker>,
    events: PoolPublisher,
    state: Mutex<PoolState>,
    available: Notify,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Why an idle connection can no longer be handed out
    fn perished(&self, conn: &Connection, generation: u64) -> Option<ConnectionClosedReason> {
        if conn.generation() != generation {
            Some(ConnectionClosedReason::Stale)
        } else if conn.is_closed() {
            Some(ConnectionClosedReason::Error)
        } else if self
            .options
            .max_idle_time
            .is_some_and(|max_idle| conn.idle_for() >= max_idle)
        {
            Some(ConnectionClosedReason::Idle)
        } else {
            None
        }
    }

    fn publish(&self, event: PoolEvent) {
        self.events.publish(event);
    }

    fn close_connection(&self, mut conn: Connection, reason: ConnectionClosedReason) {
        conn.close();
        self.publish(PoolEvent::ConnectionClosed {
            address: self.address.clone(),
            connection_id: conn.id(),
            reason,
        });
    }

    fn check_out_failed(&self, reason: CheckOutFailedReason) {
        self.publish(PoolEvent::ConnectionCheckOutFailed {
            address: self.address.clone(),
            reason,
        });
    }

    fn check_in(&self, mut conn: Connection) {
        let mut state = self.lock();
        state.checked_out.remove(&conn.id());
        self.publish(PoolEvent::ConnectionCheckedIn {
            address: self.address.clone(),
            connection_id: conn.id(),
        });

        let discard = if state.closed {
            Some(ConnectionClosedReason::PoolClosed)
        } else if conn.generation() != state.generation {
            Some(ConnectionClosedReason::Stale)
        } else if conn.is_closed() || conn.has_pending_request() {
            Some(ConnectionClosedReason::Error)
        } else {
            None
        };

        if let Some(reason) = discard {
            debug!(
                "Discarding connection {} to {} (generation {}, pool generation {})",
                conn.id(),
                self.address,
                conn.generation(),
                state.generation
            );
            self.close_connection(conn, reason);
        } else {
            conn.mark_idle();
            state.idle.push_back(conn);
        }
        drop(state);
        self.available.notify_one();
    }

    /// Connect and handshake a new connection for `generation`
    async fn establish(&self, generation: u64) -> RutaResult<Connection> {
        let connect_timeout = self.options.connect_timeout;
        let started = Instant::now();
        let mut conn =
            Connection::connect(self.connector.as_ref(), &self.address, generation, connect_timeout)
                .await?;
        self.publish(PoolEvent::ConnectionCreated {
            address: self.address.clone(),
            connection_id: conn.id(),
        });

        let handshake = match timeout(connect_timeout, self.handshaker.handshake(&mut conn)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(RutaError::network(
                std::io::ErrorKind::TimedOut,
                format!("handshake with {} timed out", self.address),
            )),
        };
        if let Err(e) = handshake {
            self.close_connection(conn, ConnectionClosedReason::Error);
            return Err(e);
        }

        conn.set_socket_timeout(self.options.socket_timeout);
        debug!("Established connection {} to {}", conn.id(), self.address);
        self.publish(PoolEvent::ConnectionReady {
            address: self.address.clone(),
            connection_id: conn.id(),
            duration: started.elapsed(),
        });
        Ok(conn)
    }
}

/// Decrements a pool counter unless disarmed, so cancelled futures keep
/// the accounting straight
struct CounterGuard<'a> {
    inner: &'a PoolInner,
    counter: Counter,
    armed: bool,
}

#[derive(Clone, Copy)]
enum Counter {
    Pending,
    Waiters,
}

impl<'a> CounterGuard<'a> {
    fn new(inner: &'a PoolInner, counter: Counter) -> Self {
        Self {
            inner,
            counter,
            armed: true,
        }
    }

    /// Decrement while the caller already holds the lock
    fn release(mut self, state: &mut PoolState) {
        self.armed = false;
        decrement(state, self.counter);
    }
}

fn decrement(state: &mut PoolState, counter: Counter) {
    match counter {
        Counter::Pending => state.pending = state.pending.saturating_sub(1),
        Counter::Waiters => state.waiters = state.waiters.saturating_sub(1),
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            decrement(&mut self.inner.lock(), self.counter);
            if matches!(self.counter, Counter::Pending) {
                self.inner.available.notify_one();
            }
        }
    }
}

/// Connection pool for one node
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        address: ServerAddress,
        options: PoolOptions,
        connector: Arc<dyn Connector>,
        handshaker: Arc<Handshaker>,
        events: PoolPublisher,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                address,
                options,
                connector,
                handshaker,
                events,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    checked_out: FnvHashSet::default(),
                    pending: 0,
                    waiters: 0,
                    generation: 0,
                    closed: false,
                }),
                available: Notify::new(),
            }),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            idle: state.idle.len(),
            checked_out: state.checked_out.len(),
            pending: state.pending,
            waiters: state.waiters,
            generation: state.generation,
            max_size: self.inner.options.max_size,
            closed: state.closed,
        }
    }

    /// Check out a connection: a same-generation idle one if present,
    /// otherwise a new one if under `max_size`, otherwise wait up to the
    /// wait queue timeout.
    pub async fn check_out(&self) -> RutaResult<PooledConnection> {
        let started = Instant::now();
        let deadline = started + self.inner.options.wait_queue_timeout;

        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);

            let (generation, waiter) = {
                let mut state = self.inner.lock();
                if state.closed {
                    self.inner.check_out_failed(CheckOutFailedReason::PoolClosed);
                    return Err(RutaError::PoolClosed {
                        address: self.inner.address.clone(),
                    });
                }

                if let Some(conn) = self.take_idle(&mut state) {
                    return Ok(self.lease(conn, &mut state));
                }

                if state.total() < self.inner.options.max_size {
                    state.pending += 1;
                    (Some(state.generation), None)
                } else {
                    state.waiters += 1;
                    notified.as_mut().enable();
                    (None, Some(CounterGuard::new(&self.inner, Counter::Waiters)))
                }
            };

            if let Some(generation) = generation {
                return self.create_for_checkout(generation).await;
            }

            let woke = tokio::time::timeout_at(deadline, notified).await;
            if let Some(waiter) = waiter {
                waiter.release(&mut self.inner.lock());
            }
            if woke.is_err() {
                debug!("Wait queue timeout for {}", self.inner.address);
                self.inner.check_out_failed(CheckOutFailedReason::Timeout);
                return Err(RutaError::PoolExhausted {
                    address: self.inner.address.clone(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
    }

    async fn create_for_checkout(&self, generation: u64) -> RutaResult<PooledConnection> {
        let pending = CounterGuard::new(&self.inner, Counter::Pending);
        let result = self.inner.establish(generation).await;

        let mut state = self.inner.lock();
        pending.release(&mut state);
        match result {
            Ok(conn) if !state.closed => Ok(self.lease(conn, &mut state)),
            Ok(conn) => {
                self.inner.close_connection(conn, ConnectionClosedReason::PoolClosed);
                self.inner.check_out_failed(CheckOutFailedReason::PoolClosed);
                Err(RutaError::PoolClosed {
                    address: self.inner.address.clone(),
                })
            }
            Err(e) => {
                drop(state);
                self.inner.check_out_failed(CheckOutFailedReason::ConnectionError);
                self.inner.available.notify_one();
                Err(e)
            }
        }
    }

    fn take_idle(&self, state: &mut PoolState) -> Option<Connection> {
        while let Some(conn) = state.idle.pop_back() {
            if let Some(reason) = self.inner.perished(&conn, state.generation) {
                self.inner.close_connection(conn, reason);
                continue;
            }
            return Some(conn);
        }
        None
    }

    fn lease(&self, conn: Connection, state: &mut PoolState) -> PooledConnection {
        state.checked_out.insert(conn.id());
        self.inner.publish(PoolEvent::ConnectionCheckedOut {
            address: self.inner.address.clone(),
            connection_id: conn.id(),
        });
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Invalidate every existing connection. Idle ones close now, checked-out
    /// ones when they come back. Returns the new generation.
    pub fn clear(&self) -> u64 {
        let mut state = self.inner.lock();
        state.generation += 1;
        let generation = state.generation;
        let idle: Vec<Connection> = state.idle.drain(..).collect();
        drop(state);

        info!(
            "Cleared pool for {} (generation {}, closed {} idle)",
            self.inner.address,
            generation,
            idle.len()
        );
        self.inner.publish(PoolEvent::PoolCleared {
            address: self.inner.address.clone(),
            generation,
        });
        for conn in idle {
            self.inner.close_connection(conn, ConnectionClosedReason::Stale);
        }
        self.inner.available.notify_waiters();
        generation
    }

    /// Close the pool. Waiters fail with `PoolClosed`; checked-out
    /// connections close on return.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle: Vec<Connection> = state.idle.drain(..).collect();
        drop(state);

        debug!("Closed pool for {}", self.inner.address);
        for conn in idle {
            self.inner.close_connection(conn, ConnectionClosedReason::PoolClosed);
        }
        self.inner.publish(PoolEvent::PoolClosed {
            address: self.inner.address.clone(),
        });
        self.inner.available.notify_waiters();
    }

    /// Drop idle connections past the max idle time
    pub fn prune_idle(&self) -> usize {
        let mut state = self.inner.lock();
        let generation = state.generation;
        let mut expired = Vec::new();
        for conn in std::mem::take(&mut state.idle) {
            match self.inner.perished(&conn, generation) {
                Some(reason) => expired.push((conn, reason)),
                None => state.idle.push_back(conn),
            }
        }
        drop(state);

        let pruned = expired.len();
        for (conn, reason) in expired {
            self.inner.close_connection(conn, reason);
        }
        pruned
    }

    /// Open idle connections until the pool holds `min_size`. Returns the
    /// number of connections created.
    pub async fn populate(&self) -> RutaResult<usize> {
        self.prune_idle();
        let mut created = 0;
        loop {
            let generation = {
                let mut state = self.inner.lock();
                if state.closed || state.total() >= self.inner.options.min_size {
                    return Ok(created);
                }
                state.pending += 1;
                state.generation
            };

            let pending = CounterGuard::new(&self.inner, Counter::Pending);
            let result = self.inner.establish(generation).await;

            let mut state = self.inner.lock();
            pending.release(&mut state);
            let conn = result?;
            if state.closed {
                self.inner.close_connection(conn, ConnectionClosedReason::PoolClosed);
            } else if conn.generation() != state.generation {
                self.inner.close_connection(conn, ConnectionClosedReason::Stale);
            } else {
                state.idle.push_back(conn);
                created += 1;
            }
            drop(state);
            self.inner.available.notify_one();
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.address)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A checked-out connection. Returns itself to the pool when dropped.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Return the connection to its pool
    pub fn check_in(self) {
        drop(self);
    }

    /// Close the connection instead of reusing it
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close();
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}
