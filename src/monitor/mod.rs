/// Node monitors
///
/// One task per known address keeps that node's description fresh. Each
/// monitor owns a dedicated connection outside the operation pool, sends a
/// heartbeat on every interval (or earlier when a check is requested) and
/// publishes every result to its [`MonitorListener`]. Failures are published
/// too; nothing a monitor does ever reaches an operation's call path.
use std::sync::{Arc, Weak};
use std::time::Duration;

use bson::Document;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::core::handshake::Handshaker;
use crate::core::wire::next_request_id;
use crate::core::{Connection, Connector, NodeDescription, ServerAddress};
use crate::diagnostics::NodeTracker;
use crate::error::{RutaError, RutaResult};
use crate::topology::events::{SdamEvent, SdamPublisher};

/// Weight of the newest sample in the round-trip average
const RTT_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub heartbeat_frequency: Duration,
    pub min_heartbeat_frequency: Duration,
    pub connect_timeout: Duration,
}

impl MonitorOptions {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            heartbeat_frequency: config.heartbeat_frequency(),
            min_heartbeat_frequency: config.min_heartbeat_frequency(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self::from_config(&MonitorConfig::default())
    }
}

/// Receives every heartbeat outcome
pub(crate) trait MonitorListener: Send + Sync + 'static {
    fn on_heartbeat_success(&self, description: NodeDescription);
    fn on_heartbeat_failure(&self, address: &ServerAddress, error: &RutaError);
}

/// Exponentially weighted moving average of heartbeat round trips
#[derive(Debug, Default, Clone, Copy)]
pub struct RttEstimator {
    average: Option<Duration>,
}

impl RttEstimator {
    pub fn add_sample(&mut self, sample: Duration) -> Duration {
        let average = match self.average {
            Some(previous) => previous.mul_f64(1.0 - RTT_ALPHA) + sample.mul_f64(RTT_ALPHA),
            None => sample,
        };
        self.average = Some(average);
        average
    }

    pub fn average(&self) -> Option<Duration> {
        self.average
    }

    pub fn reset(&mut self) {
        self.average = None;
    }
}

/// Owner side of a running monitor. Dropping it stops the task.
pub struct MonitorHandle {
    address: ServerAddress,
    check: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Check as soon as the minimum heartbeat interval allows
    pub fn request_check(&self) {
        self.check.notify_one();
    }

    /// Stop the monitor and wait for its task to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!("Monitor for {} stopped", self.address);
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Spawn a monitor for `address` on the current runtime
pub(crate) fn spawn(
    address: ServerAddress,
    options: MonitorOptions,
    connector: Arc<dyn Connector>,
    handshaker: Arc<Handshaker>,
    listener: Weak<dyn MonitorListener>,
    events: SdamPublisher,
) -> MonitorHandle {
    let check = Arc::new(Notify::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = Monitor {
        _tracker: NodeTracker::new(&address),
        address: address.clone(),
        options,
        connector,
        handshaker,
        listener,
        events,
        connection: None,
        rtt: RttEstimator::default(),
        check: Arc::clone(&check),
    };
    let task = tokio::spawn(monitor.run(shutdown_rx));

    MonitorHandle {
        address,
        check,
        shutdown: shutdown_tx,
        task: Some(task),
    }
}

struct Monitor {
    address: ServerAddress,
    options: MonitorOptions,
    connector: Arc<dyn Connector>,
    handshaker: Arc<Handshaker>,
    listener: Weak<dyn MonitorListener>,
    events: SdamPublisher,
    connection: Option<Connection>,
    rtt: RttEstimator,
    check: Arc<Notify>,
    _tracker: NodeTracker,
}

enum Wake {
    Check,
    /// Shutdown was signalled or the handle was dropped
    Shutdown,
}

impl Monitor {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!("Monitor for {} started", self.address);
        let mut previous_ok = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let ok = tokio::select! {
                ok = self.check_once() => ok,
                _ = shutdown.changed() => break,
            };
            let Some(ok) = ok else {
                // topology is gone
                break;
            };

            // One quick retry after a node that was fine stops answering
            let interval = if previous_ok && !ok {
                self.options.min_heartbeat_frequency
            } else {
                self.options.heartbeat_frequency
            };
            previous_ok = ok;

            let check = Arc::clone(&self.check);
            let min_interval = self.options.min_heartbeat_frequency;
            if let Wake::Shutdown = wait(&check, started, interval, min_interval, &mut shutdown).await {
                break;
            }
        }

        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
    }

    /// Run one heartbeat and publish the outcome. `None` when nobody listens
    /// anymore.
    async fn check_once(&mut self) -> Option<bool> {
        self.events.publish(SdamEvent::ServerHeartbeatStarted {
            address: self.address.clone(),
            awaited: false,
        });
        let started = Instant::now();
        let result = self.heartbeat().await.and_then(|(reply, elapsed)| {
            match RutaError::from_reply(&reply) {
                Some(error) => Err(error),
                None => Ok((reply, elapsed)),
            }
        });
        let duration = started.elapsed();
        if self.events.is_active() {
            self.events.publish(match &result {
                Ok((reply, _)) => SdamEvent::ServerHeartbeatSucceeded {
                    address: self.address.clone(),
                    duration,
                    reply: reply.clone(),
                },
                Err(error) => SdamEvent::ServerHeartbeatFailed {
                    address: self.address.clone(),
                    duration,
                    error: error.clone(),
                },
            });
        }
        let listener = self.listener.upgrade()?;

        let outcome = result.and_then(|(reply, elapsed)| {
            let rtt = self.rtt.add_sample(elapsed);
            NodeDescription::from_hello(self.address.clone(), &reply, Some(rtt))
        });

        match outcome {
            Ok(description) => {
                debug!(
                    "Heartbeat from {}: {} (rtt {:?})",
                    self.address, description.role, description.round_trip_time
                );
                listener.on_heartbeat_success(description);
                Some(true)
            }
            Err(error) => {
                warn!("Heartbeat to {} failed: {}", self.address, error);
                if let Some(mut conn) = self.connection.take() {
                    conn.close();
                }
                self.rtt.reset();
                listener.on_heartbeat_failure(&self.address, &error);
                Some(false)
            }
        }
    }

    /// Handshake on a fresh connection, otherwise a plain status check.
    /// Returns the reply and the measured round trip.
    async fn heartbeat(&mut self) -> RutaResult<(Document, Duration)> {
        let reusable = self.connection.as_ref().is_some_and(|conn| !conn.is_closed());
        if !reusable {
            let mut conn = Connection::connect(
                self.connector.as_ref(),
                &self.address,
                0,
                self.options.connect_timeout,
            )
            .await?;
            conn.set_socket_timeout(Some(self.options.connect_timeout));

            let started = Instant::now();
            let reply = self.handshaker.handshake(&mut conn).await?;
            let elapsed = started.elapsed();
            self.connection = Some(conn);
            return Ok((reply, elapsed));
        }

        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| RutaError::internal("monitor connection missing"))?;
        let command = Handshaker::heartbeat_command(conn.hello_ok());
        let started = Instant::now();
        let reply = conn.send_command(next_request_id(), command).await?;
        Ok((reply, started.elapsed()))
    }
}

/// Sleep until the next heartbeat is due. A requested check cuts the wait
/// short, but never below the minimum heartbeat interval.
async fn wait(
    check: &Notify,
    started: Instant,
    interval: Duration,
    min_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Wake {
    let requested = tokio::select! {
        _ = sleep_until(started + interval) => false,
        _ = check.notified() => true,
        _ = shutdown.changed() => return Wake::Shutdown,
    };

    if requested {
        tokio::select! {
            _ = sleep_until(started + min_interval) => {}
            _ = shutdown.changed() => return Wake::Shutdown,
        }
    }
    Wake::Check
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeRole;
    use crate::diagnostics;
    use crate::mock::{hello, Failure, MockCluster};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Result<NodeDescription, String>>>,
    }

    impl MonitorListener for Recorder {
        fn on_heartbeat_success(&self, description: NodeDescription) {
            self.events.lock().unwrap().push(Ok(description));
        }

        fn on_heartbeat_failure(&self, _address: &ServerAddress, error: &RutaError) {
            self.events.lock().unwrap().push(Err(error.to_string()));
        }
    }

    impl Recorder {
        fn len(&self) -> usize {
            self.events.lock().unwrap().len()
        }

        fn last(&self) -> Option<Result<NodeDescription, String>> {
            self.events.lock().unwrap().last().cloned()
        }
    }

    fn options(heartbeat_ms: u64, min_heartbeat_ms: u64) -> MonitorOptions {
        MonitorOptions {
            heartbeat_frequency: Duration::from_millis(heartbeat_ms),
            min_heartbeat_frequency: Duration::from_millis(min_heartbeat_ms),
            connect_timeout: Duration::from_millis(200),
        }
    }

    fn start(cluster: &MockCluster, address: &str, options: MonitorOptions, recorder: &Arc<Recorder>) -> MonitorHandle {
        start_with_events(cluster, address, options, recorder, SdamPublisher::new(64))
    }

    fn start_with_events(
        cluster: &MockCluster,
        address: &str,
        options: MonitorOptions,
        recorder: &Arc<Recorder>,
        events: SdamPublisher,
    ) -> MonitorHandle {
        let listener: Arc<dyn MonitorListener> = recorder.clone();
        spawn(
            ServerAddress::parse(address).unwrap(),
            options,
            cluster.connector(),
            Arc::new(Handshaker::new(None, None)),
            Arc::downgrade(&listener),
            events,
        )
    }

    fn assert_send<T: Send>(_: &T) {}

    async fn wait_for_events(recorder: &Recorder, count: usize) {
        for _ in 0..200 {
            if recorder.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} events, got {}", count, recorder.len());
    }

    #[test]
    fn test_rtt_moving_average() {
        let mut rtt = RttEstimator::default();
        assert_eq!(rtt.add_sample(Duration::from_millis(10)), Duration::from_millis(10));
        assert_eq!(rtt.add_sample(Duration::from_millis(20)), Duration::from_millis(12));
        rtt.reset();
        assert_eq!(rtt.average(), None);
    }

    #[tokio::test]
    async fn test_monitor_task_is_send() {
        let cluster = MockCluster::new();
        let listener: Arc<dyn MonitorListener> = Arc::new(Recorder::default());
        let monitor = Monitor {
            _tracker: NodeTracker::new(&ServerAddress::new("mon-s", 27017)),
            address: ServerAddress::new("mon-s", 27017),
            options: options(10_000, 10),
            connector: cluster.connector(),
            handshaker: Arc::new(Handshaker::new(None, None)),
            listener: Arc::downgrade(&listener),
            events: SdamPublisher::new(8),
            connection: None,
            rtt: RttEstimator::default(),
            check: Arc::new(Notify::new()),
        };
        let (_tx, rx) = watch::channel(true);
        let task = monitor.run(rx);
        assert_send(&task);
        // shutdown is already signalled
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_events() {
        let cluster = MockCluster::new();
        cluster.add_node("mon-g:27017", hello::standalone());
        let recorder = Arc::new(Recorder::default());
        let publisher = SdamPublisher::new(64);
        let mut events = publisher.subscribe();

        let handle = start_with_events(&cluster, "mon-g:27017", options(60_000, 10), &recorder, publisher);
        wait_for_events(&recorder, 1).await;
        cluster.fail_command("mon-g:27017", "hello", Failure::Error(11600, "shutting down".into()));
        handle.request_check();
        wait_for_events(&recorder, 2).await;
        handle.shutdown().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], SdamEvent::ServerHeartbeatStarted { awaited: false, .. }));
        assert!(matches!(
            &seen[1],
            SdamEvent::ServerHeartbeatSucceeded { reply, .. } if reply.get_bool("isWritablePrimary").unwrap_or(false)
        ));
        assert!(matches!(seen[2], SdamEvent::ServerHeartbeatStarted { .. }));
        assert!(matches!(&seen[3], SdamEvent::ServerHeartbeatFailed { error, .. } if error.to_string().contains("shutting down")));
        assert!(seen.iter().all(|e| e.address().map(|a| a.host()) == Some("mon-g")));
    }

    #[tokio::test]
    async fn test_publishes_descriptions() {
        let cluster = MockCluster::new();
        cluster.add_node("mon-a:27017", hello::secondary("rs", &["mon-a:27017"]));
        let recorder = Arc::new(Recorder::default());

        let handle = start(&cluster, "mon-a:27017", options(10_000, 10), &recorder);
        wait_for_events(&recorder, 1).await;

        let description = recorder.last().unwrap().unwrap();
        assert_eq!(description.role, NodeRole::RsSecondary);
        assert!(description.round_trip_time.is_some());
        assert_eq!(cluster.connection_count("mon-a:27017"), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_requested_check_runs_early() {
        let cluster = MockCluster::new();
        cluster.add_node("mon-b:27017", hello::standalone());
        let recorder = Arc::new(Recorder::default());

        let handle = start(&cluster, "mon-b:27017", options(60_000, 10), &recorder);
        wait_for_events(&recorder, 1).await;

        cluster.set_hello("mon-b:27017", hello::router());
        handle.request_check();
        wait_for_events(&recorder, 2).await;

        assert_eq!(recorder.last().unwrap().unwrap().role, NodeRole::Router);
        // heartbeats reuse the monitoring connection
        assert_eq!(cluster.connection_count("mon-b:27017"), 1);
        assert_eq!(cluster.command_count("mon-b:27017", "hello"), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_is_published_and_retried() {
        let cluster = MockCluster::new();
        cluster.add_node("mon-c:27017", hello::standalone());
        let recorder = Arc::new(Recorder::default());

        let handle = start(&cluster, "mon-c:27017", options(60_000, 10), &recorder);
        wait_for_events(&recorder, 1).await;

        cluster.fail_command("mon-c:27017", "hello", Failure::CloseConnection);
        handle.request_check();
        wait_for_events(&recorder, 2).await;
        assert!(recorder.last().unwrap().is_err());

        // the quick retry reconnects without waiting a full heartbeat
        wait_for_events(&recorder, 3).await;
        assert!(recorder.last().unwrap().is_ok());
        assert_eq!(cluster.connection_count("mon-c:27017"), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_node_reports_error() {
        let cluster = MockCluster::new();
        cluster.add_node("mon-d:27017", hello::standalone());
        cluster.set_reachable("mon-d:27017", false);
        let recorder = Arc::new(Recorder::default());

        let handle = start(&cluster, "mon-d:27017", options(60_000, 10), &recorder);
        wait_for_events(&recorder, 1).await;
        assert!(recorder.last().unwrap().unwrap_err().contains("refused"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_releases_node() {
        diagnostics::enable();
        let cluster = MockCluster::new();
        cluster.add_node("mon-e:27017", hello::standalone());
        cluster.fail_command("mon-e:27017", "hello", Failure::Hang);
        let recorder = Arc::new(Recorder::default());
        let address = ServerAddress::parse("mon-e:27017").unwrap();

        let handle = start(&cluster, "mon-e:27017", options(60_000, 10), &recorder);
        assert!(diagnostics::is_node_open(&address));

        // a hung heartbeat does not delay shutdown
        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
        assert!(!diagnostics::is_node_open(&address));
        assert_eq!(diagnostics::open_connections_to(&address), 0);
        assert_eq!(recorder.len(), 0);
    }

    #[tokio::test]
    async fn test_stops_when_listener_is_gone() {
        let cluster = MockCluster::new();
        cluster.add_node("mon-f:27017", hello::standalone());
        let recorder = Arc::new(Recorder::default());

        let mut handle = start(&cluster, "mon-f:27017", options(10, 1), &recorder);
        drop(recorder);

        let task = handle.task.take().unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
