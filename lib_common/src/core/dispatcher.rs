//! # Broadcast Dispatcher
//!
//! The `Dispatcher` is the central fanout component of the engine. It owns
//! the client registry and distributes each serialized envelope to every
//! registered client using one of two strategies:
//!
//! 1. **Naive**: one socket write per client, awaited sequentially. The
//!    baseline strategy; the slowest client dictates the pace for all.
//!
//! 2. **Queued**: a non-blocking drop-oldest enqueue into each client's
//!    bounded [`RelayQueue`], drained by a dedicated relay worker per
//!    client. A slow client only sheds its own frames.
//!
//! ## Ownership Model
//!
//! The dispatcher is not shared. A single engine task owns it and is the
//! only code path that admits, evicts or iterates clients, so registry
//! mutation needs no locking. Relay workers report their own exit over a
//! channel handed out at construction, and the engine folds those reports
//! back into registry removals.
//!
//! In queued mode the broadcast pass touches a client only through its
//! queue; the socket write half is owned by the client's relay worker for
//! the whole life of the connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::health::{ClientHealth, HealthPolicy, Verdict};
use crate::core::metrics::{SendTimes, SEND_TIMES_CAPACITY};
use crate::core::relay_queue::RelayQueue;

/// Identifier assigned at admission, monotonically increasing from 1.
pub type ClientId = u64;

/// How long an eviction waits for the relay worker to wind down before
/// aborting it.
const RELAY_GRACE: Duration = Duration::from_millis(500);

/// One broadcast message, serialized once per tick and fanned out as a
/// shared frame.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    /// Monotonically increasing sequence number, starting at 1.
    pub seq: u64,
    /// Wall clock seconds at production, with fractional precision.
    pub ts_send: f64,
    /// Base64-encoded opaque payload.
    pub payload_b64: &'a str,
}

impl Envelope<'_> {
    /// Serializes into the single text frame sent to every client.
    pub fn to_frame(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// Wall clock as fractional Unix seconds, the time base for `ts_send` and
/// `ack_ts`.
pub fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Errors surfaced by a client transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed or half-closed the connection.
    #[error("connection closed")]
    Closed,
    /// Any other transport failure, treated like a close for lifecycle
    /// purposes.
    #[error("transport failure: {0}")]
    Other(String),
}

/// Write side of one client connection.
///
/// The server implements this over the WebSocket write half; tests use
/// in-memory mocks.
#[async_trait]
pub trait ClientTransport: Send + 'static {
    /// Sends one text frame.
    async fn send_text(&mut self, frame: &str) -> Result<(), TransportError>;
    /// Sends a keepalive ping.
    async fn send_ping(&mut self) -> Result<(), TransportError>;
    /// Best-effort close notification to the peer.
    async fn close(&mut self);
}

/// Most recent proof of life from the peer. Touched by the inbound reader,
/// read by the keepalive checks.
pub struct PongClock {
    last: Mutex<Instant>,
}

impl PongClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().expect("pong clock lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().expect("pong clock lock poisoned").elapsed()
    }
}

impl Default for PongClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a relay worker stopped on its own.
#[derive(Debug)]
pub enum DepartReason {
    TransportClosed,
    TransportError(String),
    KeepaliveTimeout,
}

impl fmt::Display for DepartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepartReason::TransportClosed => write!(f, "connection closed"),
            DepartReason::TransportError(msg) => write!(f, "transport error: {}", msg),
            DepartReason::KeepaliveTimeout => write!(f, "keepalive timeout"),
        }
    }
}

/// Self-reported exit of a relay worker, consumed by the engine loop.
#[derive(Debug)]
pub struct Departure {
    pub id: ClientId,
    pub reason: DepartReason,
}

/// Broadcast strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Sequential socket writes from the broadcast pass.
    Naive,
    /// Per-client bounded queues drained by relay workers.
    Queued,
}

/// Dispatcher tuning, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub mode: DispatchMode,
    /// Per-client queue capacity in queued mode.
    pub maxsize: usize,
    pub policy: HealthPolicy,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

/// Handed back to the connection handler at admission.
pub struct Admission {
    pub id: ClientId,
    /// Shared liveness clock for the inbound reader to touch.
    pub pong: Arc<PongClock>,
    /// Cancelled when the client is removed; the inbound reader should exit.
    pub cancel: CancellationToken,
}

enum ClientLink<T> {
    /// Naive mode: the broadcast pass owns the socket write half.
    Direct { transport: T },
    /// Queued mode: a relay worker owns the write half and drains the queue.
    Queued {
        queue: Arc<RelayQueue>,
        relay: JoinHandle<()>,
    },
}

struct ClientHandle<T> {
    peer: String,
    link: ClientLink<T>,
    health: ClientHealth,
    send_times: Arc<Mutex<SendTimes>>,
    pong: Arc<PongClock>,
    cancel: CancellationToken,
}

/// Per-client figures reported through the metrics worker.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub id: ClientId,
    pub peer: String,
    pub queue_len: usize,
    pub drops_total: u64,
    pub send_latency_ms: f64,
}

/// Registry-level figures reported through the metrics worker.
#[derive(Debug, Clone)]
pub struct DispatcherSnapshot {
    pub connected: usize,
    pub disconnects_total: u64,
    pub clients: Vec<ClientSnapshot>,
}

/// The broadcaster and client registry. See the module docs for the
/// ownership model.
pub struct Dispatcher<T: ClientTransport> {
    cfg: DispatcherConfig,
    clients: HashMap<ClientId, ClientHandle<T>>,
    next_id: ClientId,
    departures_tx: mpsc::UnboundedSender<Departure>,
    disconnects_total: u64,
}

impl<T: ClientTransport> Dispatcher<T> {
    /// Creates the dispatcher together with the channel on which relay
    /// workers report their own exit.
    pub fn new(cfg: DispatcherConfig) -> (Self, mpsc::UnboundedReceiver<Departure>) {
        let (departures_tx, departures_rx) = mpsc::unbounded_channel();
        (
            Self {
                cfg,
                clients: HashMap::new(),
                next_id: 0,
                departures_tx,
                disconnects_total: 0,
            },
            departures_rx,
        )
    }

    /// Registers a connection. In queued mode this allocates the bounded
    /// queue and starts the relay worker.
    pub fn admit(&mut self, transport: T, peer: String) -> Admission {
        self.next_id += 1;
        let id = self.next_id;
        let pong = Arc::new(PongClock::new());
        let cancel = CancellationToken::new();
        let send_times = Arc::new(Mutex::new(SendTimes::new(SEND_TIMES_CAPACITY)));

        let link = match self.cfg.mode {
            DispatchMode::Naive => ClientLink::Direct { transport },
            DispatchMode::Queued => {
                let queue = Arc::new(RelayQueue::new(self.cfg.maxsize));
                let relay = tokio::spawn(relay_loop(
                    id,
                    transport,
                    Arc::clone(&queue),
                    cancel.clone(),
                    Arc::clone(&send_times),
                    Arc::clone(&pong),
                    self.cfg.ping_interval,
                    self.cfg.ping_timeout,
                    self.departures_tx.clone(),
                ));
                ClientLink::Queued { queue, relay }
            }
        };

        self.clients.insert(
            id,
            ClientHandle {
                peer: peer.clone(),
                link,
                health: ClientHealth::new(),
                send_times,
                pong: Arc::clone(&pong),
                cancel: cancel.clone(),
            },
        );
        log::info!("Client {} ({}) connected. Total: {}", id, peer, self.clients.len());
        Admission { id, pong, cancel }
    }

    /// Fans one frame out to every registered client using the configured
    /// strategy.
    pub async fn broadcast(&mut self, frame: &Arc<str>) {
        match self.cfg.mode {
            DispatchMode::Naive => self.broadcast_naive(frame).await,
            DispatchMode::Queued => self.broadcast_queued(frame).await,
        }
    }

    /// Sequential fanout: one awaited socket write per client. No client is
    /// skipped mid-pass; clients whose write failed are removed after the
    /// pass completes.
    async fn broadcast_naive(&mut self, frame: &Arc<str>) {
        let mut failed: Vec<ClientId> = Vec::new();
        for (id, handle) in self.clients.iter_mut() {
            if let ClientLink::Direct { transport } = &mut handle.link {
                if let Err(err) = transport.send_text(frame).await {
                    log::info!("Client {} write failed: {}", id, err);
                    failed.push(*id);
                }
            }
        }
        for id in failed {
            self.remove_client(id).await;
        }
    }

    /// Queue fanout: non-blocking drop-oldest enqueue per client, followed
    /// by a health verdict. Clients voted out are removed after the pass.
    async fn broadcast_queued(&mut self, frame: &Arc<str>) {
        let now = Instant::now();
        let mut evicted: Vec<(ClientId, String)> = Vec::new();
        for (id, handle) in self.clients.iter_mut() {
            if let ClientLink::Queued { queue, .. } = &handle.link {
                let outcome = queue.push_or_displace(Arc::clone(frame));
                handle.health.record_enqueue(outcome, now);
                if let Verdict::Evict(reason) = handle.health.verdict(&self.cfg.policy, now) {
                    evicted.push((
                        *id,
                        format!("{}, drops: {}", reason, handle.health.drops_total()),
                    ));
                }
            }
        }
        for (id, detail) in evicted {
            log::info!("Auto-disconnecting slow client {} ({})", id, detail);
            self.remove_client(id).await;
        }
    }

    /// Naive-mode keepalive: ping every client and evict the ones whose
    /// pong clock went stale. Queued-mode relays run their own keepalive.
    pub async fn keepalive_pass(&mut self) {
        if self.cfg.mode != DispatchMode::Naive {
            return;
        }
        let stale_after = self.cfg.ping_interval + self.cfg.ping_timeout;
        let mut dead: Vec<ClientId> = Vec::new();
        for (id, handle) in self.clients.iter_mut() {
            if handle.pong.idle_for() > stale_after {
                log::info!("Client {} keepalive timeout", id);
                dead.push(*id);
                continue;
            }
            if let ClientLink::Direct { transport } = &mut handle.link {
                if transport.send_ping().await.is_err() {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.remove_client(id).await;
        }
    }

    /// Unregisters a client: cancels its relay and inbound reader, waits
    /// for the relay to wind down (bounded by [`RELAY_GRACE`]), closes the
    /// socket, and drops the registry entry.
    ///
    /// Idempotent: removing an id that is already gone is a no-op returning
    /// false, so the relay exit path and the eviction path may race freely.
    pub async fn remove_client(&mut self, id: ClientId) -> bool {
        let Some(handle) = self.clients.remove(&id) else {
            return false;
        };
        handle.cancel.cancel();
        match handle.link {
            ClientLink::Direct { mut transport } => transport.close().await,
            ClientLink::Queued { relay, .. } => {
                let abort = relay.abort_handle();
                if tokio::time::timeout(RELAY_GRACE, relay).await.is_err() {
                    log::warn!("Client {} relay did not stop in time; aborting", id);
                    abort.abort();
                }
            }
        }
        self.disconnects_total += 1;
        log::info!("Client {} disconnected. Total: {}", id, self.clients.len());
        true
    }

    /// Closes every client. Used at shutdown.
    pub async fn shutdown(&mut self) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.remove_client(id).await;
        }
    }

    pub fn connected(&self) -> usize {
        self.clients.len()
    }

    pub fn disconnects_total(&self) -> u64 {
        self.disconnects_total
    }

    pub fn mode(&self) -> DispatchMode {
        self.cfg.mode
    }

    /// Registry counters for the metrics worker, ordered by client id.
    pub fn snapshot(&self) -> DispatcherSnapshot {
        let mut clients: Vec<ClientSnapshot> = self
            .clients
            .iter()
            .map(|(id, handle)| ClientSnapshot {
                id: *id,
                peer: handle.peer.clone(),
                queue_len: match &handle.link {
                    ClientLink::Queued { queue, .. } => queue.len(),
                    ClientLink::Direct { .. } => 0,
                },
                drops_total: handle.health.drops_total(),
                send_latency_ms: handle
                    .send_times
                    .lock()
                    .expect("send times lock poisoned")
                    .mean_ms(),
            })
            .collect();
        clients.sort_by_key(|snapshot| snapshot.id);
        DispatcherSnapshot {
            connected: self.clients.len(),
            disconnects_total: self.disconnects_total,
            clients,
        }
    }
}

/// Relay worker: drains one client's queue onto its socket in FIFO order
/// and runs the keepalive ping. Exits on cancellation (eviction), on a dead
/// transport, or when the peer stops answering pings; the latter two are
/// reported as a [`Departure`].
#[allow(clippy::too_many_arguments)]
async fn relay_loop<T: ClientTransport>(
    id: ClientId,
    mut transport: T,
    queue: Arc<RelayQueue>,
    cancel: CancellationToken,
    send_times: Arc<Mutex<SendTimes>>,
    pong: Arc<PongClock>,
    ping_interval: Duration,
    ping_timeout: Duration,
    departures: mpsc::UnboundedSender<Departure>,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick completes immediately

    let reason = loop {
        tokio::select! {
            // Cancellation wins over pending frames so evictions are prompt.
            biased;
            _ = cancel.cancelled() => {
                transport.close().await;
                return;
            }
            frame = queue.recv() => {
                let started = Instant::now();
                match transport.send_text(&frame).await {
                    Ok(()) => {
                        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                        send_times
                            .lock()
                            .expect("send times lock poisoned")
                            .record(elapsed_ms);
                    }
                    Err(TransportError::Closed) => break DepartReason::TransportClosed,
                    Err(TransportError::Other(msg)) => {
                        log::info!("Client {} send error: {}", id, msg);
                        break DepartReason::TransportError(msg);
                    }
                }
            }
            _ = ping.tick() => {
                if pong.idle_for() > ping_interval + ping_timeout {
                    break DepartReason::KeepaliveTimeout;
                }
                if transport.send_ping().await.is_err() {
                    break DepartReason::TransportClosed;
                }
            }
        }
    };
    transport.close().await;
    let _ = departures.send(Departure { id, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::sleep;

    #[derive(Clone)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<String>>>,
        fail: Arc<AtomicBool>,
        delay: Duration,
    }

    impl MockTransport {
        fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> (Self, Arc<Mutex<Vec<String>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    sent: Arc::clone(&sent),
                    fail: Arc::new(AtomicBool::new(false)),
                    delay,
                },
                sent,
            )
        }

        fn failing() -> Self {
            let (mut transport, _) = Self::new();
            transport.fail = Arc::new(AtomicBool::new(true));
            transport
        }
    }

    #[async_trait]
    impl ClientTransport for MockTransport {
        async fn send_text(&mut self, frame: &str) -> Result<(), TransportError> {
            if self.delay > Duration::ZERO {
                sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(frame.to_string());
            Ok(())
        }

        async fn send_ping(&mut self) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn config(mode: DispatchMode, maxsize: usize, drop_limit: usize) -> DispatcherConfig {
        DispatcherConfig {
            mode,
            maxsize,
            policy: HealthPolicy {
                drop_limit,
                full_timeout: Duration::from_secs(60),
            },
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(20),
        }
    }

    fn frame(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[test]
    fn envelope_serializes_the_exact_wire_fields() {
        let envelope = Envelope {
            seq: 7,
            ts_send: 1700000000.25,
            payload_b64: "aGVsbG8=",
        };
        let text = envelope.to_frame().expect("serializable");
        let value: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        let object = value.as_object().expect("object frame");
        assert_eq!(object.len(), 3);
        assert_eq!(object["seq"], 7);
        assert_eq!(object["ts_send"], 1700000000.25);
        assert_eq!(object["payload_b64"], "aGVsbG8=");
    }

    #[tokio::test]
    async fn admission_ids_increase_from_one() {
        let (mut dispatcher, _departures) =
            Dispatcher::new(config(DispatchMode::Naive, 4, 50));
        let first = dispatcher.admit(MockTransport::new().0, "a".into());
        let second = dispatcher.admit(MockTransport::new().0, "b".into());
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(dispatcher.connected(), 2);
    }

    #[tokio::test]
    async fn naive_broadcast_reaches_every_client_in_order() {
        let (mut dispatcher, _departures) =
            Dispatcher::new(config(DispatchMode::Naive, 4, 50));
        let (transport_a, sent_a) = MockTransport::new();
        let (transport_b, sent_b) = MockTransport::new();
        dispatcher.admit(transport_a, "a".into());
        dispatcher.admit(transport_b, "b".into());

        for text in ["s1", "s2", "s3"] {
            dispatcher.broadcast(&frame(text)).await;
        }

        let expected = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        assert_eq!(*sent_a.lock().unwrap(), expected);
        assert_eq!(*sent_b.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn naive_failed_write_evicts_after_the_pass() {
        let (mut dispatcher, _departures) =
            Dispatcher::new(config(DispatchMode::Naive, 4, 50));
        dispatcher.admit(MockTransport::failing(), "dead".into());
        let (healthy, sent) = MockTransport::new();
        dispatcher.admit(healthy, "alive".into());

        dispatcher.broadcast(&frame("s1")).await;

        // The healthy client still got the frame within the same pass.
        assert_eq!(*sent.lock().unwrap(), vec!["s1".to_string()]);
        assert_eq!(dispatcher.connected(), 1);
        assert_eq!(dispatcher.disconnects_total(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn queued_overflow_drops_oldest_and_counts() {
        let (mut dispatcher, _departures) =
            Dispatcher::new(config(DispatchMode::Queued, 2, 50));
        let (transport, sent) = MockTransport::new();
        dispatcher.admit(transport, "slow".into());

        // Five frames enqueued back to back; the relay cannot interleave
        // because nothing here yields to the scheduler.
        for text in ["f1", "f2", "f3", "f4", "f5"] {
            dispatcher.broadcast(&frame(text)).await;
        }

        let snapshot = dispatcher.snapshot();
        assert_eq!(snapshot.clients.len(), 1);
        assert_eq!(snapshot.clients[0].queue_len, 2);
        assert_eq!(snapshot.clients[0].drops_total, 3);

        // Let the relay drain: only the two newest frames survive, in order.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *sent.lock().unwrap(),
            vec!["f4".to_string(), "f5".to_string()]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn queued_slow_client_does_not_stall_fast_client() {
        let (mut dispatcher, _departures) =
            Dispatcher::new(config(DispatchMode::Queued, 2, 50));
        let (fast, fast_sent) = MockTransport::new();
        let (slow, slow_sent) = MockTransport::with_delay(Duration::from_millis(500));
        let fast_id = dispatcher.admit(fast, "fast".into()).id;
        let slow_id = dispatcher.admit(slow, "slow".into()).id;

        // Broadcast with small pauses so the relays get scheduled. The fast
        // relay drains each frame immediately; the slow relay spends half a
        // second on its first write and overflows.
        for text in ["f1", "f2", "f3", "f4", "f5"] {
            dispatcher.broadcast(&frame(text)).await;
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(50)).await;

        // The fast client has everything, in order, despite the slow peer.
        assert_eq!(
            *fast_sent.lock().unwrap(),
            vec!["f1", "f2", "f3", "f4", "f5"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );

        let snapshot = dispatcher.snapshot();
        let drops_of = |id: ClientId| {
            snapshot
                .clients
                .iter()
                .find(|c| c.id == id)
                .expect("client present")
                .drops_total
        };
        assert_eq!(drops_of(fast_id), 0);
        // The slow client shed old frames instead of blocking anyone.
        assert!(drops_of(slow_id) >= 1);
        assert!(slow_sent.lock().unwrap().len() <= 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn drop_limit_breach_evicts_the_client() {
        let (mut dispatcher, _departures) =
            Dispatcher::new(config(DispatchMode::Queued, 1, 3));
        let (transport, _sent) = MockTransport::with_delay(Duration::from_secs(5));
        dispatcher.admit(transport, "stuck".into());

        // First frame fills the queue; each later frame displaces and the
        // window exceeds the limit on the fifth drop.
        for text in ["f1", "f2", "f3", "f4", "f5", "f6"] {
            dispatcher.broadcast(&frame(text)).await;
        }

        assert_eq!(dispatcher.connected(), 0);
        assert_eq!(dispatcher.disconnects_total(), 1);
    }

    #[tokio::test]
    async fn remove_client_is_idempotent() {
        let (mut dispatcher, _departures) =
            Dispatcher::new(config(DispatchMode::Queued, 4, 50));
        let admission = dispatcher.admit(MockTransport::new().0, "once".into());

        assert!(dispatcher.remove_client(admission.id).await);
        assert!(!dispatcher.remove_client(admission.id).await);
        assert_eq!(dispatcher.disconnects_total(), 1);
        assert_eq!(dispatcher.connected(), 0);
    }

    #[tokio::test]
    async fn removal_cancels_the_inbound_reader_token() {
        let (mut dispatcher, _departures) =
            Dispatcher::new(config(DispatchMode::Queued, 4, 50));
        let admission = dispatcher.admit(MockTransport::new().0, "evicted".into());
        assert!(!admission.cancel.is_cancelled());

        dispatcher.remove_client(admission.id).await;
        assert!(admission.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn dead_transport_reports_a_departure() {
        let (mut dispatcher, mut departures) =
            Dispatcher::new(config(DispatchMode::Queued, 4, 50));
        let admission = dispatcher.admit(MockTransport::failing(), "flaky".into());

        dispatcher.broadcast(&frame("s1")).await;

        let departure = tokio::time::timeout(Duration::from_secs(1), departures.recv())
            .await
            .expect("departure within deadline")
            .expect("channel open");
        assert_eq!(departure.id, admission.id);
        assert!(matches!(departure.reason, DepartReason::TransportClosed));

        // The engine folds the departure back into a removal.
        assert!(dispatcher.remove_client(departure.id).await);
        assert_eq!(dispatcher.connected(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_every_client() {
        let (mut dispatcher, _departures) =
            Dispatcher::new(config(DispatchMode::Queued, 4, 50));
        for peer in ["a", "b", "c"] {
            dispatcher.admit(MockTransport::new().0, peer.into());
        }

        dispatcher.shutdown().await;
        assert_eq!(dispatcher.connected(), 0);
        assert_eq!(dispatcher.disconnects_total(), 3);
    }
}
