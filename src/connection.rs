//! Client connection manager.
//!
//! Owns one WebSocket transport channel and everything around it:
//! the authentication handshake, heartbeat with latency tracking,
//! exponential-backoff reconnection, and a health snapshot that is
//! queryable at any time without blocking.
//!
//! ```text
//! connect(token, user)
//!       │
//!       ▼
//! ┌────────────┐  Hello/Welcome   ┌──────────────────────────┐
//! │ establish  │ ───────────────► │ reader / writer / heart- │
//! └─────┬──────┘                  │ beat tasks (per socket)  │
//!       │ socket drops            └──────────────────────────┘
//!       ▼
//! ┌────────────┐  base·2^n capped, up to max attempts
//! │ supervisor │ ───► reconnect, re-join rooms, resume
//! └────────────┘
//! ```
//!
//! Authentication failures are fatal and never retried; transient
//! transport failures feed the reconnect ladder.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::optimistic::OptimisticCoordinator;
use crate::protocol::{Envelope, Frame, ProtocolError, UserIdentity};

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Explicit `disconnect()` call.
    Client,
    /// Server closed the socket.
    Server,
    /// Network failure or heartbeat loss.
    Transport,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Transport => "transport",
        }
    }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    Reconnecting { attempt: u32 },
    MaxReconnectAttemptsReached,
    /// Heartbeat round-trip measured.
    Ping { latency: Duration },
    /// Server confirmed a pricing update.
    Confirmed { update_id: Uuid, sequence: u64 },
    Error(String),
}

/// Connection manager errors.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Token rejected by the server. Fatal; no auto-retry.
    Authentication(String),
    /// Handshake exceeded the configured deadline.
    ConnectionTimeout,
    /// Backoff exhausted; manual reconnect required.
    MaxReconnectAttemptsReached,
    ConnectionClosed,
    Protocol(ProtocolError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication(reason) => write!(f, "Authentication rejected: {reason}"),
            Self::ConnectionTimeout => write!(f, "Connection timeout"),
            Self::MaxReconnectAttemptsReached => write!(f, "Max reconnect attempts reached"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

/// Delay before reconnect attempt `attempt` (0-based): `base * 2^attempt`,
/// capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base.checked_mul(factor.min(u32::MAX as u64) as u32)
        .unwrap_or(max)
        .min(max)
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub handshake_timeout: Duration,
    /// Fallback heartbeat interval; the server's `Welcome` value wins.
    pub heartbeat_interval: Duration,
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Rolling window size for the latency average.
    pub ping_window: usize,
    /// Consecutive missed pongs that force a reconnect.
    pub heartbeat_failure_threshold: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9470".to_string(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            ping_window: 10,
            heartbeat_failure_threshold: 3,
        }
    }
}

/// Non-blocking health snapshot.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub connected: bool,
    pub reconnecting: bool,
    /// Most recent round-trip.
    pub ping: Option<Duration>,
    /// Rolling average over the configured window.
    pub avg_ping: Option<Duration>,
    /// failed / total operations.
    pub error_rate: f64,
    pub reconnect_attempts: u32,
    pub uptime: Duration,
    pub downtime: Duration,
}

struct HealthInner {
    pings: VecDeque<Duration>,
    connected_at: Option<Instant>,
    disconnected_at: Option<Instant>,
}

/// Tracks connection health. All reads are lock-light and never block on
/// transport operations.
pub struct HealthMonitor {
    window: usize,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_attempts: AtomicU32,
    ops_total: AtomicU64,
    ops_failed: AtomicU64,
    inner: Mutex<HealthInner>,
}

impl HealthMonitor {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            ops_total: AtomicU64::new(0),
            ops_failed: AtomicU64::new(0),
            inner: Mutex::new(HealthInner {
                pings: VecDeque::new(),
                connected_at: None,
                disconnected_at: None,
            }),
        }
    }

    pub fn record_ping(&self, latency: Duration) {
        self.ops_total.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.pings.push_back(latency);
        while inner.pings.len() > self.window {
            inner.pings.pop_front();
        }
    }

    pub fn record_failure(&self) {
        self.ops_total.fetch_add(1, Ordering::Relaxed);
        self.ops_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_connected(&self, now: Instant) {
        self.connected.store(true, Ordering::Relaxed);
        self.reconnecting.store(false, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.connected_at = Some(now);
        inner.disconnected_at = None;
    }

    pub fn mark_disconnected(&self, now: Instant) {
        self.connected.store(false, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.connected_at = None;
        if inner.disconnected_at.is_none() {
            inner.disconnected_at = Some(now);
        }
    }

    pub fn set_reconnecting(&self, attempt: u32) {
        self.reconnecting.store(true, Ordering::Relaxed);
        self.reconnect_attempts.store(attempt, Ordering::Relaxed);
    }

    pub fn stop_reconnecting(&self) {
        self.reconnecting.store(false, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        let inner = self.inner.lock().unwrap();
        let total = self.ops_total.load(Ordering::Relaxed);
        let failed = self.ops_failed.load(Ordering::Relaxed);
        let avg_ping = if inner.pings.is_empty() {
            None
        } else {
            Some(inner.pings.iter().sum::<Duration>() / inner.pings.len() as u32)
        };
        HealthSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            reconnecting: self.reconnecting.load(Ordering::Relaxed),
            ping: inner.pings.back().copied(),
            avg_ping,
            error_rate: if total == 0 {
                0.0
            } else {
                failed as f64 / total as f64
            },
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            uptime: inner
                .connected_at
                .map(|t| now.duration_since(t))
                .unwrap_or_default(),
            downtime: inner
                .disconnected_at
                .map(|t| now.duration_since(t))
                .unwrap_or_default(),
        }
    }
}

struct Shared {
    config: ClientConfig,
    bus: Arc<EventBus>,
    health: HealthMonitor,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    desired_rooms: Mutex<HashSet<String>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    intentional: AtomicBool,
    credentials: Mutex<Option<(String, UserIdentity)>>,
    coordinator: Mutex<Option<Arc<OptimisticCoordinator>>>,
    connection_id: Mutex<Option<Uuid>>,
    ping_seq: AtomicU64,
    outstanding_pings: Mutex<HashMap<u64, Instant>>,
    consecutive_ping_failures: AtomicU32,
    /// Shutdown signal for the current socket's tasks; replaced on every
    /// (re)connect. `disconnect()` and the heartbeat failure threshold both
    /// fire it, and the value is latched so a signal sent between poll
    /// iterations is still observed.
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }

    fn send_frame(&self, frame: Frame) -> Result<(), ClientError> {
        let outgoing = self.outgoing.lock().unwrap();
        match *outgoing {
            Some(ref tx) => tx.send(frame).map_err(|_| ClientError::ConnectionClosed),
            None => Err(ClientError::ConnectionClosed),
        }
    }
}

/// The connection manager. One instance per client process; constructed
/// explicitly and shared by reference (no global instance).
pub struct ConnectionManager {
    shared: Arc<Shared>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, bus: Arc<EventBus>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let ping_window = config.ping_window;
        Self {
            shared: Arc::new(Shared {
                config,
                bus,
                health: HealthMonitor::new(ping_window),
                event_tx,
                desired_rooms: Mutex::new(HashSet::new()),
                outgoing: Mutex::new(None),
                intentional: AtomicBool::new(false),
                credentials: Mutex::new(None),
                coordinator: Mutex::new(None),
                connection_id: Mutex::new(None),
                ping_seq: AtomicU64::new(0),
                outstanding_pings: Mutex::new(HashMap::new()),
                consecutive_ping_failures: AtomicU32::new(0),
                shutdown: Mutex::new(None),
            }),
            event_rx: Mutex::new(Some(event_rx)),
            supervisor: Mutex::new(None),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    /// Route server confirmations into an optimistic coordinator.
    pub fn attach_coordinator(&self, coordinator: Arc<OptimisticCoordinator>) {
        *self.shared.coordinator.lock().unwrap() = Some(coordinator);
    }

    /// Establish the transport channel and start heartbeat, health
    /// monitoring, and the reconnect supervisor.
    ///
    /// Fails with `Authentication` if the server rejects the token (never
    /// retried) and `ConnectionTimeout` if the handshake misses its
    /// deadline.
    pub async fn connect(&self, token: &str, user: UserIdentity) -> Result<(), ClientError> {
        self.shared.intentional.store(false, Ordering::Relaxed);
        *self.shared.credentials.lock().unwrap() = Some((token.to_string(), user));

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        establish(self.shared.clone(), closed_tx.clone()).await?;

        let shared = self.shared.clone();
        let handle = tokio::spawn(supervise(shared, closed_tx, closed_rx));
        if let Some(old) = self.supervisor.lock().unwrap().replace(handle) {
            old.abort();
        }
        Ok(())
    }

    /// Deterministic teardown: stops the heartbeat and reconnect machinery,
    /// closes the socket, and emits `Disconnected(Client)`. The server sees
    /// a Close frame immediately rather than after heartbeat failures.
    pub fn disconnect(&self) {
        self.shared.intentional.store(true, Ordering::Relaxed);
        if let Some(shutdown) = self.shared.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }
        *self.shared.outgoing.lock().unwrap() = None;
        self.shared.bus.clear_forwarder();
    }

    /// Join a room. The room is remembered and automatically re-joined
    /// after every reconnect.
    pub fn join_room(&self, room_id: &str) {
        self.shared
            .desired_rooms
            .lock()
            .unwrap()
            .insert(room_id.to_string());
        let _ = self.shared.send_frame(Frame::Join {
            room_id: room_id.to_string(),
        });
    }

    /// Leave a room and forget it for reconnect purposes.
    pub fn leave_room(&self, room_id: &str) {
        self.shared
            .desired_rooms
            .lock()
            .unwrap()
            .remove(room_id);
        let _ = self.shared.send_frame(Frame::Leave {
            room_id: room_id.to_string(),
        });
    }

    /// Send an envelope directly over the transport, bypassing the bus.
    pub fn send_envelope(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.shared.send_frame(Frame::Event(envelope))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outgoing.lock().unwrap().is_some()
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        *self.shared.connection_id.lock().unwrap()
    }

    pub fn desired_rooms(&self) -> Vec<String> {
        self.shared
            .desired_rooms
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect()
    }

    /// Health snapshot; never blocks on transport operations.
    pub fn health(&self) -> HealthSnapshot {
        self.shared.health.snapshot(Instant::now())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Single connection attempt: dial, handshake, spawn per-socket tasks.
async fn establish(
    shared: Arc<Shared>,
    closed_tx: mpsc::UnboundedSender<DisconnectReason>,
) -> Result<(), ClientError> {
    let (token, user) = shared
        .credentials
        .lock()
        .unwrap()
        .clone()
        .ok_or(ClientError::ConnectionClosed)?;

    let url = shared.config.server_url.clone();
    let connect = tokio_tungstenite::connect_async(url.as_str());
    let (ws_stream, _) = tokio::time::timeout(shared.config.handshake_timeout, connect)
        .await
        .map_err(|_| ClientError::ConnectionTimeout)?
        .map_err(|e| {
            log::debug!("Dial failed for {url}: {e}");
            ClientError::ConnectionClosed
        })?;

    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    // Handshake: Hello, then Welcome or AuthRejected within the deadline.
    let hello = Frame::Hello {
        token,
        user: user.clone(),
    };
    ws_writer
        .send(Message::Binary(hello.encode()?.into()))
        .await
        .map_err(|_| ClientError::ConnectionClosed)?;

    let heartbeat_interval = loop {
        let msg = tokio::time::timeout(shared.config.handshake_timeout, ws_reader.next())
            .await
            .map_err(|_| ClientError::ConnectionTimeout)?;
        match msg {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                match Frame::decode(&bytes)? {
                    Frame::Welcome {
                        connection_id,
                        heartbeat_interval_ms,
                    } => {
                        *shared.connection_id.lock().unwrap() = Some(connection_id);
                        break Duration::from_millis(heartbeat_interval_ms.max(100));
                    }
                    Frame::AuthRejected { reason } => {
                        return Err(ClientError::Authentication(reason));
                    }
                    other => {
                        log::warn!("Unexpected frame during handshake: {other:?}");
                    }
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return Err(ClientError::ConnectionClosed),
        }
    };

    // Per-socket shutdown signal, fired by disconnect() or the heartbeat
    // failure threshold.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    *shared.shutdown.lock().unwrap() = Some(shutdown_tx.clone());

    // Writer task: outgoing frames onto the socket. On shutdown it performs
    // the close handshake so the server drops the member immediately.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let mut writer_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let encoded = match frame.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::error!("Failed to encode outgoing frame: {e}");
                            continue;
                        }
                    };
                    if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                        break;
                    }
                }
                _ = writer_shutdown.changed() => break,
            }
        }
        let _ = ws_writer.close().await;
    });

    *shared.outgoing.lock().unwrap() = Some(out_tx.clone());
    shared.outstanding_pings.lock().unwrap().clear();
    shared.consecutive_ping_failures.store(0, Ordering::Relaxed);

    // Bus forwarder: locally emitted envelopes go out as Event frames.
    let (fwd_tx, mut fwd_rx) = mpsc::unbounded_channel::<Envelope>();
    shared.bus.set_forwarder(fwd_tx);
    let fwd_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(envelope) = fwd_rx.recv().await {
            if fwd_out.send(Frame::Event(envelope)).is_err() {
                break;
            }
        }
    });

    // Re-join previously joined rooms before resuming normal emission so
    // server-side state reconverges with client intent.
    {
        let rooms = shared.desired_rooms.lock().unwrap().clone();
        for room_id in rooms {
            let _ = out_tx.send(Frame::Join { room_id });
        }
    }

    shared.health.mark_connected(Instant::now());
    shared.emit(ClientEvent::Connected);
    log::info!("Connected to {url} as {}", user.name);

    // Heartbeat task.
    let hb_shared = shared.clone();
    let hb_out = out_tx.clone();
    let hb_shutdown_tx = shutdown_tx.clone();
    let mut hb_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = hb_shutdown_rx.changed() => break,
            }

            // Pings still outstanding after a full interval count as
            // failed operations.
            let missed = {
                let now = Instant::now();
                let mut outstanding = hb_shared.outstanding_pings.lock().unwrap();
                let stale: Vec<u64> = outstanding
                    .iter()
                    .filter(|(_, sent)| now.duration_since(**sent) >= heartbeat_interval)
                    .map(|(seq, _)| *seq)
                    .collect();
                for seq in &stale {
                    outstanding.remove(seq);
                }
                stale.len() as u32
            };
            if missed > 0 {
                for _ in 0..missed {
                    hb_shared.health.record_failure();
                }
                let consecutive = hb_shared
                    .consecutive_ping_failures
                    .fetch_add(missed, Ordering::Relaxed)
                    + missed;
                if consecutive >= hb_shared.config.heartbeat_failure_threshold {
                    log::warn!("{consecutive} consecutive heartbeat failures; forcing reconnect");
                    let _ = hb_shutdown_tx.send(true);
                    break;
                }
            }

            let seq = hb_shared.ping_seq.fetch_add(1, Ordering::Relaxed);
            hb_shared
                .outstanding_pings
                .lock()
                .unwrap()
                .insert(seq, Instant::now());
            if hb_out.send(Frame::Ping { seq }).is_err() {
                break;
            }
        }
    });

    // Reader task: inbound frames until the socket drops or a forced close.
    let rd_shared = shared.clone();
    let mut rd_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            match Frame::decode(&bytes) {
                                Ok(frame) => handle_inbound(&rd_shared, frame),
                                Err(e) => log::warn!("Undecodable frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break DisconnectReason::Server,
                        Some(Err(e)) => {
                            log::warn!("Transport error: {e}");
                            break DisconnectReason::Transport;
                        }
                        Some(Ok(_)) => {}
                    }
                }
                _ = rd_shutdown.changed() => {
                    if rd_shared.intentional.load(Ordering::Relaxed) {
                        break DisconnectReason::Client;
                    }
                    break DisconnectReason::Transport;
                }
            }
        };

        *rd_shared.outgoing.lock().unwrap() = None;
        rd_shared.bus.clear_forwarder();
        rd_shared.health.mark_disconnected(Instant::now());
        rd_shared.emit(ClientEvent::Disconnected { reason });
        log::info!("Disconnected ({})", reason.as_str());
        let _ = closed_tx.send(reason);
    });

    Ok(())
}

fn handle_inbound(shared: &Arc<Shared>, frame: Frame) {
    match frame {
        Frame::Event(envelope) => {
            shared.bus.dispatch_remote(&envelope);
        }
        Frame::Confirm { update_id, sequence } => {
            if let Some(coordinator) = shared.coordinator.lock().unwrap().clone() {
                coordinator.confirm(update_id, sequence);
            }
            shared.emit(ClientEvent::Confirmed { update_id, sequence });
        }
        Frame::Pong { seq } => {
            let sent = shared.outstanding_pings.lock().unwrap().remove(&seq);
            if let Some(sent) = sent {
                let latency = sent.elapsed();
                shared.health.record_ping(latency);
                shared
                    .consecutive_ping_failures
                    .store(0, Ordering::Relaxed);
                shared.emit(ClientEvent::Ping { latency });
            }
        }
        other => {
            log::debug!("Unhandled inbound frame: {other:?}");
        }
    }
}

/// Reconnect supervisor: waits for the socket to drop and climbs the
/// backoff ladder. Attempts never exceed the configured maximum and the
/// counter resets to zero after every successful connection.
async fn supervise(
    shared: Arc<Shared>,
    closed_tx: mpsc::UnboundedSender<DisconnectReason>,
    mut closed_rx: mpsc::UnboundedReceiver<DisconnectReason>,
) {
    'outer: while let Some(reason) = closed_rx.recv().await {
        if reason == DisconnectReason::Client || shared.intentional.load(Ordering::Relaxed) {
            break;
        }

        for attempt in 1..=shared.config.max_reconnect_attempts {
            shared.health.set_reconnecting(attempt);
            shared.emit(ClientEvent::Reconnecting { attempt });
            let delay = backoff_delay(
                attempt - 1,
                shared.config.base_reconnect_delay,
                shared.config.max_reconnect_delay,
            );
            tokio::time::sleep(delay).await;

            if shared.intentional.load(Ordering::Relaxed) {
                break 'outer;
            }

            match establish(shared.clone(), closed_tx.clone()).await {
                Ok(()) => {
                    log::info!("Reconnected on attempt {attempt}");
                    continue 'outer;
                }
                Err(ClientError::Authentication(reason)) => {
                    // Fatal; surface and stop retrying.
                    shared.health.stop_reconnecting();
                    shared.emit(ClientEvent::Error(format!(
                        "Authentication rejected during reconnect: {reason}"
                    )));
                    break 'outer;
                }
                Err(e) => {
                    log::debug!("Reconnect attempt {attempt} failed: {e}");
                }
            }
        }

        shared.health.stop_reconnecting();
        shared.emit(ClientEvent::MaxReconnectAttemptsReached);
        log::error!(
            "Gave up after {} reconnect attempts",
            shared.config.max_reconnect_attempts
        );
        break;
    }
}
