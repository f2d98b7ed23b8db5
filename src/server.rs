//! Collaboration server.
//!
//! Accepts WebSocket connections, authenticates them with a pluggable
//! token verifier, and routes frames through the room registry:
//!
//! ```text
//!           ┌──────────────┐
//! client ──►│ handshake    │ Hello ──► verify ──► Welcome / AuthRejected
//!           └──────┬───────┘
//!                  ▼
//!           ┌──────────────┐   Join/Leave ──► RoomRegistry
//!           │ frame loop   │   Event ──────► broadcast (sender excluded)
//!           │ (per socket) │                 + Confirm for pricing
//!           └──────────────┘   Ping ───────► Pong
//! ```
//!
//! Pricing events are assigned a monotonically increasing sequence number
//! and confirmed back to the sender only; the sequence gives conflicting
//! edits of the same field a total order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{EventType, Frame, UserIdentity};
use crate::rooms::{RegistryConfig, RoomMember, RoomRegistry};

/// Decides whether a handshake token is acceptable.
pub type TokenVerifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Server configuration, overridable through `ESTIMATE_COLLAB_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Origins accepted during the HTTP upgrade; empty allows any.
    pub allowed_origins: Vec<String>,
    pub heartbeat_interval_secs: u64,
    /// Deadline for the Hello/Welcome handshake.
    pub connection_timeout_secs: u64,
    pub max_connections: usize,
    pub room_retention_secs: u64,
    pub gc_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9470".to_string(),
            allowed_origins: Vec::new(),
            heartbeat_interval_secs: 30,
            connection_timeout_secs: 10,
            max_connections: 500,
            room_retention_secs: 30 * 60,
            gc_interval_secs: 5 * 60,
        }
    }
}

impl ServerConfig {
    /// Build from the environment, falling back to defaults for unset or
    /// unparsable values (with a warning).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("ESTIMATE_COLLAB_BIND") {
            config.bind_addr = bind;
        }
        if let Ok(origins) = std::env::var("ESTIMATE_COLLAB_ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        config.heartbeat_interval_secs = env_parse(
            "ESTIMATE_COLLAB_HEARTBEAT_SECS",
            config.heartbeat_interval_secs,
        );
        config.connection_timeout_secs = env_parse(
            "ESTIMATE_COLLAB_CONN_TIMEOUT_SECS",
            config.connection_timeout_secs,
        );
        config.max_connections =
            env_parse("ESTIMATE_COLLAB_MAX_CONNECTIONS", config.max_connections);
        config.room_retention_secs = env_parse(
            "ESTIMATE_COLLAB_ROOM_RETENTION_SECS",
            config.room_retention_secs,
        );
        config
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Invalid value for {key}: {raw:?}; using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Running counters, all relaxed atomics.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    confirmed_updates: AtomicU64,
}

/// Point-in-time view of [`ServerStats`].
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub confirmed_updates: u64,
    pub active_rooms: usize,
}

impl ServerStats {
    fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn update_confirmed(&self) {
        self.confirmed_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn snapshot(&self, active_rooms: usize) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            confirmed_updates: self.confirmed_updates.load(Ordering::Relaxed),
            active_rooms,
        }
    }
}

/// The collaboration server. Owns the room registry and the pricing
/// sequence counter.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<ServerStats>,
    verifier: TokenVerifier,
    sequence: Arc<AtomicU64>,
}

impl CollabServer {
    /// Server with the default verifier: any non-empty token is accepted.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_verifier(config, Arc::new(|token: &str| !token.is_empty()))
    }

    pub fn with_verifier(config: ServerConfig, verifier: TokenVerifier) -> Self {
        let registry = Arc::new(RoomRegistry::new(RegistryConfig {
            retention: Duration::from_secs(config.room_retention_secs),
            sweep_interval: Duration::from_secs(config.gc_interval_secs),
        }));
        Self {
            config,
            registry,
            stats: Arc::new(ServerStats::default()),
            verifier,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    pub async fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.registry.room_count().await)
    }

    /// Bind and serve until the task is cancelled.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.config.bind_addr);

        let _gc = self.registry.spawn_gc();

        loop {
            let (stream, peer) = listener.accept().await?;

            if self.stats.active_connections() >= self.config.max_connections as u64 {
                log::warn!("Rejecting {peer}: connection limit reached");
                drop(stream);
                continue;
            }

            let config = self.config.clone();
            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let verifier = self.verifier.clone();
            let sequence = self.sequence.clone();
            tokio::spawn(async move {
                stats.connection_opened();
                if let Err(e) =
                    handle_connection(stream, config, registry, &stats, verifier, sequence).await
                {
                    log::debug!("Connection from {peer} ended with error: {e}");
                }
                stats.connection_closed();
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: &ServerStats,
    verifier: TokenVerifier,
    sequence: Arc<AtomicU64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let allowed_origins = config.allowed_origins.clone();
    let origin_check = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if allowed_origins.is_empty() {
            return Ok(response);
        }
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if allowed_origins.iter().any(|a| a == origin) {
            Ok(response)
        } else {
            log::warn!("Rejected upgrade from origin {origin:?}");
            let mut response = ErrorResponse::new(Some("origin not allowed".to_string()));
            *response.status_mut() = StatusCode::FORBIDDEN;
            Err(response)
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, origin_check).await?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let handshake_deadline = Duration::from_secs(config.connection_timeout_secs);
    let user = match authenticate(&mut ws_reader, handshake_deadline, &verifier).await {
        Ok(user) => user,
        Err(reason) => {
            let rejected = Frame::AuthRejected {
                reason: reason.clone(),
            };
            if let Ok(bytes) = rejected.encode() {
                let _ = ws_writer.send(Message::Binary(bytes.into())).await;
            }
            let _ = ws_writer.close().await;
            log::info!("Handshake rejected: {reason}");
            return Ok(());
        }
    };

    let connection_id = Uuid::new_v4();
    let welcome = Frame::Welcome {
        connection_id,
        heartbeat_interval_ms: config.heartbeat_interval_secs * 1000,
    };
    ws_writer.send(Message::Binary(welcome.encode()?.into())).await?;
    log::info!(
        "Connection {connection_id} authenticated as {} ({})",
        user.name,
        user.role
    );

    // Per-member outbox: the registry pushes encoded frames here and this
    // loop drains them onto the socket in order.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<Vec<u8>>>();

    let reason = loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                match outbound {
                    Some(bytes) => {
                        if ws_writer.send(Message::Binary((*bytes).clone().into())).await.is_err() {
                            break "transport";
                        }
                    }
                    None => break "transport",
                }
            }
            inbound = ws_reader.next() => {
                let msg = match inbound {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        log::debug!("Read error on {connection_id}: {e}");
                        break "transport";
                    }
                    None => break "server",
                };
                match msg {
                    Message::Binary(data) => {
                        let bytes: Vec<u8> = data.into();
                        stats.message_received(bytes.len());
                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Undecodable frame from {connection_id}: {e}");
                                continue;
                            }
                        };
                        match frame {
                            Frame::Join { room_id } => {
                                let member = RoomMember {
                                    connection_id,
                                    user: user.clone(),
                                    outbox: out_tx.clone(),
                                };
                                if let Err(e) = registry.join(&room_id, member).await {
                                    log::error!("Join failed for {connection_id}: {e}");
                                }
                            }
                            Frame::Leave { room_id } => {
                                let _ = registry.leave(&room_id, connection_id).await;
                            }
                            Frame::Event(mut envelope) => {
                                // The server, not the client, is authoritative
                                // for sender identity.
                                envelope.user_id = Some(user.user_id);
                                let room_id = match envelope.room_id.clone() {
                                    Some(room_id) => room_id,
                                    None => {
                                        log::debug!("Dropping roomless event from {connection_id}");
                                        continue;
                                    }
                                };
                                let _ = registry
                                    .broadcast(&room_id, &envelope, Some(connection_id))
                                    .await;

                                if envelope.event_type == EventType::Pricing {
                                    if let Ok(update) = envelope.pricing_update() {
                                        let seq = sequence.fetch_add(1, Ordering::Relaxed) + 1;
                                        let confirm = Frame::Confirm {
                                            update_id: update.update_id,
                                            sequence: seq,
                                        };
                                        if let Ok(encoded) = confirm.encode() {
                                            let _ = out_tx.send(Arc::new(encoded));
                                            stats.update_confirmed();
                                        }
                                    }
                                }
                            }
                            Frame::Ping { seq } => {
                                if let Ok(encoded) = (Frame::Pong { seq }).encode() {
                                    let _ = out_tx.send(Arc::new(encoded));
                                }
                            }
                            other => {
                                log::debug!("Unexpected frame from {connection_id}: {other:?}");
                            }
                        }
                    }
                    Message::Close(_) => break "client",
                    _ => {}
                }
            }
        }
    };

    registry.disconnect(connection_id, reason).await;
    log::info!("Connection {connection_id} closed ({reason})");
    Ok(())
}

/// Read frames until a `Hello` arrives, verify its token, and return the
/// identity. Anything else within the deadline is an error string suitable
/// for `AuthRejected`.
async fn authenticate<S>(
    ws_reader: &mut S,
    deadline: Duration,
    verifier: &TokenVerifier,
) -> Result<UserIdentity, String>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(deadline, ws_reader.next())
            .await
            .map_err(|_| "handshake timeout".to_string())?;
        match msg {
            Some(Ok(Message::Binary(data))) => {
                let bytes: Vec<u8> = data.into();
                match Frame::decode(&bytes) {
                    Ok(Frame::Hello { token, user }) => {
                        if verifier(&token) {
                            return Ok(user);
                        }
                        return Err("invalid token".to_string());
                    }
                    Ok(_) => return Err("expected hello".to_string()),
                    Err(_) => return Err("malformed hello".to_string()),
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err("closed before hello".to_string())
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(format!("transport error: {e}")),
        }
    }
}
