//! Server-side room registry.
//!
//! Rooms group every connection collaborating on one estimate. Membership
//! mutation is locked per room — there is no global lock across rooms, so
//! traffic in one room never serializes against another.
//!
//! Empty rooms are not deleted inline: a periodic sweep removes rooms that
//! have had zero members for longer than the retention window, which keeps
//! a briefly-reconnecting user from churning room state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::presence::PresencePayload;
use crate::protocol::{Envelope, EventType, Frame, Priority, ProtocolError, UserIdentity};

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    RoomNotFound(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoomNotFound(id) => write!(f, "Room not found: {id}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// A connected member of a room.
///
/// `outbox` is the member's ordered delivery queue: frames pushed into it
/// arrive at that connection in push order, which gives the per-member
/// emission-order guarantee for a room's envelopes.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub connection_id: Uuid,
    pub user: UserIdentity,
    pub outbox: mpsc::UnboundedSender<Arc<Vec<u8>>>,
}

struct Room {
    members: RwLock<HashMap<Uuid, RoomMember>>,
    last_activity: RwLock<Instant>,
}

impl Room {
    fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            last_activity: RwLock::new(Instant::now()),
        }
    }

    async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    /// Send pre-encoded bytes to every member except `exclude`.
    async fn send_raw(&self, bytes: &Arc<Vec<u8>>, exclude: Option<Uuid>) -> usize {
        let members = self.members.read().await;
        let mut delivered = 0;
        for member in members.values() {
            if Some(member.connection_id) == exclude {
                continue;
            }
            if member.outbox.send(bytes.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Empty rooms older than this are garbage-collected.
    pub retention: Duration,
    /// Interval between GC sweeps.
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// The room registry. Exclusively owns room membership on the server.
pub struct RoomRegistry {
    config: RegistryConfig,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    /// Add a member to a room, creating the room on first join.
    ///
    /// Idempotent: joining a room the connection already belongs to is a
    /// no-op and returns `false`. On a real join, `user-joined` is
    /// broadcast to the members present before the joiner.
    pub async fn join(&self, room_id: &str, member: RoomMember) -> Result<bool, ProtocolError> {
        let room = self.get_or_create(room_id).await;
        room.touch().await;

        let joined_envelope = {
            let mut members = room.members.write().await;
            if members.contains_key(&member.connection_id) {
                return Ok(false);
            }
            let envelope = presence_envelope(
                room_id,
                "user-joined",
                &PresencePayload::Joined {
                    user: member.user.clone(),
                },
            )?;
            members.insert(member.connection_id, member.clone());
            envelope
        };

        // Deliver to everyone but the joiner.
        self.broadcast(room_id, &joined_envelope, Some(member.connection_id))
            .await
            .ok();
        log::info!(
            "{} ({}) joined room {room_id}",
            member.user.name,
            member.connection_id
        );
        Ok(true)
    }

    /// Remove a member and broadcast `user-left` to the remaining members.
    ///
    /// The room survives even when it becomes empty; the GC sweep deletes
    /// it after the retention window.
    pub async fn leave(&self, room_id: &str, connection_id: Uuid) -> Result<bool, RegistryError> {
        let room = self
            .get(room_id)
            .await
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;

        let removed = {
            let mut members = room.members.write().await;
            members.remove(&connection_id)
        };
        room.touch().await;

        if let Some(member) = removed {
            if let Ok(envelope) = presence_envelope(
                room_id,
                "user-left",
                &PresencePayload::Left {
                    user_id: member.user.user_id,
                },
            ) {
                let _ = self.broadcast(room_id, &envelope, None).await;
            }
            log::info!("{} left room {room_id}", member.user.name);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Deliver an envelope to every member of a room, optionally excluding
    /// the sending connection. Returns the number of deliveries.
    pub async fn broadcast(
        &self,
        room_id: &str,
        envelope: &Envelope,
        exclude: Option<Uuid>,
    ) -> Result<usize, RegistryError> {
        let room = self
            .get(room_id)
            .await
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;

        let frame = Frame::Event(envelope.clone());
        let bytes = match frame.encode() {
            Ok(b) => Arc::new(b),
            Err(e) => {
                log::error!("Failed to encode broadcast for room {room_id}: {e}");
                return Ok(0);
            }
        };

        room.touch().await;
        Ok(room.send_raw(&bytes, exclude).await)
    }

    /// Remove a dropped connection from every room it belongs to and
    /// broadcast `user-disconnected` with the reason to each affected room.
    /// Returns the affected room ids.
    pub async fn disconnect(&self, connection_id: Uuid, reason: &str) -> Vec<String> {
        let rooms: Vec<(String, Arc<Room>)> = {
            let map = self.rooms.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut affected = Vec::new();
        for (room_id, room) in rooms {
            let removed = {
                let mut members = room.members.write().await;
                members.remove(&connection_id)
            };
            if let Some(member) = removed {
                room.touch().await;
                if let Ok(envelope) = presence_envelope(
                    &room_id,
                    "user-disconnected",
                    &PresencePayload::Disconnected {
                        user_id: member.user.user_id,
                        reason: reason.to_string(),
                    },
                ) {
                    let _ = self.broadcast(&room_id, &envelope, None).await;
                }
                affected.push(room_id);
            }
        }

        if !affected.is_empty() {
            log::info!(
                "Connection {connection_id} removed from {} room(s) ({reason})",
                affected.len()
            );
        }
        affected
    }

    /// GC pass: delete rooms with zero members whose last activity is older
    /// than the retention window. Deterministic against the supplied `now`.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let candidates: Vec<(String, Arc<Room>)> = {
            let map = self.rooms.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut removed = Vec::new();
        for (room_id, room) in candidates {
            let empty = room.members.read().await.is_empty();
            let stale =
                now.duration_since(*room.last_activity.read().await) >= self.config.retention;
            if empty && stale {
                let mut map = self.rooms.write().await;
                // Re-check under the write lock; a join may have raced.
                if let Some(r) = map.get(&room_id) {
                    if r.members.read().await.is_empty() {
                        map.remove(&room_id);
                        removed.push(room_id);
                    }
                }
            }
        }

        if !removed.is_empty() {
            log::info!("GC removed {} stale room(s)", removed.len());
        }
        removed
    }

    /// Drive `sweep` on the configured interval.
    pub fn spawn_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let interval = registry.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                registry.sweep(Instant::now()).await;
            }
        })
    }

    pub async fn member_count(&self, room_id: &str) -> usize {
        match self.get(room_id).await {
            Some(room) => room.members.read().await.len(),
            None => 0,
        }
    }

    pub async fn members(&self, room_id: &str) -> Vec<UserIdentity> {
        match self.get(room_id).await {
            Some(room) => room
                .members
                .read()
                .await
                .values()
                .map(|m| m.user.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn is_member(&self, room_id: &str, connection_id: Uuid) -> bool {
        match self.get(room_id).await {
            Some(room) => room.members.read().await.contains_key(&connection_id),
            None => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Arc::new(Room::new());
        rooms.insert(room_id.to_string(), room.clone());
        log::debug!("Created room {room_id}");
        room
    }
}

fn presence_envelope(
    room_id: &str,
    subtype: &str,
    payload: &PresencePayload,
) -> Result<Envelope, ProtocolError> {
    Ok(Envelope::new(EventType::Presence, payload.encode()?)
        .with_subtype(subtype)
        .with_room(room_id)
        .with_priority(Priority::Medium))
}
