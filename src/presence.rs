//! Presence tracking: cursor, field focus, and typing signals.
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceTracker::update_local_cursor()   (debounced: 100ms, latest wins)
//!       │
//!       ▼
//! PresencePayload::Cursor { … } ── Envelope ── transport broadcast
//!       │
//!       ▼
//! Remote PresenceTracker::handle_remote()  (rebuilds PresenceRecord)
//! ```
//!
//! All timer state is explicit and every operation takes a `now: Instant`,
//! so debounce and quiet-period behavior is deterministic in tests.
//! Presence records are pure cache: losing them on reconnect is safe, they
//! are rebuilt from subsequent traffic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{Envelope, EventType, Priority, ProtocolError, UserIdentity};

/// Cursor position in estimate-sheet coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Presence messages carried inside `EventType::Presence` envelopes.
///
/// Join/leave/disconnect variants are produced server-side by the room
/// registry; the rest originate from client trackers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresencePayload {
    Joined {
        user: UserIdentity,
    },
    Left {
        user_id: Uuid,
    },
    Disconnected {
        user_id: Uuid,
        reason: String,
    },
    /// High frequency; debounced at the source.
    Cursor {
        user_id: Uuid,
        position: CursorPosition,
        /// Monotonic per-sender counter; stale updates are dropped.
        timestamp: u64,
    },
    FocusField {
        user_id: Uuid,
        field_id: String,
    },
    BlurField {
        user_id: Uuid,
        field_id: String,
    },
    TypingStarted {
        user_id: Uuid,
        field_id: String,
    },
    TypingStopped {
        user_id: Uuid,
        field_id: String,
    },
}

impl PresencePayload {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Get the user_id from any variant.
    pub fn user_id(&self) -> Uuid {
        match self {
            Self::Joined { user } => user.user_id,
            Self::Left { user_id }
            | Self::Disconnected { user_id, .. }
            | Self::Cursor { user_id, .. }
            | Self::FocusField { user_id, .. }
            | Self::BlurField { user_id, .. }
            | Self::TypingStarted { user_id, .. }
            | Self::TypingStopped { user_id, .. } => *user_id,
        }
    }

    /// Envelope subtype for this variant.
    pub fn subtype(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "user-joined",
            Self::Left { .. } => "user-left",
            Self::Disconnected { .. } => "user-disconnected",
            Self::Cursor { .. } => "cursor",
            Self::FocusField { .. } => "field-focused",
            Self::BlurField { .. } => "field-blurred",
            Self::TypingStarted { .. } => "typing-started",
            Self::TypingStopped { .. } => "typing-stopped",
        }
    }

    /// Wrap into a presence envelope for the given room.
    pub fn into_envelope(self, room_id: impl Into<String>) -> Result<Envelope, ProtocolError> {
        let user_id = self.user_id();
        let subtype = self.subtype();
        Ok(Envelope::new(EventType::Presence, self.encode()?)
            .with_subtype(subtype)
            .with_user(user_id)
            .with_room(room_id)
            .with_priority(Priority::Low))
    }
}

/// What we currently know about one remote collaborator.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub name: String,
    pub cursor: Option<CursorPosition>,
    pub focused_field: Option<String>,
    pub typing_field: Option<String>,
    pub last_seen: Instant,
    /// Last cursor counter seen from this user.
    last_cursor_timestamp: u64,
}

impl PresenceRecord {
    fn new(user_id: Uuid, name: String, now: Instant) -> Self {
        Self {
            user_id,
            name,
            cursor: None,
            focused_field: None,
            typing_field: None,
            last_seen: now,
            last_cursor_timestamp: 0,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.typing_field.is_some()
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_seen) > timeout
    }
}

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Minimum interval between cursor emissions.
    pub cursor_debounce: Duration,
    /// Typing auto-expires to stopped after this much quiet.
    pub typing_quiet_period: Duration,
    /// Remote records idle past this are culled.
    pub idle_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_debounce: Duration::from_millis(100),
            typing_quiet_period: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Derives collaboration signals from bus traffic and bounds the volume of
/// outgoing presence messages.
pub struct PresenceTracker {
    local_user_id: Uuid,
    config: PresenceConfig,
    peers: HashMap<Uuid, PresenceRecord>,

    // Debounce state for the local cursor.
    pending_cursor: Option<CursorPosition>,
    last_cursor_emit: Option<Instant>,
    cursor_counter: u64,

    // Quiet-period state for local typing.
    typing_field: Option<String>,
    last_input: Option<Instant>,
}

impl PresenceTracker {
    pub fn new(local_user_id: Uuid) -> Self {
        Self::with_config(local_user_id, PresenceConfig::default())
    }

    pub fn with_config(local_user_id: Uuid, config: PresenceConfig) -> Self {
        Self {
            local_user_id,
            config,
            peers: HashMap::new(),
            pending_cursor: None,
            last_cursor_emit: None,
            cursor_counter: 0,
            typing_field: None,
            last_input: None,
        }
    }

    /// Record a local cursor move. Returns a payload to emit if the
    /// debounce window has elapsed, otherwise stores the position so the
    /// latest one inside the window wins at the next flush.
    pub fn update_local_cursor(
        &mut self,
        position: CursorPosition,
        now: Instant,
    ) -> Option<PresencePayload> {
        self.pending_cursor = Some(position);
        let elapsed = self
            .last_cursor_emit
            .map_or(true, |t| now.duration_since(t) >= self.config.cursor_debounce);
        if elapsed {
            self.flush_cursor(now)
        } else {
            None
        }
    }

    /// Report local typing on a field. Starting emits immediately; repeated
    /// input on the same field only refreshes the quiet-period timer.
    /// Switching fields stops the old indicator first.
    pub fn typing(&mut self, field_id: &str, now: Instant) -> Vec<PresencePayload> {
        let mut out = Vec::new();
        match self.typing_field.as_deref() {
            Some(current) if current == field_id => {}
            Some(current) => {
                out.push(PresencePayload::TypingStopped {
                    user_id: self.local_user_id,
                    field_id: current.to_string(),
                });
                out.push(PresencePayload::TypingStarted {
                    user_id: self.local_user_id,
                    field_id: field_id.to_string(),
                });
                self.typing_field = Some(field_id.to_string());
            }
            None => {
                out.push(PresencePayload::TypingStarted {
                    user_id: self.local_user_id,
                    field_id: field_id.to_string(),
                });
                self.typing_field = Some(field_id.to_string());
            }
        }
        self.last_input = Some(now);
        out
    }

    /// Focus is low-frequency and high-value: emitted immediately.
    pub fn focus_field(&mut self, field_id: &str) -> PresencePayload {
        PresencePayload::FocusField {
            user_id: self.local_user_id,
            field_id: field_id.to_string(),
        }
    }

    /// Blur is emitted immediately. Blurring the field currently being
    /// typed in also stops the typing indicator.
    pub fn blur_field(&mut self, field_id: &str) -> Vec<PresencePayload> {
        let mut out = Vec::new();
        if self.typing_field.as_deref() == Some(field_id) {
            self.typing_field = None;
            self.last_input = None;
            out.push(PresencePayload::TypingStopped {
                user_id: self.local_user_id,
                field_id: field_id.to_string(),
            });
        }
        out.push(PresencePayload::BlurField {
            user_id: self.local_user_id,
            field_id: field_id.to_string(),
        });
        out
    }

    /// Periodic driver: flushes a debounced cursor position and expires the
    /// typing indicator after the quiet period. The indicator can therefore
    /// never persist indefinitely on an abandoned field.
    pub fn tick(&mut self, now: Instant) -> Vec<PresencePayload> {
        let mut out = Vec::new();

        let window_elapsed = self
            .last_cursor_emit
            .map_or(true, |t| now.duration_since(t) >= self.config.cursor_debounce);
        if window_elapsed {
            if let Some(payload) = self.flush_cursor(now) {
                out.push(payload);
            }
        }

        let quiet = match (self.typing_field.as_ref(), self.last_input) {
            (Some(_), Some(last)) => {
                now.duration_since(last) >= self.config.typing_quiet_period
            }
            _ => false,
        };
        if quiet {
            let field_id = self.typing_field.take().unwrap_or_default();
            self.last_input = None;
            out.push(PresencePayload::TypingStopped {
                user_id: self.local_user_id,
                field_id,
            });
        }

        out
    }

    /// Apply an incoming presence payload to the remote record map.
    /// Messages from the local user are ignored.
    pub fn handle_remote(&mut self, payload: &PresencePayload, now: Instant) {
        if payload.user_id() == self.local_user_id {
            return;
        }

        match payload {
            PresencePayload::Joined { user } => {
                self.peers.insert(
                    user.user_id,
                    PresenceRecord::new(user.user_id, user.name.clone(), now),
                );
            }
            PresencePayload::Left { user_id }
            | PresencePayload::Disconnected { user_id, .. } => {
                self.peers.remove(user_id);
            }
            PresencePayload::Cursor {
                user_id,
                position,
                timestamp,
            } => {
                let record = self.record_mut(*user_id, now);
                // Drop out-of-order cursor updates.
                if *timestamp >= record.last_cursor_timestamp {
                    record.cursor = Some(*position);
                    record.last_cursor_timestamp = *timestamp;
                    record.last_seen = now;
                }
            }
            PresencePayload::FocusField { user_id, field_id } => {
                let record = self.record_mut(*user_id, now);
                record.focused_field = Some(field_id.clone());
                record.last_seen = now;
            }
            PresencePayload::BlurField { user_id, field_id } => {
                let record = self.record_mut(*user_id, now);
                if record.focused_field.as_deref() == Some(field_id.as_str()) {
                    record.focused_field = None;
                }
                record.last_seen = now;
            }
            PresencePayload::TypingStarted { user_id, field_id } => {
                let record = self.record_mut(*user_id, now);
                record.typing_field = Some(field_id.clone());
                record.last_seen = now;
            }
            PresencePayload::TypingStopped { user_id, field_id } => {
                let record = self.record_mut(*user_id, now);
                if record.typing_field.as_deref() == Some(field_id.as_str()) {
                    record.typing_field = None;
                }
                record.last_seen = now;
            }
        }
    }

    /// Remove records idle past the timeout. Returns the culled user ids.
    pub fn cleanup_idle(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.config.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, r)| r.is_idle(now, timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn peers(&self) -> &HashMap<Uuid, PresenceRecord> {
        &self.peers
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&PresenceRecord> {
        self.peers.get(user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }

    fn flush_cursor(&mut self, now: Instant) -> Option<PresencePayload> {
        let position = self.pending_cursor.take()?;
        self.cursor_counter += 1;
        self.last_cursor_emit = Some(now);
        Some(PresencePayload::Cursor {
            user_id: self.local_user_id,
            position,
            timestamp: self.cursor_counter,
        })
    }

    /// Cursor traffic can arrive before the join envelope on reconnect;
    /// create a placeholder record rather than dropping the signal.
    fn record_mut(&mut self, user_id: Uuid, now: Instant) -> &mut PresenceRecord {
        self.peers.entry(user_id).or_insert_with(|| {
            PresenceRecord::new(user_id, format!("Peer-{}", &user_id.to_string()[..8]), now)
        })
    }
}
