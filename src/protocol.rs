//! Wire protocol for the estimate collaboration layer.
//!
//! Two layers travel over the transport channel:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Frame (bincode)                             │
//! │   Hello / Welcome / AuthRejected            │  connection control
//! │   Join / Leave / Ping / Pong / Confirm      │
//! │   Event(Envelope) ──────────────┐           │
//! └─────────────────────────────────┼───────────┘
//!                                   ▼
//!                     ┌─────────────────────────┐
//!                     │ Envelope (typed event)  │  bus traffic
//!                     │   pricing / presence /  │
//!                     │   notification / system │
//!                     └─────────────────────────┘
//! ```
//!
//! Everything is bincode-encoded (serde mode, standard config). Envelopes
//! are immutable once emitted; their ids are unique within the bus
//! retention window.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Closed set of event categories routed by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Pricing,
    Presence,
    Notification,
    System,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Pricing => "pricing",
            EventType::Presence => "presence",
            EventType::Notification => "notification",
            EventType::System => "system",
        }
    }
}

/// Delivery priority attached to every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Who a connection claims to be. The server verifies the token that
/// accompanies this and then trusts the claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub name: String,
    pub role: String,
}

impl UserIdentity {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            name: name.into(),
            role: role.into(),
        }
    }

    /// Create with an explicit user id (for testing).
    pub fn with_id(user_id: Uuid, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            role: role.into(),
        }
    }
}

/// The typed, immutable unit of data exchanged over the event bus.
///
/// Payload bytes are opaque to the bus; typed payloads such as
/// [`PricingUpdate`] are bincode-encoded into `payload` by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub event_type: EventType,
    pub subtype: Option<String>,
    pub payload: Vec<u8>,
    /// Originating user, if known.
    pub user_id: Option<Uuid>,
    /// Room this envelope belongs to, if any.
    pub room_id: Option<String>,
    pub priority: Priority,
    /// Unix milliseconds at emission.
    pub timestamp_ms: u64,
    /// Exempt from retention pruning in the bus buffer.
    pub persistent: bool,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(event_type: EventType, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            subtype: None,
            payload,
            user_id: None,
            room_id: None,
            priority: Priority::default(),
            timestamp_ms: unix_millis(),
            persistent: false,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (env, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(env)
    }

    /// Parse the payload as a pricing update.
    pub fn pricing_update(&self) -> Result<PricingUpdate, ProtocolError> {
        if self.event_type != EventType::Pricing {
            return Err(ProtocolError::InvalidFrame);
        }
        PricingUpdate::decode(&self.payload)
    }
}

/// Typed payload for pricing envelopes.
///
/// Carries the optimistic update id so the server's `Confirm` can be
/// matched back to the speculative local change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingUpdate {
    pub update_id: Uuid,
    pub service_id: String,
    pub field: String,
    pub value: f64,
}

impl PricingUpdate {
    pub fn new(update_id: Uuid, service_id: impl Into<String>, field: impl Into<String>, value: f64) -> Self {
        Self {
            update_id,
            service_id: service_id.into(),
            field: field.into(),
            value,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }

    /// Wrap into a pricing envelope for the given room.
    pub fn into_envelope(self, user_id: Uuid, room_id: impl Into<String>) -> Result<Envelope, ProtocolError> {
        let payload = self.encode()?;
        Ok(Envelope::new(EventType::Pricing, payload)
            .with_subtype("price-changed")
            .with_user(user_id)
            .with_room(room_id)
            .with_priority(Priority::High))
    }
}

/// Top-level transport frame.
///
/// The first frame a client sends must be `Hello`; the server answers with
/// `Welcome` or `AuthRejected` before any room operation is permitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Authentication handshake: opaque token plus claimed identity.
    Hello { token: String, user: UserIdentity },
    /// Handshake accepted; carries the server's heartbeat interval.
    Welcome {
        connection_id: Uuid,
        heartbeat_interval_ms: u64,
    },
    /// Handshake refused. The connection is closed after this frame.
    AuthRejected { reason: String },
    Join { room_id: String },
    Leave { room_id: String },
    Event(Envelope),
    /// Server confirmation of a pricing update, with the server-assigned
    /// sequence number that totally orders confirmed updates.
    Confirm { update_id: Uuid, sequence: u64 },
    Ping { seq: u64 },
    Pong { seq: u64 },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Derive the room id for a collaborated estimate.
///
/// Callers must not assume any structure beyond this derivation.
pub fn room_for_estimate(estimate_id: &str) -> String {
    format!("estimate_{estimate_id}")
}

/// Current wall-clock time as Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidFrame,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidFrame => write!(f, "Invalid frame for this operation"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
