//! Real-time collaboration layer for shared estimate editing.
//!
//! Multiple users edit the same estimate concurrently: pricing changes
//! apply optimistically and are confirmed (or rolled back) by the server,
//! presence keeps everyone aware of who is where, and a typed event bus
//! decouples producers from consumers on the client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────── client ───────────────────────────┐
//! │                                                              │
//! │  OptimisticCoordinator ──► EventBus ──► ConnectionManager    │
//! │        ▲                      │              │  ▲            │
//! │        │ confirm/rollback     │ callbacks    │  │ heartbeat, │
//! │        └──────────────────────┼──────────────┘  │ backoff    │
//! │  PresenceTracker ─────────────┘                 │            │
//! └─────────────────────────────────────────────────┼────────────┘
//!                                        WebSocket  │  bincode frames
//! ┌─────────────────────────────────────────────────┼────────────┐
//! │  CollabServer ──► RoomRegistry (join/leave/broadcast/GC)     │
//! │        └──► sequence numbers + Confirm frames                │
//! └────────────────────────────── server ───────────────────────┘
//! ```
//!
//! Rooms are named `estimate_{id}`; a pricing event is broadcast to every
//! other member of its room and confirmed back to its sender with a
//! server-assigned sequence number.

pub mod bus;
pub mod connection;
pub mod optimistic;
pub mod presence;
pub mod protocol;
pub mod rooms;
pub mod server;

pub use bus::{BusConfig, EventBus, EventFilter, SubscriptionId};
pub use connection::{
    ClientConfig, ClientError, ClientEvent, ConnectionManager, DisconnectReason, HealthMonitor,
    HealthSnapshot,
};
pub use optimistic::{CoordinatorConfig, OptimisticCoordinator, UpdateNotice, UpdateState};
pub use presence::{CursorPosition, PresenceConfig, PresencePayload, PresenceTracker};
pub use protocol::{
    room_for_estimate, Envelope, EventType, Frame, PricingUpdate, Priority, ProtocolError,
    UserIdentity,
};
pub use rooms::{RegistryConfig, RoomMember, RoomRegistry};
pub use server::{CollabServer, ServerConfig, ServerStats, StatsSnapshot};
