//! Optimistic update coordination for pricing edits.
//!
//! Each edit is applied speculatively, sent to the server, and resolved by
//! exactly one of two terminal transitions:
//!
//! ```text
//!            ┌──────────┐  Confirm{id, seq}   ┌───────────┐
//!  apply ──► │ Pending  │ ──────────────────► │ Confirmed │
//!            └────┬─────┘                     └───────────┘
//!                 │ deadline reached
//!                 ▼
//!            ┌────────────┐
//!            │ RolledBack │  (observer receives the pre-update snapshot)
//!            └────────────┘
//! ```
//!
//! The pending record is removed from the map under one lock, and only the
//! remover notifies — so a rollback and a confirmation for the same id can
//! never both fire, and a late confirmation after either terminal state is
//! ignored. A connection drop does not touch pending updates; they resolve
//! by timeout or by a late confirmation after reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::protocol::{PricingUpdate, ProtocolError};

/// Lifecycle of a single optimistic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Pending,
    Confirmed,
    RolledBack,
}

/// Pre-update state restored on rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackSnapshot {
    pub service_id: String,
    pub field: String,
    pub value: f64,
}

/// Notifications delivered to observers. For any update id the sequence is
/// exactly [Applied, Confirmed] or [Applied, RolledBack].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateNotice {
    /// Speculative state applied locally; show it immediately.
    Applied { update: PricingUpdate },
    /// Server accepted the update. `sequence` is the server-assigned total
    /// order; on conflicting edits to one field, highest sequence wins.
    Confirmed { update_id: Uuid, sequence: u64 },
    /// No confirmation within the timeout; restore the snapshot.
    RolledBack {
        update_id: Uuid,
        snapshot: RollbackSnapshot,
    },
}

struct PendingUpdate {
    update: PricingUpdate,
    snapshot: RollbackSnapshot,
    deadline: Instant,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long to wait for a server confirmation.
    pub confirm_timeout: Duration,
    /// Interval for the background timeout driver.
    pub sweep_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(250),
        }
    }
}

/// The optimistic update coordinator.
pub struct OptimisticCoordinator {
    config: CoordinatorConfig,
    bus: Arc<EventBus>,
    pending: Mutex<HashMap<Uuid, PendingUpdate>>,
    notice_tx: mpsc::UnboundedSender<UpdateNotice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<UpdateNotice>>>,
}

impl OptimisticCoordinator {
    pub fn new(bus: Arc<EventBus>, config: CoordinatorConfig) -> Self {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            config,
            bus,
            pending: Mutex::new(HashMap::new()),
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
        }
    }

    pub fn with_defaults(bus: Arc<EventBus>) -> Self {
        Self::new(bus, CoordinatorConfig::default())
    }

    /// Take the notice receiver (can only be called once).
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<UpdateNotice>> {
        self.notice_rx.lock().unwrap().take()
    }

    /// Apply a pricing edit speculatively.
    ///
    /// Snapshots the previous value, notifies observers of the speculative
    /// state, and emits the pricing envelope through the bus (forwarded to
    /// the server while connected). The update stays Pending until a
    /// confirmation arrives or its deadline passes.
    pub fn apply(
        &self,
        user_id: Uuid,
        room_id: &str,
        service_id: &str,
        field: &str,
        new_value: f64,
        previous_value: f64,
        now: Instant,
    ) -> Result<Uuid, ProtocolError> {
        let update_id = Uuid::new_v4();
        let update = PricingUpdate::new(update_id, service_id, field, new_value);
        let snapshot = RollbackSnapshot {
            service_id: service_id.to_string(),
            field: field.to_string(),
            value: previous_value,
        };

        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                update_id,
                PendingUpdate {
                    update: update.clone(),
                    snapshot,
                    deadline: now + self.config.confirm_timeout,
                },
            );
        }

        let _ = self.notice_tx.send(UpdateNotice::Applied {
            update: update.clone(),
        });

        let envelope = update.into_envelope(user_id, room_id)?;
        self.bus.emit(envelope);
        log::debug!("Optimistic update {update_id} applied ({service_id}.{field} = {new_value})");
        Ok(update_id)
    }

    /// Handle a server confirmation. Returns `true` if the update was
    /// Pending; confirmations for unknown or already-terminal ids are
    /// ignored, which makes late post-reconnect confirmations safe.
    pub fn confirm(&self, update_id: Uuid, sequence: u64) -> bool {
        let removed = self.pending.lock().unwrap().remove(&update_id);
        match removed {
            Some(_) => {
                let _ = self
                    .notice_tx
                    .send(UpdateNotice::Confirmed { update_id, sequence });
                log::debug!("Optimistic update {update_id} confirmed (seq {sequence})");
                true
            }
            None => {
                log::debug!("Ignoring confirmation for non-pending update {update_id}");
                false
            }
        }
    }

    /// Timeout pass: roll back every pending update whose deadline has
    /// passed, delivering the rollback snapshot to observers. Deterministic
    /// against the supplied `now`. Timeouts are independent per update.
    pub fn sweep(&self, now: Instant) -> Vec<Uuid> {
        let expired: Vec<(Uuid, PendingUpdate)> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        let mut rolled_back = Vec::with_capacity(expired.len());
        for (update_id, record) in expired {
            log::warn!(
                "Optimistic update {update_id} timed out; rolling back {}.{}",
                record.snapshot.service_id,
                record.snapshot.field
            );
            let _ = self.notice_tx.send(UpdateNotice::RolledBack {
                update_id,
                snapshot: record.snapshot,
            });
            rolled_back.push(update_id);
        }
        rolled_back
    }

    /// Drive `sweep` on the configured interval.
    pub fn spawn_timeout_driver(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        let interval = coordinator.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                coordinator.sweep(Instant::now());
            }
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn state_of(&self, update_id: Uuid) -> Option<UpdateState> {
        if self.pending.lock().unwrap().contains_key(&update_id) {
            Some(UpdateState::Pending)
        } else {
            // Terminal records are not retained; only Pending is queryable.
            None
        }
    }
}
