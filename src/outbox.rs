// Outbox of side effects that follow a committed booking, and the relay that delivers them.
//
// The booking transaction enqueues messages together with the reservation, so a
// crash after commit cannot lose them. The relay delivers them at least once,
// retrying transient failures with backoff and dead-lettering the rest.

use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::error::StoreError;
use crate::model::{ReservationId, Room, RoomId};
use crate::notification::{ConfirmationPayload, Notifier};
use crate::store::{OutboxStore, ReservationStore, RoomStore};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(pub u64);

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboxMessage {
    // Mark the room provisionally unavailable until `available_from`
    HoldRoom {
        room_id: RoomId,
        reservation_id: ReservationId,
        available_from: NaiveDate,
    },
    // Recompute the room's hold after one of its reservations was cancelled
    ReleaseHold {
        room_id: RoomId,
    },
    SendConfirmation {
        reservation_id: ReservationId,
    },
}

impl OutboxMessage {
    pub fn topic(&self) -> &'static str {
        match self {
            OutboxMessage::HoldRoom { .. } => "room.hold",
            OutboxMessage::ReleaseHold { .. } => "room.release",
            OutboxMessage::SendConfirmation { .. } => "reservation.confirmation",
        }
    }

    // Messages sharing a key are delivered one after another, in enqueue order
    pub fn ordering_key(&self) -> String {
        match self {
            OutboxMessage::HoldRoom { room_id, .. } | OutboxMessage::ReleaseHold { room_id } => {
                format!("room:{}", room_id)
            }
            OutboxMessage::SendConfirmation { reservation_id } => {
                format!("reservation:{}", reservation_id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Delivered,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxId,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    // Incremented on every claim
    pub attempts: u32,
    pub last_error: Option<String>,
    // Lease expiry while the entry is in flight
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn new(
        id: OutboxId,
        message: &OutboxMessage,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            id,
            topic: message.topic().to_string(),
            payload: serde_json::to_value(message)?,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: now,
            created_at: now,
            delivered_at: None,
        })
    }

    pub fn message(&self) -> Result<OutboxMessage, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    // Worth another attempt later
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

/// Keeps a room's provisional hold in step with its reservations.
///
/// The room flag is only a hint; reservations stay the source of truth for
/// conflicts. Both writes go through narrow store updates, so they never clobber
/// the maintenance flag or race each other back to an older date.
pub struct RoomStateUpdater<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: RoomStore> RoomStateUpdater<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    // Never moves `available_from` backwards, so holds for several bookings of
    // the same room can arrive in any order
    pub async fn mark_provisionally_booked(
        &self,
        room_id: RoomId,
        reservation_id: ReservationId,
        available_from: NaiveDate,
    ) -> Result<Room, DeliveryError> {
        let room = self
            .store
            .hold_room(room_id, reservation_id, available_from, self.clock.now())
            .await
            .map_err(delivery_error)?;
        info!(
            room_id = %room_id,
            reservation_id = %reservation_id,
            available_from = ?room.available_from,
            "room hold applied"
        );
        Ok(room)
    }

    pub async fn release_hold(&self, room_id: RoomId) -> Result<Room, DeliveryError> {
        let room = self
            .store
            .release_room_hold(room_id, self.clock.now())
            .await
            .map_err(delivery_error)?;
        info!(
            room_id = %room_id,
            is_available = room.is_available,
            available_from = ?room.available_from,
            "room hold released"
        );
        Ok(room)
    }
}

fn delivery_error(e: StoreError) -> DeliveryError {
    match e {
        StoreError::NotFound(what) => DeliveryError::Permanent(what),
        e => DeliveryError::Transient(e.to_string()),
    }
}

#[derive(Debug, Default)]
pub struct RelayStats {
    pub delivered: AtomicUsize,
    pub retried: AtomicUsize,
    pub dead: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStatsReport {
    pub delivered: usize,
    pub retried: usize,
    pub dead: usize,
}

// Wakes the relay ahead of its next poll
#[derive(Debug, Clone, Default)]
pub struct RelayWaker(Arc<Notify>);

impl RelayWaker {
    pub fn wake(&self) {
        self.0.notify_one();
    }
}

pub struct OutboxRelay<S> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
    room_state: RoomStateUpdater<S>,
    stats: RelayStats,
    waker: RelayWaker,
}

impl<S> OutboxRelay<S>
where
    S: RoomStore + ReservationStore + OutboxStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            room_state: RoomStateUpdater::new(Arc::clone(&store), Arc::clone(&clock)),
            store,
            notifier,
            clock,
            config,
            stats: RelayStats::default(),
            waker: RelayWaker::default(),
        }
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    pub fn waker(&self) -> RelayWaker {
        self.waker.clone()
    }

    pub fn stats(&self) -> RelayStatsReport {
        RelayStatsReport {
            delivered: self.stats.delivered.load(Ordering::SeqCst),
            retried: self.stats.retried.load(Ordering::SeqCst),
            dead: self.stats.dead.load(Ordering::SeqCst),
        }
    }

    /// Claims one batch of due entries and delivers it. Returns the number of
    /// entries claimed.
    ///
    /// Entries with different ordering keys are delivered concurrently; entries
    /// sharing a key go one after another in id order.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let entries = self
            .store
            .claim_due(self.clock.now(), self.batch_size(), self.config.lease())
            .await?;
        let claimed = entries.len();
        if claimed == 0 {
            return Ok(0);
        }
        debug!(claimed, "claimed outbox entries");

        let mut lanes: BTreeMap<String, Vec<OutboxEntry>> = BTreeMap::new();
        for entry in entries {
            let key = match entry.message() {
                Ok(message) => message.ordering_key(),
                Err(_) => format!("entry:{}", entry.id),
            };
            lanes.entry(key).or_default().push(entry);
        }

        futures::future::join_all(lanes.into_values().map(|mut lane| async move {
            lane.sort_by_key(|entry| entry.id);
            for entry in lane {
                self.deliver(entry).await;
            }
        }))
        .await;

        Ok(claimed)
    }

    async fn deliver(&self, entry: OutboxEntry) {
        let outcome = match entry.message() {
            Ok(message) => self.dispatch(message).await,
            Err(e) => Err(DeliveryError::Permanent(format!("unreadable payload: {}", e))),
        };

        match outcome {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self.store.mark_delivered(entry.id, self.clock.now()).await {
                    // The lease runs out and the entry is delivered again
                    error!(outbox_id = %entry.id, error = %e, "failed to mark outbox entry delivered");
                }
            }
            Err(DeliveryError::Transient(reason))
                if entry.attempts <= self.config.retry.max_retries =>
            {
                let backoff = self.config.retry.calculate_backoff(entry.attempts.saturating_sub(1));
                let next_attempt_at = self.clock.now()
                    + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());
                warn!(
                    outbox_id = %entry.id,
                    topic = %entry.topic,
                    attempt = entry.attempts,
                    error = %reason,
                    next_attempt_at = %next_attempt_at,
                    "outbox delivery failed, will retry"
                );
                self.stats.retried.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self.store.reschedule(entry.id, &reason, next_attempt_at).await {
                    error!(outbox_id = %entry.id, error = %e, "failed to reschedule outbox entry");
                }
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    outbox_id = %entry.id,
                    topic = %entry.topic,
                    attempts = entry.attempts,
                    error = %reason,
                    "outbox delivery abandoned"
                );
                self.stats.dead.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self.store.mark_dead(entry.id, &reason).await {
                    error!(outbox_id = %entry.id, error = %e, "failed to dead-letter outbox entry");
                }
            }
        }
    }

    async fn dispatch(&self, message: OutboxMessage) -> Result<(), DeliveryError> {
        match message {
            OutboxMessage::HoldRoom {
                room_id,
                reservation_id,
                available_from,
            } => self
                .room_state
                .mark_provisionally_booked(room_id, reservation_id, available_from)
                .await
                .map(|_| ()),
            OutboxMessage::ReleaseHold { room_id } => {
                self.room_state.release_hold(room_id).await.map(|_| ())
            }
            OutboxMessage::SendConfirmation { reservation_id } => {
                self.send_confirmation(reservation_id).await
            }
        }
    }

    async fn send_confirmation(&self, reservation_id: ReservationId) -> Result<(), DeliveryError> {
        let details = match self.store.get_reservation(reservation_id).await {
            Ok(Some(details)) => details,
            Ok(None) => {
                return Err(DeliveryError::Permanent(format!(
                    "reservation {} not found",
                    reservation_id
                )))
            }
            Err(e) => return Err(DeliveryError::Transient(e.to_string())),
        };

        let payload = ConfirmationPayload::from_details(&details);
        self.notifier
            .notify(&details.guest.email, &payload)
            .await
            .map_err(|e| DeliveryError::Transient(format!("{:#}", e)))
    }

    /// Runs the relay on its own task until the handle is shut down. The task
    /// is independent of any request; it polls every `poll_interval_ms` and
    /// whenever the waker fires.
    pub fn spawn(self: Arc<Self>) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let notify = Arc::clone(&self.waker.0);
        let interval = self.config.poll_interval();

        let join = tokio::spawn(async move {
            info!("outbox relay started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                match self.run_once().await {
                    // A full batch usually means more is waiting
                    Ok(claimed) if claimed >= self.batch_size() => continue,
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "outbox relay failed to claim entries"),
                }

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        // Handle dropped without an explicit shutdown
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            info!("outbox relay stopped");
        });

        RelayHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    // Lets the in-progress batch finish, then stops the task
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "outbox relay task ended abnormally");
        }
    }
}
