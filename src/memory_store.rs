// In-process implementation of every store port, backed by concurrent maps

use crate::error::StoreError;
use crate::model::{
    Guest, GuestId, Hotel, HotelId, PaymentId, ReservationId, Room, RoomId, RoomType, RoomTypeId,
};
use crate::outbox::{OutboxEntry, OutboxId, OutboxMessage, OutboxStatus};
use crate::payment::{Payment, PaymentStatus};
use crate::query::ReservationQuery;
use crate::reservation::{Reservation, ReservationDetails, ReservationStatus};
use crate::store::{
    BookingStore, BookingTransaction, OutboxStore, PaymentStore, ReservationStore, RoomReader,
    RoomStore, SettlementWrite,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

#[derive(Default)]
struct Tables {
    hotels: DashMap<HotelId, Hotel>,
    room_types: DashMap<RoomTypeId, RoomType>,
    rooms: DashMap<RoomId, Room>,
    guests: DashMap<GuestId, Guest>,
    reservations: DashMap<ReservationId, Reservation>,
    payments: DashMap<PaymentId, Payment>,
    // Unique index over Payment::transaction_id
    transaction_ids: DashMap<String, PaymentId>,
    // One lock per room, held by an open booking transaction
    room_locks: DashMap<RoomId, Arc<tokio::sync::Mutex<()>>>,
    // Serializes writes that touch more than one record
    write_lock: Mutex<()>,
    outbox: Mutex<BTreeMap<OutboxId, OutboxEntry>>,
    outbox_seq: AtomicU64,
}

impl Tables {
    fn reservations_matching(&self, query: &ReservationQuery) -> Vec<Reservation> {
        let mut found: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|r| (r.stay.check_in(), r.created_at));
        found
    }

    fn hydrate(&self, reservation: Reservation) -> Result<ReservationDetails, StoreError> {
        let room = cloned(&self.rooms, &reservation.room_id, "room")?;
        let room_type = cloned(&self.room_types, &room.room_type_id, "room type")?;
        let hotel = cloned(&self.hotels, &room.hotel_id, "hotel")?;
        let guest = cloned(&self.guests, &reservation.guest_id, "guest")?;
        let payment = cloned(&self.payments, &reservation.payment_id, "payment")?;

        Ok(ReservationDetails {
            reservation,
            room,
            room_type,
            hotel,
            guest,
            payment,
        })
    }

    fn next_outbox_id(&self) -> OutboxId {
        OutboxId(self.outbox_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    // Serializes every message before anything is written
    fn outbox_entries_for(
        &self,
        messages: &[OutboxMessage],
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        messages
            .iter()
            .map(|message| OutboxEntry::new(self.next_outbox_id(), message, now))
            .collect()
    }

    fn append_outbox(&self, entries: Vec<OutboxEntry>) {
        let mut outbox = self.outbox.lock();
        for entry in entries {
            outbox.insert(entry.id, entry);
        }
    }
}

fn cloned<K, V>(map: &DashMap<K, V>, key: &K, what: &str) -> Result<V, StoreError>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
    V: Clone,
{
    map.get(key)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| StoreError::NotFound(format!("{} {}", what, key)))
}

/// Store that keeps everything in memory. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_hotel(&self, hotel: Hotel) {
        self.tables.hotels.insert(hotel.id, hotel);
    }

    pub fn insert_room_type(&self, room_type: RoomType) {
        self.tables.room_types.insert(room_type.id, room_type);
    }

    pub fn insert_room(&self, room: Room) {
        self.tables.rooms.insert(room.id, room);
    }

    pub fn insert_guest(&self, guest: Guest) {
        self.tables.guests.insert(guest.id, guest);
    }

    // Bypasses the booking transaction; for importing existing bookings
    pub fn insert_reservation(&self, reservation: Reservation) {
        self.tables.reservations.insert(reservation.id, reservation);
    }

    pub fn reservation_count(&self) -> usize {
        self.tables.reservations.len()
    }

    // Snapshot of the outbox in enqueue order
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.tables.outbox.lock().values().cloned().collect()
    }

    fn with_outbox_entry<F>(&self, id: OutboxId, update: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut OutboxEntry),
    {
        let mut outbox = self.tables.outbox.lock();
        let entry = outbox
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox entry {}", id)))?;
        update(entry);
        Ok(())
    }
}

#[async_trait]
impl RoomReader for MemoryStore {
    async fn find_room_by_id(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.tables.rooms.get(&id).map(|room| room.value().clone()))
    }

    async fn find_overlapping_reservations(
        &self,
        query: &ReservationQuery,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.tables.reservations_matching(query))
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn find_rooms_by_number(&self, room_number: &str) -> Result<Vec<Room>, StoreError> {
        Ok(self
            .tables
            .rooms
            .iter()
            .filter(|room| room.room_number == room_number)
            .map(|room| room.value().clone())
            .collect())
    }

    async fn find_room_type(&self, id: RoomTypeId) -> Result<Option<RoomType>, StoreError> {
        Ok(self.tables.room_types.get(&id).map(|rt| rt.value().clone()))
    }

    async fn hold_room(
        &self,
        room_id: RoomId,
        reservation_id: ReservationId,
        until: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<Room, StoreError> {
        let _write = self.tables.write_lock.lock();
        let still_active = self
            .tables
            .reservations
            .get(&reservation_id)
            .map(|r| r.room_id == room_id && r.status.is_active())
            .ok_or_else(|| StoreError::NotFound(format!("reservation {}", reservation_id)))?;
        let mut room = self
            .tables
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))?;

        // A withdrawn room has no date to hold until
        let already_held = !room.is_available
            && room
                .available_from
                .map_or(true, |held_until| held_until >= until);
        if still_active && !already_held {
            room.is_available = false;
            room.available_from = Some(until);
            room.updated_at = at;
        }
        Ok(room.value().clone())
    }

    async fn release_room_hold(
        &self,
        room_id: RoomId,
        at: DateTime<Utc>,
    ) -> Result<Room, StoreError> {
        let _write = self.tables.write_lock.lock();
        let today = at.date_naive();
        let latest_check_out = self
            .tables
            .reservations
            .iter()
            .filter(|r| {
                r.room_id == room_id && r.status.is_active() && r.stay.check_out() > today
            })
            .map(|r| r.stay.check_out())
            .max();
        let mut room = self
            .tables
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))?;

        let withdrawn = !room.is_available && room.available_from.is_none();
        if !withdrawn {
            room.is_available = latest_check_out.is_none();
            room.available_from = latest_check_out;
            room.updated_at = at;
        }
        Ok(room.value().clone())
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn find_guest(&self, id: GuestId) -> Result<Option<Guest>, StoreError> {
        Ok(self.tables.guests.get(&id).map(|guest| guest.value().clone()))
    }

    async fn get_reservation(
        &self,
        id: ReservationId,
    ) -> Result<Option<ReservationDetails>, StoreError> {
        let reservation = match self.tables.reservations.get(&id) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        self.tables.hydrate(reservation).map(Some)
    }

    async fn get_reservations_by_guest(
        &self,
        guest_id: GuestId,
    ) -> Result<Vec<ReservationDetails>, StoreError> {
        let query = ReservationQuery::for_guest(guest_id).include_cancelled();
        self.tables
            .reservations_matching(&query)
            .into_iter()
            .map(|reservation| self.tables.hydrate(reservation))
            .collect()
    }

    async fn update_reservation_status(
        &self,
        id: ReservationId,
        expected: ReservationStatus,
        next: ReservationStatus,
        follow_up: &[OutboxMessage],
        at: DateTime<Utc>,
    ) -> Result<Reservation, StoreError> {
        let _write = self.tables.write_lock.lock();
        let mut stored = self
            .tables
            .reservations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("reservation {}", id)))?;

        if stored.status != expected {
            return Err(StoreError::StaleState(format!(
                "reservation {} is {}, expected {}",
                id, stored.status, expected
            )));
        }
        let entries = self.tables.outbox_entries_for(follow_up, at)?;
        stored.status = next;
        stored.updated_at = at;
        let updated = stored.value().clone();
        drop(stored);

        self.tables.append_outbox(entries);
        Ok(updated)
    }

    async fn record_settlement(&self, settlement: &SettlementWrite) -> Result<(), StoreError> {
        let _write = self.tables.write_lock.lock();
        let tables = &self.tables;

        let current_status = tables
            .reservations
            .get(&settlement.reservation_id)
            .map(|r| r.status)
            .ok_or_else(|| {
                StoreError::NotFound(format!("reservation {}", settlement.reservation_id))
            })?;
        if current_status != settlement.expected {
            return Err(StoreError::StaleState(format!(
                "reservation {} is {}, expected {}",
                settlement.reservation_id, current_status, settlement.expected
            )));
        }

        let payment_status = tables
            .payments
            .get(&settlement.payment.id)
            .map(|p| p.status)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", settlement.payment.id)))?;
        if payment_status != PaymentStatus::Pending {
            return Err(StoreError::StaleState(format!(
                "payment {} is already {}",
                settlement.payment.id, payment_status
            )));
        }

        let entries = tables.outbox_entries_for(&settlement.follow_up, settlement.at)?;
        tables
            .payments
            .insert(settlement.payment.id, settlement.payment.clone());
        if let Some(mut reservation) = tables.reservations.get_mut(&settlement.reservation_id) {
            reservation.status = settlement.next;
            reservation.updated_at = settlement.at;
        }
        tables.append_outbox(entries);
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        Ok(self.tables.payments.get(&id).map(|p| p.value().clone()))
    }

    async fn update_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let _write = self.tables.write_lock.lock();
        let previous_tx = self
            .tables
            .payments
            .get(&payment.id)
            .map(|p| p.transaction_id.clone())
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", payment.id)))?;

        if previous_tx != payment.transaction_id {
            if self.tables.transaction_ids.contains_key(&payment.transaction_id) {
                return Err(StoreError::Conflict(format!(
                    "transaction id {} already recorded",
                    payment.transaction_id
                )));
            }
            self.tables.transaction_ids.remove(&previous_tx);
            self.tables
                .transaction_ids
                .insert(payment.transaction_id.clone(), payment.id);
        }
        self.tables.payments.insert(payment.id, payment.clone());
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::Backend(format!("invalid lease: {}", e)))?;
        let mut outbox = self.tables.outbox.lock();

        let claimed: Vec<OutboxEntry> = outbox
            .values_mut()
            .filter(|entry| {
                matches!(entry.status, OutboxStatus::Pending | OutboxStatus::InFlight)
                    && entry.next_attempt_at <= now
            })
            .take(limit)
            .map(|entry| {
                entry.status = OutboxStatus::InFlight;
                entry.attempts += 1;
                entry.next_attempt_at = now + lease;
                entry.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_delivered(&self, id: OutboxId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_outbox_entry(id, |entry| {
            entry.status = OutboxStatus::Delivered;
            entry.delivered_at = Some(at);
        })
    }

    async fn reschedule(
        &self,
        id: OutboxId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_outbox_entry(id, |entry| {
            entry.status = OutboxStatus::Pending;
            entry.last_error = Some(error.to_string());
            entry.next_attempt_at = next_attempt_at;
        })
    }

    async fn mark_dead(&self, id: OutboxId, error: &str) -> Result<(), StoreError> {
        self.with_outbox_entry(id, |entry| {
            entry.status = OutboxStatus::Dead;
            entry.last_error = Some(error.to_string());
        })
    }

    async fn get_outbox_entry(&self, id: OutboxId) -> Result<Option<OutboxEntry>, StoreError> {
        Ok(self.tables.outbox.lock().get(&id).cloned())
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn begin(&self, room_id: RoomId) -> Result<Box<dyn BookingTransaction>, StoreError> {
        let lock = self
            .tables
            .room_locks
            .entry(room_id)
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        debug!(room_id = %room_id, "booking transaction started");

        Ok(Box::new(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            room_id,
            _room_guard: guard,
            payments: Vec::new(),
            reservations: Vec::new(),
            messages: Vec::new(),
        }))
    }
}

// Dropping the transaction without committing discards the staged writes
struct MemoryTransaction {
    tables: Arc<Tables>,
    room_id: RoomId,
    _room_guard: OwnedMutexGuard<()>,
    payments: Vec<Payment>,
    reservations: Vec<Reservation>,
    messages: Vec<OutboxMessage>,
}

impl MemoryTransaction {
    fn apply(self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let tables = &self.tables;
        let _write = tables.write_lock.lock();

        for payment in &self.payments {
            if !tables.guests.contains_key(&payment.guest_id) {
                return Err(StoreError::NotFound(format!("guest {}", payment.guest_id)));
            }
            let reused = tables.transaction_ids.contains_key(&payment.transaction_id)
                || self
                    .payments
                    .iter()
                    .filter(|other| other.transaction_id == payment.transaction_id)
                    .count()
                    > 1;
            if reused {
                return Err(StoreError::Conflict(format!(
                    "transaction id {} already recorded",
                    payment.transaction_id
                )));
            }
        }

        for (index, reservation) in self.reservations.iter().enumerate() {
            if reservation.room_id != self.room_id {
                return Err(StoreError::Backend(format!(
                    "reservation {} targets room {} outside this transaction",
                    reservation.id, reservation.room_id
                )));
            }
            if !tables.rooms.contains_key(&reservation.room_id) {
                return Err(StoreError::NotFound(format!("room {}", reservation.room_id)));
            }
            if !tables.guests.contains_key(&reservation.guest_id) {
                return Err(StoreError::NotFound(format!("guest {}", reservation.guest_id)));
            }
            let payment_known = tables.payments.contains_key(&reservation.payment_id)
                || self.payments.iter().any(|p| p.id == reservation.payment_id);
            if !payment_known {
                return Err(StoreError::NotFound(format!(
                    "payment {}",
                    reservation.payment_id
                )));
            }

            // Exclusion constraint: no two active reservations of a room overlap
            if reservation.status.is_active() {
                let query = ReservationQuery::for_room(reservation.room_id)
                    .overlapping(reservation.stay)
                    .excluding(Some(reservation.id));
                let committed = tables.reservations.iter().any(|r| query.matches(r.value()));
                let staged = self.reservations[..index].iter().any(|r| query.matches(r));
                if committed || staged {
                    return Err(StoreError::Conflict(format!(
                        "room {} already booked within {}",
                        reservation.room_id, reservation.stay
                    )));
                }
            }
        }

        let outbox_entries = tables.outbox_entries_for(&self.messages, now)?;

        for payment in self.payments {
            tables
                .transaction_ids
                .insert(payment.transaction_id.clone(), payment.id);
            tables.payments.insert(payment.id, payment);
        }
        for reservation in self.reservations {
            tables.reservations.insert(reservation.id, reservation);
        }
        tables.append_outbox(outbox_entries);
        Ok(())
    }
}

#[async_trait]
impl RoomReader for MemoryTransaction {
    async fn find_room_by_id(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.tables.rooms.get(&id).map(|room| room.value().clone()))
    }

    // Sees committed reservations plus the ones staged in this transaction
    async fn find_overlapping_reservations(
        &self,
        query: &ReservationQuery,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut found = self.tables.reservations_matching(query);
        found.extend(query.filter(&self.reservations));
        Ok(found)
    }
}

#[async_trait]
impl BookingTransaction for MemoryTransaction {
    fn room_id(&self) -> RoomId {
        self.room_id
    }

    fn stage_payment(&mut self, payment: Payment) {
        self.payments.push(payment);
    }

    fn stage_reservation(&mut self, reservation: Reservation) {
        self.reservations.push(reservation);
    }

    fn enqueue(&mut self, message: OutboxMessage) {
        self.messages.push(message);
    }

    async fn commit(self: Box<Self>, now: DateTime<Utc>) -> Result<(), StoreError> {
        let room_id = self.room_id;
        let staged = self.reservations.len();
        (*self).apply(now)?;
        debug!(room_id = %room_id, staged, "booking transaction committed");
        Ok(())
    }
}
