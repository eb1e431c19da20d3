// Booking engine: creates reservations, drives their lifecycle and serves reads

use crate::availability::{check_availability, Availability};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{BookingError, StoreError};
use crate::model::{GuestId, HotelId, ReservationId, Room, RoomId, StayDates};
use crate::outbox::{OutboxMessage, RelayWaker};
use crate::payment::{Payment, PaymentMethod, SettlementOutcome};
use crate::pricing::quote_total;
use crate::reservation::{LifecycleAction, Reservation, ReservationDetails, ReservationStatus};
use crate::store::{BookingStore, SettlementWrite};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// Compare-and-set rounds before a lifecycle change is given up as an internal error
const MAX_TRANSITION_ATTEMPTS: usize = 5;

// How a caller names the room to book
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomIdentifier {
    Id(RoomId),
    // Room numbers repeat across hotels; `hotel_id` narrows the lookup
    Number {
        number: String,
        hotel_id: Option<HotelId>,
    },
}

impl RoomIdentifier {
    /// Builds an identifier from the loose fields a request form carries.
    /// Exactly one of `room_id` and `room_number` must be present.
    pub fn from_parts(
        room_id: Option<RoomId>,
        room_number: Option<&str>,
        hotel_id: Option<HotelId>,
    ) -> Result<Self, BookingError> {
        let room_number = room_number.map(str::trim).filter(|n| !n.is_empty());
        match (room_id, room_number) {
            (Some(id), None) => Ok(RoomIdentifier::Id(id)),
            (None, Some(number)) => Ok(RoomIdentifier::Number {
                number: number.to_string(),
                hotel_id,
            }),
            (None, None) => Err(BookingError::Validation(
                "either room id or room number must be provided".to_string(),
            )),
            (Some(_), Some(_)) => Err(BookingError::Validation(
                "provide either room id or room number, not both".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateReservation {
    pub guest_id: GuestId,
    pub room: RoomIdentifier,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub num_guests: u32,
    pub special_request: Option<String>,
    pub payment_method: PaymentMethod,
    // Passed through to the payment record untouched
    pub payment_details: serde_json::Value,
}

#[derive(Debug, Default)]
pub struct EngineStats {
    pub created: AtomicUsize,
    pub conflicts: AtomicUsize,
    pub rejected: AtomicUsize,
    pub transitions: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EngineStatsReport {
    pub created: usize,
    pub conflicts: usize,
    pub rejected: usize,
    pub transitions: usize,
}

#[async_trait]
pub trait ReservationService: Send + Sync {
    /// Books a room for a guest. The reservation and its payment start out
    /// PENDING; room hold and confirmation follow through the outbox.
    async fn create_reservation(
        &self,
        request: CreateReservation,
    ) -> Result<ReservationDetails, BookingError>;

    async fn check_availability(
        &self,
        room_id: RoomId,
        stay: StayDates,
        exclude: Option<ReservationId>,
    ) -> Result<Availability, BookingError>;

    async fn cancel_reservation(&self, id: ReservationId) -> Result<Reservation, BookingError>;

    async fn check_in(&self, id: ReservationId) -> Result<Reservation, BookingError>;

    async fn check_out(&self, id: ReservationId) -> Result<Reservation, BookingError>;

    // Entry point for the payment processor's verdict on a pending payment
    async fn settle_payment(
        &self,
        id: ReservationId,
        outcome: SettlementOutcome,
    ) -> Result<ReservationDetails, BookingError>;

    async fn get_reservation(&self, id: ReservationId) -> Result<ReservationDetails, BookingError>;

    // Sorted by check-in date, cancelled ones included
    async fn get_user_reservations(
        &self,
        guest_id: GuestId,
    ) -> Result<Vec<ReservationDetails>, BookingError>;

    async fn get_room_by_number(
        &self,
        room_number: &str,
        hotel_id: Option<HotelId>,
    ) -> Result<Room, BookingError>;

    fn stats(&self) -> EngineStatsReport;
}

pub struct BookingEngine<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    relay: Option<RelayWaker>,
    stats: EngineStats,
}

impl<S: BookingStore> BookingEngine<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
            relay: None,
            stats: EngineStats::default(),
        }
    }

    // Pings the relay after every committed booking instead of waiting for its next poll
    pub fn with_relay_waker(mut self, waker: RelayWaker) -> Self {
        self.relay = Some(waker);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn wake_relay(&self, enqueued: &[OutboxMessage]) {
        if enqueued.is_empty() {
            return;
        }
        if let Some(relay) = &self.relay {
            relay.wake();
        }
    }

    fn reject(&self, message: impl Into<String>) -> BookingError {
        self.stats.rejected.fetch_add(1, Ordering::SeqCst);
        BookingError::Validation(message.into())
    }

    // Returns the stay and the trimmed special request
    fn validate(
        &self,
        request: &CreateReservation,
    ) -> Result<(StayDates, Option<String>), BookingError> {
        let stay = match StayDates::new(request.check_in, request.check_out) {
            Ok(stay) => stay,
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let today = self.clock.today();
        if stay.check_in() < today {
            return Err(self.reject(format!(
                "check-in date {} is in the past (today is {})",
                stay.check_in(),
                today
            )));
        }

        if request.num_guests == 0 {
            return Err(self.reject("at least one guest is required"));
        }
        if request.num_guests > self.config.max_guests {
            return Err(self.reject(format!(
                "at most {} guests can be booked at once",
                self.config.max_guests
            )));
        }

        let special_request = request
            .special_request
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        if let Some(text) = &special_request {
            if text.chars().count() > self.config.max_special_request_len {
                return Err(self.reject(format!(
                    "special request exceeds {} characters",
                    self.config.max_special_request_len
                )));
            }
        }

        Ok((stay, special_request))
    }

    async fn resolve_room(&self, identifier: &RoomIdentifier) -> Result<Room, BookingError> {
        match identifier {
            RoomIdentifier::Id(id) => self
                .store
                .find_room_by_id(*id)
                .await
                .map_err(internal("find room"))?
                .ok_or_else(|| BookingError::not_found("Room", id)),
            RoomIdentifier::Number { number, hotel_id } => {
                self.get_room_by_number(number, *hotel_id).await
            }
        }
    }

    async fn load(&self, id: ReservationId) -> Result<ReservationDetails, BookingError> {
        self.store
            .get_reservation(id)
            .await
            .map_err(internal("load reservation"))?
            .ok_or_else(|| BookingError::not_found("Reservation", id))
    }

    // Applies `action` with compare-and-set, re-reading the status after a lost race
    async fn transition(
        &self,
        id: ReservationId,
        action: LifecycleAction,
    ) -> Result<Reservation, BookingError> {
        for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
            let reservation = self.load(id).await?.reservation;
            let current = reservation.status;
            let next = current
                .apply(action)
                .map_err(|e| BookingError::from_transition(id, e))?;
            let follow_up = follow_up(&reservation, next);

            match self
                .store
                .update_reservation_status(id, current, next, &follow_up, self.clock.now())
                .await
            {
                Ok(reservation) => {
                    self.stats.transitions.fetch_add(1, Ordering::SeqCst);
                    self.wake_relay(&follow_up);
                    info!(
                        reservation_id = %id,
                        action = %action,
                        from = %current,
                        to = %next,
                        "reservation status changed"
                    );
                    return Ok(reservation);
                }
                Err(StoreError::StaleState(reason)) => {
                    debug!(reservation_id = %id, attempt, reason = %reason, "status changed concurrently, retrying");
                }
                Err(StoreError::NotFound(_)) => return Err(BookingError::not_found("Reservation", id)),
                Err(e) => return Err(internal("update reservation status")(e)),
            }
        }

        error!(reservation_id = %id, action = %action, "gave up on contended status change");
        Err(BookingError::Internal)
    }
}

#[async_trait]
impl<S: BookingStore> ReservationService for BookingEngine<S> {
    async fn create_reservation(
        &self,
        request: CreateReservation,
    ) -> Result<ReservationDetails, BookingError> {
        let (stay, special_request) = self.validate(&request)?;
        let room = self.resolve_room(&request.room).await?;

        let room_type = self
            .store
            .find_room_type(room.room_type_id)
            .await
            .map_err(internal("find room type"))?
            .ok_or_else(|| BookingError::not_found("Room type", room.room_type_id))?;
        if request.num_guests > room_type.max_occupancy {
            return Err(self.reject(format!(
                "room {} sleeps at most {} guests",
                room.room_number, room_type.max_occupancy
            )));
        }
        let total_price = quote_total(&room_type, &stay);

        self.store
            .find_guest(request.guest_id)
            .await
            .map_err(internal("find guest"))?
            .ok_or_else(|| BookingError::not_found("Guest", request.guest_id))?;

        // Held until commit or drop; concurrent bookings of this room queue here
        let mut tx = self.store.begin(room.id).await.map_err(internal("begin booking"))?;

        let availability = check_availability(&*tx, room.id, &stay, None)
            .await
            .map_err(internal("check availability"))?;
        if let Err(e) = availability.into_result(room.id) {
            self.stats.conflicts.fetch_add(1, Ordering::SeqCst);
            info!(room_id = %room.id, stay = %stay, error = %e, "booking refused");
            return Err(e);
        }

        let now = self.clock.now();
        let payment = Payment::pending(
            request.guest_id,
            total_price,
            self.config.currency.clone(),
            request.payment_method,
            request.payment_details,
            now,
        );
        let reservation = Reservation {
            id: ReservationId::new(),
            room_id: room.id,
            guest_id: request.guest_id,
            stay,
            num_guests: request.num_guests,
            special_request,
            total_price,
            status: ReservationStatus::Pending,
            payment_id: payment.id,
            created_at: now,
            updated_at: now,
        };
        let reservation_id = reservation.id;

        tx.stage_payment(payment);
        tx.stage_reservation(reservation);
        tx.enqueue(OutboxMessage::HoldRoom {
            room_id: room.id,
            reservation_id,
            available_from: stay.check_out(),
        });
        tx.enqueue(OutboxMessage::SendConfirmation { reservation_id });

        match tx.commit(now).await {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                self.stats.conflicts.fetch_add(1, Ordering::SeqCst);
                warn!(room_id = %room.id, reason = %reason, "booking rejected at commit");
                return Err(BookingError::Conflict {
                    room_id: room.id,
                    conflicting: Vec::new(),
                });
            }
            // The room was resolved above; the remaining reference is the guest
            Err(StoreError::NotFound(_)) => {
                return Err(BookingError::not_found("Guest", request.guest_id))
            }
            Err(e) => return Err(internal("commit booking")(e)),
        }

        self.stats.created.fetch_add(1, Ordering::SeqCst);
        info!(
            reservation_id = %reservation_id,
            room_id = %room.id,
            guest_id = %request.guest_id,
            stay = %stay,
            total_price = %total_price,
            "reservation created"
        );
        if let Some(relay) = &self.relay {
            relay.wake();
        }

        self.store
            .get_reservation(reservation_id)
            .await
            .map_err(internal("load created reservation"))?
            .ok_or_else(|| {
                error!(reservation_id = %reservation_id, "committed reservation not readable");
                BookingError::Internal
            })
    }

    async fn check_availability(
        &self,
        room_id: RoomId,
        stay: StayDates,
        exclude: Option<ReservationId>,
    ) -> Result<Availability, BookingError> {
        match check_availability(&*self.store, room_id, &stay, exclude).await {
            Ok(availability) => Ok(availability),
            Err(StoreError::NotFound(_)) => Err(BookingError::not_found("Room", room_id)),
            Err(e) => Err(internal("check availability")(e)),
        }
    }

    async fn cancel_reservation(&self, id: ReservationId) -> Result<Reservation, BookingError> {
        self.transition(id, LifecycleAction::Cancel).await
    }

    async fn check_in(&self, id: ReservationId) -> Result<Reservation, BookingError> {
        self.transition(id, LifecycleAction::CheckIn).await
    }

    async fn check_out(&self, id: ReservationId) -> Result<Reservation, BookingError> {
        self.transition(id, LifecycleAction::CheckOut).await
    }

    async fn settle_payment(
        &self,
        id: ReservationId,
        outcome: SettlementOutcome,
    ) -> Result<ReservationDetails, BookingError> {
        let action = match outcome {
            SettlementOutcome::Succeeded => LifecycleAction::Confirm,
            SettlementOutcome::Failed => LifecycleAction::Cancel,
        };

        for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
            let details = self.load(id).await?;
            let current = details.reservation.status;

            // Only a pending reservation is waiting on its payment
            if current == ReservationStatus::Cancelled {
                return Err(BookingError::AlreadyCancelled(id));
            }
            current
                .apply(LifecycleAction::Confirm)
                .map_err(|e| BookingError::from_transition(id, e))?;
            let next = current
                .apply(action)
                .map_err(|e| BookingError::from_transition(id, e))?;

            let now = self.clock.now();
            let mut payment = details.payment;
            let payment_status = payment
                .settle(outcome, now)
                .map_err(|e| BookingError::from_transition(id, e))?;

            let write = SettlementWrite {
                reservation_id: id,
                expected: current,
                next,
                payment,
                follow_up: follow_up(&details.reservation, next),
                at: now,
            };
            match self.store.record_settlement(&write).await {
                Ok(()) => {
                    self.stats.transitions.fetch_add(1, Ordering::SeqCst);
                    self.wake_relay(&write.follow_up);
                    info!(
                        reservation_id = %id,
                        payment_status = %payment_status,
                        status = %next,
                        "payment settled"
                    );
                    return self.load(id).await;
                }
                Err(StoreError::StaleState(reason)) => {
                    debug!(reservation_id = %id, attempt, reason = %reason, "settlement raced, retrying");
                }
                Err(e) => return Err(internal("record settlement")(e)),
            }
        }

        error!(reservation_id = %id, "gave up on contended settlement");
        Err(BookingError::Internal)
    }

    async fn get_reservation(&self, id: ReservationId) -> Result<ReservationDetails, BookingError> {
        self.load(id).await
    }

    async fn get_user_reservations(
        &self,
        guest_id: GuestId,
    ) -> Result<Vec<ReservationDetails>, BookingError> {
        let mut reservations = self
            .store
            .get_reservations_by_guest(guest_id)
            .await
            .map_err(internal("list guest reservations"))?;
        reservations.sort_by_key(|d| (d.reservation.check_in(), d.reservation.created_at));
        Ok(reservations)
    }

    async fn get_room_by_number(
        &self,
        room_number: &str,
        hotel_id: Option<HotelId>,
    ) -> Result<Room, BookingError> {
        let room_number = room_number.trim();
        if room_number.is_empty() {
            return Err(self.reject("room number must not be empty"));
        }

        let mut rooms: Vec<Room> = self
            .store
            .find_rooms_by_number(room_number)
            .await
            .map_err(internal("find rooms by number"))?
            .into_iter()
            .filter(|room| hotel_id.map_or(true, |id| room.hotel_id == id))
            .collect();

        match rooms.len() {
            0 => Err(BookingError::not_found("Room", room_number)),
            1 => Ok(rooms.remove(0)),
            n => Err(self.reject(format!(
                "room number {} matches {} rooms; specify the hotel",
                room_number, n
            ))),
        }
    }

    fn stats(&self) -> EngineStatsReport {
        EngineStatsReport {
            created: self.stats.created.load(Ordering::SeqCst),
            conflicts: self.stats.conflicts.load(Ordering::SeqCst),
            rejected: self.stats.rejected.load(Ordering::SeqCst),
            transitions: self.stats.transitions.load(Ordering::SeqCst),
        }
    }
}

// A cancelled reservation no longer justifies the room's provisional hold
fn follow_up(reservation: &Reservation, next: ReservationStatus) -> Vec<OutboxMessage> {
    if next == ReservationStatus::Cancelled {
        vec![OutboxMessage::ReleaseHold {
            room_id: reservation.room_id,
        }]
    } else {
        Vec::new()
    }
}

// Logs the store failure and hides it from the caller
fn internal(operation: &'static str) -> impl Fn(StoreError) -> BookingError {
    move |e| {
        error!(operation, error = %e, "store failure");
        BookingError::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::error::UnavailableReason;
    use crate::outbox::OutboxRelay;
    use crate::payment::PaymentStatus;
    use crate::store::RoomReader;
    use crate::test_support::{date, stay, Fixture, RecordingNotifier};
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use test_case::test_case;

    fn engine(fixture: &Fixture) -> BookingEngine<crate::memory_store::MemoryStore> {
        fixture.engine(EngineConfig::default())
    }

    fn request(fixture: &Fixture, check_in: &str, check_out: &str) -> CreateReservation {
        CreateReservation {
            guest_id: fixture.guest.id,
            room: RoomIdentifier::Id(fixture.room.id),
            check_in: date(check_in),
            check_out: date(check_out),
            num_guests: 2,
            special_request: None,
            payment_method: PaymentMethod::CreditCard,
            payment_details: serde_json::json!({ "last4": "4242" }),
        }
    }

    #[tokio::test]
    async fn test_create_reservation_end_to_end() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);

        let details = engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap();

        let reservation = &details.reservation;
        assert_eq!(reservation.status, ReservationStatus::Pending);
        assert_eq!(reservation.stay, stay("2025-06-01", "2025-06-05"));
        assert_eq!(reservation.total_price, Decimal::from_str("480.00").unwrap());
        assert_eq!(details.payment.status, PaymentStatus::Pending);
        assert_eq!(details.payment.id, reservation.payment_id);
        assert_eq!(details.payment.amount, reservation.total_price);
        assert_eq!(details.payment.currency, "USD");
        assert_eq!(details.payment.details["last4"], "4242");
        assert_eq!(details.room.id, fixture.room.id);
        assert_eq!(details.room_type.id, fixture.room_type.id);
        assert_eq!(details.guest.id, fixture.guest.id);

        // Hold and confirmation wait in the outbox
        let topics: Vec<_> = fixture
            .store
            .outbox_entries()
            .into_iter()
            .map(|e| e.topic)
            .collect();
        assert_eq!(topics, vec!["room.hold", "reservation.confirmation"]);
        assert_eq!(engine.stats().created, 1);
    }

    #[test_case("2025-05-19", "2025-05-22"; "check in yesterday")]
    #[test_case("2025-06-05", "2025-06-05"; "zero nights")]
    #[test_case("2025-06-05", "2025-06-01"; "check out before check in")]
    #[tokio::test]
    async fn test_invalid_dates_rejected(check_in: &str, check_out: &str) {
        let fixture = Fixture::new();
        let engine = engine(&fixture);

        let err = engine
            .create_reservation(request(&fixture, check_in, check_out))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)), "got {:?}", err);
        assert_eq!(fixture.store.reservation_count(), 0);
        assert_eq!(engine.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_booking_for_today_is_allowed() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        tokio_test::assert_ok!(
            engine
                .create_reservation(request(&fixture, "2025-05-20", "2025-05-21"))
                .await
        );
    }

    #[test_case(0; "no guests")]
    #[test_case(3; "over room occupancy")]
    #[test_case(11; "over absolute cap")]
    #[tokio::test]
    async fn test_guest_count_rejected(num_guests: u32) {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let mut req = request(&fixture, "2025-06-01", "2025-06-05");
        req.num_guests = num_guests;

        let err = engine.create_reservation(req).await.unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_special_request_trimmed_and_capped() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);

        let mut req = request(&fixture, "2025-06-01", "2025-06-03");
        req.special_request = Some("   ".to_string());
        let details = engine.create_reservation(req).await.unwrap();
        assert_eq!(details.reservation.special_request, None);

        let mut req = request(&fixture, "2025-06-03", "2025-06-05");
        req.special_request = Some(" late arrival ".to_string());
        let details = engine.create_reservation(req).await.unwrap();
        assert_eq!(
            details.reservation.special_request.as_deref(),
            Some("late arrival")
        );

        let mut req = request(&fixture, "2025-06-10", "2025-06-12");
        req.special_request = Some("x".repeat(501));
        let err = engine.create_reservation(req).await.unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_room_and_guest() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);

        let mut req = request(&fixture, "2025-06-01", "2025-06-05");
        req.room = RoomIdentifier::Id(RoomId::new());
        let err = engine.create_reservation(req).await.unwrap_err();
        assert!(matches!(err, BookingError::NotFound { entity: "Room", .. }));

        let mut req = request(&fixture, "2025-06-01", "2025-06-05");
        req.guest_id = GuestId::new();
        let err = engine.create_reservation(req).await.unwrap_err();
        assert!(matches!(err, BookingError::NotFound { entity: "Guest", .. }));
        assert_eq!(fixture.store.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_guest_reported_before_conflict() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap();

        let mut req = request(&fixture, "2025-06-02", "2025-06-04");
        req.guest_id = GuestId::new();
        let err = engine.create_reservation(req).await.unwrap_err();
        assert!(matches!(err, BookingError::NotFound { entity: "Guest", .. }));
        assert_eq!(engine.stats().conflicts, 0);
    }

    #[tokio::test]
    async fn test_maintenance_room_refused() {
        let fixture = Fixture::new();
        fixture.set_room(|room| room.under_maintenance = true);
        let engine = engine(&fixture);

        let err = engine
            .create_reservation(request(&fixture, "2025-09-01", "2025-09-02"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BookingError::RoomUnavailable {
                reason: UnavailableReason::UnderMaintenance,
                ..
            }
        ));
        assert!(err.is_conflict());
        assert!(fixture.store.outbox_entries().is_empty());
    }

    #[tokio::test]
    async fn test_overlap_and_turnover() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let first = engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap();

        let err = engine
            .create_reservation(request(&fixture, "2025-06-03", "2025-06-07"))
            .await
            .unwrap_err();
        match err {
            BookingError::Conflict { conflicting, .. } => {
                assert_eq!(conflicting, vec![first.reservation.id])
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        tokio_test::assert_ok!(
            engine
                .create_reservation(request(&fixture, "2025-06-05", "2025-06-08"))
                .await
        );
        assert_eq!(engine.stats().conflicts, 1);
        assert_eq!(fixture.store.reservation_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_bookings_only_one_wins() {
        let fixture = Fixture::new();
        let engine = Arc::new(engine(&fixture));

        let handles: Vec<_> = [("2025-06-01", "2025-06-05"), ("2025-06-03", "2025-06-07")]
            .into_iter()
            .map(|(check_in, check_out)| {
                let engine = Arc::clone(&engine);
                let req = request(&fixture, check_in, check_out);
                tokio::spawn(async move { engine.create_reservation(req).await })
            })
            .collect();

        let results: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(BookingError::Conflict { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);
        assert_eq!(fixture.store.reservation_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_bookings_keep_room_disjoint() {
        let fixture = Fixture::new();
        let engine = Arc::new(engine(&fixture));

        // Overlapping two-night windows starting every day
        let handles: Vec<_> = (0..10)
            .map(|offset| {
                let engine = Arc::clone(&engine);
                let check_in = date("2025-06-01") + chrono::Duration::days(offset);
                let mut req = request(&fixture, "2025-06-01", "2025-06-02");
                req.check_in = check_in;
                req.check_out = check_in + chrono::Duration::days(2);
                tokio::spawn(async move { engine.create_reservation(req).await })
            })
            .collect();
        futures::future::join_all(handles).await;

        let booked = engine
            .get_user_reservations(fixture.guest.id)
            .await
            .unwrap();
        assert!(!booked.is_empty());
        for (i, a) in booked.iter().enumerate() {
            for b in &booked[i + 1..] {
                assert!(!a.reservation.stay.overlaps(&b.reservation.stay));
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_twice_reports_already_cancelled() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let created = engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap();
        let id = created.reservation.id;

        let cancelled = engine.cancel_reservation(id).await.unwrap();
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);
        assert_eq!(cancelled.stay, created.reservation.stay);
        assert_eq!(cancelled.total_price, created.reservation.total_price);

        let err = engine.cancel_reservation(id).await.unwrap_err();
        assert!(matches!(err, BookingError::AlreadyCancelled(found) if found == id));

        // Dates are free again
        tokio_test::assert_ok!(
            engine
                .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
                .await
        );
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let id = engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap()
            .reservation
            .id;

        let err = engine.check_in(id).await.unwrap_err();
        assert!(matches!(
            err,
            BookingError::InvalidTransition {
                action: LifecycleAction::CheckIn,
                actual: ReservationStatus::Pending,
                ..
            }
        ));
        assert!(err.to_string().contains("CONFIRMED"));

        engine
            .settle_payment(id, SettlementOutcome::Succeeded)
            .await
            .unwrap();
        let err = engine.check_out(id).await.unwrap_err();
        assert!(matches!(
            err,
            BookingError::InvalidTransition {
                action: LifecycleAction::CheckOut,
                actual: ReservationStatus::Confirmed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let id = engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap()
            .reservation
            .id;

        let confirmed = engine
            .settle_payment(id, SettlementOutcome::Succeeded)
            .await
            .unwrap();
        assert_eq!(confirmed.reservation.status, ReservationStatus::Confirmed);
        assert_eq!(confirmed.payment.status, PaymentStatus::Success);

        fixture.clock.advance(chrono::Duration::days(12));
        let in_progress = engine.check_in(id).await.unwrap();
        assert_eq!(in_progress.status, ReservationStatus::InProgress);
        assert_eq!(in_progress.updated_at, fixture.now());

        let completed = engine.check_out(id).await.unwrap();
        assert_eq!(completed.status, ReservationStatus::Completed);

        let err = engine.cancel_reservation(id).await.unwrap_err();
        assert!(matches!(err, BookingError::InvalidTransition { .. }));
        assert_eq!(engine.stats().transitions, 3);
    }

    #[tokio::test]
    async fn test_failed_settlement_cancels_and_frees_dates() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let id = engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap()
            .reservation
            .id;

        let settled = engine
            .settle_payment(id, SettlementOutcome::Failed)
            .await
            .unwrap();
        assert_eq!(settled.reservation.status, ReservationStatus::Cancelled);
        assert_eq!(settled.payment.status, PaymentStatus::Failed);

        let err = engine
            .settle_payment(id, SettlementOutcome::Succeeded)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::AlreadyCancelled(_)));

        tokio_test::assert_ok!(
            engine
                .create_reservation(request(&fixture, "2025-06-02", "2025-06-04"))
                .await
        );
    }

    #[test_case(false ; "cancelled by guest")]
    #[test_case(true ; "payment failed")]
    #[tokio::test]
    async fn test_hold_released_when_booking_falls_through(payment_failed: bool) {
        let fixture = Fixture::new();
        let clock: Arc<dyn Clock> = fixture.clock.clone();
        let relay = OutboxRelay::new(
            Arc::clone(&fixture.store),
            Arc::new(RecordingNotifier::default()),
            clock,
            RelayConfig::default(),
        );
        let engine = engine(&fixture).with_relay_waker(relay.waker());
        let id = engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap()
            .reservation
            .id;

        assert_eq!(relay.run_once().await.unwrap(), 2);
        let room = fixture
            .store
            .find_room_by_id(fixture.room.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(room.available_from, Some(date("2025-06-05")));

        if payment_failed {
            engine
                .settle_payment(id, SettlementOutcome::Failed)
                .await
                .unwrap();
        } else {
            engine.cancel_reservation(id).await.unwrap();
        }
        assert_eq!(relay.run_once().await.unwrap(), 1);

        let room = fixture
            .store
            .find_room_by_id(fixture.room.id)
            .await
            .unwrap()
            .unwrap();
        assert!(room.is_available);
        assert_eq!(room.available_from, None);
        tokio_test::assert_ok!(
            engine
                .create_reservation(request(&fixture, "2025-06-02", "2025-06-04"))
                .await
        );
    }

    #[tokio::test]
    async fn test_settlement_requires_pending_reservation() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let id = engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap()
            .reservation
            .id;
        engine
            .settle_payment(id, SettlementOutcome::Succeeded)
            .await
            .unwrap();

        let err = engine
            .settle_payment(id, SettlementOutcome::Failed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BookingError::InvalidTransition {
                actual: ReservationStatus::Confirmed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_reservation() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let id = ReservationId::new();

        assert!(matches!(
            engine.get_reservation(id).await,
            Err(BookingError::NotFound { entity: "Reservation", .. })
        ));
        assert!(matches!(
            engine.cancel_reservation(id).await,
            Err(BookingError::NotFound { .. })
        ));
        assert!(matches!(
            engine.settle_payment(id, SettlementOutcome::Succeeded).await,
            Err(BookingError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_user_reservations_sorted_by_check_in() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        for (check_in, check_out) in [
            ("2025-08-01", "2025-08-03"),
            ("2025-06-01", "2025-06-03"),
            ("2025-07-01", "2025-07-03"),
        ] {
            engine
                .create_reservation(request(&fixture, check_in, check_out))
                .await
                .unwrap();
        }

        let check_ins: Vec<_> = engine
            .get_user_reservations(fixture.guest.id)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.reservation.check_in())
            .collect();
        assert_eq!(
            check_ins,
            vec![date("2025-06-01"), date("2025-07-01"), date("2025-08-01")]
        );
        assert!(engine
            .get_user_reservations(GuestId::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_room_lookup_by_number() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let other_hotel = HotelId::new();
        let twin = fixture.add_room("101", Some(other_hotel));

        let err = engine.get_room_by_number("101", None).await.unwrap_err();
        assert!(matches!(err, BookingError::Validation(_)));

        let room = engine
            .get_room_by_number("101", Some(fixture.hotel.id))
            .await
            .unwrap();
        assert_eq!(room.id, fixture.room.id);
        let room = engine
            .get_room_by_number(" 101 ", Some(other_hotel))
            .await
            .unwrap();
        assert_eq!(room.id, twin.id);

        let err = engine.get_room_by_number("404", None).await.unwrap_err();
        assert!(matches!(err, BookingError::NotFound { entity: "Room", .. }));
    }

    #[tokio::test]
    async fn test_create_by_room_number() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let mut req = request(&fixture, "2025-06-01", "2025-06-05");
        req.room = RoomIdentifier::from_parts(None, Some("101"), None).unwrap();

        let details = engine.create_reservation(req).await.unwrap();
        assert_eq!(details.room.id, fixture.room.id);
    }

    #[test]
    fn test_room_identifier_from_parts() {
        let id = RoomId::new();
        assert_eq!(
            RoomIdentifier::from_parts(Some(id), None, None).unwrap(),
            RoomIdentifier::Id(id)
        );
        assert_eq!(
            RoomIdentifier::from_parts(None, Some(" 12 "), None).unwrap(),
            RoomIdentifier::Number {
                number: "12".to_string(),
                hotel_id: None
            }
        );
        assert!(RoomIdentifier::from_parts(None, None, None).is_err());
        assert!(RoomIdentifier::from_parts(None, Some(""), None).is_err());
        assert!(RoomIdentifier::from_parts(Some(id), Some("12"), None).is_err());
    }

    #[tokio::test]
    async fn test_check_availability_operation() {
        let fixture = Fixture::new();
        let engine = engine(&fixture);
        let created = engine
            .create_reservation(request(&fixture, "2025-06-01", "2025-06-05"))
            .await
            .unwrap();
        let id = created.reservation.id;

        let busy = engine
            .check_availability(fixture.room.id, stay("2025-06-04", "2025-06-06"), None)
            .await
            .unwrap();
        assert_eq!(busy, Availability::Conflict(vec![id]));

        let own = engine
            .check_availability(fixture.room.id, stay("2025-06-04", "2025-06-06"), Some(id))
            .await
            .unwrap();
        assert!(own.is_available());

        let err = engine
            .check_availability(RoomId::new(), stay("2025-06-04", "2025-06-06"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_held_room_refuses_earlier_check_in() {
        let fixture = Fixture::new();
        fixture.set_room(|room: &mut Room| {
            room.is_available = false;
            room.available_from = Some(date("2025-06-05"));
        });
        let engine = engine(&fixture);

        let err = engine
            .create_reservation(request(&fixture, "2025-06-03", "2025-06-04"))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::RoomUnavailable { .. }));

        tokio_test::assert_ok!(
            engine
                .create_reservation(request(&fixture, "2025-06-05", "2025-06-07"))
                .await
        );
        // Booking never touches the room row itself
        let room = fixture
            .store
            .find_room_by_id(fixture.room.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(room.available_from, Some(date("2025-06-05")));
    }
}
