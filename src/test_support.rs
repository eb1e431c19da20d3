// Seeded store shared by the unit tests

use crate::clock::{Clock, FixedClock};
use crate::config::EngineConfig;
use crate::engine::BookingEngine;
use crate::memory_store::MemoryStore;
use crate::model::{BedType, Guest, GuestId, Hotel, HotelId, Room, RoomType, RoomTypeId, StayDates};
use crate::notification::{ConfirmationPayload, Notifier};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn date(value: &str) -> NaiveDate {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
}

pub fn stay(check_in: &str, check_out: &str) -> StayDates {
    StayDates::parse(check_in, check_out).unwrap()
}

// One hotel with one room of a 120.00/night type sleeping two, and one guest.
// The clock reads 2025-05-20.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<FixedClock>,
    pub hotel: Hotel,
    pub room_type: RoomType,
    pub room: Room,
    pub guest: Guest,
}

impl Fixture {
    pub fn new() -> Self {
        let clock = Arc::new(FixedClock::at_date(date("2025-05-20")));
        let store = Arc::new(MemoryStore::new());

        let hotel = Hotel {
            id: HotelId::new(),
            name: "Lakeside Inn".to_string(),
            contact_number: "+1 555 0100".to_string(),
        };
        let room_type = RoomType {
            id: RoomTypeId::new(),
            name: "Deluxe King".to_string(),
            description: "King bed, lake view".to_string(),
            base_price: Decimal::new(12000, 2),
            max_occupancy: 2,
            num_beds: 1,
            bed_type: BedType::King,
        };
        let room = Room::new(hotel.id, room_type.id, "101", clock.now());
        let guest = Guest {
            id: GuestId::new(),
            name: "Ada Guest".to_string(),
            email: "ada@example.com".to_string(),
        };

        store.insert_hotel(hotel.clone());
        store.insert_room_type(room_type.clone());
        store.insert_room(room.clone());
        store.insert_guest(guest.clone());

        Self {
            store,
            clock,
            hotel,
            room_type,
            room,
            guest,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn engine(&self, config: EngineConfig) -> BookingEngine<MemoryStore> {
        let clock: Arc<dyn Clock> = self.clock.clone();
        BookingEngine::new(Arc::clone(&self.store), clock, config)
    }

    // Adds another room of the same type, optionally in another hotel
    pub fn add_room(&self, number: &str, hotel_id: Option<HotelId>) -> Room {
        let hotel_id = match hotel_id {
            Some(id) => {
                self.store.insert_hotel(Hotel {
                    id,
                    name: format!("Hotel {}", id),
                    contact_number: "+1 555 0199".to_string(),
                });
                id
            }
            None => self.hotel.id,
        };
        let room = Room::new(hotel_id, self.room_type.id, number, self.now());
        self.store.insert_room(room.clone());
        room
    }

    pub fn set_room(&self, update: impl FnOnce(&mut Room)) -> Room {
        let mut room = self.room.clone();
        update(&mut room);
        self.store.insert_room(room.clone());
        room
    }
}

// Keeps every confirmation it is handed
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, ConfirmationPayload)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: &str, payload: &ConfirmationPayload) -> anyhow::Result<()> {
        self.sent
            .lock()
            .push((recipient.to_string(), payload.clone()));
        Ok(())
    }
}

// Fails every call, counting attempts
#[derive(Default)]
pub struct FailingNotifier {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _recipient: &str, _payload: &ConfirmationPayload) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("smtp relay refused connection")
    }
}
