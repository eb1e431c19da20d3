// Core records the booking engine reads: hotels, room types, rooms, guests and stay dates

use crate::error::BookingError;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(HotelId);
id_type!(RoomTypeId);
id_type!(RoomId);
id_type!(GuestId);
id_type!(ReservationId);
id_type!(PaymentId);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotel {
    pub id: HotelId,
    pub name: String,
    pub contact_number: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BedType {
    Single,
    Double,
    Queen,
    King,
}

// Room category; read-only as far as booking is concerned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomType {
    pub id: RoomTypeId,
    pub name: String,
    pub description: String,
    pub base_price: Decimal,
    pub max_occupancy: u32,
    pub num_beds: u32,
    pub bed_type: BedType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub hotel_id: HotelId,
    pub room_type_id: RoomTypeId,
    pub room_number: String,
    pub floor_number: i32,
    pub is_available: bool,
    pub under_maintenance: bool,
    // Earliest date the room is bookable again while `is_available` is false.
    // None with `is_available == false` means held with no release date.
    pub available_from: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn new(
        hotel_id: HotelId,
        room_type_id: RoomTypeId,
        room_number: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RoomId::new(),
            hotel_id,
            room_type_id,
            room_number: room_number.into(),
            floor_number: 0,
            is_available: true,
            under_maintenance: false,
            available_from: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guest {
    pub id: GuestId,
    pub name: String,
    pub email: String,
}

/// Half-open stay interval `[check_in, check_out)` at date granularity.
///
/// A stay ending on the day another begins does not overlap it, which is what
/// allows same-day turnover of a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StayDates {
    check_in: NaiveDate,
    check_out: NaiveDate,
}

impl StayDates {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Result<Self, BookingError> {
        if check_in >= check_out {
            return Err(BookingError::Validation(
                "check-in date must be before check-out date".to_string(),
            ));
        }
        Ok(Self {
            check_in,
            check_out,
        })
    }

    // Time of day is dropped; stays are stored at date granularity
    pub fn from_timestamps(
        check_in: DateTime<Utc>,
        check_out: DateTime<Utc>,
    ) -> Result<Self, BookingError> {
        Self::new(check_in.date_naive(), check_out.date_naive())
    }

    pub fn parse(check_in: &str, check_out: &str) -> Result<Self, BookingError> {
        Self::new(parse_date(check_in)?, parse_date(check_out)?)
    }

    pub fn check_in(&self) -> NaiveDate {
        self.check_in
    }

    pub fn check_out(&self) -> NaiveDate {
        self.check_out
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn overlaps(&self, other: &StayDates) -> bool {
        self.check_in < other.check_out && other.check_in < self.check_out
    }
}

impl fmt::Display for StayDates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.check_in, self.check_out)
    }
}

// Parses a "YYYY-MM-DD" date
pub fn parse_date(value: &str) -> Result<NaiveDate, BookingError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BookingError::Validation("date string is empty".to_string()));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| BookingError::Validation(format!("invalid date format '{}': {}", value, e)))
}
