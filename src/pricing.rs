// Reservation pricing: nights x base nightly price of the room type.
// Guest count does not change the price.

use crate::model::{RoomType, StayDates};
use rust_decimal::Decimal;

pub fn quote_total(room_type: &RoomType, stay: &StayDates) -> Decimal {
    room_type.base_price * Decimal::from(stay.nights())
}
