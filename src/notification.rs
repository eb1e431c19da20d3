// Booking confirmation payload and the notifier port.
// Delivery (SMTP or otherwise) lives behind `Notifier`; the engine only builds the payload.

use crate::model::ReservationId;
use crate::payment::{PaymentMethod, PaymentStatus};
use crate::reservation::ReservationDetails;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationPayload {
    pub reservation_id: ReservationId,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub nights: i64,
    pub room_number: String,
    pub room_type: String,
    pub hotel_name: String,
    pub guest_name: String,
    pub guest_email: String,
    pub num_guests: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_request: Option<String>,
    pub total_price: Decimal,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
}

impl ConfirmationPayload {
    pub fn from_details(details: &ReservationDetails) -> Self {
        let reservation = &details.reservation;
        Self {
            reservation_id: reservation.id,
            check_in: reservation.check_in(),
            check_out: reservation.check_out(),
            nights: reservation.stay.nights(),
            room_number: details.room.room_number.clone(),
            room_type: details.room_type.name.clone(),
            hotel_name: details.hotel.name.clone(),
            guest_name: details.guest.name.clone(),
            guest_email: details.guest.email.clone(),
            num_guests: reservation.num_guests,
            special_request: reservation.special_request.clone(),
            total_price: reservation.total_price,
            currency: details.payment.currency.clone(),
            payment_method: details.payment.method,
            payment_status: details.payment.status,
        }
    }

    pub fn subject(&self) -> String {
        format!("Booking Confirmation - {}", self.hotel_name)
    }

    // e.g. "Sunday, June 1, 2025"
    pub fn check_in_display(&self) -> String {
        display_date(self.check_in)
    }

    pub fn check_out_display(&self) -> String {
        display_date(self.check_out)
    }
}

fn display_date(date: NaiveDate) -> String {
    date.format("%A, %B %-d, %Y").to_string()
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, recipient: &str, payload: &ConfirmationPayload) -> anyhow::Result<()>;
}

// Notifier that only logs; used when no transport is wired in
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, recipient: &str, payload: &ConfirmationPayload) -> anyhow::Result<()> {
        info!(
            recipient,
            reservation_id = %payload.reservation_id,
            hotel = %payload.hotel_name,
            check_in = %payload.check_in,
            check_out = %payload.check_out,
            total_price = %payload.total_price,
            payment_status = %payload.payment_status,
            subject = %payload.subject(),
            "booking confirmation"
        );
        Ok(())
    }
}
