// Room reservation booking engine for hotels

pub mod availability;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory_store;
pub mod model;
pub mod notification;
pub mod outbox;
pub mod payment;
pub mod pricing;
pub mod query;
pub mod reservation;
pub mod store;

#[cfg(test)]
mod test_support;

// Re-export key types for convenience
pub use availability::{check_availability, Availability};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{EngineConfig, RelayConfig, RetryConfig};
pub use engine::{
    BookingEngine, CreateReservation, EngineStatsReport, ReservationService, RoomIdentifier,
};
pub use error::{BookingError, StoreError, UnavailableReason};
pub use memory_store::MemoryStore;
pub use model::{
    parse_date, BedType, Guest, GuestId, Hotel, HotelId, PaymentId, ReservationId, Room, RoomId,
    RoomType, RoomTypeId, StayDates,
};
pub use notification::{ConfirmationPayload, Notifier, TracingNotifier};
pub use outbox::{OutboxMessage, OutboxRelay, RelayHandle, RelayStatsReport, RoomStateUpdater};
pub use payment::{Payment, PaymentMethod, PaymentStatus, SettlementOutcome};
pub use query::ReservationQuery;
pub use reservation::{LifecycleAction, Reservation, ReservationDetails, ReservationStatus};
pub use store::{BookingStore, BookingTransaction, ReservationStore, RoomReader, RoomStore};
