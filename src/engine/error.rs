use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("email already registered: {0}")]
    EmailTaken(String),
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error("seat {0} is under maintenance")]
    SeatUnavailable(Ulid),
    #[error("time slot {0} is already taken")]
    SlotUnavailable(Ulid),
    #[error("booking {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("seat {0} still has active bookings")]
    HasActiveBookings(Ulid),
    #[error("booking window has already ended")]
    InPast,
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
