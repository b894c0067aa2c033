use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{quote, seat_is_free};
use super::conflict::validate_query_window;
use super::{Engine, EngineError, SharedSeatState};

/// Optional filters for booking listings. Empty means every booking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub seat_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
}

impl Engine {
    /// Seat handles sorted by seat id, so listings come out in a stable order.
    fn sorted_seats(&self) -> Vec<SharedSeatState> {
        let mut seats: Vec<(Ulid, SharedSeatState)> = self
            .seats
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        seats.sort_by_key(|(id, _)| *id);
        seats.into_iter().map(|(_, s)| s).collect()
    }

    pub fn list_branches(&self) -> Vec<Branch> {
        let mut out: Vec<Branch> = self.branches.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|b| b.id);
        out
    }

    pub fn list_seating_types(&self) -> Vec<SeatingType> {
        let mut out: Vec<SeatingType> = self
            .seating_types
            .iter()
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|t| t.id);
        out
    }

    pub fn seating_type(&self, id: &Ulid) -> Option<SeatingType> {
        self.seating_types.get(id).map(|e| e.value().clone())
    }

    pub async fn list_seats(&self, branch_id: Option<Ulid>) -> Vec<Seat> {
        let mut out = Vec::new();
        for seat in self.sorted_seats() {
            let guard = seat.read().await;
            if branch_id.is_none_or(|b| guard.seat.branch_id == b) {
                out.push(guard.seat.clone());
            }
        }
        out
    }

    pub async fn seat(&self, id: &Ulid) -> Option<Seat> {
        let seat = self.get_seat(id)?;
        let guard = seat.read().await;
        Some(guard.seat.clone())
    }

    /// Bookings matching the filter, ordered by seat then start time.
    pub async fn list_bookings(&self, filter: BookingFilter) -> Vec<Booking> {
        let seats = match filter.seat_id {
            Some(id) => self.get_seat(&id).into_iter().collect(),
            None => self.sorted_seats(),
        };
        let mut out = Vec::new();
        for seat in seats {
            let guard = seat.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| filter.customer_id.is_none_or(|c| b.customer_id == c))
                    .cloned(),
            );
        }
        out
    }

    pub async fn booking(&self, id: &Ulid) -> Option<Booking> {
        let seat_id = self.seat_for_booking(id)?;
        let seat = self.get_seat(&seat_id)?;
        let guard = seat.read().await;
        guard.booking(id).cloned()
    }

    pub fn list_accounts(&self) -> Vec<Account> {
        let mut out: Vec<Account> = self.accounts.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|a| a.id);
        out
    }

    pub fn account(&self, id: &Ulid) -> Option<Account> {
        self.accounts.get(id).map(|e| e.value().clone())
    }

    /// Case-insensitive email lookup.
    pub fn account_by_email(&self, email: &str) -> Option<Account> {
        let id = *self.emails.get(&email.trim().to_lowercase())?.value();
        self.account(&id)
    }

    /// Time slots of one seat overlapping the window, in start order.
    pub async fn time_slots(&self, seat_id: Ulid, window: Span) -> Result<Vec<TimeSlot>, EngineError> {
        validate_query_window(&window)?;
        let seat = self.get_seat(&seat_id).ok_or(EngineError::NotFound(seat_id))?;
        let guard = seat.read().await;
        Ok(guard.overlapping_slots(&window).cloned().collect())
    }

    /// Seats of one type, optionally in one branch, that are free for the window.
    pub async fn free_seats(
        &self,
        seating_type_id: Ulid,
        window: Span,
        branch_id: Option<Ulid>,
    ) -> Result<Vec<Seat>, EngineError> {
        validate_query_window(&window)?;
        if !self.seating_types.contains_key(&seating_type_id) {
            return Err(EngineError::NotFound(seating_type_id));
        }
        if let Some(b) = branch_id
            && !self.branches.contains_key(&b)
        {
            return Err(EngineError::NotFound(b));
        }

        let mut out = Vec::new();
        for seat in self.sorted_seats() {
            let guard = seat.read().await;
            if guard.seat.seating_type_id != seating_type_id {
                continue;
            }
            if branch_id.is_some_and(|b| guard.seat.branch_id != b) {
                continue;
            }
            if seat_is_free(&guard, &window) {
                out.push(guard.seat.clone());
            }
        }
        Ok(out)
    }

    /// Pre-booking check: how many seats of a type are free for the window
    /// and what the requested count would cost. Read-only.
    pub async fn verify_booking(&self, req: VerifyRequest) -> Result<BookingQuote, EngineError> {
        if req.seat_count > MAX_SEAT_COUNT {
            return Err(EngineError::LimitExceeded("seat count too large"));
        }
        let seating_type = self
            .seating_type(&req.seating_type_id)
            .ok_or(EngineError::NotFound(req.seating_type_id))?;
        let free = self
            .free_seats(req.seating_type_id, req.span, req.branch_id)
            .await?;
        let available = u32::try_from(free.len()).unwrap_or(u32::MAX);
        Ok(quote(
            &seating_type,
            req.seat_count,
            available,
            &req.span,
            req.duration_type,
        ))
    }
}
