use crate::model::*;

// ── Availability ─────────────────────────────────────────────────

/// A seat is free for `window` unless it is under maintenance or an active
/// booking overlaps the window. The current derived status plays no part:
/// a seat occupied today can still be free next week.
pub fn seat_is_free(ss: &SeatState, window: &Span) -> bool {
    ss.seat.status != SeatStatus::Maintenance && ss.active_overlapping(window).next().is_none()
}

/// Price and feasibility of booking `requested` seats of one type.
///
/// The price covers the requested count capped at `available`, so a partial
/// quote is still informative when the request cannot be met.
pub fn quote(
    seating_type: &SeatingType,
    requested: u32,
    available: u32,
    span: &Span,
    duration_type: DurationType,
) -> BookingQuote {
    let units = duration_type.units(span);
    let rate = seating_type.rates.for_duration(duration_type);
    let bookable = requested.min(available);
    let total_price = rate
        .saturating_mul(units)
        .saturating_mul(u64::from(bookable));
    BookingQuote {
        seating_type_id: seating_type.id,
        requested,
        available,
        bookable,
        can_book: requested > 0 && requested <= available,
        duration_type,
        units,
        rate,
        total_price,
    }
}
