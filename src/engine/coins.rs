//! Loyalty-coin rewards.
//!
//! `coins = 10 × months + floor(price / 100) + 5 × floor(months / 3)`, where
//! months is the booking length in 30-day months rounded up. Meeting-room
//! bookings never earn coins.

use crate::model::{BookingKind, MONTH_MS, Span};

pub const COINS_PER_MONTH: u64 = 10;
pub const PRICE_PER_COIN: u64 = 100;
pub const QUARTER_BONUS: u64 = 5;

/// Whole months covered by the span, partial months rounded up, at least one.
pub fn months_spanned(span: &Span) -> u64 {
    let months = (span.duration_ms() + MONTH_MS - 1) / MONTH_MS;
    months.max(1) as u64
}

pub fn reward_coins(kind: BookingKind, span: &Span, price: u64) -> u64 {
    if kind == BookingKind::Meeting {
        return 0;
    }
    let months = months_spanned(span);
    COINS_PER_MONTH * months + price / PRICE_PER_COIN + QUARTER_BONUS * (months / 3)
}
