use crate::model::{DAY_MS, Ms};

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 1024;

pub const MAX_BRANCHES_PER_TENANT: usize = 10_000;
pub const MAX_SEATING_TYPES_PER_TENANT: usize = 10_000;
pub const MAX_SEATS_PER_TENANT: usize = 100_000;
pub const MAX_ACCOUNTS_PER_TENANT: usize = 1_000_000;
pub const MAX_BOOKINGS_PER_SEAT: usize = 50_000;
pub const MAX_SLOTS_PER_SEAT: usize = 50_000;

/// Rows in one multi-row `INSERT INTO bookings`.
pub const MAX_BATCH_SIZE: usize = 1000;
/// Seats asked for in one verification.
pub const MAX_SEAT_COUNT: u32 = 10_000;

/// Bookings up to two years long.
pub const MAX_SPAN_DURATION_MS: Ms = 731 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 731 * DAY_MS;
/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MIN_SLOT_MINUTES: u32 = 15;
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;
/// Slot width when `INSERT INTO time_slots` omits `slot_minutes`.
pub const DEFAULT_SLOT_MINUTES: u32 = 60;
