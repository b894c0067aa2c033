use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;
/// Billing month. Calendar months are not used anywhere in pricing.
pub const MONTH_MS: Ms = 30 * DAY_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeatStatus {
    Available,
    Occupied,
    Maintenance,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Pending and confirmed bookings hold their seat.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingKind {
    Seat,
    Meeting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurationType {
    Hourly,
    Daily,
    Monthly,
}

impl DurationType {
    pub fn unit_ms(self) -> Ms {
        match self {
            DurationType::Hourly => HOUR_MS,
            DurationType::Daily => DAY_MS,
            DurationType::Monthly => MONTH_MS,
        }
    }

    /// Billable units covering `span`, partial units rounded up.
    pub fn units(self, span: &Span) -> u64 {
        let unit = self.unit_ms();
        let units = (span.duration_ms() + unit - 1) / unit;
        units.max(1) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Customer,
}

macro_rules! text_enum {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s.to_ascii_uppercase().as_str() {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(SeatStatus {
    Available => "AVAILABLE",
    Occupied => "OCCUPIED",
    Maintenance => "MAINTENANCE",
    Reserved => "RESERVED",
});

text_enum!(BookingStatus {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

text_enum!(BookingKind {
    Seat => "SEAT",
    Meeting => "MEETING",
});

text_enum!(DurationType {
    Hourly => "HOURLY",
    Daily => "DAILY",
    Monthly => "MONTHLY",
});

text_enum!(Role {
    Admin => "ADMIN",
    Customer => "CUSTOMER",
});

/// Prices in whole currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rates {
    pub hourly: u64,
    pub daily: u64,
    pub monthly: u64,
}

impl Rates {
    pub fn for_duration(&self, duration: DurationType) -> u64 {
        match duration {
            DurationType::Hourly => self.hourly,
            DurationType::Daily => self.daily,
            DurationType::Monthly => self.monthly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Ulid,
    pub name: String,
    /// UTC hour the branch opens, `0..24`.
    pub opening_hour: u8,
    /// UTC hour the branch closes, `opening_hour+1..=24`.
    pub closing_hour: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatingType {
    pub id: Ulid,
    pub name: String,
    pub rates: Rates,
    pub is_meeting_room: bool,
}

impl SeatingType {
    pub fn booking_kind(&self) -> BookingKind {
        if self.is_meeting_room {
            BookingKind::Meeting
        } else {
            BookingKind::Seat
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub seating_type_id: Ulid,
    pub label: String,
    pub status: SeatStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub kind: BookingKind,
    pub seat_id: Ulid,
    pub customer_id: Ulid,
    pub span: Span,
    pub duration_type: DurationType,
    pub status: BookingStatus,
    pub price: u64,
    /// Coins credited to the customer once the booking is confirmed.
    pub coins: u64,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub seat_id: Ulid,
    pub span: Span,
    pub is_available: bool,
    pub booking_id: Option<Ulid>,
}

impl TimeSlot {
    pub fn release(&mut self) {
        self.booking_id = None;
        self.is_available = true;
    }

    pub fn claim(&mut self, booking_id: Ulid) {
        self.booking_id = Some(booking_id);
        self.is_available = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub password_hash: String,
    pub coins: u64,
}

/// A seat with everything scheduled on it. Guarded by one lock.
#[derive(Debug, Clone)]
pub struct SeatState {
    pub seat: Seat,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Sorted by `span.start`. Only meeting rooms carry slots.
    pub slots: Vec<TimeSlot>,
}

impl SeatState {
    pub fn new(seat: Seat) -> Self {
        Self {
            seat,
            bookings: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.seat.id
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    pub fn insert_slot(&mut self, slot: TimeSlot) {
        let pos = self.slots.partition_point(|s| s.span.start <= slot.span.start);
        self.slots.insert(pos, slot);
    }

    pub fn slot_mut(&mut self, id: &Ulid) -> Option<&mut TimeSlot> {
        self.slots.iter_mut().find(|s| s.id == *id)
    }

    /// Bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn overlapping_slots(&self, query: &Span) -> impl Iterator<Item = &TimeSlot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    /// Active bookings overlapping the window.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.is_active())
    }

    /// Status the seat should have at `now` given its bookings.
    ///
    /// Maintenance is an operator override and is never derived away.
    pub fn derived_status(&self, now: Ms) -> SeatStatus {
        if self.seat.status == SeatStatus::Maintenance {
            return SeatStatus::Maintenance;
        }
        self.booking_status_at(now)
    }

    /// Status implied by bookings alone, ignoring maintenance.
    pub fn booking_status_at(&self, now: Ms) -> SeatStatus {
        let instant = Span::new(now, now + 1);
        let mut status = SeatStatus::Available;
        for booking in self.active_overlapping(&instant) {
            match booking.status {
                BookingStatus::Confirmed => return SeatStatus::Occupied,
                _ => status = SeatStatus::Reserved,
            }
        }
        status
    }
}

/// A time slot claimed by a booking as part of a placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotClaim {
    pub seat_id: Ulid,
    pub slot_id: Ulid,
    pub booking_id: Ulid,
}

/// WAL record format. Flat, no nesting beyond domain records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BranchCreated {
        branch: Branch,
    },
    SeatingTypeCreated {
        seating_type: SeatingType,
    },
    SeatCreated {
        seat: Seat,
    },
    SeatDeleted {
        id: Ulid,
    },
    SeatStatusSet {
        id: Ulid,
        status: SeatStatus,
    },
    AccountRegistered {
        account: Account,
    },
    BookingsPlaced {
        bookings: Vec<Booking>,
        slot_claims: Vec<SlotClaim>,
        seat_statuses: Vec<(Ulid, SeatStatus)>,
    },
    BookingConfirmed {
        id: Ulid,
        seat_id: Ulid,
        customer_id: Ulid,
        coins: u64,
        seat_status: SeatStatus,
    },
    BookingCancelled {
        id: Ulid,
        seat_id: Ulid,
        released_slots: Vec<Ulid>,
        seat_status: SeatStatus,
    },
    SlotsGenerated {
        seat_id: Ulid,
        slots: Vec<TimeSlot>,
    },
    /// One expiry reconciliation pass, committed as a single record.
    ExpiryReconciled {
        at: Ms,
        /// `(booking_id, seat_id)`
        completed: Vec<(Ulid, Ulid)>,
        /// `(seat_id, slot_id)`
        released_slots: Vec<(Ulid, Ulid)>,
        seat_statuses: Vec<(Ulid, SeatStatus)>,
    },
    /// A JWT that must be refused until it expires on its own.
    TokenRevoked {
        jti: Ulid,
        /// Unix seconds.
        exp: i64,
    },
}

impl Event {
    /// Seats whose locked state this event mutates.
    pub fn seat_ids(&self) -> Vec<Ulid> {
        let mut ids = match self {
            Event::SeatStatusSet { id, .. } => vec![*id],
            Event::BookingsPlaced { bookings, seat_statuses, .. } => bookings
                .iter()
                .map(|b| b.seat_id)
                .chain(seat_statuses.iter().map(|(id, _)| *id))
                .collect(),
            Event::BookingConfirmed { seat_id, .. }
            | Event::BookingCancelled { seat_id, .. }
            | Event::SlotsGenerated { seat_id, .. } => vec![*seat_id],
            Event::ExpiryReconciled { completed, seat_statuses, .. } => completed
                .iter()
                .map(|(_, seat)| *seat)
                .chain(seat_statuses.iter().map(|(id, _)| *id))
                .collect(),
            Event::BranchCreated { .. }
            | Event::SeatingTypeCreated { .. }
            | Event::SeatCreated { .. }
            | Event::SeatDeleted { .. }
            | Event::AccountRegistered { .. }
            | Event::TokenRevoked { .. } => Vec::new(),
        };
        ids.sort();
        ids.dedup();
        ids
    }
}

/// One booking to place. Kind, price and coins are derived from the seat's type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub seat_id: Ulid,
    pub customer_id: Ulid,
    pub span: Span,
    pub duration_type: DurationType,
}

/// Input of a pre-booking check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyRequest {
    pub seating_type_id: Ulid,
    pub branch_id: Option<Ulid>,
    pub seat_count: u32,
    pub span: Span,
    pub duration_type: DurationType,
}

/// Outcome of a pre-booking check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingQuote {
    pub seating_type_id: Ulid,
    pub requested: u32,
    pub available: u32,
    /// Requested count capped at availability.
    pub bookable: u32,
    pub can_book: bool,
    pub duration_type: DurationType,
    pub units: u64,
    pub rate: u64,
    pub total_price: u64,
}

/// Counts from one expiry reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub seat_bookings_completed: u32,
    pub meeting_bookings_completed: u32,
    pub slots_released: u32,
    pub seats_released: u32,
    pub seats_activated: u32,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        *self == ReconcileReport::default()
    }
}
