use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Fixed-width slots covering a branch's opening hours on one UTC date.
/// A trailing remainder shorter than one slot is dropped.
pub fn day_slots(branch: &Branch, date: NaiveDate, slot_minutes: u32) -> Vec<Span> {
    let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
        return Vec::new();
    };
    let day_start = midnight.and_utc().timestamp_millis();
    let open = day_start + Ms::from(branch.opening_hour) * HOUR_MS;
    let close = day_start + Ms::from(branch.closing_hour) * HOUR_MS;
    let step = Ms::from(slot_minutes) * 60_000;
    if step <= 0 {
        return Vec::new();
    }

    let mut spans = Vec::new();
    let mut start = open;
    while start + step <= close {
        spans.push(Span::new(start, start + step));
        start += step;
    }
    spans
}

impl Engine {
    /// Create the slots of one day for a meeting room.
    ///
    /// Spans overlapping an existing slot are skipped, so regenerating a day
    /// is a no-op. A slot under an active booking starts out claimed by it.
    /// Returns only the slots created by this call.
    pub async fn generate_time_slots(
        &self,
        seat_id: Ulid,
        date: NaiveDate,
        slot_minutes: u32,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&slot_minutes) {
            return Err(EngineError::Invalid(format!(
                "slot_minutes must be between {MIN_SLOT_MINUTES} and {MAX_SLOT_MINUTES}"
            )));
        }

        let mut guards = self.lock_seats(&[seat_id]).await?;
        let Some(guard) = guards.first() else {
            return Err(EngineError::NotFound(seat_id));
        };

        let seating_type = self
            .seating_types
            .get(&guard.seat.seating_type_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(guard.seat.seating_type_id))?;
        if !seating_type.is_meeting_room {
            return Err(EngineError::Invalid(format!(
                "seat {seat_id} is not a meeting room"
            )));
        }
        let branch = self
            .branches
            .get(&guard.seat.branch_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(guard.seat.branch_id))?;

        let mut created = Vec::new();
        for span in day_slots(&branch, date, slot_minutes) {
            if guard.overlapping_slots(&span).next().is_some() {
                continue;
            }
            let holder = guard.active_overlapping(&span).next().map(|b| b.id);
            created.push(TimeSlot {
                id: Ulid::new(),
                seat_id,
                span,
                is_available: holder.is_none(),
                booking_id: holder,
            });
        }

        if created.is_empty() {
            return Ok(created);
        }
        if guard.slots.len() + created.len() > MAX_SLOTS_PER_SEAT {
            return Err(EngineError::LimitExceeded("too many time slots on seat"));
        }

        let event = Event::SlotsGenerated {
            seat_id,
            slots: created.clone(),
        };
        self.commit(event, &mut guards).await?;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(open: u8, close: u8) -> Branch {
        Branch {
            id: Ulid::new(),
            name: "Central".into(),
            opening_hour: open,
            closing_hour: close,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 3, 14).unwrap()
    }

    #[test]
    fn hourly_slots_cover_opening_hours() {
        let spans = day_slots(&branch(9, 17), date(), 60);
        assert_eq!(spans.len(), 8);
        let day_start = date().and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
        assert_eq!(spans[0].start, day_start + 9 * HOUR_MS);
        assert_eq!(spans[7].end, day_start + 17 * HOUR_MS);
        assert!(spans.windows(2).all(|w| w[0].end == w[1].start));
    }

    #[test]
    fn remainder_shorter_than_a_slot_is_dropped() {
        let spans = day_slots(&branch(9, 10), date(), 45);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].duration_ms(), 45 * 60_000);
    }

    #[test]
    fn round_the_clock_branch() {
        assert_eq!(day_slots(&branch(0, 24), date(), 30).len(), 48);
    }
}
