use std::collections::HashSet;
use std::time::Instant;

use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

/// Whether a seat has anything for reconciliation to do at `now`.
fn needs_reconcile(ss: &SeatState, now: Ms) -> bool {
    ss.bookings
        .iter()
        .any(|b| b.status.is_active() && b.span.end <= now)
        || ss.derived_status(now) != ss.seat.status
}

impl Engine {
    /// Complete every active booking whose window has ended, release its time
    /// slots and re-derive the status of every affected seat.
    ///
    /// The whole pass is one WAL record applied under the write locks of all
    /// touched seats: either every transition lands or none does. A pass with
    /// nothing to do writes nothing and reports zeros.
    pub async fn reconcile_expired(&self) -> Result<ReconcileReport, EngineError> {
        let started = Instant::now();
        let now = self.now();

        // Scan under read locks, then lock only the candidates for writing.
        let seats: Vec<_> = self.seats.iter().map(|e| e.value().clone()).collect();
        let mut candidates = Vec::new();
        for seat in seats {
            let guard = seat.read().await;
            if needs_reconcile(&guard, now) {
                candidates.push(guard.id());
            }
        }
        if candidates.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let mut guards = self.lock_existing_seats(&candidates).await;

        // State may have moved since the scan: recompute under the write locks.
        let mut report = ReconcileReport::default();
        let mut completed = Vec::new();
        let mut released_slots = Vec::new();
        let mut seat_statuses = Vec::new();
        for guard in &guards {
            let sid = guard.id();
            let mut expired = HashSet::new();
            for booking in guard
                .bookings
                .iter()
                .filter(|b| b.status.is_active() && b.span.end <= now)
            {
                expired.insert(booking.id);
                completed.push((booking.id, sid));
                match booking.kind {
                    BookingKind::Seat => report.seat_bookings_completed += 1,
                    BookingKind::Meeting => report.meeting_bookings_completed += 1,
                }
            }
            for slot in &guard.slots {
                if let Some(holder) = slot.booking_id
                    && expired.contains(&holder)
                {
                    released_slots.push((sid, slot.id));
                    report.slots_released += 1;
                }
            }

            // Expired bookings do not contain `now`, so completing them leaves
            // the derived status unchanged.
            let old = guard.seat.status;
            let new = guard.derived_status(now);
            if new != old {
                seat_statuses.push((sid, new));
                match (old, new) {
                    (_, SeatStatus::Available) => report.seats_released += 1,
                    (SeatStatus::Available, _) => report.seats_activated += 1,
                    _ => {}
                }
            }
        }

        if completed.is_empty() && released_slots.is_empty() && seat_statuses.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let event = Event::ExpiryReconciled {
            at: now,
            completed,
            released_slots,
            seat_statuses,
        };
        self.commit(event, &mut guards).await?;
        drop(guards);

        metrics::counter!(observability::RECONCILE_RUNS_TOTAL).increment(1);
        metrics::counter!(observability::RECONCILE_COMPLETED_TOTAL, "kind" => "seat")
            .increment(u64::from(report.seat_bookings_completed));
        metrics::counter!(observability::RECONCILE_COMPLETED_TOTAL, "kind" => "meeting")
            .increment(u64::from(report.meeting_bookings_completed));
        metrics::counter!(observability::RECONCILE_SLOTS_RELEASED_TOTAL)
            .increment(u64::from(report.slots_released));
        metrics::histogram!(observability::RECONCILE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        tracing::info!(
            seat_bookings = report.seat_bookings_completed,
            meeting_bookings = report.meeting_bookings_completed,
            slots = report.slots_released,
            seats_released = report.seats_released,
            seats_activated = report.seats_activated,
            "reconciled expired bookings"
        );
        Ok(report)
    }
}
