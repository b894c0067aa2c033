use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::Invalid("start must be before end".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_query_window(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Invalid("start must be before end".into()));
    }
    if span.duration_ms() > crate::limits::MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// Any active booking on the seat overlapping `span` is a conflict.
pub(crate) fn check_no_conflict(ss: &SeatState, span: &Span) -> Result<(), EngineError> {
    match ss.active_overlapping(span).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

/// Slots a meeting booking would claim. Every overlapping slot must be free.
pub(crate) fn claimable_slots(ss: &SeatState, span: &Span) -> Result<Vec<Ulid>, EngineError> {
    let mut ids = Vec::new();
    for slot in ss.overlapping_slots(span) {
        if !slot.is_available {
            return Err(EngineError::SlotUnavailable(slot.id));
        }
        ids.push(slot.id);
    }
    Ok(ids)
}

/// Reject two requests in the same batch that overlap on one seat.
pub(crate) fn check_batch_overlap(batch: &[(Ulid, Span)]) -> Result<(), EngineError> {
    for i in 0..batch.len() {
        for j in (i + 1)..batch.len() {
            if batch[i].1.overlaps(&batch[j].1) {
                return Err(EngineError::Conflict(batch[i].0));
            }
        }
    }
    Ok(())
}
