use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::coins::reward_coins;
use super::conflict::{check_batch_overlap, check_no_conflict, claimable_slots, validate_span};
use super::{Engine, EngineError, WalCommand};

/// Seat status at `now` once `overrides` are applied to existing bookings
/// and `added` bookings are inserted.
fn projected_status(
    ss: &SeatState,
    now: Ms,
    overrides: &[(Ulid, BookingStatus)],
    added: &[&Booking],
) -> SeatStatus {
    if ss.seat.status == SeatStatus::Maintenance {
        return SeatStatus::Maintenance;
    }
    let instant = Span::new(now, now + 1);
    let existing = ss.overlapping(&instant).map(|b| {
        overrides
            .iter()
            .find(|(id, _)| *id == b.id)
            .map_or(b.status, |(_, s)| *s)
    });
    let fresh = added
        .iter()
        .filter(|b| b.span.contains_instant(now))
        .map(|b| b.status);

    let mut derived = SeatStatus::Available;
    for status in existing.chain(fresh) {
        match status {
            BookingStatus::Confirmed => return SeatStatus::Occupied,
            BookingStatus::Pending => derived = SeatStatus::Reserved,
            BookingStatus::Completed | BookingStatus::Cancelled => {}
        }
    }
    derived
}

fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Invalid(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Catalogue ───────────────────────────────────────────────

    pub async fn create_branch(&self, branch: Branch) -> Result<(), EngineError> {
        validate_name(&branch.name, "branch name")?;
        if branch.opening_hour >= branch.closing_hour || branch.closing_hour > 24 {
            return Err(EngineError::Invalid(
                "opening hours must satisfy 0 <= open < close <= 24".into(),
            ));
        }
        let _catalogue = self.catalogue_lock.lock().await;
        if self.branches.len() >= MAX_BRANCHES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many branches"));
        }
        if self.branches.contains_key(&branch.id) {
            return Err(EngineError::AlreadyExists(branch.id));
        }
        self.commit(Event::BranchCreated { branch }, &mut []).await
    }

    pub async fn create_seating_type(&self, seating_type: SeatingType) -> Result<(), EngineError> {
        validate_name(&seating_type.name, "seating type name")?;
        let _catalogue = self.catalogue_lock.lock().await;
        if self.seating_types.len() >= MAX_SEATING_TYPES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many seating types"));
        }
        if self.seating_types.contains_key(&seating_type.id) {
            return Err(EngineError::AlreadyExists(seating_type.id));
        }
        self.commit(Event::SeatingTypeCreated { seating_type }, &mut [])
            .await
    }

    pub async fn create_seat(
        &self,
        id: Ulid,
        branch_id: Ulid,
        seating_type_id: Ulid,
        label: String,
    ) -> Result<Seat, EngineError> {
        validate_name(&label, "seat label")?;
        let _catalogue = self.catalogue_lock.lock().await;
        if self.seats.len() >= MAX_SEATS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many seats"));
        }
        if self.seats.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.branches.contains_key(&branch_id) {
            return Err(EngineError::NotFound(branch_id));
        }
        if !self.seating_types.contains_key(&seating_type_id) {
            return Err(EngineError::NotFound(seating_type_id));
        }

        let seat = Seat {
            id,
            branch_id,
            seating_type_id,
            label,
            status: SeatStatus::Available,
        };
        self.commit(Event::SeatCreated { seat: seat.clone() }, &mut [])
            .await?;
        Ok(seat)
    }

    /// Remove a seat with no pending or confirmed bookings. Its history goes with it.
    pub async fn delete_seat(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guards = self.lock_seats(&[id]).await?;
        if guards.iter().any(|g| g.bookings.iter().any(|b| b.status.is_active())) {
            return Err(EngineError::HasActiveBookings(id));
        }
        self.commit(Event::SeatDeleted { id }, &mut guards).await
    }

    /// Put a seat under maintenance, or take it out and re-derive its status
    /// from its bookings.
    pub async fn set_seat_maintenance(&self, id: Ulid, on: bool) -> Result<SeatStatus, EngineError> {
        let mut guards = self.lock_seats(&[id]).await?;
        let status = match (on, guards.first()) {
            (true, _) => SeatStatus::Maintenance,
            (false, Some(guard)) => guard.booking_status_at(self.now()),
            (false, None) => return Err(EngineError::NotFound(id)),
        };
        self.commit(Event::SeatStatusSet { id, status }, &mut guards)
            .await?;
        Ok(status)
    }

    pub async fn register_account(
        &self,
        id: Ulid,
        email: &str,
        name: &str,
        password_hash: String,
        role: Role,
    ) -> Result<Account, EngineError> {
        let email = email.trim();
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !well_formed {
            return Err(EngineError::Invalid(format!("invalid email: {email}")));
        }
        validate_name(name, "account name")?;

        let _catalogue = self.catalogue_lock.lock().await;
        if self.accounts.len() >= MAX_ACCOUNTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many accounts"));
        }
        if self.accounts.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.emails.contains_key(&email.to_lowercase()) {
            return Err(EngineError::EmailTaken(email.to_string()));
        }

        let account = Account {
            id,
            email: email.to_string(),
            name: name.to_string(),
            role,
            password_hash,
            coins: 0,
        };
        self.commit(
            Event::AccountRegistered {
                account: account.clone(),
            },
            &mut [],
        )
        .await?;
        Ok(account)
    }

    // ── Booking lifecycle ───────────────────────────────────────

    /// Place one or more bookings atomically. All-or-nothing: if any request
    /// is rejected, nothing is written. Requests may span different seats.
    pub async fn place_bookings(
        &self,
        requests: Vec<BookingRequest>,
    ) -> Result<Vec<Booking>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let now = self.now();
        let mut ids = HashSet::new();
        for req in &requests {
            validate_span(&req.span)?;
            if req.span.end <= now {
                return Err(EngineError::InPast);
            }
            if !self.accounts.contains_key(&req.customer_id) {
                return Err(EngineError::NotFound(req.customer_id));
            }
            if !ids.insert(req.id) || self.booking_to_seat.contains_key(&req.id) {
                return Err(EngineError::AlreadyExists(req.id));
            }
        }

        // Locks are taken in seat id order to prevent deadlocks.
        let seat_ids: Vec<Ulid> = requests.iter().map(|r| r.seat_id).collect();
        let mut guards = self.lock_seats(&seat_ids).await?;
        let slot_of: HashMap<Ulid, usize> =
            guards.iter().enumerate().map(|(i, g)| (g.id(), i)).collect();

        // Phase 1: validate every request against current state and the batch.
        let mut by_seat: HashMap<Ulid, Vec<(Ulid, Span)>> = HashMap::new();
        for req in &requests {
            by_seat.entry(req.seat_id).or_default().push((req.id, req.span));
        }
        for (seat_id, batch) in &by_seat {
            let guard = &guards[slot_of[seat_id]];
            if guard.seat.status == SeatStatus::Maintenance {
                return Err(EngineError::SeatUnavailable(*seat_id));
            }
            if guard.bookings.len() + batch.len() > MAX_BOOKINGS_PER_SEAT {
                return Err(EngineError::LimitExceeded("too many bookings on seat"));
            }
            for (_, span) in batch {
                check_no_conflict(guard, span)?;
            }
            check_batch_overlap(batch)?;
        }

        let mut bookings = Vec::with_capacity(requests.len());
        let mut slot_claims = Vec::new();
        for req in requests {
            let guard = &guards[slot_of[&req.seat_id]];
            let seating_type = self
                .seating_types
                .get(&guard.seat.seating_type_id)
                .map(|e| e.value().clone())
                .ok_or(EngineError::NotFound(guard.seat.seating_type_id))?;
            let kind = seating_type.booking_kind();
            if kind == BookingKind::Meeting {
                for slot_id in claimable_slots(guard, &req.span)? {
                    slot_claims.push(SlotClaim {
                        seat_id: req.seat_id,
                        slot_id,
                        booking_id: req.id,
                    });
                }
            }

            let price = seating_type
                .rates
                .for_duration(req.duration_type)
                .saturating_mul(req.duration_type.units(&req.span));
            bookings.push(Booking {
                id: req.id,
                kind,
                seat_id: req.seat_id,
                customer_id: req.customer_id,
                span: req.span,
                duration_type: req.duration_type,
                status: BookingStatus::Pending,
                price,
                coins: reward_coins(kind, &req.span, price),
                created_at: now,
            });
        }

        // Phase 2: all validated; derive seat statuses and commit as one record.
        let seat_statuses = guards
            .iter()
            .map(|g| {
                let added: Vec<&Booking> =
                    bookings.iter().filter(|b| b.seat_id == g.id()).collect();
                (g.id(), projected_status(g, now, &[], &added))
            })
            .collect();

        let event = Event::BookingsPlaced {
            bookings: bookings.clone(),
            slot_claims,
            seat_statuses,
        };
        self.commit(event, &mut guards).await?;

        for booking in &bookings {
            metrics::counter!(
                crate::observability::BOOKINGS_PLACED_TOTAL,
                "kind" => booking.kind.as_str()
            )
            .increment(1);
        }
        Ok(bookings)
    }

    /// Payment recorded: PENDING → CONFIRMED, crediting the booking's coins.
    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.lock_booking_seat(&id).await?;
        let now = self.now();
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                to: BookingStatus::Confirmed,
            });
        }
        if booking.span.end <= now {
            return Err(EngineError::InPast);
        }

        let seat_status = projected_status(&guard, now, &[(id, BookingStatus::Confirmed)], &[]);
        let event = Event::BookingConfirmed {
            id,
            seat_id: booking.seat_id,
            customer_id: booking.customer_id,
            coins: booking.coins,
            seat_status,
        };
        self.commit(event, std::slice::from_mut(&mut guard)).await?;
        Ok(Booking {
            status: BookingStatus::Confirmed,
            ..booking
        })
    }

    /// PENDING or CONFIRMED → CANCELLED. Claimed slots are released.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let mut guard = self.lock_booking_seat(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !booking.status.is_active() {
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                to: BookingStatus::Cancelled,
            });
        }

        let released_slots = guard
            .slots
            .iter()
            .filter(|s| s.booking_id == Some(id))
            .map(|s| s.id)
            .collect();
        let seat_status =
            projected_status(&guard, self.now(), &[(id, BookingStatus::Cancelled)], &[]);
        let event = Event::BookingCancelled {
            id,
            seat_id: booking.seat_id,
            released_slots,
            seat_status,
        };
        self.commit(event, std::slice::from_mut(&mut guard)).await?;
        Ok(Booking {
            status: BookingStatus::Cancelled,
            ..booking
        })
    }

    // ── Compaction ──────────────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    ///
    /// Holds the catalogue lock and every seat's read lock until the snapshot
    /// is swapped in, so no commit can land in the old log unseen.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalogue = self.catalogue_lock.lock().await;

        let mut seat_ids: Vec<Ulid> = self.seats.iter().map(|e| *e.key()).collect();
        seat_ids.sort();
        let mut seats = Vec::with_capacity(seat_ids.len());
        for id in seat_ids {
            if let Some(seat) = self.get_seat(&id) {
                seats.push(seat.read_owned().await);
            }
        }

        let mut events = Vec::new();
        events.extend(self.branches.iter().map(|e| Event::BranchCreated {
            branch: e.value().clone(),
        }));
        events.extend(self.seating_types.iter().map(|e| Event::SeatingTypeCreated {
            seating_type: e.value().clone(),
        }));
        // Balances are carried on the account record, not re-derived from confirmations.
        events.extend(self.accounts.iter().map(|e| Event::AccountRegistered {
            account: e.value().clone(),
        }));

        let now_secs = self.clock.now_secs();
        events.extend(
            self.revoked_tokens
                .iter()
                .filter(|e| *e.value() > now_secs)
                .map(|e| Event::TokenRevoked {
                    jti: *e.key(),
                    exp: *e.value(),
                }),
        );

        for ss in &seats {
            events.push(Event::SeatCreated {
                seat: ss.seat.clone(),
            });
            if !ss.bookings.is_empty() {
                events.push(Event::BookingsPlaced {
                    bookings: ss.bookings.clone(),
                    slot_claims: Vec::new(),
                    seat_statuses: vec![(ss.id(), ss.seat.status)],
                });
            }
            if !ss.slots.is_empty() {
                events.push(Event::SlotsGenerated {
                    seat_id: ss.id(),
                    slots: ss.slots.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
