mod availability;
mod coins;
mod conflict;
mod error;
mod mutations;
mod queries;
mod reconcile;
mod slots;
mod tokens;

pub use availability::{quote, seat_is_free};
pub use coins::{months_spanned, reward_coins};
pub use error::EngineError;
pub use queries::BookingFilter;
pub use slots::day_slots;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::wal::Wal;

pub type SharedSeatState = Arc<RwLock<SeatState>>;
pub type SeatGuard = OwnedRwLockWriteGuard<SeatState>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while one fsync is in flight are
/// written together and share the next fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes are not
    // attributed to the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// One tenant's coworking state.
///
/// Catalogue records (branches, seating types, accounts) live directly in
/// maps. Each seat owns its bookings and time slots behind its own lock, so
/// bookings on different seats never contend.
pub struct Engine {
    pub(super) branches: DashMap<Ulid, Branch>,
    pub(super) seating_types: DashMap<Ulid, SeatingType>,
    pub(super) seats: DashMap<Ulid, SharedSeatState>,
    pub(super) accounts: DashMap<Ulid, Account>,
    /// Lowercased email → account id.
    pub(super) emails: DashMap<String, Ulid>,
    /// Reverse lookup: booking id → seat id.
    pub(super) booking_to_seat: DashMap<Ulid, Ulid>,
    /// jti → exp (unix seconds) of revoked tokens issued for this tenant.
    pub(super) revoked_tokens: DashMap<Ulid, i64>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    /// Serializes catalogue writes so existence and uniqueness checks hold until commit.
    pub(super) catalogue_lock: tokio::sync::Mutex<()>,
}

/// Apply the parts of an event that live in a seat's locked state.
fn apply_to_seat(ss: &mut SeatState, event: &Event) {
    let sid = ss.id();
    match event {
        Event::SeatStatusSet { id, status } if *id == sid => {
            ss.seat.status = *status;
        }
        Event::BookingsPlaced {
            bookings,
            slot_claims,
            seat_statuses,
        } => {
            for booking in bookings.iter().filter(|b| b.seat_id == sid) {
                ss.insert_booking(booking.clone());
            }
            for claim in slot_claims.iter().filter(|c| c.seat_id == sid) {
                if let Some(slot) = ss.slot_mut(&claim.slot_id) {
                    slot.claim(claim.booking_id);
                }
            }
            apply_seat_statuses(ss, seat_statuses);
        }
        Event::BookingConfirmed {
            id,
            seat_id,
            seat_status,
            ..
        } if *seat_id == sid => {
            if let Some(booking) = ss.booking_mut(id) {
                booking.status = BookingStatus::Confirmed;
            }
            ss.seat.status = *seat_status;
        }
        Event::BookingCancelled {
            id,
            seat_id,
            released_slots,
            seat_status,
        } if *seat_id == sid => {
            if let Some(booking) = ss.booking_mut(id) {
                booking.status = BookingStatus::Cancelled;
            }
            for slot_id in released_slots {
                if let Some(slot) = ss.slot_mut(slot_id) {
                    slot.release();
                }
            }
            ss.seat.status = *seat_status;
        }
        Event::SlotsGenerated { seat_id, slots } if *seat_id == sid => {
            for slot in slots {
                ss.insert_slot(slot.clone());
            }
        }
        Event::ExpiryReconciled {
            completed,
            released_slots,
            seat_statuses,
            ..
        } => {
            for (booking_id, _) in completed.iter().filter(|(_, seat)| *seat == sid) {
                if let Some(booking) = ss.booking_mut(booking_id) {
                    booking.status = BookingStatus::Completed;
                }
            }
            for (_, slot_id) in released_slots.iter().filter(|(seat, _)| *seat == sid) {
                if let Some(slot) = ss.slot_mut(slot_id) {
                    slot.release();
                }
            }
            apply_seat_statuses(ss, seat_statuses);
        }
        _ => {}
    }
}

fn apply_seat_statuses(ss: &mut SeatState, statuses: &[(Ulid, SeatStatus)]) {
    let sid = ss.id();
    if let Some((_, status)) = statuses.iter().find(|(id, _)| *id == sid) {
        ss.seat.status = *status;
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_clock(wal_path, Arc::new(SystemClock))
    }

    /// Replay the WAL at `wal_path` and start its writer task. Must run inside a tokio runtime.
    pub fn with_clock(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            branches: DashMap::new(),
            seating_types: DashMap::new(),
            seats: DashMap::new(),
            accounts: DashMap::new(),
            emails: DashMap::new(),
            booking_to_seat: DashMap::new(),
            revoked_tokens: DashMap::new(),
            wal_tx,
            clock,
            catalogue_lock: tokio::sync::Mutex::new(()),
        };

        // Nothing else holds these locks yet, so try_write always succeeds.
        // Blocking lock calls are off limits here: tenants are created lazily
        // from inside async handlers.
        for event in &events {
            engine.apply_to_directory(event);
            for seat_id in event.seat_ids() {
                if let Some(seat) = engine.get_seat(&seat_id)
                    && let Ok(mut guard) = seat.try_write()
                {
                    apply_to_seat(&mut guard, event);
                }
            }
        }

        tracing::debug!("replayed {} events from {}", events.len(), wal_path.display());
        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Apply the parts of an event that live outside seat locks.
    fn apply_to_directory(&self, event: &Event) {
        match event {
            Event::BranchCreated { branch } => {
                self.branches.insert(branch.id, branch.clone());
            }
            Event::SeatingTypeCreated { seating_type } => {
                self.seating_types.insert(seating_type.id, seating_type.clone());
            }
            Event::SeatCreated { seat } => {
                let state = SeatState::new(seat.clone());
                self.seats.insert(seat.id, Arc::new(RwLock::new(state)));
            }
            Event::SeatDeleted { id } => {
                self.seats.remove(id);
                self.booking_to_seat.retain(|_, seat| seat != id);
            }
            Event::AccountRegistered { account } => {
                self.emails.insert(account.email.to_lowercase(), account.id);
                self.accounts.insert(account.id, account.clone());
            }
            Event::BookingsPlaced { bookings, .. } => {
                for booking in bookings {
                    self.booking_to_seat.insert(booking.id, booking.seat_id);
                }
            }
            Event::BookingConfirmed {
                customer_id, coins, ..
            } => {
                if let Some(mut account) = self.accounts.get_mut(customer_id) {
                    account.coins = account.coins.saturating_add(*coins);
                }
            }
            Event::TokenRevoked { jti, exp } => {
                self.revoked_tokens.insert(*jti, *exp);
            }
            Event::SeatStatusSet { .. }
            | Event::BookingCancelled { .. }
            | Event::SlotsGenerated { .. }
            | Event::ExpiryReconciled { .. } => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Persist, then apply to the locked seats and the directory.
    /// Nothing is applied unless the WAL write succeeded.
    pub(super) async fn commit(
        &self,
        event: Event,
        seats: &mut [SeatGuard],
    ) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        for guard in seats.iter_mut() {
            apply_to_seat(guard, &event);
        }
        self.apply_to_directory(&event);
        Ok(())
    }

    pub fn get_seat(&self, id: &Ulid) -> Option<SharedSeatState> {
        self.seats.get(id).map(|e| e.value().clone())
    }

    pub fn seat_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_seat.get(booking_id).map(|e| *e.value())
    }

    /// Write-lock the given seats in id order (no deadlocks between batches).
    /// Fails if a seat is unknown or was deleted while we waited.
    pub(super) async fn lock_seats(&self, ids: &[Ulid]) -> Result<Vec<SeatGuard>, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let seat = self.get_seat(&id).ok_or(EngineError::NotFound(id))?;
            let guard = seat.clone().write_owned().await;
            let still_registered = self
                .seats
                .get(&id)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &seat));
            if !still_registered {
                return Err(EngineError::NotFound(id));
            }
            guards.push(guard);
        }
        Ok(guards)
    }

    /// Like `lock_seats`, but seats deleted in the meantime are skipped.
    pub(super) async fn lock_existing_seats(&self, ids: &[Ulid]) -> Vec<SeatGuard> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(seat) = self.get_seat(&id) else { continue };
            let guard = seat.clone().write_owned().await;
            if self
                .seats
                .get(&id)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &seat))
            {
                guards.push(guard);
            }
        }
        guards
    }

    /// Lookup booking → seat, then write-lock that seat.
    pub(super) async fn lock_booking_seat(&self, booking_id: &Ulid) -> Result<SeatGuard, EngineError> {
        let seat_id = self
            .seat_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let mut guards = self.lock_seats(&[seat_id]).await?;
        guards.pop().ok_or(EngineError::NotFound(seat_id))
    }
}
