//! Booking lifecycle: the only code path that writes bookings or session status.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use log::{error, info, warn};

use crate::errors::BookingError;
use crate::gateway::{PersistenceGateway, SessionLedger};
use crate::identity::Caller;
use crate::models::{
    Booking, BookingOutcome, BookingStatus, CancelOutcome, NewBooking, ResizeOutcome, SessionClosure,
    SessionStatus,
};
use crate::waitlist;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, initial_backoff: Duration::from_millis(25) }
    }
}

pub struct BookingService<G> {
    gateway: Arc<G>,
    retry: RetryPolicy,
}

impl<G> Clone for BookingService<G> {
    fn clone(&self) -> Self {
        Self { gateway: self.gateway.clone(), retry: self.retry }
    }
}

impl<G: PersistenceGateway> BookingService<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway, retry: RetryPolicy::default() }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Books `member_id` into the session: confirmed while slots remain, waitlisted after.
    /// A retry after an unseen commit fails with `AlreadyBooked` rather than booking twice.
    pub fn request_booking(&self, member_id: &str, session_id: i32) -> Result<BookingOutcome, BookingError> {
        let outcome = self.retrying("request booking", || {
            let now = Utc::now().naive_utc();
            self.gateway.with_session(session_id, |ledger| book(ledger, member_id, now))
        })?;

        match &outcome {
            BookingOutcome::Confirmed { booking_id } => {
                info!("Booking {} confirmed for member {} in session {}", booking_id, member_id, session_id)
            }
            BookingOutcome::Waitlisted { booking_id, position } => info!(
                "Booking {} waitlisted at position {} for member {} in session {}",
                booking_id, position, member_id, session_id
            ),
        }
        Ok(outcome)
    }

    /// Cancels a confirmed or waitlisted booking and, when a slot frees up, promotes the
    /// head of the waitlist in the same atomic unit.
    pub fn cancel_booking(&self, booking_id: i32, caller: &Caller) -> Result<CancelOutcome, BookingError> {
        let session_id = self
            .gateway
            .find_booking(booking_id)?
            .ok_or_else(|| BookingError::booking_not_found(booking_id))?
            .session_id;

        let outcome = self.retrying("cancel booking", || {
            self.gateway.with_session(session_id, |ledger| cancel(ledger, booking_id, caller))
        })?;

        info!(
            "Booking {} cancelled by {} in session {} (session now {})",
            booking_id, caller.member_id, session_id, outcome.session_status
        );
        if let Some(promoted) = &outcome.promoted {
            info!(
                "Booking {} for member {} promoted from the waitlist of session {}",
                promoted.booking_id, promoted.member_id, session_id
            );
        }
        Ok(outcome)
    }

    /// Changes a session's capacity. Never drops below the confirmed count; extra slots
    /// go to the head of the waitlist.
    pub fn resize_session(&self, session_id: i32, capacity: i32) -> Result<ResizeOutcome, BookingError> {
        if capacity < 1 {
            return Err(BookingError::InvalidRequest("capacity must be at least 1".to_string()));
        }

        let outcome = self.retrying("resize session", || {
            self.gateway.with_session(session_id, |ledger| resize(ledger, capacity))
        })?;

        info!(
            "Session {} capacity set to {}; {} waitlisted booking(s) promoted",
            session_id,
            capacity,
            outcome.promoted.len()
        );
        Ok(outcome)
    }

    /// Administrative cancellation. Every active booking of the session is cancelled.
    pub fn cancel_session(&self, session_id: i32) -> Result<SessionClosure, BookingError> {
        let closure = self.retrying("cancel session", || {
            self.gateway.with_session(session_id, |ledger| {
                let status = ledger.session().status;
                match status {
                    SessionStatus::Cancelled => return closure_of(ledger, Vec::new()),
                    SessionStatus::Completed => {
                        return Err(BookingError::SessionClosed {
                            session_id,
                            reason: "session has been completed",
                        })
                    }
                    _ => {}
                }

                ledger.set_session_status(SessionStatus::Cancelled)?;
                let mut cancelled = Vec::new();
                for booking in ledger.active_bookings()? {
                    cancelled.push(ledger.update_booking(booking.booking_id, BookingStatus::Cancelled, None)?);
                }
                closure_of(ledger, cancelled)
            })
        })?;

        info!(
            "Session {} cancelled; {} active booking(s) cancelled",
            session_id,
            closure.cancelled_bookings.len()
        );
        Ok(closure)
    }

    /// Marks an ended session completed and clears its waitlist. Confirmed bookings stay
    /// as attendance history. Completing a session twice changes nothing.
    pub fn complete_session(&self, session_id: i32) -> Result<SessionClosure, BookingError> {
        let closure = self.retrying("complete session", || {
            let now = Utc::now().naive_utc();
            self.gateway.with_session(session_id, |ledger| complete(ledger, now))
        })?;

        if !closure.cancelled_bookings.is_empty() {
            info!(
                "Session {} completed; {} waitlisted booking(s) cancelled",
                session_id,
                closure.cancelled_bookings.len()
            );
        }
        Ok(closure)
    }

    /// Completes every session whose end has passed. Failures are logged per session and
    /// do not stop the sweep.
    pub fn complete_due_sessions(&self) -> Result<Vec<SessionClosure>, BookingError> {
        let now = Utc::now().naive_utc();
        let due: Vec<i32> = self
            .gateway
            .list_sessions()?
            .into_iter()
            .filter(|s| !s.status.is_final() && s.ends_at() <= now)
            .map(|s| s.session_id)
            .collect();

        let mut closures = Vec::with_capacity(due.len());
        for session_id in due {
            match self.complete_session(session_id) {
                Ok(closure) => closures.push(closure),
                Err(e) => error!("Failed to complete session {}: {}", session_id, e),
            }
        }
        Ok(closures)
    }

    fn retrying<T, F>(&self, operation: &str, mut attempt: F) -> Result<T, BookingError>
    where
        F: FnMut() -> Result<T, BookingError>,
    {
        let mut delay = self.retry.initial_backoff;
        let mut tries = 1;

        loop {
            match attempt() {
                Err(e) if e.is_transient() && tries < self.retry.attempts => {
                    warn!("{} failed (attempt {}/{}), retrying: {}", operation, tries, self.retry.attempts, e);
                    std::thread::sleep(delay);
                    delay *= 2;
                    tries += 1;
                }
                result => return result,
            }
        }
    }
}

fn book(ledger: &mut dyn SessionLedger, member_id: &str, now: NaiveDateTime) -> Result<BookingOutcome, BookingError> {
    let session = ledger.session().clone();
    if let Some(reason) = session.closed_reason(now) {
        return Err(BookingError::SessionClosed { session_id: session.session_id, reason });
    }

    if ledger.active_booking_for(member_id)?.is_some() {
        return Err(BookingError::AlreadyBooked { member_id: member_id.to_string(), session_id: session.session_id });
    }

    let capacity = i64::from(session.capacity);
    let confirmed = ledger.confirmed_count()?;

    if confirmed < capacity {
        let booking = ledger.insert_booking(NewBooking {
            session_id: session.session_id,
            member_id: member_id.to_string(),
            requested_at: session.start_timestamp,
            status: BookingStatus::Confirmed,
            waitlist_position: None,
        })?;

        if confirmed + 1 >= capacity {
            ledger.set_session_status(SessionStatus::Full)?;
            info!("Session {} is now full", session.session_id);
        }
        return Ok(BookingOutcome::Confirmed { booking_id: booking.booking_id });
    }

    let position = waitlist::next_position(ledger.waitlist()?.len());
    let booking = ledger.insert_booking(NewBooking {
        session_id: session.session_id,
        member_id: member_id.to_string(),
        requested_at: session.start_timestamp,
        status: BookingStatus::Waitlisted,
        waitlist_position: Some(position),
    })?;

    if session.status != SessionStatus::Full {
        ledger.set_session_status(SessionStatus::Full)?;
    }
    Ok(BookingOutcome::Waitlisted { booking_id: booking.booking_id, position })
}

fn cancel(ledger: &mut dyn SessionLedger, booking_id: i32, caller: &Caller) -> Result<CancelOutcome, BookingError> {
    let booking = ledger
        .booking(booking_id)?
        .ok_or_else(|| BookingError::booking_not_found(booking_id))?;

    if !caller.can_act_for(&booking.member_id) {
        return Err(BookingError::Unauthorized(format!(
            "booking {} does not belong to member {}",
            booking_id, caller.member_id
        )));
    }
    if !booking.status.is_active() {
        return Err(BookingError::NotFound { resource: "active booking", id: booking_id.to_string() });
    }

    let session = ledger.session().clone();
    if session.status.is_final() {
        return Err(BookingError::SessionClosed {
            session_id: session.session_id,
            reason: if session.status == SessionStatus::Cancelled {
                "session has been cancelled"
            } else {
                "session has been completed"
            },
        });
    }

    let cancelled = ledger.update_booking(booking_id, BookingStatus::Cancelled, None)?;

    // A freed slot reopens a full session and goes to at most one waitlisted booking.
    // The session stays `active` until the next request finds it at capacity.
    let promoted = match (booking.status, booking.waitlist_position) {
        (BookingStatus::Confirmed, _) => {
            if session.status == SessionStatus::Full {
                ledger.set_session_status(SessionStatus::Active)?;
            }
            promote_head(ledger)?
        }
        (BookingStatus::Waitlisted, Some(position)) => {
            ledger.close_waitlist_gap(position)?;
            None
        }
        _ => None,
    };

    Ok(CancelOutcome { cancelled, promoted, session_status: ledger.session().status })
}

fn resize(ledger: &mut dyn SessionLedger, capacity: i32) -> Result<ResizeOutcome, BookingError> {
    let session = ledger.session().clone();
    if session.status.is_final() {
        return Err(BookingError::SessionClosed {
            session_id: session.session_id,
            reason: "session is no longer open for changes",
        });
    }

    let confirmed = ledger.confirmed_count()?;
    if i64::from(capacity) < confirmed {
        return Err(BookingError::InvalidRequest(format!(
            "capacity {} is below the {} confirmed booking(s)",
            capacity, confirmed
        )));
    }

    ledger.set_session_capacity(capacity)?;
    let promoted = fill_free_slots(ledger)?;
    Ok(ResizeOutcome { session: ledger.session().clone(), promoted })
}

fn complete(ledger: &mut dyn SessionLedger, now: NaiveDateTime) -> Result<SessionClosure, BookingError> {
    let session = ledger.session().clone();
    if session.status.is_final() {
        return closure_of(ledger, Vec::new());
    }
    if session.ends_at() > now {
        return Err(BookingError::InvalidRequest(format!(
            "session {} has not ended yet",
            session.session_id
        )));
    }

    ledger.set_session_status(SessionStatus::Completed)?;
    let mut cancelled = Vec::new();
    for entry in ledger.waitlist()? {
        cancelled.push(ledger.update_booking(entry.booking_id, BookingStatus::Cancelled, None)?);
    }
    closure_of(ledger, cancelled)
}

/// Promotes waitlist heads while slots are free, then brings the session status in line
/// with the confirmed count: `full` at capacity, `active` once a full session has room.
fn fill_free_slots(ledger: &mut dyn SessionLedger) -> Result<Vec<Booking>, BookingError> {
    let capacity = i64::from(ledger.session().capacity);
    let mut confirmed = ledger.confirmed_count()?;
    let mut promoted = Vec::new();

    while confirmed < capacity {
        let Some(booking) = promote_head(ledger)? else {
            break;
        };
        promoted.push(booking);
        confirmed += 1;
    }

    let status = ledger.session().status;
    if confirmed >= capacity && status != SessionStatus::Full {
        ledger.set_session_status(SessionStatus::Full)?;
    } else if confirmed < capacity && status == SessionStatus::Full {
        ledger.set_session_status(SessionStatus::Active)?;
    }
    Ok(promoted)
}

/// Confirms the waitlist head, if any, and shifts the rest up one place.
fn promote_head(ledger: &mut dyn SessionLedger) -> Result<Option<Booking>, BookingError> {
    let entries = ledger.waitlist()?;
    let Some(head) = waitlist::head(&entries) else {
        return Ok(None);
    };
    let position = head.waitlist_position.unwrap_or(1);
    let promoted = ledger.update_booking(head.booking_id, BookingStatus::Confirmed, None)?;
    ledger.close_waitlist_gap(position)?;
    Ok(Some(promoted))
}

fn closure_of(ledger: &mut dyn SessionLedger, cancelled_bookings: Vec<Booking>) -> Result<SessionClosure, BookingError> {
    Ok(SessionClosure { session: ledger.session().clone(), cancelled_bookings })
}
