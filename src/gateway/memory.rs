use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use super::{PersistenceGateway, SessionLedger};
use crate::errors::BookingError;
use crate::models::{Booking, BookingStatus, ClassSession, NewBooking, NewClassSession, SessionStatus};
use crate::waitlist;

#[derive(Debug, Default)]
struct MemoryState {
    sessions: BTreeMap<i32, ClassSession>,
    /// Bookings grouped by session, then by booking id.
    bookings: BTreeMap<i32, BTreeMap<i32, Booking>>,
    booking_sessions: BTreeMap<i32, i32>,
    last_session_id: i32,
    last_booking_id: i32,
}

impl MemoryState {
    fn booking(&self, booking_id: i32) -> Option<&Booking> {
        let session_id = self.booking_sessions.get(&booking_id)?;
        self.bookings.get(session_id)?.get(&booking_id)
    }
}

/// In-process gateway for development and tests.
///
/// A single mutex serializes every atomic unit. Each unit works on a copy of its
/// session's rows that replaces the originals only when the unit succeeds.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, BookingError> {
        self.state
            .lock()
            .map_err(|_| BookingError::Persistence("in-memory store poisoned".to_string()))
    }
}

impl PersistenceGateway for MemoryGateway {
    fn with_session<T, F>(&self, session_id: i32, f: F) -> Result<T, BookingError>
    where
        F: FnOnce(&mut dyn SessionLedger) -> Result<T, BookingError>,
    {
        let mut guard = self.lock()?;
        let session = guard
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| BookingError::session_not_found(session_id))?;

        let first_new_id = guard.last_booking_id + 1;
        let mut ledger = MemoryLedger {
            session,
            bookings: guard.bookings.get(&session_id).cloned().unwrap_or_default(),
            last_booking_id: guard.last_booking_id,
        };
        let result = f(&mut ledger)?;

        let state = &mut *guard;
        for &booking_id in ledger.bookings.range(first_new_id..).map(|(id, _)| id) {
            state.booking_sessions.insert(booking_id, session_id);
        }
        state.last_booking_id = ledger.last_booking_id;
        state.sessions.insert(session_id, ledger.session);
        state.bookings.insert(session_id, ledger.bookings);
        Ok(result)
    }

    fn find_session(&self, session_id: i32) -> Result<Option<ClassSession>, BookingError> {
        Ok(self.lock()?.sessions.get(&session_id).cloned())
    }

    fn list_sessions(&self) -> Result<Vec<ClassSession>, BookingError> {
        let mut sessions: Vec<ClassSession> = self.lock()?.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| (s.start_timestamp, s.session_id));
        Ok(sessions)
    }

    fn insert_session(&self, session: NewClassSession) -> Result<ClassSession, BookingError> {
        if session.capacity < 1 {
            return Err(BookingError::Persistence("capacity violates check constraint".to_string()));
        }

        let mut state = self.lock()?;
        state.last_session_id += 1;
        let created = ClassSession {
            session_id: state.last_session_id,
            title: session.title,
            instructor_id: session.instructor_id,
            start_timestamp: session.start_timestamp,
            duration_minutes: session.duration_minutes,
            capacity: session.capacity,
            location: session.location,
            status: session.status,
            created_at: Utc::now().naive_utc(),
        };
        state.sessions.insert(created.session_id, created.clone());
        Ok(created)
    }

    fn delete_session(&self, session_id: i32) -> Result<bool, BookingError> {
        let mut state = self.lock()?;
        if state.sessions.remove(&session_id).is_none() {
            return Ok(false);
        }
        if let Some(removed) = state.bookings.remove(&session_id) {
            for booking_id in removed.keys() {
                state.booking_sessions.remove(booking_id);
            }
        }
        Ok(true)
    }

    fn find_booking(&self, booking_id: i32) -> Result<Option<Booking>, BookingError> {
        Ok(self.lock()?.booking(booking_id).cloned())
    }

    fn list_session_bookings(&self, session_id: i32) -> Result<Vec<Booking>, BookingError> {
        // Booking ids grow with creation time.
        Ok(self
            .lock()?
            .bookings
            .get(&session_id)
            .map(|bookings| bookings.values().cloned().collect())
            .unwrap_or_default())
    }

    fn list_member_bookings(&self, member_id: &str) -> Result<Vec<Booking>, BookingError> {
        let mut bookings: Vec<Booking> = self
            .lock()?
            .bookings
            .values()
            .flat_map(|session| session.values())
            .filter(|b| b.member_id == member_id)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| Reverse(b.booking_id));
        Ok(bookings)
    }
}

struct MemoryLedger {
    session: ClassSession,
    bookings: BTreeMap<i32, Booking>,
    last_booking_id: i32,
}

impl MemoryLedger {
    fn session_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.values()
    }
}

impl SessionLedger for MemoryLedger {
    fn session(&self) -> &ClassSession {
        &self.session
    }

    fn booking(&mut self, booking_id: i32) -> Result<Option<Booking>, BookingError> {
        Ok(self.bookings.get(&booking_id).cloned())
    }

    fn active_booking_for(&mut self, member_id: &str) -> Result<Option<Booking>, BookingError> {
        Ok(self
            .session_bookings()
            .find(|b| b.member_id == member_id && b.status.is_active())
            .cloned())
    }

    fn active_bookings(&mut self) -> Result<Vec<Booking>, BookingError> {
        Ok(self.session_bookings().filter(|b| b.status.is_active()).cloned().collect())
    }

    fn confirmed_count(&mut self) -> Result<i64, BookingError> {
        let count = self
            .session_bookings()
            .filter(|b| b.status == BookingStatus::Confirmed)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    fn waitlist(&mut self) -> Result<Vec<Booking>, BookingError> {
        let mut entries: Vec<Booking> = self
            .session_bookings()
            .filter(|b| b.status == BookingStatus::Waitlisted)
            .cloned()
            .collect();
        entries.sort_by_key(|b| b.waitlist_position);
        Ok(entries)
    }

    fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, BookingError> {
        // Mirrors the partial unique index and check constraints of the SQL schema.
        if booking.status.is_active() && self.active_booking_for(&booking.member_id)?.is_some() {
            return Err(BookingError::AlreadyBooked { member_id: booking.member_id, session_id: booking.session_id });
        }
        if (booking.status == BookingStatus::Waitlisted) != booking.waitlist_position.is_some() {
            return Err(BookingError::Persistence("waitlist position violates check constraint".to_string()));
        }

        self.last_booking_id += 1;
        let created = Booking {
            booking_id: self.last_booking_id,
            session_id: booking.session_id,
            member_id: booking.member_id,
            requested_at: booking.requested_at,
            status: booking.status,
            waitlist_position: booking.waitlist_position,
            created_at: Utc::now().naive_utc(),
            cancelled_at: None,
        };
        self.bookings.insert(created.booking_id, created.clone());
        Ok(created)
    }

    fn update_booking(
        &mut self,
        booking_id: i32,
        status: BookingStatus,
        waitlist_position: Option<i32>,
    ) -> Result<Booking, BookingError> {
        let booking = self
            .bookings
            .get_mut(&booking_id)
            .ok_or_else(|| BookingError::booking_not_found(booking_id))?;

        booking.status = status;
        booking.waitlist_position = waitlist_position;
        booking.cancelled_at = (status == BookingStatus::Cancelled).then(|| Utc::now().naive_utc());
        Ok(booking.clone())
    }

    fn close_waitlist_gap(&mut self, removed_position: i32) -> Result<(), BookingError> {
        for booking in self.bookings.values_mut().filter(|b| b.status == BookingStatus::Waitlisted) {
            booking.waitlist_position = booking.waitlist_position.map(|p| waitlist::shifted(p, removed_position));
        }
        Ok(())
    }

    fn set_session_status(&mut self, status: SessionStatus) -> Result<(), BookingError> {
        self.session.status = status;
        Ok(())
    }

    fn set_session_capacity(&mut self, capacity: i32) -> Result<(), BookingError> {
        if capacity < 1 {
            return Err(BookingError::Persistence("capacity violates check constraint".to_string()));
        }
        self.session.capacity = capacity;
        Ok(())
    }
}
