//! Storage seam for sessions and bookings.
//!
//! Every change to a session's bookings happens inside [`PersistenceGateway::with_session`]:
//! the session is locked for the duration of the closure and the closure's writes commit
//! together or not at all. Reads outside that unit are plain lookups.

use crate::errors::BookingError;
use crate::models::{Booking, BookingStatus, ClassSession, NewBooking, NewClassSession, SessionStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryGateway;
pub use postgres::{DbPool, PgGateway};

/// Reads and writes against one locked session.
pub trait SessionLedger {
    /// The locked session as of the last write made through this ledger.
    fn session(&self) -> &ClassSession;

    /// A booking of this session; bookings of other sessions are not visible.
    fn booking(&mut self, booking_id: i32) -> Result<Option<Booking>, BookingError>;

    fn active_booking_for(&mut self, member_id: &str) -> Result<Option<Booking>, BookingError>;

    fn active_bookings(&mut self) -> Result<Vec<Booking>, BookingError>;

    fn confirmed_count(&mut self) -> Result<i64, BookingError>;

    /// Waitlisted bookings ordered by position.
    fn waitlist(&mut self) -> Result<Vec<Booking>, BookingError>;

    /// Fails with `AlreadyBooked` when the member already holds an active booking.
    fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, BookingError>;

    /// Sets status and waitlist position; stamps `cancelled_at` when cancelling.
    fn update_booking(
        &mut self,
        booking_id: i32,
        status: BookingStatus,
        waitlist_position: Option<i32>,
    ) -> Result<Booking, BookingError>;

    /// Moves every waitlisted entry behind `removed_position` up by one.
    fn close_waitlist_gap(&mut self, removed_position: i32) -> Result<(), BookingError>;

    fn set_session_status(&mut self, status: SessionStatus) -> Result<(), BookingError>;

    fn set_session_capacity(&mut self, capacity: i32) -> Result<(), BookingError>;
}

pub trait PersistenceGateway: Send + Sync + 'static {
    /// Runs `f` as one atomic unit against the locked session. `Err` rolls back every
    /// write `f` made. Unknown sessions fail with `NotFound`.
    fn with_session<T, F>(&self, session_id: i32, f: F) -> Result<T, BookingError>
    where
        F: FnOnce(&mut dyn SessionLedger) -> Result<T, BookingError>;

    fn find_session(&self, session_id: i32) -> Result<Option<ClassSession>, BookingError>;

    /// All sessions ordered by start time.
    fn list_sessions(&self) -> Result<Vec<ClassSession>, BookingError>;

    fn insert_session(&self, session: NewClassSession) -> Result<ClassSession, BookingError>;

    /// Deletes the session and its bookings. Returns false for unknown sessions.
    fn delete_session(&self, session_id: i32) -> Result<bool, BookingError>;

    fn find_booking(&self, booking_id: i32) -> Result<Option<Booking>, BookingError>;

    /// Bookings of a session ordered by creation.
    fn list_session_bookings(&self, session_id: i32) -> Result<Vec<Booking>, BookingError>;

    /// Bookings of a member, newest first.
    fn list_member_bookings(&self, member_id: &str) -> Result<Vec<Booking>, BookingError>;
}
