use chrono::{NaiveDateTime, Utc};
use diesel::{
    prelude::*,
    r2d2::{self, ConnectionManager},
    result::{DatabaseErrorKind, Error as DieselError},
};

use super::{PersistenceGateway, SessionLedger};
use crate::errors::{BookingError, ACTIVE_BOOKING_INDEX};
use crate::models::{Booking, BookingStatus, ClassSession, NewBooking, NewClassSession, SessionStatus};
use crate::schema::{bookings, class_sessions};

pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// PostgreSQL gateway. The atomic unit is a transaction holding `FOR UPDATE` on the
/// session row, so all booking writes for one session are serialized while writes for
/// different sessions proceed independently.
#[derive(Clone)]
pub struct PgGateway {
    pool: DbPool,
}

impl PgGateway {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl PersistenceGateway for PgGateway {
    fn with_session<T, F>(&self, session_id: i32, f: F) -> Result<T, BookingError>
    where
        F: FnOnce(&mut dyn SessionLedger) -> Result<T, BookingError>,
    {
        let mut pooled = self.pool.get()?;
        let conn: &mut PgConnection = &mut pooled;

        conn.transaction::<T, BookingError, _>(|conn| {
            // Lock the session row; concurrent units for the same session queue here.
            let session = class_sessions::table
                .find(session_id)
                .select(ClassSession::as_select())
                .for_update()
                .first::<ClassSession>(conn)
                .optional()?
                .ok_or_else(|| BookingError::session_not_found(session_id))?;

            let mut ledger = PgLedger { conn, session };
            f(&mut ledger)
        })
    }

    fn find_session(&self, session_id: i32) -> Result<Option<ClassSession>, BookingError> {
        let mut conn = self.pool.get()?;

        let session = class_sessions::table
            .find(session_id)
            .select(ClassSession::as_select())
            .first::<ClassSession>(&mut conn)
            .optional()?;

        Ok(session)
    }

    fn list_sessions(&self) -> Result<Vec<ClassSession>, BookingError> {
        let mut conn = self.pool.get()?;

        let sessions = class_sessions::table
            .select(ClassSession::as_select())
            .order((class_sessions::start_timestamp.asc(), class_sessions::session_id.asc()))
            .load::<ClassSession>(&mut conn)?;

        Ok(sessions)
    }

    fn insert_session(&self, session: NewClassSession) -> Result<ClassSession, BookingError> {
        let mut conn = self.pool.get()?;

        let created = diesel::insert_into(class_sessions::table)
            .values(&session)
            .returning(ClassSession::as_returning())
            .get_result::<ClassSession>(&mut conn)?;

        Ok(created)
    }

    fn delete_session(&self, session_id: i32) -> Result<bool, BookingError> {
        let mut conn = self.pool.get()?;

        // Bookings go with it through ON DELETE CASCADE.
        let deleted = diesel::delete(class_sessions::table.find(session_id)).execute(&mut conn)?;

        Ok(deleted > 0)
    }

    fn find_booking(&self, booking_id: i32) -> Result<Option<Booking>, BookingError> {
        let mut conn = self.pool.get()?;

        let booking = bookings::table
            .find(booking_id)
            .select(Booking::as_select())
            .first::<Booking>(&mut conn)
            .optional()?;

        Ok(booking)
    }

    fn list_session_bookings(&self, session_id: i32) -> Result<Vec<Booking>, BookingError> {
        let mut conn = self.pool.get()?;

        let roster = bookings::table
            .filter(bookings::session_id.eq(session_id))
            .select(Booking::as_select())
            .order((bookings::created_at.asc(), bookings::booking_id.asc()))
            .load::<Booking>(&mut conn)?;

        Ok(roster)
    }

    fn list_member_bookings(&self, member_id: &str) -> Result<Vec<Booking>, BookingError> {
        let mut conn = self.pool.get()?;

        let history = bookings::table
            .filter(bookings::member_id.eq(member_id))
            .select(Booking::as_select())
            .order((bookings::created_at.desc(), bookings::booking_id.desc()))
            .load::<Booking>(&mut conn)?;

        Ok(history)
    }
}

struct PgLedger<'c> {
    conn: &'c mut PgConnection,
    session: ClassSession,
}

impl PgLedger<'_> {
    fn session_id(&self) -> i32 {
        self.session.session_id
    }
}

impl SessionLedger for PgLedger<'_> {
    fn session(&self) -> &ClassSession {
        &self.session
    }

    fn booking(&mut self, booking_id: i32) -> Result<Option<Booking>, BookingError> {
        let booking = bookings::table
            .filter(bookings::booking_id.eq(booking_id))
            .filter(bookings::session_id.eq(self.session_id()))
            .select(Booking::as_select())
            .for_update()
            .first::<Booking>(self.conn)
            .optional()?;

        Ok(booking)
    }

    fn active_booking_for(&mut self, member_id: &str) -> Result<Option<Booking>, BookingError> {
        let existing = bookings::table
            .filter(bookings::session_id.eq(self.session_id()))
            .filter(bookings::member_id.eq(member_id))
            .filter(bookings::status.ne(BookingStatus::Cancelled))
            .select(Booking::as_select())
            .first::<Booking>(self.conn)
            .optional()?;

        Ok(existing)
    }

    fn active_bookings(&mut self) -> Result<Vec<Booking>, BookingError> {
        let active = bookings::table
            .filter(bookings::session_id.eq(self.session_id()))
            .filter(bookings::status.ne(BookingStatus::Cancelled))
            .select(Booking::as_select())
            .order(bookings::booking_id.asc())
            .load::<Booking>(self.conn)?;

        Ok(active)
    }

    fn confirmed_count(&mut self) -> Result<i64, BookingError> {
        let count = bookings::table
            .filter(bookings::session_id.eq(self.session_id()))
            .filter(bookings::status.eq(BookingStatus::Confirmed))
            .count()
            .get_result::<i64>(self.conn)?;

        Ok(count)
    }

    fn waitlist(&mut self) -> Result<Vec<Booking>, BookingError> {
        let entries = bookings::table
            .filter(bookings::session_id.eq(self.session_id()))
            .filter(bookings::status.eq(BookingStatus::Waitlisted))
            .select(Booking::as_select())
            .order(bookings::waitlist_position.asc())
            .load::<Booking>(self.conn)?;

        Ok(entries)
    }

    fn insert_booking(&mut self, booking: NewBooking) -> Result<Booking, BookingError> {
        let member_id = booking.member_id.clone();
        let session_id = booking.session_id;

        diesel::insert_into(bookings::table)
            .values(&booking)
            .returning(Booking::as_returning())
            .get_result::<Booking>(self.conn)
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, ref info)
                    if info.constraint_name() == Some(ACTIVE_BOOKING_INDEX) =>
                {
                    BookingError::AlreadyBooked { member_id, session_id }
                }
                other => other.into(),
            })
    }

    fn update_booking(
        &mut self,
        booking_id: i32,
        status: BookingStatus,
        waitlist_position: Option<i32>,
    ) -> Result<Booking, BookingError> {
        let cancelled_at: Option<NaiveDateTime> =
            (status == BookingStatus::Cancelled).then(|| Utc::now().naive_utc());

        let updated = diesel::update(
            bookings::table
                .filter(bookings::booking_id.eq(booking_id))
                .filter(bookings::session_id.eq(self.session_id())),
        )
        .set((
            bookings::status.eq(status),
            bookings::waitlist_position.eq(waitlist_position),
            bookings::cancelled_at.eq(cancelled_at),
        ))
        .returning(Booking::as_returning())
        .get_result::<Booking>(self.conn)
        .optional()?;

        updated.ok_or_else(|| BookingError::booking_not_found(booking_id))
    }

    fn close_waitlist_gap(&mut self, removed_position: i32) -> Result<(), BookingError> {
        diesel::update(
            bookings::table
                .filter(bookings::session_id.eq(self.session_id()))
                .filter(bookings::status.eq(BookingStatus::Waitlisted))
                .filter(bookings::waitlist_position.gt(removed_position)),
        )
        .set(bookings::waitlist_position.eq(bookings::waitlist_position - 1))
        .execute(self.conn)?;

        Ok(())
    }

    fn set_session_status(&mut self, status: SessionStatus) -> Result<(), BookingError> {
        diesel::update(class_sessions::table.find(self.session_id()))
            .set(class_sessions::status.eq(status))
            .execute(self.conn)?;

        self.session.status = status;
        Ok(())
    }

    fn set_session_capacity(&mut self, capacity: i32) -> Result<(), BookingError> {
        diesel::update(class_sessions::table.find(self.session_id()))
            .set(class_sessions::capacity.eq(capacity))
            .execute(self.conn)?;

        self.session.capacity = capacity;
        Ok(())
    }
}
