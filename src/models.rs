use std::{fmt, str::FromStr};

use chrono::{Duration, NaiveDateTime};
use diesel::{
    deserialize::{self, FromSql},
    pg::{Pg, PgValue},
    serialize::{self, Output, ToSql},
    sql_types::Text,
    Insertable, Selectable,
};
use serde::{Deserialize, Serialize};

use crate::schema::{bookings, class_sessions};

/// Timestamp format accepted from admin forms.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::SessionStatus)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Scheduled,
    Active,
    Full,
    Cancelled,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Active => "active",
            SessionStatus::Full => "full",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Completed => "completed",
        }
    }

    /// Cancelled and completed sessions never change again.
    pub fn is_final(&self) -> bool {
        matches!(self, SessionStatus::Cancelled | SessionStatus::Completed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "active" => Ok(SessionStatus::Active),
            "full" => Ok(SessionStatus::Full),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "completed" => Ok(SessionStatus::Completed),
            other => Err(format!("Unrecognized session status: {}", other)),
        }
    }
}

impl ToSql<crate::schema::sql_types::SessionStatus, Pg> for SessionStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<crate::schema::sql_types::SessionStatus, Pg> for SessionStatus {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        Ok(<String as FromSql<Text, Pg>>::from_sql(bytes)?.parse::<SessionStatus>()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::BookingStatus)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Waitlisted,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Waitlisted => "waitlisted",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// Confirmed and waitlisted bookings are active.
    pub fn is_active(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(BookingStatus::Confirmed),
            "waitlisted" => Ok(BookingStatus::Waitlisted),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("Unrecognized booking status: {}", other)),
        }
    }
}

impl ToSql<crate::schema::sql_types::BookingStatus, Pg> for BookingStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
    }
}

impl FromSql<crate::schema::sql_types::BookingStatus, Pg> for BookingStatus {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        Ok(<String as FromSql<Text, Pg>>::from_sql(bytes)?.parse::<BookingStatus>()?)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = class_sessions)]
pub struct ClassSession {
    pub session_id: i32,
    pub title: String,
    pub instructor_id: String,
    pub start_timestamp: NaiveDateTime,
    pub duration_minutes: i32,
    pub capacity: i32,
    pub location: String,
    pub status: SessionStatus,
    pub created_at: NaiveDateTime,
}

impl ClassSession {
    pub fn ends_at(&self) -> NaiveDateTime {
        self.start_timestamp + Duration::minutes(i64::from(self.duration_minutes))
    }

    /// Reason the session no longer accepts bookings at `now`, if any.
    pub fn closed_reason(&self, now: NaiveDateTime) -> Option<&'static str> {
        match self.status {
            SessionStatus::Cancelled => Some("session has been cancelled"),
            SessionStatus::Completed => Some("session has been completed"),
            _ if self.start_timestamp <= now => Some("session has already started"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = class_sessions)]
pub struct NewClassSession {
    pub title: String,
    pub instructor_id: String,
    pub start_timestamp: NaiveDateTime,
    pub duration_minutes: i32,
    pub capacity: i32,
    pub location: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSessionRequest {
    pub title: String,
    pub instructor_id: String,
    pub start: String,
    pub duration_minutes: i32,
    pub capacity: i32,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = bookings)]
pub struct Booking {
    pub booking_id: i32,
    pub session_id: i32,
    pub member_id: String,
    pub requested_at: NaiveDateTime,
    pub status: BookingStatus,
    pub waitlist_position: Option<i32>,
    pub created_at: NaiveDateTime,
    pub cancelled_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = bookings)]
pub struct NewBooking {
    pub session_id: i32,
    pub member_id: String,
    pub requested_at: NaiveDateTime,
    pub status: BookingStatus,
    pub waitlist_position: Option<i32>,
}

/// Result of `request_booking` as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BookingOutcome {
    Confirmed { booking_id: i32 },
    Waitlisted { booking_id: i32, position: i32 },
}

impl BookingOutcome {
    pub fn booking_id(&self) -> i32 {
        match self {
            BookingOutcome::Confirmed { booking_id } | BookingOutcome::Waitlisted { booking_id, .. } => *booking_id,
        }
    }
}

/// Everything a committed cancellation changed.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub cancelled: Booking,
    pub promoted: Option<Booking>,
    pub session_status: SessionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelBookingResponse {
    pub status: BookingStatus,
    pub booking_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAvailability {
    pub session_id: i32,
    pub capacity: i32,
    pub confirmed_count: i64,
    pub waitlist_length: i64,
    pub status: SessionStatus,
}

/// Changes made when a session is closed out (cancelled or completed).
#[derive(Debug, Clone, Serialize)]
pub struct SessionClosure {
    pub session: ClassSession,
    pub cancelled_bookings: Vec<Booking>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub instructor_id: Option<String>,
    pub location: Option<String>,
    pub starts_after: Option<NaiveDateTime>,
    pub starts_before: Option<NaiveDateTime>,
}

impl SessionFilter {
    pub fn matches(&self, session: &ClassSession) -> bool {
        self.status.map_or(true, |s| session.status == s)
            && self.instructor_id.as_deref().map_or(true, |i| session.instructor_id == i)
            && self
                .location
                .as_deref()
                .map_or(true, |l| session.location.eq_ignore_ascii_case(l))
            && self.starts_after.map_or(true, |t| session.start_timestamp >= t)
            && self.starts_before.map_or(true, |t| session.start_timestamp < t)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResizeSessionRequest {
    pub capacity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResizeOutcome {
    pub session: ClassSession,
    pub promoted: Vec<Booking>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub message: String,
}
