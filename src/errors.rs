use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::Serialize;
use thiserror::Error;

/// Name of the partial unique index guarding one active booking per member and session.
pub const ACTIVE_BOOKING_INDEX: &str = "bookings_one_active_per_member";

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("member {member_id} already holds an active booking for session {session_id}")]
    AlreadyBooked { member_id: String, session_id: i32 },

    #[error("session {session_id} is closed: {reason}")]
    SessionClosed { session_id: i32, reason: &'static str },

    #[error("{0}")]
    Unauthorized(String),

    #[error("caller identity missing or invalid")]
    Unauthenticated,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("persistence temporarily unavailable: {0}")]
    TransientPersistenceFailure(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl BookingError {
    pub fn session_not_found(session_id: i32) -> Self {
        BookingError::NotFound { resource: "session", id: session_id.to_string() }
    }

    pub fn booking_not_found(booking_id: i32) -> Self {
        BookingError::NotFound { resource: "booking", id: booking_id.to_string() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BookingError::TransientPersistenceFailure(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            BookingError::NotFound { .. } => "not_found",
            BookingError::AlreadyBooked { .. } => "already_booked",
            BookingError::SessionClosed { .. } => "session_closed",
            BookingError::Unauthorized(_) => "unauthorized",
            BookingError::Unauthenticated => "unauthenticated",
            BookingError::InvalidRequest(_) => "invalid_request",
            BookingError::TransientPersistenceFailure(_) => "transient_persistence_failure",
            BookingError::Persistence(_) => "persistence_failure",
        }
    }

    /// Message safe to show to the caller. Store internals are not leaked.
    pub fn user_message(&self) -> String {
        match self {
            BookingError::TransientPersistenceFailure(_) => {
                "The booking store is temporarily unavailable, please retry".to_string()
            }
            BookingError::Persistence(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ResponseError for BookingError {
    fn status_code(&self) -> StatusCode {
        match self {
            BookingError::NotFound { .. } => StatusCode::NOT_FOUND,
            BookingError::AlreadyBooked { .. } => StatusCode::CONFLICT,
            BookingError::SessionClosed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BookingError::Unauthorized(_) => StatusCode::FORBIDDEN,
            BookingError::Unauthenticated => StatusCode::UNAUTHORIZED,
            BookingError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BookingError::TransientPersistenceFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            BookingError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody { code: self.code(), message: self.user_message() })
    }
}

impl From<DieselError> for BookingError {
    fn from(e: DieselError) -> Self {
        match e {
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                BookingError::TransientPersistenceFailure(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                BookingError::TransientPersistenceFailure(info.message().to_string())
            }
            DieselError::BrokenTransactionManager => {
                BookingError::TransientPersistenceFailure("transaction manager is broken".to_string())
            }
            other => BookingError::Persistence(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for BookingError {
    fn from(e: r2d2::Error) -> Self {
        BookingError::TransientPersistenceFailure(e.to_string())
    }
}
