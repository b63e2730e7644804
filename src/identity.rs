//! Caller identity supplied by the upstream identity provider.
//!
//! The provider authenticates the member and forwards an opaque member id in a trusted
//! header. Nothing here re-authenticates; the id is taken as given.

use std::future::{ready, Ready};
use std::sync::OnceLock;

use actix_web::{dev::Payload, http::header::HeaderMap, FromRequest, HttpRequest};
use regex::Regex;

use crate::errors::BookingError;

pub const MEMBER_HEADER: &str = "x-member-id";
pub const ROLE_HEADER: &str = "x-member-role";
pub const ADMIN_ROLE: &str = "admin";

fn member_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,255}$").expect("member id pattern is valid"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub member_id: String,
    pub is_admin: bool,
}

impl Caller {
    pub fn member(member_id: impl Into<String>) -> Self {
        Self { member_id: member_id.into(), is_admin: false }
    }

    pub fn admin(member_id: impl Into<String>) -> Self {
        Self { member_id: member_id.into(), is_admin: true }
    }

    /// Members act on their own records; admins act on anyone's.
    pub fn can_act_for(&self, member_id: &str) -> bool {
        self.is_admin || self.member_id == member_id
    }

    pub fn require_admin(&self) -> Result<(), BookingError> {
        if self.is_admin {
            Ok(())
        } else {
            Err(BookingError::Unauthorized(format!("member {} is not an administrator", self.member_id)))
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, BookingError> {
        let member_id = headers
            .get(MEMBER_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|id| member_id_pattern().is_match(id))
            .ok_or(BookingError::Unauthenticated)?;

        let is_admin = headers
            .get(ROLE_HEADER)
            .and_then(|h| h.to_str().ok())
            .map_or(false, |role| role.trim().eq_ignore_ascii_case(ADMIN_ROLE));

        Ok(Self { member_id: member_id.to_string(), is_admin })
    }
}

impl FromRequest for Caller {
    type Error = BookingError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Caller::from_headers(req.headers()))
    }
}
