use std::sync::{Arc, OnceLock};

use chrono::{NaiveDateTime, Utc};
use log::info;
use regex::Regex;

use crate::errors::BookingError;
use crate::gateway::PersistenceGateway;
use crate::identity::Caller;
use crate::models::{
    Booking, BookingStatus, ClassSession, NewClassSession, ScheduleSessionRequest, SessionAvailability, SessionFilter,
    SessionStatus, TIMESTAMP_FORMAT,
};

/// Longest schedulable session.
pub const MAX_DURATION_MINUTES: i32 = 12 * 60;

fn label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9 \-'&.,]+$").expect("label pattern is valid"))
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,255}$").expect("reference pattern is valid"))
}

/// Session lookups for listings and for the booking flow, plus session administration.
pub struct ClassCatalog<G> {
    gateway: Arc<G>,
}

impl<G> Clone for ClassCatalog<G> {
    fn clone(&self) -> Self {
        Self { gateway: self.gateway.clone() }
    }
}

impl<G: PersistenceGateway> ClassCatalog<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    pub fn get(&self, session_id: i32) -> Result<ClassSession, BookingError> {
        self.gateway
            .find_session(session_id)?
            .ok_or_else(|| BookingError::session_not_found(session_id))
    }

    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<ClassSession>, BookingError> {
        Ok(self
            .gateway
            .list_sessions()?
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect())
    }

    /// Capacity, confirmed count and waitlist length read in one atomic unit.
    pub fn availability(&self, session_id: i32) -> Result<SessionAvailability, BookingError> {
        self.gateway.with_session(session_id, |ledger| {
            let confirmed_count = ledger.confirmed_count()?;
            let waitlist_length = i64::try_from(ledger.waitlist()?.len()).unwrap_or(i64::MAX);
            let session = ledger.session();
            Ok(SessionAvailability {
                session_id: session.session_id,
                capacity: session.capacity,
                confirmed_count,
                waitlist_length,
                status: session.status,
            })
        })
    }

    pub fn schedule(&self, request: &ScheduleSessionRequest) -> Result<ClassSession, BookingError> {
        let new_session = validate_schedule(request, Utc::now().naive_utc())?;
        let session = self.gateway.insert_session(new_session)?;
        info!(
            "Session {} '{}' scheduled at {} with capacity {}",
            session.session_id, session.title, session.start_timestamp, session.capacity
        );
        Ok(session)
    }

    /// Removes the session together with every booking made against it.
    pub fn delete(&self, session_id: i32) -> Result<(), BookingError> {
        if !self.gateway.delete_session(session_id)? {
            return Err(BookingError::session_not_found(session_id));
        }
        info!("Session {} deleted with its bookings", session_id);
        Ok(())
    }

    pub fn booking(&self, booking_id: i32, caller: &Caller) -> Result<Booking, BookingError> {
        let booking = self
            .gateway
            .find_booking(booking_id)?
            .ok_or_else(|| BookingError::booking_not_found(booking_id))?;

        if !caller.can_act_for(&booking.member_id) {
            return Err(BookingError::Unauthorized(format!(
                "booking {} does not belong to member {}",
                booking_id, caller.member_id
            )));
        }
        Ok(booking)
    }

    pub fn member_bookings(&self, member_id: &str) -> Result<Vec<Booking>, BookingError> {
        self.gateway.list_member_bookings(member_id)
    }

    /// Active bookings first (confirmed, then waitlist order), cancelled history last.
    pub fn roster(&self, session_id: i32) -> Result<Vec<Booking>, BookingError> {
        self.get(session_id)?;
        let mut roster = self.gateway.list_session_bookings(session_id)?;
        roster.sort_by_key(|b| {
            let rank = match b.status {
                BookingStatus::Confirmed => 0,
                BookingStatus::Waitlisted => 1,
                BookingStatus::Cancelled => 2,
            };
            (rank, b.waitlist_position.unwrap_or(0), b.booking_id)
        });
        Ok(roster)
    }
}

/// Checks an admin's schedule form and turns it into an insertable session.
pub fn validate_schedule(request: &ScheduleSessionRequest, now: NaiveDateTime) -> Result<NewClassSession, BookingError> {
    let title = request.title.trim();
    if title.is_empty() || !label_pattern().is_match(title) {
        return Err(BookingError::InvalidRequest(
            "title should be alphanumeric; spaces and - ' & . , are allowed".to_string(),
        ));
    }

    let location = request.location.trim();
    if location.is_empty() || !label_pattern().is_match(location) {
        return Err(BookingError::InvalidRequest(
            "location should be alphanumeric; spaces and - ' & . , are allowed".to_string(),
        ));
    }

    if !reference_pattern().is_match(&request.instructor_id) {
        return Err(BookingError::InvalidRequest("instructor_id is not a valid reference".to_string()));
    }

    let start_timestamp = NaiveDateTime::parse_from_str(&request.start, TIMESTAMP_FORMAT)
        .map_err(|_| BookingError::InvalidRequest("start timestamp not in correct format".to_string()))?;
    if start_timestamp <= now {
        return Err(BookingError::InvalidRequest("start must be in the future".to_string()));
    }

    if request.duration_minutes < 1 || request.duration_minutes > MAX_DURATION_MINUTES {
        return Err(BookingError::InvalidRequest(format!(
            "duration must be between 1 and {} minutes",
            MAX_DURATION_MINUTES
        )));
    }

    if request.capacity < 1 {
        return Err(BookingError::InvalidRequest("capacity must be at least 1".to_string()));
    }

    Ok(NewClassSession {
        title: title.to_string(),
        instructor_id: request.instructor_id.clone(),
        start_timestamp,
        duration_minutes: request.duration_minutes,
        capacity: request.capacity,
        location: location.to_string(),
        status: SessionStatus::Scheduled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::service::BookingService;
    use chrono::NaiveDate;
    use rstest::rstest;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 3, 1).unwrap().and_hms_opt(8, 0, 0).unwrap()
    }

    fn request() -> ScheduleSessionRequest {
        ScheduleSessionRequest {
            title: "Power Yoga".to_string(),
            instructor_id: "inst-3".to_string(),
            start: "2030-03-02 18:30:00".to_string(),
            duration_minutes: 60,
            capacity: 12,
            location: "Studio A".to_string(),
        }
    }

    #[test]
    fn valid_form_becomes_a_scheduled_session() {
        let session = validate_schedule(&request(), now()).unwrap();
        assert_eq!(session.status, SessionStatus::Scheduled);
        assert_eq!(session.start_timestamp.to_string(), "2030-03-02 18:30:00");
        assert_eq!(session.capacity, 12);
    }

    #[rstest]
    #[case::bad_title(ScheduleSessionRequest { title: "Yoga <script>".to_string(), ..request() })]
    #[case::blank_location(ScheduleSessionRequest { location: "  ".to_string(), ..request() })]
    #[case::bad_instructor(ScheduleSessionRequest { instructor_id: "a b".to_string(), ..request() })]
    #[case::bad_timestamp(ScheduleSessionRequest { start: "02/03/2030".to_string(), ..request() })]
    #[case::in_the_past(ScheduleSessionRequest { start: "2030-03-01 07:59:59".to_string(), ..request() })]
    #[case::zero_duration(ScheduleSessionRequest { duration_minutes: 0, ..request() })]
    #[case::too_long(ScheduleSessionRequest { duration_minutes: MAX_DURATION_MINUTES + 1, ..request() })]
    #[case::zero_capacity(ScheduleSessionRequest { capacity: 0, ..request() })]
    fn invalid_forms_are_rejected(#[case] form: ScheduleSessionRequest) {
        assert!(matches!(validate_schedule(&form, now()), Err(BookingError::InvalidRequest(_))));
    }

    fn catalog_with_session(capacity: i32) -> (ClassCatalog<MemoryGateway>, BookingService<MemoryGateway>, i32) {
        let gateway = Arc::new(MemoryGateway::new());
        let catalog = ClassCatalog::new(gateway.clone());
        let start = (Utc::now().naive_utc() + chrono::Duration::days(2)).format(TIMESTAMP_FORMAT).to_string();
        let session = catalog
            .schedule(&ScheduleSessionRequest { start, capacity, ..request() })
            .unwrap();
        (catalog, BookingService::new(gateway), session.session_id)
    }

    #[test]
    fn availability_reflects_bookings() {
        let (catalog, service, id) = catalog_with_session(1);
        service.request_booking("m1", id).unwrap();
        service.request_booking("m2", id).unwrap();
        service.request_booking("m3", id).unwrap();

        let availability = catalog.availability(id).unwrap();
        assert_eq!(
            availability,
            SessionAvailability {
                session_id: id,
                capacity: 1,
                confirmed_count: 1,
                waitlist_length: 2,
                status: SessionStatus::Full,
            }
        );
    }

    #[test]
    fn roster_orders_confirmed_then_waitlist() {
        let (catalog, service, id) = catalog_with_session(1);
        let first = service.request_booking("m1", id).unwrap();
        let second = service.request_booking("m2", id).unwrap();
        let third = service.request_booking("m3", id).unwrap();
        service.cancel_booking(second.booking_id(), &Caller::member("m2")).unwrap();

        let order: Vec<i32> = catalog.roster(id).unwrap().iter().map(|b| b.booking_id).collect();
        assert_eq!(order, vec![first.booking_id(), third.booking_id(), second.booking_id()]);
    }

    #[test]
    fn booking_lookup_is_owner_or_admin_only() {
        let (catalog, service, id) = catalog_with_session(3);
        let booking = service.request_booking("m1", id).unwrap();

        assert!(catalog.booking(booking.booking_id(), &Caller::member("m1")).is_ok());
        assert!(catalog.booking(booking.booking_id(), &Caller::admin("ops")).is_ok());
        assert!(matches!(
            catalog.booking(booking.booking_id(), &Caller::member("m2")),
            Err(BookingError::Unauthorized(_))
        ));
    }

    #[test]
    fn list_applies_filter() {
        let (catalog, service, id) = catalog_with_session(1);
        service.request_booking("m1", id).unwrap();

        let full = SessionFilter { status: Some(SessionStatus::Full), ..SessionFilter::default() };
        assert_eq!(catalog.list(&full).unwrap().len(), 1);

        let elsewhere = SessionFilter { location: Some("Annex".to_string()), ..SessionFilter::default() };
        assert!(catalog.list(&elsewhere).unwrap().is_empty());
    }

    #[test]
    fn delete_unknown_session_is_not_found() {
        let (catalog, _, id) = catalog_with_session(1);
        catalog.delete(id).unwrap();
        assert!(matches!(catalog.delete(id), Err(BookingError::NotFound { .. })));
        assert!(matches!(catalog.get(id), Err(BookingError::NotFound { .. })));
    }
}
