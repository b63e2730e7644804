//! Runs against a real PostgreSQL database when `TEST_DATABASE_URL` is set; skipped otherwise.
//! The schema is recreated from the migrations, so point it at a throwaway database.

use std::sync::{Arc, Barrier, Mutex, OnceLock};
use std::thread;

use chrono::{Duration, Utc};
use diesel::{
    connection::SimpleConnection,
    r2d2::{ConnectionManager, Pool},
    PgConnection,
};

use studio_booking::{
    errors::BookingError,
    gateway::{PersistenceGateway, PgGateway},
    identity::Caller,
    models::{BookingOutcome, BookingStatus, NewClassSession, SessionStatus},
    service::BookingService,
    waitlist,
};

const UP: &str = include_str!("../migrations/2025-01-01-000000_create_sessions_and_bookings/up.sql");
const DOWN: &str = include_str!("../migrations/2025-01-01-000000_create_sessions_and_bookings/down.sql");

// Tests share one schema; run them one at a time.
fn serial() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

fn gateway() -> Option<Arc<PgGateway>> {
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set; skipping PostgreSQL test");
            return None;
        }
    };
    let pool = Pool::builder()
        .max_size(16)
        .build(ConnectionManager::<PgConnection>::new(url))
        .unwrap();
    let mut conn = pool.get().unwrap();
    conn.batch_execute(DOWN).unwrap();
    conn.batch_execute(UP).unwrap();
    Some(Arc::new(PgGateway::new(pool)))
}

fn session(gateway: &PgGateway, capacity: i32) -> i32 {
    gateway
        .insert_session(NewClassSession {
            title: "Reformer".to_string(),
            instructor_id: "inst-4".to_string(),
            start_timestamp: (Utc::now() + Duration::days(1)).naive_utc(),
            duration_minutes: 50,
            capacity,
            location: "Studio D".to_string(),
            status: SessionStatus::Scheduled,
        })
        .unwrap()
        .session_id
}

#[test]
fn row_lock_serializes_concurrent_bookings() {
    let _guard = serial();
    let Some(gateway) = gateway() else { return };
    let session_id = session(&gateway, 4);
    let service = BookingService::new(gateway.clone());

    let workers = 12;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let (barrier, service) = (barrier.clone(), service.clone());
            thread::spawn(move || {
                barrier.wait();
                service.request_booking(&format!("member-{}", i), session_id).unwrap()
            })
        })
        .collect();
    let outcomes: Vec<BookingOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let confirmed = outcomes.iter().filter(|o| matches!(o, BookingOutcome::Confirmed { .. })).count();
    assert_eq!(confirmed, 4);

    let roster = gateway.list_session_bookings(session_id).unwrap();
    assert!(waitlist::is_dense(waitlist::positions(&roster)));
    assert_eq!(waitlist::positions(&roster).len(), 8);
    assert_eq!(gateway.find_session(session_id).unwrap().unwrap().status, SessionStatus::Full);
}

#[test]
fn unique_index_rejects_second_active_booking() {
    let _guard = serial();
    let Some(gateway) = gateway() else { return };
    let session_id = session(&gateway, 2);
    let service = BookingService::new(gateway.clone());

    let first = service.request_booking("alice", session_id).unwrap();
    assert!(matches!(
        service.request_booking("alice", session_id),
        Err(BookingError::AlreadyBooked { .. })
    ));

    service.cancel_booking(first.booking_id(), &Caller::member("alice")).unwrap();
    assert!(service.request_booking("alice", session_id).is_ok());
}

#[test]
fn cancellation_promotes_and_deletion_cascades() {
    let _guard = serial();
    let Some(gateway) = gateway() else { return };
    let session_id = session(&gateway, 1);
    let service = BookingService::new(gateway.clone());

    let first = service.request_booking("alice", session_id).unwrap();
    let second = service.request_booking("bob", session_id).unwrap();
    service.request_booking("carol", session_id).unwrap();

    let outcome = service.cancel_booking(first.booking_id(), &Caller::member("alice")).unwrap();
    let promoted = outcome.promoted.unwrap();
    assert_eq!(promoted.booking_id, second.booking_id());
    assert_eq!(promoted.status, BookingStatus::Confirmed);
    assert!(outcome.cancelled.cancelled_at.is_some());

    let carol = gateway.list_member_bookings("carol").unwrap();
    assert_eq!(carol[0].waitlist_position, Some(1));

    assert!(gateway.delete_session(session_id).unwrap());
    assert!(gateway.find_booking(second.booking_id()).unwrap().is_none());
}
