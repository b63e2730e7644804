use std::sync::{Arc, Barrier};
use std::thread;

use chrono::{Duration, Utc};

use studio_booking::{
    catalog::ClassCatalog,
    errors::BookingError,
    gateway::{MemoryGateway, PersistenceGateway},
    identity::Caller,
    models::{BookingOutcome, BookingStatus, NewClassSession, SessionStatus},
    service::BookingService,
    waitlist,
};

fn session(gateway: &MemoryGateway, capacity: i32) -> i32 {
    gateway
        .insert_session(NewClassSession {
            title: "Spin".to_string(),
            instructor_id: "inst-1".to_string(),
            start_timestamp: (Utc::now() + Duration::days(1)).naive_utc(),
            duration_minutes: 45,
            capacity,
            location: "Cycle Room".to_string(),
            status: SessionStatus::Scheduled,
        })
        .unwrap()
        .session_id
}

/// Releases every worker at once and collects their results.
fn race<T, F>(workers: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(workers));
    let f = Arc::new(f);
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let barrier = barrier.clone();
            let f = f.clone();
            thread::spawn(move || {
                barrier.wait();
                f(i)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn assert_consistent(gateway: &MemoryGateway, session_id: i32) {
    let bookings = gateway.list_session_bookings(session_id).unwrap();
    let session = gateway.find_session(session_id).unwrap().unwrap();
    let confirmed = bookings.iter().filter(|b| b.status == BookingStatus::Confirmed).count();
    assert!(confirmed <= session.capacity as usize);

    let waitlisted: Vec<_> = bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Waitlisted)
        .cloned()
        .collect();
    assert!(waitlist::is_dense(waitlist::positions(&waitlisted)));
    if !waitlisted.is_empty() {
        assert_eq!(confirmed, session.capacity as usize, "waitlist exists while slots are free");
    }
}

#[test]
fn concurrent_requests_never_overbook() {
    let gateway = Arc::new(MemoryGateway::new());
    let session_id = session(&gateway, 5);
    let service = BookingService::new(gateway.clone());

    let outcomes = race(40, move |i| service.request_booking(&format!("member-{}", i), session_id).unwrap());

    let confirmed = outcomes.iter().filter(|o| matches!(o, BookingOutcome::Confirmed { .. })).count();
    let mut positions: Vec<i32> = outcomes
        .iter()
        .filter_map(|o| match o {
            BookingOutcome::Waitlisted { position, .. } => Some(*position),
            _ => None,
        })
        .collect();
    positions.sort_unstable();

    assert_eq!(confirmed, 5);
    assert_eq!(positions, (1..=35).collect::<Vec<_>>());
    assert_consistent(&gateway, session_id);
}

#[test]
fn last_slot_goes_to_exactly_one_of_two() {
    let gateway = Arc::new(MemoryGateway::new());
    let session_id = session(&gateway, 1);
    let service = BookingService::new(gateway.clone());

    let outcomes = race(2, move |i| service.request_booking(&format!("member-{}", i), session_id).unwrap());

    let confirmed = outcomes.iter().filter(|o| matches!(o, BookingOutcome::Confirmed { .. })).count();
    assert_eq!(confirmed, 1);
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, BookingOutcome::Waitlisted { position: 1, .. })));
}

#[test]
fn concurrent_retries_of_one_member_book_once() {
    let gateway = Arc::new(MemoryGateway::new());
    let session_id = session(&gateway, 3);
    let service = BookingService::new(gateway.clone());

    let results = race(8, move |_| service.request_booking("same-member", session_id));

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, BookingError::AlreadyBooked { .. })));
    assert_eq!(gateway.list_member_bookings("same-member").unwrap().len(), 1);
}

#[test]
fn mixed_cancellations_and_requests_keep_the_waitlist_dense() {
    let gateway = Arc::new(MemoryGateway::new());
    let session_id = session(&gateway, 3);
    let service = BookingService::new(gateway.clone());

    let initial: Vec<BookingOutcome> = (0..10)
        .map(|i| service.request_booking(&format!("early-{}", i), session_id).unwrap())
        .collect();

    let worker_service = service.clone();
    race(16, move |i| {
        if i < 8 {
            let booking_id = initial[i].booking_id();
            worker_service
                .cancel_booking(booking_id, &Caller::member(format!("early-{}", i)))
                .map(|_| ())
        } else {
            worker_service.request_booking(&format!("late-{}", i), session_id).map(|_| ())
        }
    })
    .into_iter()
    .for_each(|r| r.unwrap());

    assert_consistent(&gateway, session_id);
    let availability = ClassCatalog::new(gateway.clone()).availability(session_id).unwrap();
    assert_eq!(availability.confirmed_count, 3);
    assert_eq!(availability.waitlist_length, 10 - 8 + 8 - 3);
    // A promoting cancellation leaves the session active until the next request.
    assert!(matches!(availability.status, SessionStatus::Full | SessionStatus::Active));
}

#[test]
fn interleaved_requests_fill_each_session_independently() {
    let gateway = Arc::new(MemoryGateway::new());
    let first = session(&gateway, 2);
    let second = session(&gateway, 2);
    let service = BookingService::new(gateway.clone());

    race(8, move |i| {
        let target = if i % 2 == 0 { first } else { second };
        service.request_booking(&format!("member-{}", i), target).unwrap()
    });

    for session_id in [first, second] {
        let availability = ClassCatalog::new(gateway.clone()).availability(session_id).unwrap();
        assert_eq!(availability.confirmed_count, 2);
        assert_eq!(availability.waitlist_length, 2);
        assert_consistent(&gateway, session_id);
    }
}
