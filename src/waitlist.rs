//! Dense waitlist ordering.
//!
//! A session's waitlisted bookings always carry positions `1..=k` with no gaps or
//! duplicates. Appending takes `k + 1`; removing position `p` moves every entry behind
//! `p` up by one.

use crate::models::{Booking, BookingStatus};

/// Position for an entry appended to a waitlist currently holding `len` entries.
pub fn next_position(len: usize) -> i32 {
    i32::try_from(len).map_or(i32::MAX, |l| l.saturating_add(1))
}

/// Where an entry at `position` lands once the entry at `removed` leaves the waitlist.
pub fn shifted(position: i32, removed: i32) -> i32 {
    if position > removed {
        position - 1
    } else {
        position
    }
}

/// The entry to promote next: the waitlisted booking with the lowest position.
pub fn head(entries: &[Booking]) -> Option<&Booking> {
    entries
        .iter()
        .filter(|b| b.status == BookingStatus::Waitlisted)
        .min_by_key(|b| b.waitlist_position.unwrap_or(i32::MAX))
}

/// Whether `positions` is exactly `{1, ..., k}` for `k` = number of positions.
pub fn is_dense<I>(positions: I) -> bool
where
    I: IntoIterator<Item = i32>,
{
    let mut positions: Vec<i32> = positions.into_iter().collect();
    positions.sort_unstable();
    positions.iter().zip(1..).all(|(p, expected)| *p == expected)
}

/// Positions of the waitlisted entries among `bookings`.
pub fn positions(bookings: &[Booking]) -> Vec<i32> {
    bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Waitlisted)
        .filter_map(|b| b.waitlist_position)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn waitlisted(booking_id: i32, position: i32) -> Booking {
        let t = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap().and_hms_opt(10, 0, 0).unwrap();
        Booking {
            booking_id,
            session_id: 1,
            member_id: format!("m{}", booking_id),
            requested_at: t,
            status: BookingStatus::Waitlisted,
            waitlist_position: Some(position),
            created_at: t,
            cancelled_at: None,
        }
    }

    #[test]
    fn appends_after_the_last_entry() {
        assert_eq!(next_position(0), 1);
        assert_eq!(next_position(3), 4);
    }

    #[test]
    fn removal_moves_later_entries_up() {
        let after: Vec<i32> = [1, 2, 3, 4].iter().filter(|p| **p != 2).map(|p| shifted(*p, 2)).collect();
        assert_eq!(after, vec![1, 2, 3]);
        assert!(is_dense(after));
    }

    #[test]
    fn head_is_lowest_position() {
        let entries = vec![waitlisted(10, 3), waitlisted(11, 1), waitlisted(12, 2)];
        assert_eq!(head(&entries).map(|b| b.booking_id), Some(11));
        assert!(head(&[]).is_none());
    }

    #[test]
    fn head_ignores_non_waitlisted_entries() {
        let mut confirmed = waitlisted(1, 1);
        confirmed.status = BookingStatus::Confirmed;
        confirmed.waitlist_position = None;
        let entries = vec![confirmed, waitlisted(2, 1)];
        assert_eq!(head(&entries).map(|b| b.booking_id), Some(2));
    }

    #[test]
    fn density_rejects_gaps_and_duplicates() {
        assert!(is_dense(Vec::new()));
        assert!(is_dense(vec![2, 1, 3]));
        assert!(!is_dense(vec![1, 3]));
        assert!(!is_dense(vec![1, 1, 2]));
        assert!(!is_dense(vec![0, 1]));
    }
}
