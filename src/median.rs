//! Median over fixed-point prices

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MedianError {
    #[error("cannot compute the median of an empty list")]
    Empty,
}

/// Median of `values`. Even-length input averages the two middle values,
/// rounding down. The input order does not matter.
pub fn median(values: &[u64]) -> Result<u64, MedianError> {
    if values.is_empty() {
        return Err(MedianError::Empty);
    }

    let mut sorted = values.to_vec();
    sorted.sort_unstable();

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        return Ok(sorted[mid]);
    }

    // u128 so the sum of two u64 cannot overflow
    let sum = u128::from(sorted[mid - 1]) + u128::from(sorted[mid]);
    Ok((sum / 2) as u64)
}

/// A price stamped at `ts` counts towards a median read at `read_time` when it
/// falls in `[read_time - max_age, read_time]`. An age reaching past the
/// earliest representable time leaves the window open at the start.
pub fn within_window(ts: DateTime<Utc>, read_time: DateTime<Utc>, max_age: Duration) -> bool {
    ts <= read_time
        && read_time
            .checked_sub_signed(max_age)
            .map_or(true, |start| ts >= start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_is_closed_on_both_ends() {
        let read = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let age = Duration::seconds(30);
        assert!(within_window(read, read, age));
        assert!(within_window(read - age, read, age));
        assert!(!within_window(read - age - Duration::milliseconds(1), read, age));
        assert!(!within_window(read + Duration::seconds(1), read, age));
    }

    #[test]
    fn huge_max_age_keeps_window_open() {
        let read = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let age = crate::time::to_chrono(std::time::Duration::from_secs(u64::MAX));
        assert!(within_window(read - Duration::days(365), read, age));
        assert!(within_window(read, read, age));
        assert!(!within_window(read + Duration::seconds(1), read, age));
    }

    #[test]
    fn empty_is_an_error() {
        assert_eq!(median(&[]), Err(MedianError::Empty));
    }

    #[test]
    fn odd_length_takes_middle() {
        assert_eq!(median(&[3003, 1001, 2002]), Ok(2002));
        assert_eq!(median(&[7]), Ok(7));
    }

    #[test]
    fn even_length_averages_middle_pair() {
        assert_eq!(median(&[50_400, 50_000]), Ok(50_200));
        assert_eq!(median(&[1, 2, 3, 4]), Ok(2));
        assert_eq!(median(&[2002, 3003]), Ok(2502));
    }

    #[test]
    fn even_length_near_u64_max_does_not_overflow() {
        assert_eq!(median(&[u64::MAX, u64::MAX - 2]), Ok(u64::MAX - 1));
    }

    #[test]
    fn repeated_calls_are_deterministic() {
        let values = [10, 40, 20, 30];
        let first = median(&values);
        for _ in 0..10 {
            assert_eq!(median(&values), first);
        }
    }
}
