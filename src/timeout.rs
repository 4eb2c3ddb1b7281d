// src/timeout.rs

//! Timeout normalisation.
//!
//! Callers always pass `Option<Duration>`: `None` blocks indefinitely and
//! `Some(Duration::ZERO)` is a non-blocking poll. The backends want different
//! shapes (signed milliseconds for epoll, an optional `timespec` for kqueue),
//! and the legacy bindings accepted a few more; the conversions live here so
//! both backends agree on the edge cases.

use crate::error::{Error, Result};
use std::time::Duration;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Signed milliseconds, negative meaning "forever" (the epoll convention).
pub fn from_millis(ms: i64) -> Option<Duration> {
    if ms < 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

/// A `(seconds, nanoseconds)` pair as accepted by the kqueue bindings.
pub fn from_sec_nsec(sec: i64, nsec: i64) -> Result<Option<Duration>> {
    if sec < 0 {
        return Err(Error::InvalidTimeout(format!(
            "seconds must not be negative (got {})",
            sec
        )));
    }
    if !(0..NANOS_PER_SEC).contains(&nsec) {
        return Err(Error::InvalidTimeout(format!(
            "nanoseconds must be in 0..{} (got {})",
            NANOS_PER_SEC, nsec
        )));
    }
    Ok(Some(Duration::new(sec as u64, nsec as u32)))
}

/// Plain integer nanoseconds, the other form the kqueue bindings accepted.
pub fn from_nanos(ns: i64) -> Result<Option<Duration>> {
    if ns < 0 {
        return Err(Error::InvalidTimeout(format!(
            "nanoseconds must not be negative (got {})",
            ns
        )));
    }
    Ok(Some(Duration::from_nanos(ns as u64)))
}

/// Converts to the `timeout` argument of `epoll_wait`.
///
/// Sub-millisecond remainders round up so a short non-zero timeout does not
/// turn into a busy poll.
pub fn to_epoll_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % NANOS_PER_MILLI as u32 != 0 {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

/// Converts to the `timeout` argument of `kevent`; `None` becomes a NULL
/// pointer at the call site.
pub fn to_timespec(timeout: Option<Duration>) -> Option<libc::timespec> {
    timeout.map(|d| {
        let secs = d.as_secs().min(libc::time_t::MAX as u64);
        libc::timespec {
            tv_sec: secs as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        }
    })
}

/// The legacy kqueue integer-millisecond timeout.
///
/// The remainder is scaled by 1_000_000 to get nanoseconds. An older binding
/// scaled it by 100_000, which made every sub-second part ten times too short.
pub fn legacy_millis_to_timespec(ms: i64) -> Result<libc::timespec> {
    if ms < 0 {
        return Err(Error::InvalidTimeout(format!(
            "milliseconds must not be negative (got {})",
            ms
        )));
    }
    Ok(libc::timespec {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_nsec: ((ms % 1000) * NANOS_PER_MILLI) as _,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn negative_millis_block_forever() {
        assert_eq!(from_millis(-1), None);
        assert_eq!(from_millis(-250), None);
        assert_eq!(from_millis(0), Some(Duration::ZERO));
        assert_eq!(from_millis(1500), Some(Duration::from_millis(1500)));
    }

    #[test_log::test]
    fn sec_nsec_pair_is_validated() {
        assert_eq!(
            from_sec_nsec(2, 5).unwrap(),
            Some(Duration::new(2, 5))
        );
        assert!(matches!(
            from_sec_nsec(-1, 0),
            Err(Error::InvalidTimeout(_))
        ));
        assert!(matches!(
            from_sec_nsec(0, NANOS_PER_SEC),
            Err(Error::InvalidTimeout(_))
        ));
        assert!(matches!(
            from_sec_nsec(0, -3),
            Err(Error::InvalidTimeout(_))
        ));
    }

    #[test_log::test]
    fn nanos_form() {
        assert_eq!(
            from_nanos(1_500_000_000).unwrap(),
            Some(Duration::new(1, 500_000_000))
        );
        assert!(from_nanos(-1).is_err());
    }

    #[test_log::test]
    fn epoll_millis_conversion() {
        assert_eq!(to_epoll_millis(None), -1);
        assert_eq!(to_epoll_millis(Some(Duration::ZERO)), 0);
        assert_eq!(to_epoll_millis(Some(Duration::from_millis(250))), 250);
        // 1µs must still block for something.
        assert_eq!(to_epoll_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(to_epoll_millis(Some(Duration::from_micros(2500))), 3);
        assert_eq!(
            to_epoll_millis(Some(Duration::from_secs(u64::MAX / 2))),
            libc::c_int::MAX
        );
    }

    #[test_log::test]
    fn timespec_conversion() {
        assert!(to_timespec(None).is_none());
        let ts = to_timespec(Some(Duration::new(3, 42))).unwrap();
        assert_eq!(ts.tv_sec, 3);
        assert_eq!(ts.tv_nsec as i64, 42);
    }

    #[test_log::test]
    fn legacy_millis_use_corrected_factor() {
        let ts = legacy_millis_to_timespec(1500).unwrap();
        assert_eq!(ts.tv_sec, 1);
        assert_eq!(ts.tv_nsec as i64, 500_000_000);

        let ts = legacy_millis_to_timespec(999).unwrap();
        assert_eq!(ts.tv_sec, 0);
        assert_eq!(ts.tv_nsec as i64, 999_000_000);

        assert!(legacy_millis_to_timespec(-5).is_err());
    }
}
