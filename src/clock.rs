//! Timestamps and session identity
//!
//! All engine timestamps flow through a [`Clock`]. The tracker wraps whatever
//! clock it is given in a [`MonotonicClock`] so that timestamps handed out
//! within one tracker never go backwards, even if the wall clock does.
//! Readings are truncated to milliseconds, the precision of the export format.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Source of wall-clock time.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A hand-driven clock for replays and tests.
///
/// Clones share the same underlying instant, so a test can keep one handle
/// and advance it after giving another to the tracker.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Move the clock forward by `ms` milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to an absolute instant (may move backwards).
    pub fn set(&self, instant: DateTime<Utc>) {
        self.millis.store(instant.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }
}

/// Clamps an inner clock so readings are non-decreasing.
pub struct MonotonicClock {
    inner: Box<dyn Clock>,
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn new(inner: Box<dyn Clock>) -> Self {
        Self { inner, last: None }
    }

    pub fn now(&mut self) -> DateTime<Utc> {
        let reading = truncate_to_millis(self.inner.now());
        let stamped = match self.last {
            Some(last) if reading < last => last,
            _ => reading,
        };
        self.last = Some(stamped);
        stamped
    }
}

fn truncate_to_millis(instant: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(instant.timestamp_millis())
        .single()
        .unwrap_or(instant)
}

/// Generate a session-unique identifier
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(t0());
        let handle = clock.clone();
        handle.advance_ms(250);
        assert_eq!((clock.now() - t0()).num_milliseconds(), 250);
    }

    #[test]
    fn test_monotonic_clock_never_goes_backwards() {
        let manual = ManualClock::new(t0());
        let mut clock = MonotonicClock::new(Box::new(manual.clone()));

        let first = clock.now();
        manual.set(t0() - chrono::Duration::seconds(5));
        let second = clock.now();
        assert_eq!(first, second);

        manual.advance_ms(10_000);
        assert!(clock.now() > second);
    }

    #[test]
    fn test_monotonic_clock_truncates_to_millis() {
        struct Fine;
        impl Clock for Fine {
            fn now(&self) -> DateTime<Utc> {
                Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
                    + chrono::Duration::nanoseconds(1_234_567)
            }
        }
        let mut clock = MonotonicClock::new(Box::new(Fine));
        assert_eq!(clock.now().timestamp_subsec_nanos(), 1_000_000);
    }

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }
}
