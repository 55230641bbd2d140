//! Low-level interaction capture
//!
//! Turns raw pointer, scroll, click, and key events into immutable samples on
//! the open page visit. Pointer and scroll are throttled (leading edge); clicks
//! and key presses are not.

use crate::config::{TrackerConfig, MAX_INTERVAL_MS};
use crate::ledger::PageLedger;
use crate::types::{ClickRecord, ElementInfo, KeyPress, PointerSample, ScrollSample};
use chrono::{DateTime, Duration, Utc};
use log::debug;

/// Resolves the tracking id of the element at a viewport point.
///
/// Supplied by the rendering layer; the conventional source is the nearest
/// ancestor carrying a `data-track-id` attribute.
pub trait ElementLookup {
    fn tracking_id_at(&self, x: f64, y: f64) -> Option<String>;
}

/// Leading-edge throttle: accept, then ignore until `interval` has elapsed.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_accepted: Option<DateTime<Utc>>,
}

impl Throttle {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::milliseconds(interval_ms.min(MAX_INTERVAL_MS) as i64),
            last_accepted: None,
        }
    }

    pub fn admit(&mut self, now: DateTime<Utc>) -> bool {
        match self.last_accepted {
            Some(last) if now - last < self.interval => false,
            _ => {
                self.last_accepted = Some(now);
                true
            }
        }
    }

    pub fn cancel(&mut self) {
        self.last_accepted = None;
    }
}

/// What happened to a captured event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Recorded,
    Throttled,
    /// Key press outside a text-capable element
    Ignored,
    /// No open record, or listeners detached
    Dropped,
}

pub struct EventCapture {
    pointer: Throttle,
    scroll: Throttle,
    lookup: Option<Box<dyn ElementLookup>>,
    attached: bool,
}

impl EventCapture {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            pointer: Throttle::new(config.pointer_sample_interval_ms),
            scroll: Throttle::new(config.scroll_sample_interval_ms),
            lookup: None,
            attached: false,
        }
    }

    pub fn set_lookup(&mut self, lookup: Box<dyn ElementLookup>) {
        self.lookup = Some(lookup);
    }

    pub fn attach(&mut self) {
        debug!("Attaching capture listeners");
        self.attached = true;
    }

    /// Stop capturing and drop pending throttle state.
    pub fn detach(&mut self) {
        debug!("Removing capture listeners");
        self.attached = false;
        self.pointer.cancel();
        self.scroll.cancel();
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn pointer_moved(
        &mut self,
        ledger: &mut PageLedger,
        x: f64,
        y: f64,
        now: DateTime<Utc>,
    ) -> CaptureOutcome {
        if !self.can_record(ledger) {
            return CaptureOutcome::Dropped;
        }
        if !self.pointer.admit(now) {
            return CaptureOutcome::Throttled;
        }
        let tracking_id = self.lookup.as_ref().and_then(|l| l.tracking_id_at(x, y));
        Self::outcome(ledger.push_pointer(PointerSample {
            x,
            y,
            time: now,
            tracking_id,
        }))
    }

    pub fn scrolled(
        &mut self,
        ledger: &mut PageLedger,
        x: f64,
        y: f64,
        now: DateTime<Utc>,
    ) -> CaptureOutcome {
        if !self.can_record(ledger) {
            return CaptureOutcome::Dropped;
        }
        if !self.scroll.admit(now) {
            return CaptureOutcome::Throttled;
        }
        Self::outcome(ledger.push_scroll(ScrollSample { x, y, time: now }))
    }

    pub fn clicked(
        &mut self,
        ledger: &mut PageLedger,
        x: f64,
        y: f64,
        target: &ElementInfo,
        now: DateTime<Utc>,
    ) -> CaptureOutcome {
        if !self.can_record(ledger) {
            return CaptureOutcome::Dropped;
        }
        let tracking_id = target
            .tracking_id
            .clone()
            .or_else(|| self.lookup.as_ref().and_then(|l| l.tracking_id_at(x, y)));
        debug!("Click on {} with track id {:?}", target.tag, tracking_id);
        Self::outcome(ledger.push_click(ClickRecord {
            x,
            y,
            element: target.tag.clone(),
            tracking_id,
            time: now,
        }))
    }

    pub fn key_pressed(
        &mut self,
        ledger: &mut PageLedger,
        key: &str,
        target: &ElementInfo,
        now: DateTime<Utc>,
    ) -> CaptureOutcome {
        if !self.can_record(ledger) {
            return CaptureOutcome::Dropped;
        }
        if !target.accepts_text() {
            return CaptureOutcome::Ignored;
        }
        Self::outcome(ledger.push_key(KeyPress {
            key: key.to_string(),
            input_id: target.input_id(),
            time: now,
        }))
    }

    fn can_record(&self, ledger: &PageLedger) -> bool {
        self.is_attached() && ledger.current().is_some()
    }

    fn outcome(pushed: bool) -> CaptureOutcome {
        if pushed {
            CaptureOutcome::Recorded
        } else {
            CaptureOutcome::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    struct FixedLookup;

    impl ElementLookup for FixedLookup {
        fn tracking_id_at(&self, x: f64, _y: f64) -> Option<String> {
            (x < 100.0).then(|| "flight-card-1".to_string())
        }
    }

    fn attached(config: &TrackerConfig) -> (EventCapture, PageLedger) {
        let mut capture = EventCapture::new(config);
        capture.attach();
        let mut ledger = PageLedger::new();
        ledger.transition("/results", t(0));
        (capture, ledger)
    }

    #[test]
    fn test_throttle_leading_edge() {
        let mut throttle = Throttle::new(100);
        assert!(throttle.admit(t(0)));
        assert!(!throttle.admit(t(50)));
        assert!(!throttle.admit(t(99)));
        assert!(throttle.admit(t(100)));
        assert!(!throttle.admit(t(150)));
    }

    #[test]
    fn test_oversized_interval_is_clamped() {
        let mut throttle = Throttle::new(u64::MAX);
        assert!(throttle.admit(t(0)));
        assert!(!throttle.admit(t(3_599_999)));
        assert!(throttle.admit(t(3_600_000)));
    }

    #[test]
    fn test_zero_interval_admits_everything() {
        let mut throttle = Throttle::new(0);
        assert!(throttle.admit(t(0)));
        assert!(throttle.admit(t(0)));
    }

    #[test]
    fn test_pointer_samples_throttled() {
        let (mut capture, mut ledger) = attached(&TrackerConfig::default());
        let outcomes: Vec<CaptureOutcome> = [0, 30, 60, 120, 130]
            .iter()
            .map(|&ms| capture.pointer_moved(&mut ledger, 10.0, 20.0, t(ms)))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                CaptureOutcome::Recorded,
                CaptureOutcome::Throttled,
                CaptureOutcome::Throttled,
                CaptureOutcome::Recorded,
                CaptureOutcome::Throttled,
            ]
        );
        assert_eq!(ledger.current().unwrap().pointer_samples.len(), 2);
    }

    #[test]
    fn test_clicks_not_throttled_and_resolve_tracking_id() {
        let (mut capture, mut ledger) = attached(&TrackerConfig::default());
        capture.set_lookup(Box::new(FixedLookup));

        let tagged = ElementInfo::new("BUTTON").with_tracking_id("search-submit");
        let plain = ElementInfo::new("SPAN");
        capture.clicked(&mut ledger, 500.0, 10.0, &tagged, t(0));
        capture.clicked(&mut ledger, 50.0, 10.0, &plain, t(1));
        capture.clicked(&mut ledger, 500.0, 10.0, &plain, t(2));

        let clicks = &ledger.current().unwrap().clicks;
        assert_eq!(clicks.len(), 3);
        assert_eq!(clicks[0].tracking_id.as_deref(), Some("search-submit"));
        assert_eq!(clicks[0].element, "BUTTON");
        assert_eq!(clicks[1].tracking_id.as_deref(), Some("flight-card-1"));
        assert_eq!(clicks[2].tracking_id, None);
    }

    #[test]
    fn test_key_press_only_in_text_inputs() {
        let (mut capture, mut ledger) = attached(&TrackerConfig::default());
        let input = ElementInfo::new("INPUT").with_id("departure");
        let button = ElementInfo::new("BUTTON").with_id("go");

        assert_eq!(
            capture.key_pressed(&mut ledger, "J", &input, t(0)),
            CaptureOutcome::Recorded
        );
        assert_eq!(
            capture.key_pressed(&mut ledger, "Enter", &button, t(1)),
            CaptureOutcome::Ignored
        );

        let keys = &ledger.current().unwrap().key_presses;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key, "J");
        assert_eq!(keys[0].input_id.as_deref(), Some("departure"));
    }

    #[test]
    fn test_detached_capture_drops_everything() {
        let (mut capture, mut ledger) = attached(&TrackerConfig::default());
        assert!(capture.is_attached());
        capture.detach();
        assert!(!capture.is_attached());
        let el = ElementInfo::new("INPUT");
        assert_eq!(capture.scrolled(&mut ledger, 0.0, 5.0, t(0)), CaptureOutcome::Dropped);
        assert_eq!(capture.key_pressed(&mut ledger, "a", &el, t(0)), CaptureOutcome::Dropped);
        assert_eq!(ledger.current().unwrap().sample_count(), 0);
    }

    #[test]
    fn test_no_open_record_drops() {
        let mut capture = EventCapture::new(&TrackerConfig::default());
        capture.attach();
        let mut ledger = PageLedger::new();
        assert_eq!(
            capture.pointer_moved(&mut ledger, 1.0, 1.0, t(0)),
            CaptureOutcome::Dropped
        );
    }
}
