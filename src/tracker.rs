//! Session lifecycle controller
//!
//! [`Tracker`] owns the single active session slot. Everything that touches the
//! ledger (navigation, capture, selections) goes through it, so no component
//! can hold a stale copy across a restart.
//!
//! States: `Idle -> Active -> Idle`. A new `start` after `stop` begins a fresh
//! session with a new id.

use crate::annotation::annotate_current;
use crate::capture::{CaptureOutcome, ElementLookup, EventCapture};
use crate::clock::{new_session_id, Clock, MonotonicClock, SystemClock};
use crate::config::TrackerConfig;
use crate::delivery::{DeliveryReport, Exporter};
use crate::error::TrackerError;
use crate::input::InputEvent;
use crate::ledger::PageLedger;
use crate::navigation::{NavigationDetector, PageKeyResolver, Transition};
use crate::types::{ElementInfo, PageVisit, SessionRecord};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { session_id: String },
    /// A session for the same run key was already running; nothing changed
    AlreadyActive,
}

/// Result of a successful `stop`
#[derive(Debug, Clone)]
pub struct StopReport {
    pub record: SessionRecord,
    pub delivery: DeliveryReport,
}

/// The live session occupying the active slot
struct ActiveSession {
    session_id: String,
    run_key: String,
    participant_id: Option<String>,
    sequence: u32,
    started_at: DateTime<Utc>,
    ledger: PageLedger,
}

impl ActiveSession {
    fn into_record(self, ended_at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id,
            run_key: self.run_key,
            participant_id: self.participant_id,
            sequence: self.sequence,
            started_at: self.started_at,
            ended_at: Some(ended_at),
            pages: self.ledger.into_pages(),
        }
    }

    fn snapshot(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            run_key: self.run_key.clone(),
            participant_id: self.participant_id.clone(),
            sequence: self.sequence,
            started_at: self.started_at,
            ended_at: None,
            pages: self.ledger.pages().to_vec(),
        }
    }
}

pub struct Tracker {
    config: TrackerConfig,
    clock: MonotonicClock,
    resolver: Box<dyn PageKeyResolver>,
    navigation: NavigationDetector,
    capture: EventCapture,
    exporter: Exporter,
    active: Option<ActiveSession>,
    runs_started: u32,
}

impl Tracker {
    /// Create an idle tracker using the system clock and an exporter with no
    /// destinations.
    pub fn new(config: TrackerConfig, resolver: impl PageKeyResolver + 'static) -> Self {
        Self {
            navigation: NavigationDetector::new(
                config.navigation_debounce_ms,
                config.excluded_pages.clone(),
            ),
            capture: EventCapture::new(&config),
            exporter: Exporter::from_config(&config),
            clock: MonotonicClock::new(Box::new(SystemClock)),
            resolver: Box::new(resolver),
            active: None,
            runs_started: 0,
            config,
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = MonotonicClock::new(Box::new(clock));
        self
    }

    pub fn with_exporter(mut self, exporter: Exporter) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_element_lookup(mut self, lookup: impl ElementLookup + 'static) -> Self {
        self.capture.set_lookup(Box::new(lookup));
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin tracking `run_key`.
    ///
    /// Repeating the active run key is a no-op. A different run key while a
    /// session is active is refused and leaves that session untouched.
    pub fn start(&mut self, run_key: &str) -> Result<StartOutcome, TrackerError> {
        if let Some(active) = &self.active {
            if active.run_key == run_key {
                info!("Session already started for run {}", run_key);
                return Ok(StartOutcome::AlreadyActive);
            }
            warn!(
                "Refusing to start run {} while run {} is active",
                run_key, active.run_key
            );
            return Err(TrackerError::RunKeyConflict {
                active: active.run_key.clone(),
                requested: run_key.to_string(),
            });
        }

        let now = self.clock.now();
        self.runs_started += 1;
        let mut session = ActiveSession {
            session_id: new_session_id(),
            run_key: run_key.to_string(),
            participant_id: self.config.participant_id.clone(),
            sequence: self.runs_started,
            started_at: now,
            ledger: PageLedger::new(),
        };

        let page_key = self.resolver.current_page_key();
        self.navigation
            .prime(page_key, &mut session.ledger, now, self.config.eager_open);
        self.capture.attach();

        let session_id = session.session_id.clone();
        self.active = Some(session);
        info!("Session {} started for run {}", session_id, run_key);
        Ok(StartOutcome::Started { session_id })
    }

    /// Seal the active session without exporting it.
    ///
    /// Closes the open page visit, stamps the end time, detaches listeners and
    /// returns the tracker to idle.
    pub fn seal(&mut self) -> Result<SessionRecord, TrackerError> {
        let mut session = match self.active.take() {
            Some(session) => session,
            None => {
                error!("No tracking session in progress");
                return Err(TrackerError::NotTracking);
            }
        };

        let now = self.clock.now();
        session.ledger.close_current(now);
        self.capture.detach();
        self.navigation.reset();

        let record = session.into_record(now);
        info!(
            "Session {} sealed with {} page visits",
            record.session_id,
            record.pages.len()
        );
        Ok(record)
    }

    /// Seal the active session and hand it to the exporter.
    ///
    /// Delivery problems never fail this call; they are reported in
    /// [`StopReport::delivery`] alongside the sealed record.
    pub async fn stop(&mut self) -> Result<StopReport, TrackerError> {
        let record = self.seal()?;
        let at = record.ended_at.unwrap_or(record.started_at);
        let delivery = self.exporter.export(&record, at).await;
        Ok(StopReport { record, delivery })
    }

    // ------------------------------------------------------------------
    // Selections
    // ------------------------------------------------------------------

    /// Attach a domain decision to the open page visit (last write wins).
    /// Returns the page that received it; `None` when nothing is open.
    pub fn add_selection(&mut self, payload: Value) -> Option<String> {
        let now = self.clock.now();
        self.flush_navigation(now);
        let session = self.active.as_mut()?;
        annotate_current(&mut session.ledger, payload, now)
    }

    // ------------------------------------------------------------------
    // Navigation signals
    // ------------------------------------------------------------------

    pub fn history_popped(&mut self) -> Option<Transition> {
        let now = self.clock.now();
        let session = self.active.as_mut()?;
        self.navigation
            .history_popped(self.resolver.as_ref(), &mut session.ledger, now)
    }

    pub fn dom_mutated(&mut self) -> Option<Transition> {
        let now = self.clock.now();
        let session = self.active.as_mut()?;
        self.navigation
            .dom_mutated(self.resolver.as_ref(), &mut session.ledger, now)
    }

    /// Run navigation checks whose debounce window has elapsed.
    pub fn tick(&mut self) -> Option<Transition> {
        let now = self.clock.now();
        self.flush_navigation(now)
    }

    fn flush_navigation(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        let session = self.active.as_mut()?;
        self.navigation
            .poll(self.resolver.as_ref(), &mut session.ledger, now)
    }

    // ------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------

    pub fn pointer_moved(&mut self, x: f64, y: f64) -> CaptureOutcome {
        let now = self.clock.now();
        self.flush_navigation(now);
        match self.active.as_mut() {
            Some(session) => self.capture.pointer_moved(&mut session.ledger, x, y, now),
            None => CaptureOutcome::Dropped,
        }
    }

    pub fn scrolled(&mut self, x: f64, y: f64) -> CaptureOutcome {
        let now = self.clock.now();
        self.flush_navigation(now);
        match self.active.as_mut() {
            Some(session) => self.capture.scrolled(&mut session.ledger, x, y, now),
            None => CaptureOutcome::Dropped,
        }
    }

    pub fn clicked(&mut self, x: f64, y: f64, target: &ElementInfo) -> CaptureOutcome {
        let now = self.clock.now();
        self.flush_navigation(now);
        match self.active.as_mut() {
            Some(session) => self
                .capture
                .clicked(&mut session.ledger, x, y, target, now),
            None => CaptureOutcome::Dropped,
        }
    }

    pub fn key_pressed(&mut self, key: &str, target: &ElementInfo) -> CaptureOutcome {
        let now = self.clock.now();
        self.flush_navigation(now);
        match self.active.as_mut() {
            Some(session) => self
                .capture
                .key_pressed(&mut session.ledger, key, target, now),
            None => CaptureOutcome::Dropped,
        }
    }

    /// Dispatch a serialized input event to the matching handler.
    pub fn handle(&mut self, event: &InputEvent) -> Option<CaptureOutcome> {
        match event {
            InputEvent::PointerMove { x, y } => Some(self.pointer_moved(*x, *y)),
            InputEvent::Scroll { x, y } => Some(self.scrolled(*x, *y)),
            InputEvent::Click { x, y, target } => Some(self.clicked(*x, *y, target)),
            InputEvent::KeyDown { key, target } => Some(self.key_pressed(key, target)),
            InputEvent::HistoryPop => {
                self.history_popped();
                None
            }
            InputEvent::DomMutation => {
                self.dom_mutated();
                None
            }
            InputEvent::Tick => {
                self.tick();
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn is_tracking(&self) -> bool {
        self.active.is_some()
    }

    pub fn run_key(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.run_key.as_str())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.session_id.as_str())
    }

    /// Page visits of the active session; empty when idle
    pub fn pages(&self) -> &[PageVisit] {
        self.active
            .as_ref()
            .map(|s| s.ledger.pages())
            .unwrap_or(&[])
    }

    pub fn current_page(&self) -> Option<&PageVisit> {
        self.active.as_ref().and_then(|s| s.ledger.current())
    }

    /// Copy of the active session as it stands now
    pub fn snapshot(&self) -> Option<SessionRecord> {
        self.active.as_ref().map(ActiveSession::snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::navigation::LocationHandle;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn tracker(path: &str) -> (Tracker, LocationHandle, ManualClock) {
        let location = LocationHandle::new(path);
        let clock = ManualClock::new(t0());
        let tracker = Tracker::new(TrackerConfig::immediate(), location.clone())
            .with_clock(clock.clone());
        (tracker, location, clock)
    }

    #[test]
    fn test_start_opens_record_for_tracked_page() {
        let (mut tracker, _, _) = tracker("/search");
        let outcome = tracker.start("1").unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert_eq!(tracker.pages().len(), 1);
        assert_eq!(tracker.current_page().unwrap().page_key, "/search");
    }

    #[test]
    fn test_start_on_entry_page_defers_record() {
        let (mut tracker, location, clock) = tracker("/welcome");
        tracker.start("1").unwrap();
        assert!(tracker.pages().is_empty());

        clock.advance_ms(10);
        location.set("/search");
        tracker.dom_mutated();
        assert_eq!(tracker.pages().len(), 1);
    }

    #[test]
    fn test_duplicate_start_is_idempotent() {
        let (mut tracker, _, clock) = tracker("/search");
        tracker.start("A").unwrap();
        let id = tracker.session_id().unwrap().to_string();
        clock.advance_ms(5);
        tracker.clicked(1.0, 1.0, &ElementInfo::new("BUTTON"));

        assert_eq!(tracker.start("A").unwrap(), StartOutcome::AlreadyActive);
        assert_eq!(tracker.session_id(), Some(id.as_str()));
        assert_eq!(tracker.run_key(), Some("A"));
        assert_eq!(tracker.current_page().unwrap().clicks.len(), 1);
    }

    #[test]
    fn test_conflicting_start_keeps_session() {
        let (mut tracker, _, _) = tracker("/search");
        tracker.start("A").unwrap();
        let err = tracker.start("B").unwrap_err();
        assert!(matches!(err, TrackerError::RunKeyConflict { .. }));
        assert_eq!(tracker.run_key(), Some("A"));
    }

    #[test]
    fn test_seal_without_start() {
        let (mut tracker, _, _) = tracker("/search");
        assert!(matches!(tracker.seal(), Err(TrackerError::NotTracking)));
    }

    #[test]
    fn test_inactive_tracker_ignores_everything() {
        let (mut tracker, location, _) = tracker("/search");
        location.set("/results");
        assert!(tracker.history_popped().is_none());
        assert_eq!(tracker.scrolled(0.0, 1.0), CaptureOutcome::Dropped);
        assert_eq!(tracker.add_selection(json!({"a": 1})), None);
        assert!(tracker.snapshot().is_none());
    }

    #[test]
    fn test_seal_closes_last_record_and_detaches() {
        let (mut tracker, location, clock) = tracker("/search");
        tracker.start("1").unwrap();
        clock.advance_ms(100);
        location.set("/results");
        tracker.history_popped();
        clock.advance_ms(100);

        let record = tracker.seal().unwrap();
        assert!(record.is_sealed());
        assert_eq!(record.pages.last().unwrap().closed_at, record.ended_at);
        assert!(!tracker.is_tracking());
        assert_eq!(tracker.pointer_moved(1.0, 1.0), CaptureOutcome::Dropped);
    }

    #[test]
    fn test_restart_gets_fresh_session() {
        let (mut tracker, _, _) = tracker("/search");
        tracker.start("1").unwrap();
        let first = tracker.seal().unwrap();
        tracker.start("1").unwrap();
        let second = tracker.seal().unwrap();

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[test]
    fn test_debounced_navigation_flushes_before_capture() {
        let location = LocationHandle::new("/search");
        let clock = ManualClock::new(t0());
        let config = TrackerConfig::immediate().with_navigation_debounce_ms(50);
        let mut tracker = Tracker::new(config, location.clone()).with_clock(clock.clone());
        tracker.start("1").unwrap();

        location.set("/results");
        clock.advance_ms(10);
        assert!(tracker.dom_mutated().is_none());

        clock.advance_ms(20);
        tracker.clicked(1.0, 1.0, &ElementInfo::new("DIV"));
        assert_eq!(tracker.pages()[0].clicks.len(), 1);

        clock.advance_ms(30);
        tracker.clicked(2.0, 2.0, &ElementInfo::new("DIV"));
        assert_eq!(tracker.pages().len(), 2);
        assert_eq!(tracker.pages()[1].clicks.len(), 1);
    }
}
