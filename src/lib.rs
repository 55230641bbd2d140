//! Booking Telemetry - behavioral session engine for multi-page booking flows
//!
//! The engine silently records how a participant moves through an ordered
//! sequence of views: which logical page was open and when, pointer and scroll
//! samples, clicks, key presses, and the domain decisions the host attaches.
//! At the end of a run the record is exported as a single JSON document.
//!
//! ## Modules
//!
//! - **Tracker**: session lifecycle (`start` → active → `stop`)
//! - **Navigation**: page transition detection without full reloads
//! - **Capture**: throttled low-level interaction capture
//! - **Export / Delivery**: transfer document and best-effort upload with a
//!   local fallback

pub mod annotation;
pub mod capture;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod error;
pub mod export;
pub mod input;
pub mod ledger;
pub mod navigation;
pub mod tracker;
pub mod types;

pub use capture::{CaptureOutcome, ElementLookup};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TrackerConfig;
pub use delivery::{DeliveryReport, DirectorySave, Exporter, LocalSave, RemoteOutcome, TransportSink};
pub use error::{ExportError, TrackerError};
pub use export::{validate_record, ExportDocument, LedgerViolation, DOCUMENT_VERSION};
pub use input::InputEvent;
pub use navigation::{LocationHandle, PageKeyResolver, Transition};
pub use tracker::{StartOutcome, StopReport, Tracker};
pub use types::{ElementInfo, PageVisit, SessionRecord};

#[cfg(feature = "http")]
pub use delivery::HttpSink;

/// Crate version embedded in every exported document
pub const TELEMETRY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for exported documents
pub const PRODUCER_NAME: &str = "booking-telemetry";
