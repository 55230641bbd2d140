//! Core data types for the session record
//!
//! These types flow through the engine:
//! Tracker → PageLedger → PageVisit → samples / annotation → ExportDocument

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A throttled pointer position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerSample {
    pub x: f64,
    pub y: f64,
    pub time: DateTime<Utc>,
    /// Tracking id of the element under the pointer, when resolvable
    pub tracking_id: Option<String>,
}

/// A throttled scroll offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollSample {
    pub x: f64,
    pub y: f64,
    pub time: DateTime<Utc>,
}

/// A click, never throttled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickRecord {
    pub x: f64,
    pub y: f64,
    /// Tag name of the event target (e.g. "BUTTON")
    pub element: String,
    /// Nearest ancestor tracking id; `None` when nothing is tagged
    pub tracking_id: Option<String>,
    pub time: DateTime<Utc>,
}

/// A key press inside a text-capable element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPress {
    pub key: String,
    /// Element id, name, or nearest tracking id of the input
    pub input_id: Option<String>,
    pub time: DateTime<Utc>,
}

/// Host-supplied domain decision attached to a page visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub recorded_at: DateTime<Utc>,
    pub payload: Value,
}

/// One contiguous period spent on one logical page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageVisit {
    pub page_key: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub pointer_samples: Vec<PointerSample>,
    pub scroll_samples: Vec<ScrollSample>,
    pub clicks: Vec<ClickRecord>,
    pub key_presses: Vec<KeyPress>,
    pub annotation: Option<Annotation>,
}

impl PageVisit {
    pub fn open(page_key: impl Into<String>, opened_at: DateTime<Utc>) -> Self {
        Self {
            page_key: page_key.into(),
            opened_at,
            closed_at: None,
            pointer_samples: Vec::new(),
            scroll_samples: Vec::new(),
            clicks: Vec::new(),
            key_presses: Vec::new(),
            annotation: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Milliseconds spent on the page, once closed
    pub fn duration_ms(&self) -> Option<i64> {
        self.closed_at
            .map(|closed| (closed - self.opened_at).num_milliseconds())
    }

    pub fn sample_count(&self) -> usize {
        self.pointer_samples.len()
            + self.scroll_samples.len()
            + self.clicks.len()
            + self.key_presses.len()
    }
}

/// The root record for one tracked run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub run_key: String,
    pub participant_id: Option<String>,
    /// Ordinal of this run within the tracker, starting at 1
    pub sequence: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pages: Vec<PageVisit>,
}

impl SessionRecord {
    pub fn open_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_open()).count()
    }

    pub fn is_sealed(&self) -> bool {
        self.ended_at.is_some() && self.open_count() == 0
    }
}

/// What the rendering layer knows about an event target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    /// Upper-case tag name, as the DOM reports it
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content_editable: bool,
    /// Tracking id of the nearest tagged ancestor (including the element itself)
    #[serde(default)]
    pub tracking_id: Option<String>,
}

impl ElementInfo {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_tracking_id(mut self, tracking_id: impl Into<String>) -> Self {
        self.tracking_id = Some(tracking_id.into());
        self
    }

    pub fn editable(mut self) -> Self {
        self.content_editable = true;
        self
    }

    /// Inputs, text areas, and content-editable regions accept typing
    pub fn accepts_text(&self) -> bool {
        self.tag.eq_ignore_ascii_case("input")
            || self.tag.eq_ignore_ascii_case("textarea")
            || self.content_editable
    }

    /// Identifier recorded with key presses: id, then name, then tracking id
    pub fn input_id(&self) -> Option<String> {
        non_empty(&self.id)
            .or_else(|| non_empty(&self.name))
            .or_else(|| non_empty(&self.tracking_id))
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}
