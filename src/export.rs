//! Transfer document encoding
//!
//! Converts a [`SessionRecord`] into the canonical export document and back.
//! Every timestamp is rendered as RFC 3339 UTC with millisecond precision, so
//! documents sort lexically and survive a persist/reload cycle unchanged.

use crate::error::TrackerError;
use crate::types::{
    Annotation, ClickRecord, KeyPress, PageVisit, PointerSample, ScrollSample, SessionRecord,
};
use crate::{PRODUCER_NAME, TELEMETRY_VERSION};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Current export document version
pub const DOCUMENT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentProducer {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub document_version: String,
    pub producer: DocumentProducer,
    pub session_id: String,
    pub run_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    /// Ordinal of this run within the tracker that produced it
    pub sample_counter: u32,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub pages: Vec<PageDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDocument {
    pub page_key: String,
    pub opened_at: String,
    pub closed_at: Option<String>,
    /// Time spent on the page; absent while the visit is open
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub pointer_samples: Vec<PointerDocument>,
    pub scroll_samples: Vec<ScrollDocument>,
    pub clicks: Vec<ClickDocument>,
    pub key_presses: Vec<KeyPressDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<AnnotationDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerDocument {
    pub x: f64,
    pub y: f64,
    pub time: String,
    #[serde(default)]
    pub track_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollDocument {
    pub x: f64,
    pub y: f64,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickDocument {
    pub x: f64,
    pub y: f64,
    pub element: String,
    pub track_id: Option<String>,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPressDocument {
    pub key: String,
    pub input_id: Option<String>,
    pub time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationDocument {
    pub recorded_at: String,
    pub payload: Value,
}

/// Render a timestamp in the document format
pub fn format_timestamp(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a document timestamp, naming the field on failure
pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, TrackerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TrackerError::InvalidTimestamp {
            field: field.to_string(),
            value: value.to_string(),
        })
}

/// File name used for uploads and local saves
pub fn export_filename(record: &SessionRecord, at: &DateTime<Utc>) -> String {
    let stamp = format_timestamp(at).replace([':', '.'], "-");
    format!(
        "experiment-data-{}-iteration-{}-{}.json",
        filename_component(record.participant_id.as_deref().unwrap_or("unknown")),
        filename_component(&record.run_key),
        stamp
    )
}

/// Map anything outside `[A-Za-z0-9_-]` to `-` so host-supplied ids stay a
/// single path component.
fn filename_component(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

impl ExportDocument {
    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            document_version: DOCUMENT_VERSION.to_string(),
            producer: DocumentProducer {
                name: PRODUCER_NAME.to_string(),
                version: TELEMETRY_VERSION.to_string(),
            },
            session_id: record.session_id.clone(),
            run_key: record.run_key.clone(),
            participant_id: record.participant_id.clone(),
            sample_counter: record.sequence,
            started_at: format_timestamp(&record.started_at),
            ended_at: record.ended_at.as_ref().map(format_timestamp),
            pages: record.pages.iter().map(PageDocument::from_visit).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, TrackerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, TrackerError> {
        serde_json::from_str(json)
            .map_err(|e| TrackerError::ParseError(format!("Failed to parse session document: {}", e)))
    }
}

impl PageDocument {
    fn from_visit(visit: &PageVisit) -> Self {
        Self {
            page_key: visit.page_key.clone(),
            opened_at: format_timestamp(&visit.opened_at),
            closed_at: visit.closed_at.as_ref().map(format_timestamp),
            duration_ms: visit.duration_ms(),
            pointer_samples: visit
                .pointer_samples
                .iter()
                .map(|s| PointerDocument {
                    x: s.x,
                    y: s.y,
                    time: format_timestamp(&s.time),
                    track_id: s.tracking_id.clone(),
                })
                .collect(),
            scroll_samples: visit
                .scroll_samples
                .iter()
                .map(|s| ScrollDocument {
                    x: s.x,
                    y: s.y,
                    time: format_timestamp(&s.time),
                })
                .collect(),
            clicks: visit
                .clicks
                .iter()
                .map(|c| ClickDocument {
                    x: c.x,
                    y: c.y,
                    element: c.element.clone(),
                    track_id: c.tracking_id.clone(),
                    time: format_timestamp(&c.time),
                })
                .collect(),
            key_presses: visit
                .key_presses
                .iter()
                .map(|k| KeyPressDocument {
                    key: k.key.clone(),
                    input_id: k.input_id.clone(),
                    time: format_timestamp(&k.time),
                })
                .collect(),
            annotation: visit.annotation.as_ref().map(|a| AnnotationDocument {
                recorded_at: format_timestamp(&a.recorded_at),
                payload: a.payload.clone(),
            }),
        }
    }
}

impl TryFrom<ExportDocument> for SessionRecord {
    type Error = TrackerError;

    fn try_from(doc: ExportDocument) -> Result<Self, Self::Error> {
        let pages = doc
            .pages
            .into_iter()
            .map(PageVisit::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SessionRecord {
            session_id: doc.session_id,
            run_key: doc.run_key,
            participant_id: doc.participant_id,
            sequence: doc.sample_counter,
            started_at: parse_timestamp("startedAt", &doc.started_at)?,
            ended_at: doc
                .ended_at
                .as_deref()
                .map(|v| parse_timestamp("endedAt", v))
                .transpose()?,
            pages,
        })
    }
}

impl TryFrom<PageDocument> for PageVisit {
    type Error = TrackerError;

    fn try_from(page: PageDocument) -> Result<Self, Self::Error> {
        let pointer_samples = page
            .pointer_samples
            .into_iter()
            .map(|s| {
                Ok(PointerSample {
                    x: s.x,
                    y: s.y,
                    time: parse_timestamp("pointerSamples.time", &s.time)?,
                    tracking_id: s.track_id,
                })
            })
            .collect::<Result<Vec<_>, TrackerError>>()?;

        let scroll_samples = page
            .scroll_samples
            .into_iter()
            .map(|s| {
                Ok(ScrollSample {
                    x: s.x,
                    y: s.y,
                    time: parse_timestamp("scrollSamples.time", &s.time)?,
                })
            })
            .collect::<Result<Vec<_>, TrackerError>>()?;

        let clicks = page
            .clicks
            .into_iter()
            .map(|c| {
                Ok(ClickRecord {
                    x: c.x,
                    y: c.y,
                    element: c.element,
                    tracking_id: c.track_id,
                    time: parse_timestamp("clicks.time", &c.time)?,
                })
            })
            .collect::<Result<Vec<_>, TrackerError>>()?;

        let key_presses = page
            .key_presses
            .into_iter()
            .map(|k| {
                Ok(KeyPress {
                    key: k.key,
                    input_id: k.input_id,
                    time: parse_timestamp("keyPresses.time", &k.time)?,
                })
            })
            .collect::<Result<Vec<_>, TrackerError>>()?;

        let annotation = page
            .annotation
            .map(|a| {
                Ok::<_, TrackerError>(Annotation {
                    recorded_at: parse_timestamp("annotation.recordedAt", &a.recorded_at)?,
                    payload: a.payload,
                })
            })
            .transpose()?;

        Ok(PageVisit {
            opened_at: parse_timestamp("openedAt", &page.opened_at)?,
            closed_at: page
                .closed_at
                .as_deref()
                .map(|v| parse_timestamp("closedAt", v))
                .transpose()?,
            page_key: page.page_key,
            pointer_samples,
            scroll_samples,
            clicks,
            key_presses,
            annotation,
        })
    }
}

/// A broken ledger invariant found in a session record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerViolation {
    #[error("{0} page visits are open at once")]
    MultipleOpen(usize),

    #[error("page visit {0} is still open after the session ended")]
    OpenAfterStop(usize),

    #[error("page visit {0} closes before it opens")]
    ClosedBeforeOpened(usize),

    #[error("page visit {0} opens before its predecessor closes")]
    Overlap(usize),

    #[error("page visit {index} has out-of-order {kind} samples")]
    UnorderedSamples { index: usize, kind: &'static str },

    #[error("session ends before its last page visit closes")]
    EndedBeforeLastClose,

    #[error("first page visit opens before the session starts")]
    OpenedBeforeStart,
}

/// Check a record against the ledger invariants.
pub fn validate_record(record: &SessionRecord) -> Vec<LedgerViolation> {
    let mut violations = Vec::new();

    let open = record.open_count();
    if open > 1 {
        violations.push(LedgerViolation::MultipleOpen(open));
    }

    if let Some(first) = record.pages.first() {
        if first.opened_at < record.started_at {
            violations.push(LedgerViolation::OpenedBeforeStart);
        }
    }

    for (index, visit) in record.pages.iter().enumerate() {
        match visit.closed_at {
            Some(closed) if closed < visit.opened_at => {
                violations.push(LedgerViolation::ClosedBeforeOpened(index));
            }
            None if record.ended_at.is_some() => {
                violations.push(LedgerViolation::OpenAfterStop(index));
            }
            _ => {}
        }

        if index > 0 {
            let previous = &record.pages[index - 1];
            match previous.closed_at {
                Some(closed) if closed <= visit.opened_at => {}
                _ => violations.push(LedgerViolation::Overlap(index)),
            }
        }

        let checks: [(&'static str, Vec<DateTime<Utc>>); 4] = [
            ("pointer", visit.pointer_samples.iter().map(|s| s.time).collect()),
            ("scroll", visit.scroll_samples.iter().map(|s| s.time).collect()),
            ("click", visit.clicks.iter().map(|c| c.time).collect()),
            ("key", visit.key_presses.iter().map(|k| k.time).collect()),
        ];
        for (kind, times) in checks {
            if times.windows(2).any(|pair| pair[1] < pair[0]) {
                violations.push(LedgerViolation::UnorderedSamples { index, kind });
            }
        }
    }

    if let (Some(ended), Some(last_closed)) = (
        record.ended_at,
        record.pages.last().and_then(|p| p.closed_at),
    ) {
        if ended < last_closed {
            violations.push(LedgerViolation::EndedBeforeLastClose);
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    fn sample_record() -> SessionRecord {
        let mut search = PageVisit::open("/search", t(0));
        search.pointer_samples.push(PointerSample {
            x: 10.0,
            y: 20.0,
            time: t(100),
            tracking_id: None,
        });
        search.clicks.push(ClickRecord {
            x: 12.0,
            y: 24.0,
            element: "BUTTON".to_string(),
            tracking_id: Some("search-submit".to_string()),
            time: t(400),
        });
        search.key_presses.push(KeyPress {
            key: "J".to_string(),
            input_id: Some("departure".to_string()),
            time: t(200),
        });
        search.annotation = Some(Annotation {
            recorded_at: t(450),
            payload: json!({"type": "search_parameters", "departure": "JFK"}),
        });
        search.closed_at = Some(t(500));

        let mut results = PageVisit::open("/results", t(500));
        results.scroll_samples.push(ScrollSample { x: 0.0, y: 300.0, time: t(700) });
        results.closed_at = Some(t(900));

        SessionRecord {
            session_id: "sess-1".to_string(),
            run_key: "2".to_string(),
            participant_id: Some("p-42".to_string()),
            sequence: 1,
            started_at: t(0),
            ended_at: Some(t(900)),
            pages: vec![search, results],
        }
    }

    #[test]
    fn test_timestamps_are_millisecond_rfc3339() {
        assert_eq!(format_timestamp(&t(1)), "2024-03-01T09:00:00.001Z");
    }

    #[test]
    fn test_document_shape() {
        let doc = ExportDocument::from_record(&sample_record());
        let value: Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();

        assert_eq!(value["runKey"], "2");
        assert_eq!(value["sampleCounter"], 1);
        assert_eq!(value["documentVersion"], DOCUMENT_VERSION);
        assert_eq!(value["pages"][0]["pageKey"], "/search");
        assert_eq!(value["pages"][0]["durationMs"], 500);
        assert_eq!(value["pages"][0]["clicks"][0]["trackId"], "search-submit");
        assert_eq!(value["pages"][0]["annotation"]["payload"]["departure"], "JFK");
        assert_eq!(value["pages"][1]["closedAt"], "2024-03-01T09:00:00.900Z");
        assert!(value["pages"][1].get("annotation").is_none());
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample_record();
        let json = ExportDocument::from_record(&record).to_json().unwrap();
        let restored = SessionRecord::try_from(ExportDocument::from_json(&json).unwrap()).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn test_bad_timestamp_names_field() {
        let mut doc = ExportDocument::from_record(&sample_record());
        doc.pages[1].opened_at = "yesterday".to_string();
        match SessionRecord::try_from(doc) {
            Err(TrackerError::InvalidTimestamp { field, value }) => {
                assert_eq!(field, "openedAt");
                assert_eq!(value, "yesterday");
            }
            other => panic!("expected timestamp error, got {:?}", other),
        }
    }

    #[test]
    fn test_filename() {
        let record = sample_record();
        assert_eq!(
            export_filename(&record, &t(900)),
            "experiment-data-p-42-iteration-2-2024-03-01T09-00-00-900Z.json"
        );

        let anonymous = SessionRecord {
            participant_id: None,
            ..record
        };
        assert!(export_filename(&anonymous, &t(0)).starts_with("experiment-data-unknown-iteration-2-"));
    }

    #[test]
    fn test_filename_keeps_ids_in_one_component() {
        let record = SessionRecord {
            run_key: "../../2024/03".to_string(),
            participant_id: Some("lab 3\\p.1".to_string()),
            ..sample_record()
        };
        let name = export_filename(&record, &t(0));
        assert_eq!(
            name,
            "experiment-data-lab-3-p-1-iteration-------2024-03-2024-03-01T09-00-00-000Z.json"
        );
        assert!(!name.contains('/'));
        assert!(!name.contains(".."));
    }

    #[test]
    fn test_valid_record_has_no_violations() {
        assert!(validate_record(&sample_record()).is_empty());
    }

    #[test]
    fn test_validation_catches_broken_ledgers() {
        let mut record = sample_record();
        record.pages[0].closed_at = None;
        record.pages[0].scroll_samples = vec![
            ScrollSample { x: 0.0, y: 1.0, time: t(300) },
            ScrollSample { x: 0.0, y: 2.0, time: t(200) },
        ];
        record.pages[1].closed_at = None;
        record.ended_at = Some(t(950));

        let violations = validate_record(&record);
        assert!(violations.contains(&LedgerViolation::MultipleOpen(2)));
        assert!(violations.contains(&LedgerViolation::OpenAfterStop(0)));
        assert!(violations.contains(&LedgerViolation::Overlap(1)));
        assert!(violations.contains(&LedgerViolation::UnorderedSamples { index: 0, kind: "scroll" }));
    }
}
