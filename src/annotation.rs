//! Selection annotations
//!
//! The only bridge from domain-level UI logic ("user picked this itinerary")
//! into the ledger. Payloads are stored as given; callers that need a history
//! of decisions on one page embed it in the payload.

use crate::ledger::PageLedger;
use crate::types::Annotation;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde_json::Value;

/// Attach `payload` to the open page visit, replacing any earlier annotation.
///
/// Returns the page key that received it, or `None` when no record is open.
pub fn annotate_current(
    ledger: &mut PageLedger,
    payload: Value,
    now: DateTime<Utc>,
) -> Option<String> {
    let page_key = match ledger.current_key() {
        Some(key) => key.to_string(),
        None => {
            debug!("Selection dropped: no open page visit");
            return None;
        }
    };

    let replaced = ledger
        .current()
        .map(|visit| visit.annotation.is_some())
        .unwrap_or(false);

    ledger.annotate(Annotation {
        recorded_at: now,
        payload,
    });

    if replaced {
        info!("Selection replaced on {}", page_key);
    } else {
        info!("Selection recorded on {}", page_key);
    }
    Some(page_key)
}
