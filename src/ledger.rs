//! Page-visit ledger
//!
//! An append-only arena of page visits with an optional pointer to the one
//! open record. Every mutation goes through the ledger, which is the only place
//! the single-open invariant is enforced.

use crate::types::{Annotation, ClickRecord, KeyPress, PageVisit, PointerSample, ScrollSample};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageLedger {
    pages: Vec<PageVisit>,
    current: Option<usize>,
}

impl PageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pages(&self) -> &[PageVisit] {
        &self.pages
    }

    pub fn current(&self) -> Option<&PageVisit> {
        self.current.and_then(|idx| self.pages.get(idx))
    }

    fn current_mut(&mut self) -> Option<&mut PageVisit> {
        self.current.and_then(move |idx| self.pages.get_mut(idx))
    }

    pub fn current_key(&self) -> Option<&str> {
        self.current().map(|p| p.page_key.as_str())
    }

    /// Latest open or close instant recorded so far
    pub fn latest_boundary(&self) -> Option<DateTime<Utc>> {
        self.pages
            .last()
            .map(|visit| visit.closed_at.map_or(visit.opened_at, |closed| closed.max(visit.opened_at)))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Close the open record and open a new one for `page_key` at `at`.
    ///
    /// The close is stamped with the same instant as the open, so the previous
    /// record never ends after its successor begins.
    pub fn transition(&mut self, page_key: &str, at: DateTime<Utc>) -> &PageVisit {
        self.close_current(at);
        self.pages.push(PageVisit::open(page_key, at));
        let idx = self.pages.len() - 1;
        self.current = Some(idx);
        &self.pages[idx]
    }

    /// Seal the open record, if any. Returns whether a record was closed.
    pub fn close_current(&mut self, at: DateTime<Utc>) -> bool {
        match self.current.take().and_then(|idx| self.pages.get_mut(idx)) {
            Some(visit) => {
                let closed_at = if at < visit.opened_at { visit.opened_at } else { at };
                visit.closed_at = Some(closed_at);
                true
            }
            None => false,
        }
    }

    pub fn push_pointer(&mut self, sample: PointerSample) -> bool {
        self.with_current(|visit| visit.pointer_samples.push(sample))
    }

    pub fn push_scroll(&mut self, sample: ScrollSample) -> bool {
        self.with_current(|visit| visit.scroll_samples.push(sample))
    }

    pub fn push_click(&mut self, click: ClickRecord) -> bool {
        self.with_current(|visit| visit.clicks.push(click))
    }

    pub fn push_key(&mut self, key: KeyPress) -> bool {
        self.with_current(|visit| visit.key_presses.push(key))
    }

    /// Replace the open record's annotation (last write wins)
    pub fn annotate(&mut self, annotation: Annotation) -> bool {
        self.with_current(|visit| visit.annotation = Some(annotation))
    }

    fn with_current<F: FnOnce(&mut PageVisit)>(&mut self, f: F) -> bool {
        match self.current_mut() {
            Some(visit) => {
                f(visit);
                true
            }
            None => false,
        }
    }

    pub fn into_pages(self) -> Vec<PageVisit> {
        self.pages
    }
}
