//! Navigation change detection
//!
//! Single-page flows change the logical page without a reload, so the detector
//! combines two signals:
//!
//! - history pop notifications, checked immediately
//! - DOM churn, coalesced into a single check once the debounce window elapses
//!
//! Both signals resolve the current page key through a [`PageKeyResolver`] and
//! only act when the key differs from the last one seen, so two signals for the
//! same change never produce two records.

use crate::config::MAX_INTERVAL_MS;
use crate::ledger::PageLedger;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use std::cell::RefCell;
use std::rc::Rc;

/// Supplies the logical page currently showing (route or view name).
pub trait PageKeyResolver {
    fn current_page_key(&self) -> String;
}

impl<F> PageKeyResolver for F
where
    F: Fn() -> String,
{
    fn current_page_key(&self) -> String {
        self()
    }
}

/// A settable location shared between the host router and the tracker.
#[derive(Debug, Clone, Default)]
pub struct LocationHandle {
    path: Rc<RefCell<String>>,
}

impl LocationHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Rc::new(RefCell::new(path.into())),
        }
    }

    pub fn set(&self, path: impl Into<String>) {
        *self.path.borrow_mut() = path.into();
    }

    pub fn get(&self) -> String {
        self.path.borrow().clone()
    }
}

impl PageKeyResolver for LocationHandle {
    fn current_page_key(&self) -> String {
        // Query strings do not change the logical page.
        let path = self.get();
        match path.split_once(['?', '#']) {
            Some((base, _)) => base.to_string(),
            None => path,
        }
    }
}

/// A page change the detector applied to the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: Option<String>,
    pub to: String,
    /// `false` when `to` is an entry page and no record was opened
    pub tracked: bool,
}

#[derive(Debug, Clone)]
pub struct NavigationDetector {
    last_known: Option<String>,
    pending_until: Option<DateTime<Utc>>,
    debounce: Duration,
    excluded: Vec<String>,
}

impl NavigationDetector {
    pub fn new(debounce_ms: u64, excluded: Vec<String>) -> Self {
        Self {
            last_known: None,
            pending_until: None,
            debounce: Duration::milliseconds(debounce_ms.min(MAX_INTERVAL_MS) as i64),
            excluded,
        }
    }

    pub fn last_known(&self) -> Option<&str> {
        self.last_known.as_deref()
    }

    pub fn has_pending_check(&self) -> bool {
        self.pending_until.is_some()
    }

    pub fn is_excluded(&self, page_key: &str) -> bool {
        self.excluded.iter().any(|p| p == page_key)
    }

    /// Adopt the page showing at session start.
    ///
    /// Opens a record for it when `eager` is set and the page is tracked.
    pub fn prime(
        &mut self,
        page_key: String,
        ledger: &mut PageLedger,
        now: DateTime<Utc>,
        eager: bool,
    ) -> Option<Transition> {
        self.pending_until = None;
        if eager {
            return self.apply(page_key, ledger, now);
        }
        self.last_known = Some(page_key);
        None
    }

    /// Forget all state; used when the session stops.
    pub fn reset(&mut self) {
        self.last_known = None;
        self.pending_until = None;
    }

    pub fn history_popped(
        &mut self,
        resolver: &dyn PageKeyResolver,
        ledger: &mut PageLedger,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        self.apply(resolver.current_page_key(), ledger, now)
    }

    /// Record DOM churn. The check runs now when the debounce window is zero,
    /// otherwise on the first [`poll`](Self::poll) at or after the deadline.
    /// Further churn inside an open window is coalesced into the same check.
    pub fn dom_mutated(
        &mut self,
        resolver: &dyn PageKeyResolver,
        ledger: &mut PageLedger,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if self.pending_until.is_none() {
            self.pending_until = Some(now + self.debounce);
        }
        self.poll(resolver, ledger, now)
    }

    /// Run the pending DOM-churn check if its deadline has passed.
    ///
    /// The transition is stamped at the deadline, not at `now`, so a late
    /// poll does not stretch the previous visit. It never lands before a
    /// boundary already in the ledger.
    pub fn poll(
        &mut self,
        resolver: &dyn PageKeyResolver,
        ledger: &mut PageLedger,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        match self.pending_until {
            Some(deadline) if deadline <= now => {
                self.pending_until = None;
                let at = match ledger.latest_boundary() {
                    Some(boundary) if boundary > deadline => boundary,
                    _ => deadline,
                };
                self.apply(resolver.current_page_key(), ledger, at)
            }
            _ => None,
        }
    }

    fn apply(
        &mut self,
        page_key: String,
        ledger: &mut PageLedger,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        if self.last_known.as_deref() == Some(page_key.as_str()) {
            return None;
        }

        let from = self.last_known.replace(page_key.clone());

        if self.is_excluded(&page_key) {
            if ledger.close_current(now) {
                info!("Left tracked pages for entry page {}", page_key);
            } else {
                debug!("Ignoring entry page {}", page_key);
            }
            return Some(Transition {
                from,
                to: page_key,
                tracked: false,
            });
        }

        ledger.transition(&page_key, now);
        info!(
            "Page transition {} -> {}",
            from.as_deref().unwrap_or("<none>"),
            page_key
        );
        Some(Transition {
            from,
            to: page_key,
            tracked: true,
        })
    }
}
