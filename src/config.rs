//! Tracker configuration
//!
//! Every field has a default so a config file only needs to name what it
//! changes.

use crate::error::TrackerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default throttle for pointer-move samples
pub const DEFAULT_POINTER_SAMPLE_INTERVAL_MS: u64 = 100;

/// Default throttle for scroll samples
pub const DEFAULT_SCROLL_SAMPLE_INTERVAL_MS: u64 = 100;

/// Default coalescing window for DOM-churn navigation checks
pub const DEFAULT_NAVIGATION_DEBOUNCE_MS: u64 = 50;

/// Default bound on the network delivery attempt
pub const DEFAULT_EXPORT_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on throttle and debounce windows (one hour)
pub const MAX_INTERVAL_MS: u64 = 3_600_000;

/// Entry pages that are never tracked
pub const DEFAULT_EXCLUDED_PAGES: &[&str] = &["/", "/welcome"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    /// Minimum spacing between accepted pointer samples
    pub pointer_sample_interval_ms: u64,
    /// Minimum spacing between accepted scroll samples
    pub scroll_sample_interval_ms: u64,
    /// DOM-churn debounce window; zero checks synchronously
    pub navigation_debounce_ms: u64,
    /// Page keys that never open a page-visit record
    pub excluded_pages: Vec<String>,
    /// Open a record for the page showing at `start` time
    pub eager_open: bool,
    /// Upper bound on waiting for the sink before falling back
    pub export_timeout_ms: u64,
    /// Save a local copy even when delivery succeeds
    pub always_save_locally: bool,
    /// Participant identifier stamped into exported documents
    pub participant_id: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            pointer_sample_interval_ms: DEFAULT_POINTER_SAMPLE_INTERVAL_MS,
            scroll_sample_interval_ms: DEFAULT_SCROLL_SAMPLE_INTERVAL_MS,
            navigation_debounce_ms: DEFAULT_NAVIGATION_DEBOUNCE_MS,
            excluded_pages: DEFAULT_EXCLUDED_PAGES.iter().map(|p| p.to_string()).collect(),
            eager_open: true,
            export_timeout_ms: DEFAULT_EXPORT_TIMEOUT_MS,
            always_save_locally: true,
            participant_id: None,
        }
    }
}

impl TrackerConfig {
    /// Load a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, TrackerError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TrackerError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, TrackerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.export_timeout_ms == 0 {
            return Err(TrackerError::ConfigError(
                "exportTimeoutMs must be greater than zero".to_string(),
            ));
        }
        for (field, value) in [
            ("pointerSampleIntervalMs", self.pointer_sample_interval_ms),
            ("scrollSampleIntervalMs", self.scroll_sample_interval_ms),
            ("navigationDebounceMs", self.navigation_debounce_ms),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(TrackerError::ConfigError(format!(
                    "{} must be at most {} ms, got {}",
                    field, MAX_INTERVAL_MS, value
                )));
            }
        }
        if self.excluded_pages.iter().any(|p| p.is_empty()) {
            return Err(TrackerError::ConfigError(
                "excludedPages must not contain empty keys".to_string(),
            ));
        }
        Ok(())
    }

    /// Zero throttle and debounce, for deterministic replays and tests.
    pub fn immediate() -> Self {
        Self {
            pointer_sample_interval_ms: 0,
            scroll_sample_interval_ms: 0,
            navigation_debounce_ms: 0,
            ..Self::default()
        }
    }

    pub fn with_navigation_debounce_ms(mut self, ms: u64) -> Self {
        self.navigation_debounce_ms = ms;
        self
    }

    pub fn with_sample_intervals_ms(mut self, pointer: u64, scroll: u64) -> Self {
        self.pointer_sample_interval_ms = pointer;
        self.scroll_sample_interval_ms = scroll;
        self
    }

    pub fn with_excluded_pages<I, S>(mut self, pages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_pages = pages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_eager_open(mut self, eager: bool) -> Self {
        self.eager_open = eager;
        self
    }

    pub fn with_export_timeout_ms(mut self, ms: u64) -> Self {
        self.export_timeout_ms = ms;
        self
    }

    pub fn with_participant_id(mut self, id: impl Into<String>) -> Self {
        self.participant_id = Some(id.into());
        self
    }

    pub fn with_always_save_locally(mut self, always: bool) -> Self {
        self.always_save_locally = always;
        self
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }
}
