//! Host input events
//!
//! A serializable form of everything the host forwards to the tracker, used by
//! replays and by hosts that prefer a single entry point over the individual
//! handler methods.

use crate::types::ElementInfo;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    PointerMove {
        x: f64,
        y: f64,
    },
    Scroll {
        #[serde(default)]
        x: f64,
        y: f64,
    },
    Click {
        x: f64,
        y: f64,
        target: ElementInfo,
    },
    KeyDown {
        key: String,
        target: ElementInfo,
    },
    /// Browser back/forward
    HistoryPop,
    /// Document subtree changed
    DomMutation,
    /// Timer wake-up; runs due navigation checks
    Tick,
}

impl InputEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InputEvent::PointerMove { .. } => "pointer_move",
            InputEvent::Scroll { .. } => "scroll",
            InputEvent::Click { .. } => "click",
            InputEvent::KeyDown { .. } => "key_down",
            InputEvent::HistoryPop => "history_pop",
            InputEvent::DomMutation => "dom_mutation",
            InputEvent::Tick => "tick",
        }
    }
}
