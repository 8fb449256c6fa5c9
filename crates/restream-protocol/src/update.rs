//! Notifications consumed by the rendering layer.

use crate::event::AgentEvent;
use crate::metadata::UrlMetadata;
use crate::session::ClockPhase;
use serde::{Deserialize, Serialize};

/// What the view should do with its scroll position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScrollDecision {
    /// Leave the position untouched.
    Stay,
    ScrollToBottom,
    /// Put the view back where the user left it.
    RestoreOffset { offset: u32 },
}

/// A change to a session's presentation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineUpdate {
    Appended {
        events: Vec<AgentEvent>,
    },
    MetadataResolved {
        url: String,
        metadata: UrlMetadata,
    },
    ClockChanged {
        phase: ClockPhase,
        elapsed_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed_at_seconds: Option<u64>,
    },
    Scroll {
        decision: ScrollDecision,
    },
}
