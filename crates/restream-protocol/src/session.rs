//! Session state: the persisted unit.

use crate::ids::SessionId;
use crate::timeline::Timeline;
use serde::{Deserialize, Serialize};

/// Phase of the completion clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockPhase {
    /// No events yet.
    Idle,
    /// Events present, terminal event not yet observed.
    Running,
    /// Terminal event observed (or restored as completed). Terminal.
    Completed,
}

/// Everything a session derives from its event stream.
///
/// Once `completed` is true, `elapsed_seconds` and `completed_at_seconds`
/// are frozen and `completed` never reverts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub timeline: Timeline,
    pub elapsed_seconds: u64,
    pub completed: bool,
    #[serde(default)]
    pub completed_at_seconds: Option<u64>,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            timeline: Timeline::new(),
            elapsed_seconds: 0,
            completed: false,
            completed_at_seconds: None,
        }
    }

    /// Clock phase implied by this snapshot.
    pub fn phase(&self) -> ClockPhase {
        if self.completed {
            ClockPhase::Completed
        } else if self.timeline.is_empty() {
            ClockPhase::Idle
        } else {
            ClockPhase::Running
        }
    }
}
