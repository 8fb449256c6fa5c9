//! Append-only timeline of normalized agent events.

use crate::error::{EngineError, EngineResult};
use crate::event::{AgentEvent, EventKind};
use crate::ids::SeqNo;
use serde::{Deserialize, Serialize};

/// Ordered record of a session's events.
///
/// Sequences start at 0 and equal the event's index. Events are never
/// removed, reordered, or mutated after [`Timeline::append`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<AgentEvent>", into = "Vec<AgentEvent>")]
pub struct Timeline {
    events: Vec<AgentEvent>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a timeline from restored events, rejecting gaps and repeats.
    pub fn from_events(events: Vec<AgentEvent>) -> EngineResult<Self> {
        for (index, event) in events.iter().enumerate() {
            let expected = index as SeqNo;
            if event.sequence != expected {
                return Err(EngineError::SequenceConflict {
                    expected,
                    actual: event.sequence,
                });
            }
        }
        Ok(Self { events })
    }

    /// The sequence the next appended event will receive.
    pub fn next_sequence(&self) -> SeqNo {
        self.events.len() as SeqNo
    }

    /// Append a new event and return it.
    pub fn append(&mut self, kind: EventKind) -> &AgentEvent {
        let event = AgentEvent::new(self.next_sequence(), kind);
        self.events.push(event);
        &self.events[self.events.len() - 1]
    }

    pub fn get(&self, sequence: SeqNo) -> Option<&AgentEvent> {
        usize::try_from(sequence)
            .ok()
            .and_then(|index| self.events.get(index))
    }

    /// Events with `sequence >= from`.
    pub fn since(&self, from: SeqNo) -> &[AgentEvent] {
        let start = usize::try_from(from)
            .unwrap_or(usize::MAX)
            .min(self.events.len());
        &self.events[start..]
    }

    pub fn last(&self) -> Option<&AgentEvent> {
        self.events.last()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentEvent> {
        self.events.iter()
    }

    pub fn as_slice(&self) -> &[AgentEvent] {
        &self.events
    }

    pub fn contains(&self, predicate: impl Fn(&EventKind) -> bool) -> bool {
        self.events.iter().any(|event| predicate(&event.kind))
    }
}

impl TryFrom<Vec<AgentEvent>> for Timeline {
    type Error = EngineError;

    fn try_from(events: Vec<AgentEvent>) -> EngineResult<Self> {
        Self::from_events(events)
    }
}

impl From<Timeline> for Vec<AgentEvent> {
    fn from(timeline: Timeline) -> Self {
        timeline.events
    }
}
