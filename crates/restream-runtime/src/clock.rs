//! Completion clock: `idle → running → completed`.

use restream_protocol::{AgentEvent, ClockPhase, EventKind, SessionState};

/// Predicate marking the event kind that ends research.
pub type TerminalPredicate = fn(&EventKind) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTransition {
    Started,
    Completed,
}

/// Elapsed-time and completion tracking for one session.
///
/// `Completed` is terminal: ticks become no-ops and both counters freeze.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionClock {
    phase: ClockPhase,
    elapsed_seconds: u64,
    completed_at_seconds: Option<u64>,
}

impl Default for CompletionClock {
    fn default() -> Self {
        Self {
            phase: ClockPhase::Idle,
            elapsed_seconds: 0,
            completed_at_seconds: None,
        }
    }
}

impl CompletionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a snapshot. A restored timeline that already holds a
    /// terminal event completes the clock even if the flag was not saved.
    pub fn restore(state: &SessionState, is_terminal: TerminalPredicate) -> Self {
        let mut clock = Self {
            phase: state.phase(),
            elapsed_seconds: state.elapsed_seconds,
            completed_at_seconds: state.completed_at_seconds,
        };
        if clock.phase == ClockPhase::Completed {
            clock.completed_at_seconds = clock.completed_at_seconds.or(Some(clock.elapsed_seconds));
        } else if state.timeline.contains(is_terminal) {
            clock.complete();
        }
        clock
    }

    pub fn phase(&self) -> ClockPhase {
        self.phase
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn completed_at_seconds(&self) -> Option<u64> {
        self.completed_at_seconds
    }

    pub fn is_running(&self) -> bool {
        self.phase == ClockPhase::Running
    }

    pub fn is_completed(&self) -> bool {
        self.phase == ClockPhase::Completed
    }

    /// React to newly appended events.
    pub fn observe(
        &mut self,
        appended: &[AgentEvent],
        is_terminal: TerminalPredicate,
    ) -> Vec<ClockTransition> {
        let mut transitions = Vec::new();
        if appended.is_empty() || self.is_completed() {
            return transitions;
        }
        if self.phase == ClockPhase::Idle {
            self.phase = ClockPhase::Running;
            transitions.push(ClockTransition::Started);
        }
        if appended.iter().any(|event| is_terminal(&event.kind)) {
            self.complete();
            transitions.push(ClockTransition::Completed);
        }
        transitions
    }

    /// Advance one second. Returns whether anything changed.
    pub fn tick(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.elapsed_seconds += 1;
        true
    }

    fn complete(&mut self) {
        self.phase = ClockPhase::Completed;
        if self.completed_at_seconds.is_none() {
            self.completed_at_seconds = Some(self.elapsed_seconds);
        }
    }

    pub fn apply_to(&self, state: &mut SessionState) {
        state.elapsed_seconds = self.elapsed_seconds;
        state.completed = self.is_completed();
        state.completed_at_seconds = self.completed_at_seconds;
    }
}
