//! Research session engine.
//!
//! One [`ResearchSession`] per research run wires the ingestor, reconciler,
//! metadata resolver, completion clock, persistence, and scroll policy
//! together. Behavior is parametrized by [`EngineConfig`].

pub mod clock;
pub mod persistence;
pub mod scroll;
pub mod session;

use std::time::Duration;

use restream_events::KindAllowList;
use restream_metadata::FallbackPolicy;
use restream_protocol::EventKind;

pub use clock::{ClockTransition, CompletionClock, TerminalPredicate};
pub use persistence::{DEFAULT_NAMESPACE, FileKvStore, InMemoryKvStore, PersistenceAdapter};
pub use scroll::{DEFAULT_SCROLL_TOLERANCE, ScrollCoordinator, ScrollPosition};
pub use session::{IngestOutcome, ResearchSession, SessionPorts, TimelineRow, UrlRow};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub allow_list: KindAllowList,
    pub terminal: TerminalPredicate,
    pub fallback: FallbackPolicy,
    pub namespace: String,
    pub tick_interval: Duration,
    pub checkpoint_every_ticks: u64,
    pub scroll_tolerance: u32,
    pub show_unknown: bool,
    pub update_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_list: KindAllowList::default(),
            terminal: EventKind::is_terminal,
            fallback: FallbackPolicy::default(),
            namespace: DEFAULT_NAMESPACE.to_owned(),
            tick_interval: Duration::from_secs(1),
            checkpoint_every_ticks: 1,
            scroll_tolerance: DEFAULT_SCROLL_TOLERANCE,
            show_unknown: true,
            update_buffer: 256,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_list(mut self, allow_list: KindAllowList) -> Self {
        self.allow_list = allow_list;
        self
    }

    pub fn terminal(mut self, terminal: TerminalPredicate) -> Self {
        self.terminal = terminal;
        self
    }

    pub fn fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Save a snapshot every `ticks` clock ticks; 0 saves only on transitions.
    pub fn checkpoint_every_ticks(mut self, ticks: u64) -> Self {
        self.checkpoint_every_ticks = ticks;
        self
    }

    pub fn scroll_tolerance(mut self, tolerance: u32) -> Self {
        self.scroll_tolerance = tolerance;
        self
    }

    pub fn show_unknown(mut self, show_unknown: bool) -> Self {
        self.show_unknown = show_unknown;
        self
    }
}
