//! The research session engine.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use restream_events::{EventIngestor, Reconciler, TimelineHub};
use restream_metadata::MetadataResolver;
use restream_protocol::{
    AgentEvent, ClockPhase, KeyValueStorePort, MetadataServicePort, RawEvent, ScrollDecision,
    SeqNo, SessionId, SessionState, Timeline, TimelineUpdate,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, warn};

use crate::EngineConfig;
use crate::clock::{ClockTransition, CompletionClock};
use crate::persistence::PersistenceAdapter;
use crate::scroll::{ScrollCoordinator, ScrollPosition};

/// External collaborators a session needs.
#[derive(Clone)]
pub struct SessionPorts {
    pub metadata: Arc<dyn MetadataServicePort>,
    pub store: Arc<dyn KeyValueStorePort>,
}

/// What one source notification changed.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub appended: Vec<AgentEvent>,
    pub scroll: ScrollDecision,
    pub phase: ClockPhase,
    /// URLs handed to the metadata resolver for this batch.
    pub resolving: Vec<String>,
}

/// One rendered timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineRow {
    pub sequence: SeqNo,
    pub kind: String,
    pub label: &'static str,
    pub urls: Vec<UrlRow>,
}

/// One URL under a web-research row. `title` is `None` until resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlRow {
    pub url: String,
    pub title: Option<String>,
    pub favicon: String,
    pub resolved: bool,
}

#[derive(Debug)]
struct SessionCore {
    ingestor: EventIngestor,
    reconciler: Reconciler,
    clock: CompletionClock,
    scroll: ScrollCoordinator,
    ticks_since_checkpoint: u64,
    generation: u64,
    torn_down: bool,
}

/// A snapshot plus its position in the session's save order.
#[derive(Debug)]
struct Checkpoint {
    generation: u64,
    state: SessionState,
}

impl SessionCore {
    fn snapshot(&self, session_id: &SessionId) -> SessionState {
        let mut state = SessionState::new(session_id.clone());
        state.timeline = self.reconciler.timeline().clone();
        self.clock.apply_to(&mut state);
        state
    }

    fn checkpoint(&mut self, session_id: &SessionId) -> Checkpoint {
        self.generation += 1;
        Checkpoint {
            generation: self.generation,
            state: self.snapshot(session_id),
        }
    }

    fn clock_update(&self) -> TimelineUpdate {
        TimelineUpdate::ClockChanged {
            phase: self.clock.phase(),
            elapsed_seconds: self.clock.elapsed_seconds(),
            completed_at_seconds: self.clock.completed_at_seconds(),
        }
    }
}

struct SessionInner {
    session_id: SessionId,
    config: EngineConfig,
    core: Mutex<SessionCore>,
    resolver: MetadataResolver,
    persistence: PersistenceAdapter,
    /// Generation of the newest checkpoint handed to the store.
    saved_generation: tokio::sync::Mutex<u64>,
    hub: TimelineHub,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// A mounted research session.
///
/// Cloning is cheap; every clone drives the same session. State lives behind
/// one mutex that is never held across an await.
#[derive(Clone)]
pub struct ResearchSession {
    inner: Arc<SessionInner>,
}

impl ResearchSession {
    /// Restore any snapshot for `session_id`, then start tracking.
    ///
    /// A failed load is logged and the session starts empty.
    #[instrument(skip(config, ports), fields(session_id = %session_id))]
    pub async fn mount(session_id: SessionId, config: EngineConfig, ports: SessionPorts) -> Self {
        let persistence = PersistenceAdapter::new(ports.store, config.namespace.clone());
        let restored = match persistence.load(&session_id).await {
            Ok(restored) => restored,
            Err(error) => {
                warn!(%error, "snapshot load failed; continuing in memory");
                None
            }
        };
        let was_restored = restored.is_some();
        let state = restored.unwrap_or_else(|| SessionState::new(session_id.clone()));

        let clock = CompletionClock::restore(&state, config.terminal);
        let mut ingestor = EventIngestor::new();
        ingestor.seed(state.timeline.len());
        let core = SessionCore {
            ingestor,
            reconciler: Reconciler::with_timeline(state.timeline, config.allow_list.clone()),
            clock,
            scroll: ScrollCoordinator::new(config.scroll_tolerance),
            ticks_since_checkpoint: 0,
            generation: 0,
            torn_down: false,
        };
        let resolver = MetadataResolver::new(ports.metadata, config.fallback.clone());
        let hub = TimelineHub::new(config.update_buffer);

        let session = Self {
            inner: Arc::new(SessionInner {
                session_id,
                config,
                core: Mutex::new(core),
                resolver,
                persistence,
                saved_generation: tokio::sync::Mutex::new(0),
                hub,
                ticker: Mutex::new(None),
            }),
        };

        let (phase, events, elapsed, restored_urls) = {
            let core = session.inner.core.lock();
            let timeline = core.reconciler.timeline();
            (
                core.clock.phase(),
                timeline.len(),
                core.clock.elapsed_seconds(),
                unresolved_urls(timeline),
            )
        };
        if phase == ClockPhase::Running {
            session.start_ticker();
        }
        let resolving = session.schedule_resolutions(restored_urls).len();
        info!(
            restored = was_restored,
            events,
            elapsed,
            resolving,
            ?phase,
            "session mounted"
        );
        session
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metadata(&self) -> &MetadataResolver {
        &self.inner.resolver
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineUpdate> {
        self.inner.hub.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<TimelineUpdate> {
        self.inner.hub.subscribe_stream()
    }

    /// Feed the full current contents of the append-only source.
    #[instrument(
        skip(self, source),
        fields(session_id = %self.inner.session_id, source_len = source.len())
    )]
    pub async fn on_source(&self, source: &[RawEvent]) -> IngestOutcome {
        let (appended, unresolved, transitions, scroll, clock_update, checkpoint) = {
            let mut core = self.inner.core.lock();
            let phase = core.clock.phase();
            if core.torn_down {
                return IngestOutcome::unchanged(phase);
            }
            let delta = core.ingestor.poll(source);
            if delta.is_empty() {
                return IngestOutcome::unchanged(phase);
            }
            let appended = core.reconciler.ingest(delta);
            let transitions = core
                .clock
                .observe(&appended.events, self.inner.config.terminal);
            let scroll = core.scroll.on_append();
            (
                appended.events,
                appended.unresolved_urls,
                transitions,
                scroll,
                core.clock_update(),
                core.checkpoint(&self.inner.session_id),
            )
        };

        for transition in &transitions {
            match transition {
                ClockTransition::Started => self.start_ticker(),
                ClockTransition::Completed => self.stop_ticker(),
            }
        }

        self.inner.hub.publish(TimelineUpdate::Appended {
            events: appended.clone(),
        });
        if !transitions.is_empty() {
            self.inner.hub.publish(clock_update);
        }
        self.inner
            .hub
            .publish(TimelineUpdate::Scroll { decision: scroll });

        self.persist(&checkpoint).await;
        let resolving = self.schedule_resolutions(unresolved);

        debug!(
            appended = appended.len(),
            resolving = resolving.len(),
            ?transitions,
            "source notification applied"
        );
        IngestOutcome {
            appended,
            scroll,
            phase: checkpoint.state.phase(),
            resolving,
        }
    }

    /// The transport replaced its buffer; the next source starts fresh.
    pub fn on_source_reset(&self) {
        self.inner.core.lock().ingestor.reset();
        info!(session_id = %self.inner.session_id, "event source reset");
    }

    /// Returns the resulting auto-follow flag.
    pub fn on_user_scroll(&self, position: ScrollPosition) -> bool {
        let auto_follow = self.inner.core.lock().scroll.on_user_scroll(position);
        debug!(
            offset = position.offset,
            distance = position.distance_from_bottom(),
            auto_follow,
            "user scrolled"
        );
        auto_follow
    }

    pub fn on_visibility(&self, expanded: bool) -> ScrollDecision {
        let decision = self.inner.core.lock().scroll.on_visibility(expanded);
        self.inner
            .hub
            .publish(TimelineUpdate::Scroll { decision });
        decision
    }

    pub fn auto_follow(&self) -> bool {
        self.inner.core.lock().scroll.auto_follow()
    }

    pub fn phase(&self) -> ClockPhase {
        self.inner.core.lock().clock.phase()
    }

    pub fn state(&self) -> SessionState {
        self.inner.core.lock().snapshot(&self.inner.session_id)
    }

    /// Advance the clock one second. Returns whether it is still running.
    pub async fn tick_once(&self) -> bool {
        let (update, checkpoint) = {
            let mut core = self.inner.core.lock();
            if core.torn_down || !core.clock.tick() {
                return false;
            }
            core.ticks_since_checkpoint += 1;
            let every = self.inner.config.checkpoint_every_ticks;
            let checkpoint = if every > 0 && core.ticks_since_checkpoint >= every {
                core.ticks_since_checkpoint = 0;
                Some(core.checkpoint(&self.inner.session_id))
            } else {
                None
            };
            (core.clock_update(), checkpoint)
        };

        self.inner.hub.publish(update);
        if let Some(checkpoint) = checkpoint {
            self.persist(&checkpoint).await;
        }
        true
    }

    /// Rows for the rendering layer, with resolved or placeholder metadata.
    pub fn rows(&self) -> Vec<TimelineRow> {
        let core = self.inner.core.lock();
        let policy = self.inner.resolver.policy();
        let cache = self.inner.resolver.cache();

        core.reconciler
            .timeline()
            .iter()
            .filter(|event| self.inner.config.show_unknown || event.kind.is_known())
            .map(|event| TimelineRow {
                sequence: event.sequence,
                kind: event.kind.wire_name().to_owned(),
                label: event.kind.label(),
                urls: event
                    .url_refs()
                    .iter()
                    .map(|url_ref| {
                        let cached = cache.get(&url_ref.url);
                        UrlRow {
                            url: url_ref.url.clone(),
                            title: url_ref
                                .title
                                .clone()
                                .or_else(|| cached.as_ref().map(|m| m.title.clone())),
                            favicon: url_ref
                                .favicon
                                .clone()
                                .or_else(|| cached.as_ref().map(|m| m.favicon.clone()))
                                .unwrap_or_else(|| policy.domain_favicon(&url_ref.url)),
                            resolved: url_ref.is_resolved() || cached.is_some(),
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    /// Stop ticking and write a final snapshot. Safe to call more than once.
    #[instrument(skip(self), fields(session_id = %self.inner.session_id))]
    pub async fn teardown(&self) {
        let checkpoint = {
            let mut core = self.inner.core.lock();
            if core.torn_down {
                return;
            }
            core.torn_down = true;
            core.checkpoint(&self.inner.session_id)
        };
        self.stop_ticker();
        self.persist(&checkpoint).await;
        info!(
            events = checkpoint.state.timeline.len(),
            elapsed = checkpoint.state.elapsed_seconds,
            completed = checkpoint.state.completed,
            "session torn down"
        );
    }

    /// Saves run one at a time, and a checkpoint older than the last one
    /// written is dropped, so the store never moves backwards.
    async fn persist(&self, checkpoint: &Checkpoint) {
        let mut saved = self.inner.saved_generation.lock().await;
        if checkpoint.generation <= *saved {
            debug!(
                generation = checkpoint.generation,
                saved = *saved,
                "skipping stale snapshot"
            );
            return;
        }
        *saved = checkpoint.generation;
        if let Err(error) = self
            .inner
            .persistence
            .save(&self.inner.session_id, &checkpoint.state)
            .await
        {
            warn!(%error, "snapshot save failed; continuing in memory");
        }
    }

    fn schedule_resolutions(&self, urls: Vec<String>) -> Vec<String> {
        let cache = self.inner.resolver.cache();
        let pending: Vec<String> = urls.into_iter().filter(|url| !cache.contains(url)).collect();
        for url in &pending {
            let resolver = self.inner.resolver.clone();
            let hub = self.inner.hub.clone();
            let url = url.clone();
            tokio::spawn(async move {
                let metadata = resolver.resolve(&url).await;
                hub.publish(TimelineUpdate::MetadataResolved { url, metadata });
            });
        }
        pending
    }

    fn start_ticker(&self) {
        let mut ticker = self.inner.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.tick_interval;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !(ResearchSession { inner }).tick_once().await {
                    break;
                }
            }
        }));
        debug!(session_id = %self.inner.session_id, "clock ticker started");
    }

    fn stop_ticker(&self) {
        if let Some(handle) = self.inner.ticker.lock().take() {
            handle.abort();
            debug!(session_id = %self.inner.session_id, "clock ticker cancelled");
        }
    }
}

/// Distinct URLs in `timeline` still missing a title or favicon.
fn unresolved_urls(timeline: &Timeline) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for url_ref in timeline.iter().flat_map(|event| event.url_refs()) {
        if !url_ref.is_resolved() && !urls.contains(&url_ref.url) {
            urls.push(url_ref.url.clone());
        }
    }
    urls
}

impl IngestOutcome {
    fn unchanged(phase: ClockPhase) -> Self {
        Self {
            appended: Vec::new(),
            scroll: ScrollDecision::Stay,
            phase,
            resolving: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use restream_protocol::{
        ClockPhase, EngineError, EngineResult, EventKind, KeyValueStorePort, MetadataLookup,
        MetadataServicePort, RawEvent, ScrollDecision, SessionId, SessionState, TimelineUpdate,
        UrlRef,
    };
    use serde_json::json;

    use super::{Checkpoint, ResearchSession, SessionPorts};
    use crate::persistence::{InMemoryKvStore, PersistenceAdapter};
    use crate::scroll::ScrollPosition;
    use crate::{DEFAULT_NAMESPACE, EngineConfig};

    #[derive(Default)]
    struct FailingLookups {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataServicePort for FailingLookups {
        async fn lookup(&self, _url: &str) -> EngineResult<MetadataLookup> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Metadata("unreachable".to_owned()))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStorePort for BrokenStore {
        async fn get(&self, _key: &str) -> EngineResult<Option<String>> {
            Err(EngineError::Store("unavailable".to_owned()))
        }

        async fn put(&self, _key: &str, _value: String) -> EngineResult<()> {
            Err(EngineError::Store("unavailable".to_owned()))
        }

        async fn remove(&self, _key: &str) -> EngineResult<()> {
            Err(EngineError::Store("unavailable".to_owned()))
        }
    }

    #[derive(Default)]
    struct TitledLookups {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataServicePort for TitledLookups {
        async fn lookup(&self, url: &str) -> EngineResult<MetadataLookup> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(MetadataLookup {
                title: Some(format!("Title of {url}")),
                favicon: None,
            })
        }
    }

    /// Delays every put while `slow` is set.
    #[derive(Clone, Default)]
    struct SlowStore {
        inner: InMemoryKvStore,
        slow: Arc<AtomicBool>,
    }

    #[async_trait]
    impl KeyValueStorePort for SlowStore {
        async fn get(&self, key: &str) -> EngineResult<Option<String>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: String) -> EngineResult<()> {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            self.inner.put(key, value).await
        }

        async fn remove(&self, key: &str) -> EngineResult<()> {
            self.inner.remove(key).await
        }
    }

    async fn saved_state(store: &InMemoryKvStore) -> SessionState {
        PersistenceAdapter::new(Arc::new(store.clone()), DEFAULT_NAMESPACE)
            .load(&SessionId::from_string("chat-1"))
            .await
            .unwrap()
            .unwrap()
    }

    fn raw(value: serde_json::Value) -> RawEvent {
        RawEvent::new(value)
    }

    /// Manual ticking only; the background ticker never fires in these tests.
    fn manual_clock() -> EngineConfig {
        EngineConfig::new().tick_interval(Duration::from_secs(3600))
    }

    async fn mount_with(
        store: Arc<dyn KeyValueStorePort>,
        lookups: Arc<FailingLookups>,
        config: EngineConfig,
    ) -> ResearchSession {
        ResearchSession::mount(
            SessionId::from_string("chat-1"),
            config,
            SessionPorts {
                metadata: lookups,
                store,
            },
        )
        .await
    }

    #[tokio::test]
    async fn first_event_starts_clock_and_follows() {
        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            Arc::default(),
            manual_clock(),
        )
        .await;
        assert_eq!(session.phase(), ClockPhase::Idle);

        let source = vec![raw(json!({"kind": "planning_for_research"}))];
        let outcome = session.on_source(&source).await;

        assert_eq!(outcome.appended.len(), 1);
        assert_eq!(outcome.phase, ClockPhase::Running);
        assert_eq!(outcome.scroll, ScrollDecision::ScrollToBottom);
        assert!(session.auto_follow());
        session.teardown().await;
    }

    #[tokio::test]
    async fn web_research_resolves_each_url_once_with_hostname_fallback() {
        let lookups = Arc::new(FailingLookups::default());
        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            lookups.clone(),
            manual_clock(),
        )
        .await;

        let mut source = vec![raw(json!({"type": "planning_for_research"}))];
        session.on_source(&source).await;
        source.push(raw(json!({
            "type": "section_with_web_research",
            "research_urls": ["https://a.example/"]
        })));
        let outcome = session.on_source(&source).await;
        assert_eq!(outcome.resolving, vec!["https://a.example/".to_owned()]);
        assert_eq!(session.state().timeline.len(), 2);

        let metadata = session.metadata().resolve("https://a.example/").await;
        assert_eq!(metadata.title, "a.example");
        assert_eq!(lookups.calls.load(Ordering::SeqCst), 1);

        let rows = session.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].urls[0].title.as_deref(), Some("a.example"));
        assert!(rows[1].urls[0].resolved);

        // Same URL again: already cached, nothing new to resolve.
        source.push(raw(json!({
            "type": "section_with_web_research",
            "research_urls": ["https://a.example/"]
        })));
        assert!(session.on_source(&source).await.resolving.is_empty());
        assert_eq!(lookups.calls.load(Ordering::SeqCst), 1);
        session.teardown().await;
    }

    #[tokio::test]
    async fn unresolved_rows_show_placeholder_metadata() {
        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            Arc::default(),
            manual_clock(),
        )
        .await;
        let source = vec![
            raw(json!({
                "type": "section_with_web_research",
                "research_urls": [
                    {"url": "https://b.example/", "title": "B", "favicon": "https://b.example/b.ico"},
                    "not a url"
                ]
            })),
            raw(json!({"type": "mystery_step"})),
        ];
        let outcome = session.on_source(&source).await;
        assert_eq!(outcome.resolving, vec!["not a url".to_owned()]);

        let rows = session.rows();
        let supplied = &rows[0].urls[0];
        assert_eq!(supplied.title.as_deref(), Some("B"));
        assert_eq!(supplied.favicon, "https://b.example/b.ico");
        assert!(supplied.resolved);
        assert_eq!(rows[1].label, "Agent step");
        assert_eq!(rows[1].kind, "mystery_step");
        session.teardown().await;
    }

    #[tokio::test]
    async fn hidden_unknown_kinds_still_take_a_sequence() {
        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            Arc::default(),
            manual_clock().show_unknown(false),
        )
        .await;
        let source = vec![
            raw(json!({"type": "mystery_step"})),
            raw(json!({"type": "gather_completed_sections"})),
        ];
        session.on_source(&source).await;
        let rows = session.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sequence, 1);
        session.teardown().await;
    }

    #[tokio::test]
    async fn terminal_event_at_42_seconds_freezes_clock() {
        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            Arc::default(),
            manual_clock(),
        )
        .await;
        let mut source = vec![raw(json!({"type": "planning_for_research"}))];
        session.on_source(&source).await;
        for _ in 0..42 {
            assert!(session.tick_once().await);
        }

        source.push(raw(json!({"type": "writing_remaining_report"})));
        let outcome = session.on_source(&source).await;
        assert_eq!(outcome.phase, ClockPhase::Completed);

        assert!(!session.tick_once().await);
        let state = session.state();
        assert!(state.completed);
        assert_eq!(state.elapsed_seconds, 42);
        assert_eq!(state.completed_at_seconds, Some(42));
        session.teardown().await;
    }

    #[tokio::test]
    async fn scrolled_away_user_is_not_moved() {
        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            Arc::default(),
            manual_clock(),
        )
        .await;
        let mut source = vec![raw(json!({"type": "planning_for_research"}))];
        session.on_source(&source).await;

        let auto_follow = session.on_user_scroll(ScrollPosition {
            offset: 40,
            viewport_height: 300,
            content_height: 900,
        });
        assert!(!auto_follow);

        source.push(raw(json!({"type": "gather_completed_sections"})));
        let outcome = session.on_source(&source).await;
        assert_eq!(outcome.scroll, ScrollDecision::Stay);
        assert!(!session.auto_follow());

        assert_eq!(session.on_visibility(false), ScrollDecision::Stay);
        assert_eq!(
            session.on_visibility(true),
            ScrollDecision::RestoreOffset { offset: 40 }
        );
        session.teardown().await;
    }

    #[tokio::test]
    async fn reload_restores_snapshot_and_skips_seen_events() {
        let store = InMemoryKvStore::new();
        let session_id = SessionId::from_string("chat-1");
        let mut prior = SessionState::new(session_id.clone());
        prior.timeline.append(EventKind::PlanningForResearch);
        prior.timeline.append(EventKind::SearchingReferenceCorpus);
        prior.timeline.append(EventKind::GatherCompletedSections);
        prior.elapsed_seconds = 10;
        PersistenceAdapter::new(Arc::new(store.clone()), DEFAULT_NAMESPACE)
            .save(&session_id, &prior)
            .await
            .unwrap();

        let session = mount_with(Arc::new(store), Arc::default(), manual_clock()).await;
        assert_eq!(session.phase(), ClockPhase::Running);

        let source = vec![
            raw(json!({"type": "planning_for_research"})),
            raw(json!({"type": "searching_harrison"})),
            raw(json!({"type": "gather_completed_sections"})),
        ];
        let outcome = session.on_source(&source).await;
        assert!(outcome.appended.is_empty());
        assert_eq!(session.state().timeline, prior.timeline);

        assert!(session.tick_once().await);
        assert_eq!(session.state().elapsed_seconds, 11);
        session.teardown().await;
    }

    #[tokio::test]
    async fn restored_urls_get_metadata_after_mount() {
        let store = InMemoryKvStore::new();
        let session_id = SessionId::from_string("chat-1");
        let mut prior = SessionState::new(session_id.clone());
        prior.timeline.append(EventKind::SectionWithWebResearch {
            url_refs: vec![
                UrlRef::bare("https://a.example/"),
                UrlRef {
                    url: "https://b.example/".to_owned(),
                    title: Some("B".to_owned()),
                    favicon: Some("https://b.example/b.ico".to_owned()),
                },
            ],
        });
        prior.elapsed_seconds = 4;
        PersistenceAdapter::new(Arc::new(store.clone()), DEFAULT_NAMESPACE)
            .save(&session_id, &prior)
            .await
            .unwrap();

        let lookups = Arc::new(TitledLookups::default());
        let session = ResearchSession::mount(
            session_id,
            manual_clock(),
            SessionPorts {
                metadata: lookups.clone(),
                store: Arc::new(store),
            },
        )
        .await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.metadata().cache().contains("https://a.example/") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let rows = session.rows();
        let restored = &rows[0].urls[0];
        assert!(restored.resolved);
        assert_eq!(restored.title.as_deref(), Some("Title of https://a.example/"));
        assert_eq!(lookups.calls.load(Ordering::SeqCst), 1);
        assert!(!session.metadata().cache().contains("https://b.example/"));
        session.teardown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_checkpoint_never_overwrites_a_newer_snapshot() {
        let store = SlowStore::default();
        let session = mount_with(Arc::new(store.clone()), Arc::default(), manual_clock()).await;
        let mut source = vec![raw(json!({"type": "planning_for_research"}))];
        session.on_source(&source).await;

        store.slow.store(true, Ordering::SeqCst);
        let ticking = tokio::spawn({
            let session = session.clone();
            async move { session.tick_once().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.slow.store(false, Ordering::SeqCst);

        source.push(raw(json!({"type": "writing_remaining_report"})));
        session.on_source(&source).await;
        assert!(ticking.await.unwrap());

        let saved = saved_state(&store.inner).await;
        assert!(saved.completed);
        assert_eq!(saved.timeline.len(), 2);
        assert_eq!(saved.completed_at_seconds, Some(1));
        assert_eq!(saved, session.state());
        session.teardown().await;
    }

    #[tokio::test]
    async fn older_checkpoint_is_skipped_once_a_newer_one_is_written() {
        let store = InMemoryKvStore::new();
        let session = mount_with(Arc::new(store.clone()), Arc::default(), manual_clock()).await;
        let mut newer = SessionState::new(SessionId::from_string("chat-1"));
        newer.timeline.append(EventKind::WritingRemainingReport);
        newer.completed = true;
        newer.completed_at_seconds = Some(0);
        let older = SessionState::new(SessionId::from_string("chat-1"));

        session
            .persist(&Checkpoint {
                generation: 7,
                state: newer.clone(),
            })
            .await;
        session
            .persist(&Checkpoint {
                generation: 6,
                state: older,
            })
            .await;

        assert_eq!(saved_state(&store).await, newer);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn teardown_during_a_slow_tick_keeps_the_final_snapshot() {
        let store = SlowStore::default();
        let session = mount_with(Arc::new(store.clone()), Arc::default(), manual_clock()).await;
        let source = vec![raw(json!({"type": "planning_for_research"}))];
        session.on_source(&source).await;

        store.slow.store(true, Ordering::SeqCst);
        let ticking = tokio::spawn({
            let session = session.clone();
            async move { session.tick_once().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.slow.store(false, Ordering::SeqCst);

        session.teardown().await;
        assert!(ticking.await.unwrap());
        assert!(!session.tick_once().await);

        let saved = saved_state(&store.inner).await;
        assert_eq!(saved.elapsed_seconds, 1);
        assert_eq!(saved, session.state());
    }

    #[tokio::test]
    async fn every_mutation_is_persisted() {
        let store = InMemoryKvStore::new();
        let session = mount_with(
            Arc::new(store.clone()),
            Arc::default(),
            manual_clock(),
        )
        .await;
        let source = vec![raw(json!({"type": "planning_for_research"}))];
        session.on_source(&source).await;
        session.tick_once().await;
        session.tick_once().await;

        let adapter = PersistenceAdapter::new(Arc::new(store), DEFAULT_NAMESPACE);
        let saved = adapter
            .load(session.session_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved, session.state());
        assert_eq!(saved.elapsed_seconds, 2);
        session.teardown().await;
    }

    #[tokio::test]
    async fn restored_completed_session_never_ticks() {
        let store = InMemoryKvStore::new();
        let session_id = SessionId::from_string("chat-1");
        let mut prior = SessionState::new(session_id.clone());
        prior.timeline.append(EventKind::WritingRemainingReport);
        prior.elapsed_seconds = 55;
        prior.completed = true;
        prior.completed_at_seconds = Some(55);
        PersistenceAdapter::new(Arc::new(store.clone()), DEFAULT_NAMESPACE)
            .save(&session_id, &prior)
            .await
            .unwrap();

        let session = mount_with(Arc::new(store), Arc::default(), manual_clock()).await;
        assert_eq!(session.phase(), ClockPhase::Completed);
        assert!(!session.tick_once().await);
        assert_eq!(session.state(), prior);
        session.teardown().await;
    }

    #[tokio::test]
    async fn broken_store_degrades_to_memory() {
        let session = mount_with(Arc::new(BrokenStore), Arc::default(), manual_clock()).await;
        let source = vec![raw(json!({"type": "planning_for_research"}))];
        let outcome = session.on_source(&source).await;
        assert_eq!(outcome.appended.len(), 1);
        assert!(session.tick_once().await);
        assert_eq!(session.state().elapsed_seconds, 1);
        session.teardown().await;
    }

    #[tokio::test]
    async fn updates_are_published_in_order() {
        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            Arc::default(),
            manual_clock(),
        )
        .await;
        let mut updates = session.subscribe();
        let source = vec![raw(json!({"type": "planning_for_research"}))];
        session.on_source(&source).await;

        assert!(matches!(
            updates.recv().await.unwrap(),
            TimelineUpdate::Appended { events } if events.len() == 1
        ));
        assert!(matches!(
            updates.recv().await.unwrap(),
            TimelineUpdate::ClockChanged {
                phase: ClockPhase::Running,
                ..
            }
        ));
        assert_eq!(
            updates.recv().await.unwrap(),
            TimelineUpdate::Scroll {
                decision: ScrollDecision::ScrollToBottom
            }
        );
        session.teardown().await;
    }

    #[tokio::test]
    async fn stream_subscribers_see_metadata_resolution() {
        use futures_util::StreamExt;

        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            Arc::default(),
            manual_clock(),
        )
        .await;
        let mut updates = session.subscribe_stream();
        let source = vec![raw(json!({
            "type": "section_with_web_research",
            "research_urls": ["https://c.example/page"]
        }))];
        session.on_source(&source).await;

        let resolved = loop {
            match updates.next().await {
                Some(Ok(TimelineUpdate::MetadataResolved { url, metadata })) => {
                    break (url, metadata);
                }
                Some(Ok(_)) => continue,
                other => panic!("update stream ended early: {other:?}"),
            }
        };
        assert_eq!(resolved.0, "https://c.example/page");
        assert_eq!(resolved.1.title, "c.example");
        session.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_ticker_counts_wall_clock_seconds() {
        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            Arc::default(),
            EngineConfig::new(),
        )
        .await;
        let source = vec![raw(json!({"type": "planning_for_research"}))];
        session.on_source(&source).await;

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(session.state().elapsed_seconds, 3);

        session.teardown().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(session.state().elapsed_seconds, 3);
        assert!(!session.tick_once().await);

        session.teardown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stops_on_completion() {
        let session = mount_with(
            Arc::new(InMemoryKvStore::new()),
            Arc::default(),
            EngineConfig::new(),
        )
        .await;
        let mut source = vec![raw(json!({"type": "planning_for_research"}))];
        session.on_source(&source).await;
        tokio::time::sleep(Duration::from_millis(2500)).await;

        source.push(raw(json!({"type": "writing_remaining_report"})));
        session.on_source(&source).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        let state = session.state();
        assert_eq!(state.elapsed_seconds, 2);
        assert_eq!(state.completed_at_seconds, Some(2));
        session.teardown().await;
    }
}
