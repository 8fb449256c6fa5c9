use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexSet;
use restream_protocol::event::BUILTIN_KINDS;
use restream_protocol::{AgentEvent, EventKind, RawEvent, SeqNo, Timeline, TimelineUpdate};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

/// Tracks how much of an append-only source has been consumed.
#[derive(Debug, Clone, Default)]
pub struct EventIngestor {
    last_consumed: usize,
}

impl EventIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_consumed(&self) -> usize {
        self.last_consumed
    }

    /// Return the items appended since the previous poll.
    ///
    /// The source must only ever grow. A shorter source is a precondition
    /// violation: nothing is returned and the position is kept, so events
    /// may be skipped but are never delivered twice.
    pub fn poll<'a>(&mut self, source: &'a [RawEvent]) -> &'a [RawEvent] {
        if source.len() < self.last_consumed {
            warn!(
                source_len = source.len(),
                last_consumed = self.last_consumed,
                "event source shrank; waiting for explicit reset"
            );
            return &[];
        }
        if source.len() == self.last_consumed {
            return &[];
        }
        let delta = &source[self.last_consumed..];
        self.last_consumed = source.len();
        debug!(count = delta.len(), last_consumed = self.last_consumed, "source delta");
        delta
    }

    /// Mark everything up to `consumed` as seen (used on restore).
    pub fn seed(&mut self, consumed: usize) {
        self.last_consumed = self.last_consumed.max(consumed);
    }

    /// The transport replaced its buffer with a fresh one.
    pub fn reset(&mut self) {
        debug!(last_consumed = self.last_consumed, "ingestor reset");
        self.last_consumed = 0;
    }
}

/// Which built-in kinds count as known; everything else becomes `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindAllowList {
    kinds: IndexSet<&'static str>,
}

impl Default for KindAllowList {
    fn default() -> Self {
        Self {
            kinds: BUILTIN_KINDS.into_iter().collect(),
        }
    }
}

impl KindAllowList {
    /// Restrict to the given kinds. Names that are not built-in are ignored.
    pub fn only<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut kinds = IndexSet::new();
        for name in names {
            match EventKind::canonical_name(name) {
                Some(canonical) => {
                    kinds.insert(canonical);
                }
                None => debug!(kind = name, "ignoring non built-in kind in allow-list"),
            }
        }
        Self { kinds }
    }

    pub fn allows(&self, name: &str) -> bool {
        EventKind::canonical_name(name).is_some_and(|canonical| self.kinds.contains(canonical))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.iter().copied()
    }
}

/// Result of one [`Reconciler::ingest`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendedEvents {
    pub events: Vec<AgentEvent>,
    /// Distinct URLs, first-seen order, that arrived without title or favicon.
    pub unresolved_urls: Vec<String>,
}

impl AppendedEvents {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first_sequence(&self) -> Option<SeqNo> {
        self.events.first().map(|event| event.sequence)
    }
}

/// Normalizes raw events and appends them to the session timeline.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    timeline: Timeline,
    allow: KindAllowList,
}

impl Reconciler {
    pub fn new(allow: KindAllowList) -> Self {
        Self::with_timeline(Timeline::new(), allow)
    }

    /// Resume from a restored timeline.
    pub fn with_timeline(timeline: Timeline, allow: KindAllowList) -> Self {
        Self { timeline, allow }
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn classify(&self, raw: &RawEvent) -> EventKind {
        raw.kind_name()
            .filter(|name| self.allow.allows(name))
            .and_then(|name| EventKind::builtin(name, raw))
            .unwrap_or_else(|| EventKind::unknown(raw))
    }

    /// Append `raw_events` in arrival order.
    ///
    /// Performs no content deduplication: feed it only what the
    /// [`EventIngestor`] returned.
    #[instrument(skip_all, fields(batch = raw_events.len(), next_sequence = self.timeline.next_sequence()))]
    pub fn ingest(&mut self, raw_events: &[RawEvent]) -> AppendedEvents {
        let mut events = Vec::with_capacity(raw_events.len());
        let mut unresolved = IndexSet::new();

        for raw in raw_events {
            let kind = self.classify(raw);
            if !kind.is_known() {
                debug!(kind = kind.wire_name(), "unknown event kind");
            }
            let supplied = raw
                .field("research_urls")
                .or_else(|| raw.field("url_refs"))
                .and_then(serde_json::Value::as_array)
                .map_or(0, Vec::len);
            if matches!(kind, EventKind::SectionWithWebResearch { .. })
                && supplied > kind.url_refs().len()
            {
                debug!(
                    dropped = supplied - kind.url_refs().len(),
                    "ignored url refs without a url"
                );
            }
            for url_ref in kind.url_refs().iter().filter(|r| !r.is_resolved()) {
                unresolved.insert(url_ref.url.clone());
            }
            events.push(self.timeline.append(kind).clone());
        }

        debug!(
            appended = events.len(),
            unresolved = unresolved.len(),
            "events reconciled"
        );
        AppendedEvents {
            events,
            unresolved_urls: unresolved.into_iter().collect(),
        }
    }
}

/// Fan-out of presentation updates to any number of subscribers.
#[derive(Clone, Debug)]
pub struct TimelineHub {
    sender: broadcast::Sender<TimelineUpdate>,
}

impl TimelineHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, update: TimelineUpdate) {
        let _ = self.sender.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineUpdate> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<TimelineUpdate> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

/// An append-only event source backed by a JSON-lines file.
///
/// Every non-blank, newline-terminated line is one raw event. A trailing
/// line without its newline is still being written and is left for the next
/// read. Lines that fail to parse are kept as string records so positions
/// stay stable for the ingestor.
#[derive(Debug, Clone)]
pub struct FileEventSource {
    path: PathBuf,
}

impl FileEventSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip(self), fields(path = ?self.path))]
    pub async fn read_all(&self) -> Result<Vec<RawEvent>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed reading event source {:?}", self.path))?;
        let (complete, pending) = match contents.rfind('\n') {
            Some(end) => contents.split_at(end + 1),
            None => ("", contents.as_str()),
        };
        if !pending.is_empty() {
            debug!(bytes = pending.len(), "leaving unterminated line for next read");
        }

        let mut out = Vec::new();
        for line in complete.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(error) => {
                    warn!(%error, "unparseable event line");
                    serde_json::Value::String(line.to_owned())
                }
            };
            out.push(RawEvent::new(value));
        }
        debug!(count = out.len(), "events read from source");
        Ok(out)
    }

    pub async fn append(&self, event: &RawEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create source dir {parent:?}"))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed opening event source {:?}", self.path))?;
        let line = serde_json::to_string(event).context("failed serializing event")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}
