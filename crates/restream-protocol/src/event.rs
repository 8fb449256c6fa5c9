//! Research agent event types.
//!
//! Two shapes live here:
//! - [`RawEvent`]: the loosely-typed record the agent stream delivers.
//! - [`AgentEvent`]: the normalized timeline entry with a closed
//!   [`EventKind`] taxonomy plus an `Unknown` fallback.
//!
//! Forward-compatible: kinds outside the closed set are kept as
//! `Unknown { original_kind, data }` instead of being dropped.

use crate::ids::SeqNo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire names of the built-in kinds, in the order the agent emits them.
pub const BUILTIN_KINDS: [&str; 5] = [
    "planning_for_research",
    "section_with_web_research",
    "searching_reference_corpus",
    "gather_completed_sections",
    "writing_remaining_report",
];

/// Label used for any kind outside the closed set.
pub const FALLBACK_LABEL: &str = "Agent step";

/// Kind name recorded for raw events that carry no kind field at all.
pub const MISSING_KIND: &str = "unknown";

// ─── RawEvent ──────────────────────────────────────────────────────

/// A raw progress record exactly as delivered by the event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(Value);

impl RawEvent {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The record's kind: the `type` field, falling back to `kind`.
    pub fn kind_name(&self) -> Option<&str> {
        self.0
            .get("type")
            .or_else(|| self.0.get("kind"))
            .and_then(Value::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for RawEvent {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

// ─── UrlRef ────────────────────────────────────────────────────────

/// A URL referenced by a web-research step, optionally pre-resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

impl UrlRef {
    /// A reference with no metadata yet (the legacy bare-string shape).
    pub fn bare(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            favicon: None,
        }
    }

    /// Both title and favicon were supplied upstream.
    pub fn is_resolved(&self) -> bool {
        self.title.is_some() && self.favicon.is_some()
    }

    /// Normalize one array element: a bare string or a record with `url`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(url) => Some(Self::bare(url.clone())),
            Value::Object(map) => {
                let url = map.get("url").and_then(Value::as_str)?;
                let text = |key: &str| {
                    map.get(key)
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                };
                Some(Self {
                    url: url.to_owned(),
                    title: text("title"),
                    favicon: text("favicon"),
                })
            }
            _ => None,
        }
    }
}

// ─── EventKind ─────────────────────────────────────────────────────

/// Closed taxonomy of research agent steps plus an `Unknown` fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PlanningForResearch,
    SectionWithWebResearch {
        #[serde(default)]
        url_refs: Vec<UrlRef>,
    },
    #[serde(alias = "searching_harrison")]
    SearchingReferenceCorpus,
    GatherCompletedSections,
    WritingRemainingReport,
    Unknown {
        original_kind: String,
        #[serde(default)]
        data: Value,
    },
}

impl EventKind {
    /// Map a wire name (including legacy aliases) to its canonical name.
    pub fn canonical_name(name: &str) -> Option<&'static str> {
        match name {
            "searching_harrison" => Some("searching_reference_corpus"),
            other => BUILTIN_KINDS.iter().copied().find(|known| *known == other),
        }
    }

    /// Build a built-in kind from its canonical name and raw payload.
    ///
    /// Returns `None` when `name` is not a built-in kind.
    pub fn builtin(name: &str, raw: &RawEvent) -> Option<Self> {
        let kind = match Self::canonical_name(name)? {
            "planning_for_research" => Self::PlanningForResearch,
            "section_with_web_research" => Self::SectionWithWebResearch {
                url_refs: extract_url_refs(raw),
            },
            "searching_reference_corpus" => Self::SearchingReferenceCorpus,
            "gather_completed_sections" => Self::GatherCompletedSections,
            "writing_remaining_report" => Self::WritingRemainingReport,
            _ => return None,
        };
        Some(kind)
    }

    /// Wrap a raw record whose kind is not recognized.
    pub fn unknown(raw: &RawEvent) -> Self {
        let original_kind = raw.kind_name().unwrap_or(MISSING_KIND).to_owned();
        let mut data = raw.as_value().clone();
        if let Some(obj) = data.as_object_mut() {
            obj.remove("type");
            obj.remove("kind");
        }
        Self::Unknown {
            original_kind,
            data,
        }
    }

    /// Name as it appears on the wire; the original name for unknown kinds.
    pub fn wire_name(&self) -> &str {
        match self {
            Self::PlanningForResearch => "planning_for_research",
            Self::SectionWithWebResearch { .. } => "section_with_web_research",
            Self::SearchingReferenceCorpus => "searching_reference_corpus",
            Self::GatherCompletedSections => "gather_completed_sections",
            Self::WritingRemainingReport => "writing_remaining_report",
            Self::Unknown { original_kind, .. } => original_kind,
        }
    }

    /// Human label for the timeline row.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PlanningForResearch => "Planning research",
            Self::SectionWithWebResearch { .. } => "Researching the web",
            Self::SearchingReferenceCorpus => "Searching reference corpus",
            Self::GatherCompletedSections => "Gathering completed sections",
            Self::WritingRemainingReport => "Writing report",
            Self::Unknown { .. } => FALLBACK_LABEL,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown { .. })
    }

    /// Default terminal predicate: the report-writing step ends research.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WritingRemainingReport)
    }

    pub fn url_refs(&self) -> &[UrlRef] {
        match self {
            Self::SectionWithWebResearch { url_refs } => url_refs,
            _ => &[],
        }
    }
}

/// Read url refs from `research_urls` (legacy) or `url_refs`.
fn extract_url_refs(raw: &RawEvent) -> Vec<UrlRef> {
    let Some(items) = raw
        .field("research_urls")
        .or_else(|| raw.field("url_refs"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    items.iter().filter_map(UrlRef::from_value).collect()
}

// ─── AgentEvent ────────────────────────────────────────────────────

/// A normalized, sequenced timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub sequence: SeqNo,
    pub kind: EventKind,
    pub observed_at: DateTime<Utc>,
}

impl AgentEvent {
    /// Create an event stamped with the current time.
    pub fn new(sequence: SeqNo, kind: EventKind) -> Self {
        Self {
            sequence,
            kind,
            observed_at: Utc::now(),
        }
    }

    pub fn url_refs(&self) -> &[UrlRef] {
        self.kind.url_refs()
    }
}
