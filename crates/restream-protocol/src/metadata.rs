//! Display metadata for URLs referenced by web-research steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a cached metadata entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    Service,
    Fallback,
}

/// Resolved title and favicon for one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMetadata {
    pub title: String,
    pub favicon: String,
    pub resolved_at: DateTime<Utc>,
    pub source: MetadataSource,
}

/// Response shape of the metadata endpoint: `{title, favicon}`.
///
/// Both fields are optional on the wire; the resolver fills the gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataLookup {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub favicon: Option<String>,
}
