use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use restream_protocol::{
    EngineError, EngineResult, MetadataLookup, MetadataServicePort, MetadataSource, UrlMetadata,
};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};
use url::Url;

pub const DEFAULT_FAVICON_ENDPOINT: &str = "https://www.google.com/s2/favicons";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36";

/// Hostname of `url`, if it parses and has one.
pub fn hostname(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_owned))
}

/// How to fill in metadata the service could not provide.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    favicon_endpoint: String,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FAVICON_ENDPOINT)
    }
}

impl FallbackPolicy {
    pub fn new(favicon_endpoint: impl Into<String>) -> Self {
        Self {
            favicon_endpoint: favicon_endpoint.into(),
        }
    }

    /// Favicon-by-domain URL; empty when `url` has no host.
    pub fn domain_favicon(&self, url: &str) -> String {
        hostname(url)
            .map(|host| format!("{}?domain={host}", self.favicon_endpoint))
            .unwrap_or_default()
    }

    /// Title shown when nothing better is known: the hostname, else the raw URL.
    pub fn fallback_title(&self, url: &str) -> String {
        hostname(url).unwrap_or_else(|| url.to_owned())
    }

    pub fn fallback(&self, url: &str) -> UrlMetadata {
        UrlMetadata {
            title: self.fallback_title(url),
            favicon: self.domain_favicon(url),
            resolved_at: Utc::now(),
            source: MetadataSource::Fallback,
        }
    }

    /// Merge a successful lookup with fallbacks for missing fields.
    pub fn complete(&self, url: &str, lookup: MetadataLookup) -> UrlMetadata {
        let non_empty = |value: Option<String>| value.filter(|s| !s.trim().is_empty());
        UrlMetadata {
            title: non_empty(lookup.title).unwrap_or_else(|| self.fallback_title(url)),
            favicon: non_empty(lookup.favicon).unwrap_or_else(|| self.domain_favicon(url)),
            resolved_at: Utc::now(),
            source: MetadataSource::Service,
        }
    }
}

/// URL → metadata, written at most once per URL.
///
/// Each URL owns a cell; the first resolution to finish fills it and every
/// other caller (concurrent or later) reads that value.
#[derive(Debug, Clone, Default)]
pub struct UrlMetadataCache {
    slots: Arc<Mutex<HashMap<String, Arc<OnceCell<UrlMetadata>>>>>,
}

impl UrlMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, url: &str) -> Arc<OnceCell<UrlMetadata>> {
        let mut guard = self.slots.lock();
        guard
            .entry(url.to_owned())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    pub fn get(&self, url: &str) -> Option<UrlMetadata> {
        self.slots
            .lock()
            .get(url)
            .and_then(|cell| cell.get().cloned())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.get(url).is_some()
    }

    /// Store `metadata` unless the URL already has a value. Returns whether it was written.
    pub fn insert(&self, url: &str, metadata: UrlMetadata) -> bool {
        self.slot(url).set(metadata).is_ok()
    }

    /// Number of resolved entries.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache-first metadata resolution with fallback on any failure.
#[derive(Clone)]
pub struct MetadataResolver {
    cache: UrlMetadataCache,
    service: Arc<dyn MetadataServicePort>,
    policy: FallbackPolicy,
}

impl MetadataResolver {
    pub fn new(service: Arc<dyn MetadataServicePort>, policy: FallbackPolicy) -> Self {
        Self {
            cache: UrlMetadataCache::new(),
            service,
            policy,
        }
    }

    pub fn cache(&self) -> &UrlMetadataCache {
        &self.cache
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    /// Resolve `url`, never failing.
    ///
    /// Concurrent calls for the same URL share one lookup.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn resolve(&self, url: &str) -> UrlMetadata {
        let slot = self.cache.slot(url);
        if let Some(hit) = slot.get() {
            debug!("metadata cache hit");
            return hit.clone();
        }
        slot.get_or_init(|| self.fetch(url)).await.clone()
    }

    async fn fetch(&self, url: &str) -> UrlMetadata {
        if Url::parse(url).is_err() {
            warn!("malformed url; using fallback metadata");
            return self.policy.fallback(url);
        }
        match self.service.lookup(url).await {
            Ok(lookup) => {
                debug!("metadata resolved");
                self.policy.complete(url, lookup)
            }
            Err(error) => {
                warn!(%error, "metadata lookup failed; using fallback metadata");
                self.policy.fallback(url)
            }
        }
    }
}

fn http_client(timeout: Duration) -> EngineResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(BROWSER_USER_AGENT)
        .build()
        .map_err(|error| EngineError::Metadata(error.to_string()))
}

/// Asks a metadata endpoint: `GET <endpoint>?url=<url>` → `{title, favicon}`.
#[derive(Debug, Clone)]
pub struct HttpMetadataService {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpMetadataService {
    pub fn new(endpoint: &str, timeout: Duration) -> EngineResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|error| EngineError::InvalidUrl(format!("{endpoint}: {error}")))?;
        Ok(Self {
            client: http_client(timeout)?,
            endpoint,
        })
    }
}

#[async_trait]
impl MetadataServicePort for HttpMetadataService {
    async fn lookup(&self, url: &str) -> EngineResult<MetadataLookup> {
        let mut request_url = self.endpoint.clone();
        request_url.query_pairs_mut().append_pair("url", url);

        let response = self
            .client
            .get(request_url)
            .send()
            .await
            .map_err(|error| EngineError::Metadata(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Metadata(format!("endpoint returned {status}")));
        }
        response
            .json::<MetadataLookup>()
            .await
            .map_err(|error| EngineError::Metadata(error.to_string()))
    }
}

/// Fetches the page itself and reads its `<title>`; favicon is `<origin>/favicon.ico`.
#[derive(Debug, Clone)]
pub struct PageTitleService {
    client: reqwest::Client,
    title_pattern: Regex,
}

impl PageTitleService {
    pub fn new(timeout: Duration) -> EngineResult<Self> {
        let title_pattern = Regex::new(r"(?is)<title[^>]*>(.*?)</title>")
            .map_err(|error| EngineError::Metadata(error.to_string()))?;
        Ok(Self {
            client: http_client(timeout)?,
            title_pattern,
        })
    }

    fn extract_title(&self, html: &str) -> Option<String> {
        let raw = self.title_pattern.captures(html)?.get(1)?.as_str();
        let title = raw
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'");
        (!title.is_empty()).then_some(title)
    }
}

#[async_trait]
impl MetadataServicePort for PageTitleService {
    async fn lookup(&self, url: &str) -> EngineResult<MetadataLookup> {
        let parsed =
            Url::parse(url).map_err(|error| EngineError::InvalidUrl(format!("{url}: {error}")))?;
        let response = self
            .client
            .get(parsed.clone())
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|error| EngineError::Metadata(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Metadata(format!("page returned {status}")));
        }
        let html = response
            .text()
            .await
            .map_err(|error| EngineError::Metadata(error.to_string()))?;
        Ok(MetadataLookup {
            title: self.extract_title(&html),
            favicon: Some(format!("{}/favicon.ico", parsed.origin().ascii_serialization())),
        })
    }
}

/// A service that always fails, forcing fallback metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineMetadataService;

#[async_trait]
impl MetadataServicePort for OfflineMetadataService {
    async fn lookup(&self, _url: &str) -> EngineResult<MetadataLookup> {
        Err(EngineError::Metadata("metadata lookups disabled".to_owned()))
    }
}
