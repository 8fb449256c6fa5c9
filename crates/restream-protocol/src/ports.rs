//! Boundary ports between the engine and its external collaborators.
//!
//! The engine talks to the outside world only through these traits:
//! - a metadata service that turns a URL into `{title, favicon}`,
//! - a key/value store used for best-effort session snapshots.
//!
//! The event source and scroll notifications are plain inputs to the engine
//! and need no port.
//!
//! Object-safety note: traits use `async-trait` for async dyn-dispatch.

use crate::error::EngineResult;
use crate::metadata::MetadataLookup;
use async_trait::async_trait;

#[async_trait]
pub trait MetadataServicePort: Send + Sync {
    /// Look up display metadata for `url`.
    ///
    /// Any error (network, non-success status, malformed body) means
    /// "resolution failed"; callers degrade to fallback metadata.
    async fn lookup(&self, url: &str) -> EngineResult<MetadataLookup>;
}

#[async_trait]
pub trait KeyValueStorePort: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<String>>;
    async fn put(&self, key: &str, value: String) -> EngineResult<()>;
    async fn remove(&self, key: &str) -> EngineResult<()>;
}
