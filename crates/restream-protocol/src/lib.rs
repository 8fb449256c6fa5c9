//! # restream-protocol: research progress contract
//!
//! Shared types, event taxonomy, and port traits for the research progress
//! engine. Every other crate in the workspace depends on this one.
//!
//! No tokio, no HTTP client: rendering layers and tests can depend on it
//! as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SessionId) and the sequence alias
//! - [`event`]: RawEvent, AgentEvent, EventKind (closed set + unknown fallback), UrlRef
//! - [`timeline`]: Append-only Timeline keyed by sequence
//! - [`session`]: SessionState (persisted unit) and ClockPhase
//! - [`metadata`]: UrlMetadata and the lookup response shape
//! - [`update`]: TimelineUpdate and ScrollDecision notifications
//! - [`ports`]: Boundary ports (metadata service, key/value store)
//! - [`error`]: EngineError, EngineResult

pub mod error;
pub mod event;
pub mod ids;
pub mod metadata;
pub mod ports;
pub mod session;
pub mod timeline;
pub mod update;

// Re-export the most commonly used types at the crate root.
pub use error::{EngineError, EngineResult};
pub use event::{AgentEvent, EventKind, RawEvent, UrlRef};
pub use ids::{SeqNo, SessionId};
pub use metadata::{MetadataLookup, MetadataSource, UrlMetadata};
pub use ports::{KeyValueStorePort, MetadataServicePort};
pub use session::{ClockPhase, SessionState};
pub use timeline::Timeline;
pub use update::{ScrollDecision, TimelineUpdate};
