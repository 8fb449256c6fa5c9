//! Session identifiers and sequence numbers.
//!
//! Session ids usually come from the chat layer; fresh ones are UUID v4.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier for one research session (one chat, one timeline).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn new_uuid() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of an event in a session timeline. Starts at 0.
pub type SeqNo = u64;
