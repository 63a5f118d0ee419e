use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Key of a session record in the shared store.
pub type SessionId = String;

/// Serialized attribute value as stored remotely.
pub type Payload = Vec<u8>;

/// Identity of this process, used as the owner token in every remote call
/// that affects session ownership.
///
/// Built once at process start and handed to the replication client; it never
/// changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an identity chosen by the host (e.g. a stable pod name).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
