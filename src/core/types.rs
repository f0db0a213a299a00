use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Optimistic-concurrency counter. `0` means nothing has been persisted yet.
pub type Version = u64;

/// Free-form tags written alongside a state snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub value: String,
    pub operation: String,
}

impl Metadata {
    pub fn new(value: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            operation: operation.into(),
        }
    }

    /// Metadata carrying only an operation name.
    pub fn operation(operation: impl Into<String>) -> Self {
        Self::new("", operation)
    }
}

/// A state snapshot as held by a store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredState<S> {
    pub state: S,
    pub version: Version,
    #[serde(default)]
    pub metadata: Metadata,
}

impl<S> StoredState<S> {
    pub fn new(state: S, version: Version, metadata: Metadata) -> Self {
        Self {
            state,
            version,
            metadata,
        }
    }
}

/// Confirmation returned by a store for an accepted write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteReceipt {
    pub version: Version,
    pub written_at: DateTime<Utc>,
}

impl WriteReceipt {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            written_at: Utc::now(),
        }
    }
}
