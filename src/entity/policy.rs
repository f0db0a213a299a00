use crate::core::{EntityError, Result};
use serde::{Deserialize, Serialize};

/// How the startup read treats a missing record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestorePolicy {
    /// When true (the default) a not-found read means "new entity" and the
    /// entity starts at version 0. When false it is a fatal restore failure,
    /// for entities that must already exist.
    pub ignore_not_found: bool,
}

impl Default for RestorePolicy {
    fn default() -> Self {
        Self {
            ignore_not_found: true,
        }
    }
}

/// Limits on the pending-operation buffer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BufferPolicy {
    /// Log a warning each time the buffer grows past a new multiple of this
    /// length. `0` disables the warning. The buffer itself is never capped.
    pub warn_threshold: usize,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            warn_threshold: 1024,
        }
    }
}

/// Operational policy for one entity.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct EntityPolicy {
    #[serde(default)]
    pub restore: RestorePolicy,
    #[serde(default)]
    pub buffer: BufferPolicy,
}

impl EntityPolicy {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| EntityError::Config(format!("invalid entity policy: {}", err)))
    }

    pub fn require_existing(mut self) -> Self {
        self.restore.ignore_not_found = false;
        self
    }

    pub fn with_buffer_warn_threshold(mut self, threshold: usize) -> Self {
        self.buffer.warn_threshold = threshold;
        self
    }

    /// True when a buffer that just reached `len` items should be reported.
    pub(crate) fn buffer_crossed_threshold(&self, len: usize) -> bool {
        let threshold = self.buffer.warn_threshold;
        threshold > 0 && len > 0 && len % threshold == 0
    }
}
