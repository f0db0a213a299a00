use super::types::Version;
use thiserror::Error;

/// Failure reported by a durability client.
///
/// `NotFound` is only an error from the store's point of view; an entity
/// restoring for the first time treats it as "fresh".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("State '{0}' not found")]
    NotFound(String),

    #[error("Version conflict for '{id}': expected to write version {expected}, store has version {actual}")]
    Conflict {
        id: String,
        expected: Version,
        actual: Version,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Storage failure: {0}")]
    Failure(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    #[error("State not restored for '{id}': {source}")]
    RestoreFailed { id: String, source: StorageError },

    #[error("State not preserved for '{id}' at version {version}: {source}")]
    PreserveFailed {
        id: String,
        version: Version,
        source: StorageError,
    },

    #[error("Entity '{0}' is unavailable after a fatal durability failure")]
    Unavailable(String),

    #[error("Entity '{0}' has stopped")]
    Stopped(String),

    #[error("Entity '{0}' completed the operation without a reply")]
    NoReply(String),

    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EntityError {
    /// True for failures after which the entity must not serve further requests.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RestoreFailed { .. } | Self::PreserveFailed { .. } | Self::Unavailable(_)
        )
    }

    /// The storage failure behind a restore or preserve failure, if any.
    pub fn storage_cause(&self) -> Option<&StorageError> {
        match self {
            Self::RestoreFailed { source, .. } | Self::PreserveFailed { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EntityError>;

pub type StoreResult<T> = std::result::Result<T, StorageError>;
