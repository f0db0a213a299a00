//! Durability clients consumed by entities.
//!
//! A store is shared by many entities. It keeps no ordering between
//! identities; per-identity ordering is the entity's job.

pub mod file;
pub mod memory;

pub use file::JsonFileStateStore;
pub use memory::InMemoryStateStore;

use crate::core::{Metadata, StorageError, StoreResult, StoredState, Version, WriteReceipt};
use async_trait::async_trait;

/// Read and write access to versioned entity state.
///
/// The store is the authority on optimistic concurrency: `write` must reject
/// a `version` that is not exactly one past the recorded version for `id`
/// with [`StorageError::Conflict`].
#[async_trait]
pub trait StateStore<S>: Send + Sync
where
    S: Send + Sync + 'static,
{
    /// Reads the latest state for `id`, or [`StorageError::NotFound`].
    async fn read(&self, id: &str) -> StoreResult<StoredState<S>>;

    /// Writes `state` as `version` of `id`.
    async fn write(
        &self,
        id: &str,
        state: S,
        version: Version,
        metadata: Metadata,
    ) -> StoreResult<WriteReceipt>;
}

/// Accepts `version` only when it directly follows `recorded`. Nothing
/// follows `Version::MAX`.
pub(crate) fn check_next_version(
    id: &str,
    recorded: Option<Version>,
    version: Version,
) -> StoreResult<()> {
    let actual = recorded.unwrap_or(0);
    if version == 0 || actual.checked_add(1) != Some(version) {
        return Err(StorageError::Conflict {
            id: id.to_string(),
            expected: version,
            actual,
        });
    }
    Ok(())
}
