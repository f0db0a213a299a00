// ============================================================================
// Stateful Entity Library
// ============================================================================
//
// Long-lived, single-writer entities whose state lives in an external store
// under optimistic versioning. One durability call at a time per entity;
// everything that arrives meanwhile is held and replayed in arrival order.

pub mod core;
pub mod entity;
pub mod prelude;
pub mod runtime;
pub mod store;

// Re-export main types for convenience
pub use crate::core::{
    EntityError, Metadata, Result, StorageError, StoreResult, StoredState, Version, WriteReceipt,
};
pub use crate::entity::{
    EntityContext, EntityPolicy, EntityStats, EntityStatus, Handled, Preserve, StatefulEntity,
};
pub use crate::runtime::{EntityHandle, EntityWorker, spawn_entity};
pub use crate::store::{InMemoryStateStore, JsonFileStateStore, StateStore};
