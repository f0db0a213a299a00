//! Recommended API entrypoints grouped by abstraction level.
//!
//! `dx` covers what an entity author needs day to day.
//! `advanced` exposes the ordering core for custom drivers.

pub mod dx {
    //! Stable surface for writing and running entities.
    pub use crate::{
        EntityError, EntityHandle, EntityPolicy, EntityWorker, Handled, InMemoryStateStore,
        JsonFileStateStore, Metadata, Preserve, Result, StateStore, StatefulEntity, Version,
        spawn_entity,
    };
    pub use crate::entity::EntityContext;
}

pub mod advanced {
    //! Escape hatch for driving [`EntityMachine`](crate::entity::EntityMachine)
    //! without the tokio runtime in this crate.
    pub use crate::entity::{
        CompletionCorrelator, CompletionToken, CorrelationId, DurabilityRequest,
        DurabilityResponse, EntityMachine, EntityStatus, Envelope, PendingBuffer,
    };
}
