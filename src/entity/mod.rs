//! Single-writer entities with durable, optimistically versioned state.
//!
//! A concrete entity implements [`StatefulEntity`]. It decides what each
//! command does and returns a [`Handled`] value. The [`EntityMachine`] owns
//! everything about ordering: it restores state once, issues at most one
//! durability call at a time, and holds commands that arrive in between.

pub mod buffer;
pub mod correlator;
pub mod machine;
pub mod policy;

pub use buffer::PendingBuffer;
pub use correlator::{CompletionCorrelator, CompletionToken, CorrelationId, ReplyTo};
pub use machine::{
    DurabilityRequest, DurabilityResponse, EntityMachine, EntityStats, EntityStatus, Envelope,
};
pub use policy::{BufferPolicy, EntityPolicy, RestorePolicy};

use crate::core::{Metadata, Result, Version};

/// Computes a caller's reply from the entity after a write has been applied.
pub type CompletionSupplier<E> =
    Box<dyn FnOnce(&E) -> <E as StatefulEntity>::Reply + Send + 'static>;

/// Domain behavior of an entity.
pub trait StatefulEntity: Send + Sized + 'static {
    type State: Clone + Send + Sync + 'static;
    type Command: Send + 'static;
    type Reply: Send + 'static;

    /// Stable identity; must not change for the life of the entity.
    fn id(&self) -> &str;

    /// Installs durably confirmed state.
    ///
    /// Called exactly once per successful restore or write, before any
    /// caller completion and before buffered commands resume.
    fn apply_state(&mut self, state: Self::State);

    /// Executes one command. Only called while no durability call is
    /// outstanding, so the entity always sees its latest confirmed state.
    ///
    /// Takes `&self`: new state reaches the entity only through
    /// [`apply_state`](Self::apply_state) once the store has confirmed it.
    /// An `Err` is delivered to the caller.
    fn handle(&self, command: Self::Command, ctx: &EntityContext<'_>) -> Result<Handled<Self>>;
}

/// Read-only view of the machine handed to [`StatefulEntity::handle`].
#[derive(Debug, Clone, Copy)]
pub struct EntityContext<'a> {
    pub id: &'a str,
    pub version: Version,
}

/// What a command asks the machine to do.
pub enum Handled<E: StatefulEntity> {
    /// Answer now; no storage involved.
    Reply(E::Reply),
    /// Write new state and suspend until the store answers.
    Preserve(Preserve<E>),
}

impl<E: StatefulEntity> Handled<E> {
    pub fn reply(reply: E::Reply) -> Self {
        Self::Reply(reply)
    }

    pub fn preserve(state: E::State) -> Preserve<E> {
        Preserve::new(state)
    }
}

impl<E: StatefulEntity> From<Preserve<E>> for Handled<E> {
    fn from(preserve: Preserve<E>) -> Self {
        Self::Preserve(preserve)
    }
}

/// A request to persist new state.
///
/// `Preserve::new(state)` alone writes with empty metadata and no caller
/// reply; the builder methods fill in the rest.
pub struct Preserve<E: StatefulEntity> {
    pub(crate) state: E::State,
    pub(crate) metadata: Metadata,
    pub(crate) supplier: Option<CompletionSupplier<E>>,
}

impl<E: StatefulEntity> Preserve<E> {
    pub fn new(state: E::State) -> Self {
        Self {
            state,
            metadata: Metadata::default(),
            supplier: None,
        }
    }

    pub fn metadata_value(mut self, value: impl Into<String>) -> Self {
        self.metadata.value = value.into();
        self
    }

    /// Descriptive name of the operation that produced this state.
    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.metadata.operation = operation.into();
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replies to the caller with `supplier(&entity)` once the write is
    /// confirmed and applied.
    pub fn and_then<F>(mut self, supplier: F) -> Self
    where
        F: FnOnce(&E) -> E::Reply + Send + 'static,
    {
        self.supplier = Some(Box::new(supplier));
        self
    }

    pub fn state(&self) -> &E::State {
        &self.state
    }
}

impl<E: StatefulEntity> std::fmt::Debug for Preserve<E>
where
    E::State: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preserve")
            .field("state", &self.state)
            .field("metadata", &self.metadata)
            .field("supplier", &self.supplier.is_some())
            .finish()
    }
}
