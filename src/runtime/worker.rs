use super::EntityHandle;
use crate::core::{EntityError, Result};
use crate::entity::StatefulEntity;
use tokio::task::JoinHandle;
use tracing::warn;

/// Owns the task of a running entity.
///
/// Dropping the worker aborts the entity; use [`stop`](Self::stop) for an
/// orderly exit or [`join`](Self::join) to wait for a fatal failure.
pub struct EntityWorker<E: StatefulEntity> {
    handle: EntityHandle<E>,
    join_handle: Option<JoinHandle<Result<()>>>,
}

impl<E: StatefulEntity> EntityWorker<E> {
    pub(crate) fn new(handle: EntityHandle<E>, join_handle: JoinHandle<Result<()>>) -> Self {
        Self {
            handle,
            join_handle: Some(join_handle),
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn handle(&self) -> EntityHandle<E> {
        self.handle.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|join_handle| join_handle.is_finished())
            .unwrap_or(true)
    }

    /// Lets already queued messages finish, then waits for the task to exit.
    ///
    /// Returns the fatal error if the entity failed before or while stopping.
    pub async fn stop(mut self) -> Result<()> {
        // Fails only when the task already exited; `wait` reports why.
        let _ = self.handle.shutdown();
        self.wait().await
    }

    /// Waits for the task to exit on its own.
    ///
    /// `Ok` after a graceful stop; the escalated error after a fatal
    /// durability failure.
    pub async fn join(mut self) -> Result<()> {
        self.wait().await
    }

    async fn wait(&mut self) -> Result<()> {
        let Some(join_handle) = self.join_handle.take() else {
            return Ok(());
        };

        join_handle.await.map_err(|err| {
            warn!(entity = %self.handle.id(), error = %err, "entity task did not complete");
            EntityError::Stopped(self.handle.id().to_string())
        })?
    }
}

impl<E: StatefulEntity> Drop for EntityWorker<E> {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
