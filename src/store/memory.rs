use super::{StateStore, check_next_version};
use crate::core::{Metadata, StorageError, StoreResult, StoredState, Version, WriteReceipt};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::sleep;

/// One accepted write, in acceptance order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteLogEntry {
    pub id: String,
    pub version: Version,
    pub metadata: Metadata,
}

#[derive(Debug, Default)]
struct InjectedFaults {
    reads: VecDeque<StorageError>,
    writes: VecDeque<StorageError>,
}

/// Process-local state store.
///
/// Besides serving as a real store for single-process deployments, it carries
/// controls for exercising entities under slow or failing storage:
/// [`hold_writes`](Self::hold_writes) parks writes until released, and
/// `fail_next_*` queues failures that are returned instead of touching state.
pub struct InMemoryStateStore<S> {
    states: Mutex<HashMap<String, StoredState<S>>>,
    write_log: Mutex<Vec<WriteLogEntry>>,
    faults: Mutex<InjectedFaults>,
    write_gate: watch::Sender<bool>,
    latency: Option<Duration>,
}

impl<S> Default for InMemoryStateStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> InMemoryStateStore<S> {
    pub fn new() -> Self {
        let (write_gate, _) = watch::channel(true);
        Self {
            states: Mutex::new(HashMap::new()),
            write_log: Mutex::new(Vec::new()),
            faults: Mutex::new(InjectedFaults::default()),
            write_gate,
            latency: None,
        }
    }

    /// Delays every read and write by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Parks writes issued from now on until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.write_gate.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.write_gate.send_replace(true);
    }

    pub async fn fail_next_read(&self, error: StorageError) {
        self.faults.lock().await.reads.push_back(error);
    }

    pub async fn fail_next_write(&self, error: StorageError) {
        self.faults.lock().await.writes.push_back(error);
    }

    /// Accepted writes in the order the store applied them.
    pub async fn write_log(&self) -> Vec<WriteLogEntry> {
        self.write_log.lock().await.clone()
    }

    pub async fn version_of(&self, id: &str) -> Option<Version> {
        self.states.lock().await.get(id).map(|stored| stored.version)
    }

    /// Installs `state` for `id` directly, bypassing version checks.
    pub async fn seed(&self, id: impl Into<String>, state: S, version: Version) {
        self.states
            .lock()
            .await
            .insert(id.into(), StoredState::new(state, version, Metadata::default()));
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            sleep(latency).await;
        }
    }

    async fn wait_for_write_gate(&self) {
        let mut gate = self.write_gate.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = gate.wait_for(|open| *open).await;
    }
}

impl<S: Clone> InMemoryStateStore<S> {
    pub async fn get(&self, id: &str) -> Option<StoredState<S>> {
        self.states.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl<S> StateStore<S> for InMemoryStateStore<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn read(&self, id: &str) -> StoreResult<StoredState<S>> {
        self.simulate_latency().await;

        if let Some(error) = self.faults.lock().await.reads.pop_front() {
            return Err(error);
        }

        self.states
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn write(
        &self,
        id: &str,
        state: S,
        version: Version,
        metadata: Metadata,
    ) -> StoreResult<WriteReceipt> {
        self.wait_for_write_gate().await;
        self.simulate_latency().await;

        if let Some(error) = self.faults.lock().await.writes.pop_front() {
            return Err(error);
        }

        let mut states = self.states.lock().await;
        check_next_version(id, states.get(id).map(|stored| stored.version), version)?;

        states.insert(
            id.to_string(),
            StoredState::new(state, version, metadata.clone()),
        );
        self.write_log.lock().await.push(WriteLogEntry {
            id: id.to_string(),
            version,
            metadata,
        });

        Ok(WriteReceipt::new(version))
    }
}
