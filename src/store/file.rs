use super::{StateStore, check_next_version};
use crate::core::{Metadata, StorageError, StoreResult, StoredState, Version, WriteReceipt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord<S> {
    id: String,
    version: Version,
    #[serde(default)]
    metadata: Metadata,
    written_at: DateTime<Utc>,
    state: S,
}

/// Only the fields needed for the version check; the state is skipped.
#[derive(Debug, Deserialize)]
struct RecordHeader {
    version: Version,
}

/// Stores each identity as one JSON document under `root`.
///
/// Writes go through a temp file and a rename, so a reader never observes a
/// half-written record. Version checks are serialized within this process;
/// two processes sharing a directory are not coordinated.
pub struct JsonFileStateStore<S> {
    root: PathBuf,
    write_lock: Mutex<()>,
    _state: PhantomData<fn() -> S>,
}

impl<S> JsonFileStateStore<S> {
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|err| {
            StorageError::Unavailable(format!(
                "Failed to create store directory '{}': {}",
                root.display(),
                err
            ))
        })?;

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            _state: PhantomData,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record holding `id`.
    pub fn record_path(&self, id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", encode_file_stem(id), RECORD_EXTENSION))
    }

    async fn read_bytes(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.record_path(id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Failure(format!(
                "Failed to read '{}': {}",
                path.display(),
                err
            ))),
        }
    }
}

#[async_trait]
impl<S> StateStore<S> for JsonFileStateStore<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn read(&self, id: &str) -> StoreResult<StoredState<S>> {
        let Some(bytes) = self.read_bytes(id).await? else {
            return Err(StorageError::NotFound(id.to_string()));
        };

        let record: StateRecord<S> = serde_json::from_slice(&bytes).map_err(|err| {
            StorageError::Failure(format!("Corrupt record for '{}': {}", id, err))
        })?;
        Ok(StoredState::new(record.state, record.version, record.metadata))
    }

    async fn write(
        &self,
        id: &str,
        state: S,
        version: Version,
        metadata: Metadata,
    ) -> StoreResult<WriteReceipt> {
        let _guard = self.write_lock.lock().await;

        let recorded = match self.read_bytes(id).await? {
            Some(bytes) => {
                let header: RecordHeader = serde_json::from_slice(&bytes).map_err(|err| {
                    StorageError::Failure(format!("Corrupt record for '{}': {}", id, err))
                })?;
                Some(header.version)
            }
            None => None,
        };
        check_next_version(id, recorded, version)?;

        let receipt = WriteReceipt::new(version);
        let record = StateRecord {
            id: id.to_string(),
            version,
            metadata,
            written_at: receipt.written_at,
            state,
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|err| {
            StorageError::Failure(format!("Failed to encode state for '{}': {}", id, err))
        })?;

        atomic_write(&self.record_path(id), &bytes).await?;
        Ok(receipt)
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await.map_err(|err| {
        StorageError::Unavailable(format!(
            "Failed to write temp file '{}': {}",
            tmp.display(),
            err
        ))
    })?;

    fs::rename(&tmp, path).await.map_err(|err| {
        StorageError::Unavailable(format!(
            "Failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })
}

/// Maps an identity to a file stem that is unique and filesystem-safe.
fn encode_file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    if stem.is_empty() {
        stem.push('%');
    }
    stem
}
