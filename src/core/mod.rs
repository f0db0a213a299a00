pub mod error;
pub mod types;

pub use error::{EntityError, Result, StorageError, StoreResult};
pub use types::{Metadata, StoredState, Version, WriteReceipt};
