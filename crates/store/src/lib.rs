mod document;
mod store;

pub use document::{Document, ManagerPrefs, SCHEMA_VERSION};
pub use store::Store;

use convoy_core::CoreError;
use thiserror::Error;

/// Store-level failures. `ResetRequired` is the fatal-only case: the document
/// is corrupt beyond what the migration ladder can recover, and the caller
/// must explicitly `reset()` before the store is usable again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store io failure: {0}")]
    Io(String),
    #[error("store reset required: {0}")]
    ResetRequired(String),
}

impl From<StoreError> for CoreError {
    fn from(error: StoreError) -> Self {
        CoreError::Storage(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
