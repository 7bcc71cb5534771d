use batch_common::error::{CatalogError, StoreError};
use thiserror::Error;

/// Infrastructure errors that abort the worker's current poll cycle.
///
/// Job-level outcomes (bad input, engine failures, per-request errors) are
/// not represented here; those become terminal job states and result lines,
/// not control flow.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not serialize result line: {0}")]
    Serialization(#[from] serde_json::Error),
}
