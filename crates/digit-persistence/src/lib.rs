//! Operation log persistence.
//!
//! Settled trades are handed to an [`OperationSink`]. The production sink
//! is a [`JournaledStore`]: records go to the REST table first and fall
//! back to a local JSON Lines journal when the insert fails.

pub mod error;
pub mod journal;
pub mod journaled;
pub mod rest;

pub use error::{PersistenceError, PersistenceResult};
pub use journal::JsonlJournal;
pub use journaled::{JournaledStats, JournaledStore};
pub use rest::{PersistenceConfig, RestOperationStore};

use digit_core::Operation;
use futures_util::future::BoxFuture;

/// Destination for settled operation records.
pub trait OperationSink: Send + Sync {
    fn persist<'a>(&'a self, record: &'a Operation) -> BoxFuture<'a, PersistenceResult<()>>;
}
