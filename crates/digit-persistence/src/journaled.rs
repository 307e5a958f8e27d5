//! Remote store with a local journal fallback.

use crate::error::PersistenceResult;
use crate::journal::JsonlJournal;
use crate::OperationSink;
use digit_core::Operation;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JournaledStats {
    pub inserted: u64,
    pub journaled: u64,
    pub lost: u64,
}

/// Each record is inserted remotely at most once from this process.
/// Records the remote rejects are journaled instead.
pub struct JournaledStore {
    remote: Arc<dyn OperationSink>,
    journal: JsonlJournal,
    inserted: AtomicU64,
    journaled: AtomicU64,
    lost: AtomicU64,
}

impl JournaledStore {
    pub fn new(remote: Arc<dyn OperationSink>, journal: JsonlJournal) -> Self {
        Self {
            remote,
            journal,
            inserted: AtomicU64::new(0),
            journaled: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    pub fn journal(&self) -> &JsonlJournal {
        &self.journal
    }

    pub async fn store(&self, record: &Operation) -> PersistenceResult<()> {
        let remote_err = match self.remote.persist(record).await {
            Ok(()) => {
                self.inserted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(error = %remote_err, "Remote insert failed, journaling record");
        match self.journal.append(record) {
            Ok(()) => {
                self.journaled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.lost.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, ?record, "Operation record lost");
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> JournaledStats {
        JournaledStats {
            inserted: self.inserted.load(Ordering::Relaxed),
            journaled: self.journaled.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
        }
    }
}

impl OperationSink for JournaledStore {
    fn persist<'a>(&'a self, record: &'a Operation) -> BoxFuture<'a, PersistenceResult<()>> {
        Box::pin(self.store(record))
    }
}
