//! Proposal quote cache.
//!
//! Entries expire `ttl` after insertion. Expired entries are never returned;
//! a lookup evicts its own key and every insert sweeps the rest.

use digit_telemetry::Metrics;
use digit_ws::ProposalQuote;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    quote: ProposalQuote,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ProposalCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ProposalCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<ProposalQuote> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<ProposalQuote> {
        let mut entries = self.entries.lock();
        let found = match entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.inserted_at) <= self.ttl => {
                Some(entry.quote.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        drop(entries);

        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Metrics::proposal_cache(found.is_some());
        found
    }

    pub fn put(&self, key: impl Into<String>, quote: ProposalQuote) {
        self.put_at(key, quote, Instant::now());
    }

    pub fn put_at(&self, key: impl Into<String>, quote: ProposalQuote, now: Instant) {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| now.saturating_duration_since(entry.inserted_at) <= self.ttl);
        entries.insert(
            key.into(),
            Entry {
                quote,
                inserted_at: now,
            },
        );
    }

    /// Drop `key`; a bought proposal id cannot be bought again.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
