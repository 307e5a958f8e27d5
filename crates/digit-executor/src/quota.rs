//! Open-contract quota per contract kind.
//!
//! A buy first takes a [`Reservation`]; the reservation counts against the
//! quota until it is committed to a contract id or dropped. Concurrent buys
//! therefore never push a kind past its limit.

use crate::error::{ExecutorError, ExecutorResult};
use digit_core::{ContractId, ContractKind};
use digit_telemetry::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

#[derive(Default)]
struct QuotaInner {
    open: HashMap<ContractId, ContractKind>,
    reserved: HashMap<ContractKind, usize>,
}

impl QuotaInner {
    fn open_count(&self, kind: &ContractKind) -> usize {
        self.open.values().filter(|k| *k == kind).count()
    }

    fn in_use(&self, kind: &ContractKind) -> usize {
        self.open_count(kind) + self.reserved.get(kind).copied().unwrap_or(0)
    }

    fn unreserve(&mut self, kind: &ContractKind) {
        if let Some(n) = self.reserved.get_mut(kind) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.reserved.remove(kind);
            }
        }
    }
}

/// What [`OpenContracts::reconcile`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Reconciled {
    pub added: usize,
    pub released: usize,
}

pub struct OpenContracts {
    limit_per_kind: usize,
    inner: Mutex<QuotaInner>,
}

/// Slot held by an in-flight buy.
pub struct Reservation<'a> {
    owner: &'a OpenContracts,
    kind: ContractKind,
    committed: bool,
}

impl Reservation<'_> {
    /// Turn the slot into an open contract.
    pub fn commit(mut self, contract_id: ContractId) {
        self.committed = true;
        let count = {
            let mut inner = self.owner.inner.lock();
            inner.unreserve(&self.kind);
            inner.open.insert(contract_id, self.kind.clone());
            inner.open_count(&self.kind)
        };
        Metrics::open_contracts(self.kind.as_str(), count);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.owner.inner.lock().unreserve(&self.kind);
        }
    }
}

impl OpenContracts {
    pub fn new(limit_per_kind: usize) -> Self {
        Self {
            limit_per_kind,
            inner: Mutex::new(QuotaInner::default()),
        }
    }

    pub fn limit_per_kind(&self) -> usize {
        self.limit_per_kind
    }

    /// Fails fast with `QuotaExceeded` when `kind` has no free slot.
    pub fn check(&self, kind: &ContractKind) -> ExecutorResult<()> {
        let in_use = self.inner.lock().in_use(kind);
        if in_use >= self.limit_per_kind {
            return Err(self.exceeded(kind, in_use));
        }
        Ok(())
    }

    pub fn reserve(&self, kind: &ContractKind) -> ExecutorResult<Reservation<'_>> {
        let mut inner = self.inner.lock();
        let in_use = inner.in_use(kind);
        if in_use >= self.limit_per_kind {
            return Err(self.exceeded(kind, in_use));
        }
        *inner.reserved.entry(kind.clone()).or_insert(0) += 1;
        Ok(Reservation {
            owner: self,
            kind: kind.clone(),
            committed: false,
        })
    }

    fn exceeded(&self, kind: &ContractKind, open: usize) -> ExecutorError {
        debug!(kind = %kind, open, limit = self.limit_per_kind, "Quota full");
        ExecutorError::QuotaExceeded {
            kind: kind.clone(),
            open,
            limit: self.limit_per_kind,
        }
    }

    /// Track a contract discovered outside `buy` (portfolio resync).
    ///
    /// Returns false when it was already tracked.
    pub fn register(&self, contract_id: ContractId, kind: ContractKind) -> bool {
        let (inserted, count) = {
            let mut inner = self.inner.lock();
            let inserted = inner.open.insert(contract_id, kind.clone()).is_none();
            (inserted, inner.open_count(&kind))
        };
        Metrics::open_contracts(kind.as_str(), count);
        inserted
    }

    pub fn remove(&self, contract_id: &ContractId) -> Option<ContractKind> {
        let (kind, count) = {
            let mut inner = self.inner.lock();
            let kind = inner.open.remove(contract_id)?;
            let count = inner.open_count(&kind);
            (kind, count)
        };
        Metrics::open_contracts(kind.as_str(), count);
        Some(kind)
    }

    /// Align the open set with the broker's unsold contracts.
    ///
    /// Every `unsold` contract is tracked. Ids from `candidates` that the
    /// broker no longer lists are released. Ids committed after
    /// `candidates` was taken are never released here.
    pub fn reconcile(
        &self,
        candidates: &HashSet<ContractId>,
        unsold: impl IntoIterator<Item = (ContractId, ContractKind)>,
    ) -> Reconciled {
        let mut outcome = Reconciled::default();
        let counts: Vec<(ContractKind, usize)> = {
            let mut inner = self.inner.lock();
            let mut touched = BTreeSet::new();
            let mut listed = HashSet::new();

            for (contract_id, kind) in unsold {
                listed.insert(contract_id.clone());
                if inner.open.insert(contract_id, kind.clone()).is_none() {
                    outcome.added += 1;
                    touched.insert(kind);
                }
            }
            for contract_id in candidates.difference(&listed) {
                if let Some(kind) = inner.open.remove(contract_id) {
                    info!(contract_id = %contract_id, kind = %kind, "Releasing contract the broker no longer lists");
                    outcome.released += 1;
                    touched.insert(kind);
                }
            }
            touched
                .into_iter()
                .map(|kind| {
                    let count = inner.open_count(&kind);
                    (kind, count)
                })
                .collect()
        };
        for (kind, count) in counts {
            Metrics::open_contracts(kind.as_str(), count);
        }
        outcome
    }

    /// Ids currently tracked as open.
    pub fn ids(&self) -> HashSet<ContractId> {
        self.inner.lock().open.keys().cloned().collect()
    }

    pub fn contains(&self, contract_id: &ContractId) -> bool {
        self.inner.lock().open.contains_key(contract_id)
    }

    pub fn count(&self, kind: &ContractKind) -> usize {
        self.inner.lock().open_count(kind)
    }

    pub fn total(&self) -> usize {
        self.inner.lock().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Open contracts per kind.
    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        let inner = self.inner.lock();
        let mut counts = BTreeMap::new();
        for kind in inner.open.values() {
            *counts.entry(kind.to_string()).or_insert(0) += 1;
        }
        counts
    }
}
