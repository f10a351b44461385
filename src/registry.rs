//! The live set of known endpoints.
//!
//! The registry holds every [`EndpointRecord`] keyed by id, plus a derived index from model
//! name to the endpoints serving it. Both live behind one lock, so a reader never sees a
//! record without its index entries or the other way round. Writers are the static loader
//! and the discovery poller; everything else reads.
use crate::endpoint::{EndpointId, EndpointRecord, Source, SourceKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

#[derive(Debug)]
struct Entry {
    /// Insertion sequence, kept across updates so candidate order is stable.
    seq: u64,
    record: Arc<EndpointRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<EndpointId, Entry>,
    by_model: HashMap<String, BTreeMap<u64, EndpointId>>,
    next_seq: u64,
}

impl Inner {
    fn index(&mut self, seq: u64, record: &EndpointRecord) {
        for model in &record.models {
            self.by_model
                .entry(model.clone())
                .or_default()
                .insert(seq, record.id.clone());
        }
    }

    fn unindex(&mut self, seq: u64, record: &EndpointRecord) {
        for model in &record.models {
            if let Some(ids) = self.by_model.get_mut(model) {
                ids.remove(&seq);
                if ids.is_empty() {
                    self.by_model.remove(model);
                }
            }
        }
    }

    /// Returns true if the id was not present before.
    fn upsert(&mut self, record: EndpointRecord) -> bool {
        match self.records.remove(&record.id) {
            Some(old) => {
                self.unindex(old.seq, &old.record);
                self.index(old.seq, &record);
                self.records.insert(
                    record.id.clone(),
                    Entry {
                        seq: old.seq,
                        record: Arc::new(record),
                    },
                );
                false
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.index(seq, &record);
                self.records.insert(
                    record.id.clone(),
                    Entry {
                        seq,
                        record: Arc::new(record),
                    },
                );
                true
            }
        }
    }

    fn remove(&mut self, id: &EndpointId) -> Option<Arc<EndpointRecord>> {
        let entry = self.records.remove(id)?;
        self.unindex(entry.seq, &entry.record);
        Some(entry.record)
    }
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub refreshed: usize,
    pub removed: usize,
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} refreshed, {} removed",
            self.added, self.refreshed, self.removed
        )
    }
}

/// Shared handle to the endpoint registry. Cloning is cheap; all clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a record. Records without models are refused, since they could
    /// never serve anything; the return value says whether the record was stored.
    pub fn upsert(&self, record: EndpointRecord) -> bool {
        if record.models.is_empty() {
            warn!(endpoint = %record.id, "Refusing to register endpoint without models");
            return false;
        }
        debug!(endpoint = %record.id, url = %record.base_url, "Registering endpoint");
        self.write().upsert(record);
        true
    }

    pub fn remove(&self, id: &EndpointId) -> Option<Arc<EndpointRecord>> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            debug!(endpoint = %id, "Removed endpoint");
        }
        removed
    }

    pub fn get(&self, id: &EndpointId) -> Option<Arc<EndpointRecord>> {
        self.read()
            .records
            .get(id)
            .map(|entry| Arc::clone(&entry.record))
    }

    /// Every record, in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<EndpointRecord>> {
        let inner = self.read();
        let mut entries: Vec<&Entry> = inner.records.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| Arc::clone(&entry.record))
            .collect()
    }

    /// Records serving `model`, in insertion order.
    pub fn candidates_for(&self, model: &str) -> Vec<Arc<EndpointRecord>> {
        let inner = self.read();
        inner
            .by_model
            .get(model)
            .map(|ids| {
                ids.values()
                    .filter_map(|id| inner.records.get(id))
                    .map(|entry| Arc::clone(&entry.record))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every model served by at least one record.
    pub fn all_models(&self) -> BTreeSet<String> {
        self.read().by_model.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Replace everything `source` contributed with `fresh`, in one critical section.
    ///
    /// Records previously attributed to `source` but missing from `fresh` are removed, the
    /// rest are upserted. Static records and other sources' records are left alone. Records
    /// in `fresh` that belong to another source or carry no models are skipped.
    pub fn reconcile(&self, source: &SourceKey, fresh: Vec<EndpointRecord>) -> ReconcileSummary {
        let expected = Source::Discovered(source.clone());
        let fresh: Vec<EndpointRecord> = fresh
            .into_iter()
            .filter(|record| {
                if record.source != expected {
                    warn!(
                        endpoint = %record.id,
                        %source,
                        "Skipping record from a different source"
                    );
                    return false;
                }
                if record.models.is_empty() {
                    warn!(endpoint = %record.id, "Skipping discovered endpoint without models");
                    return false;
                }
                true
            })
            .collect();
        let keep: BTreeSet<&EndpointId> = fresh.iter().map(|record| &record.id).collect();

        let mut summary = ReconcileSummary::default();
        let mut inner = self.write();

        let stale: Vec<EndpointId> = inner
            .records
            .values()
            .filter(|entry| entry.record.source == expected && !keep.contains(&entry.record.id))
            .map(|entry| entry.record.id.clone())
            .collect();
        for id in stale {
            inner.remove(&id);
            summary.removed += 1;
        }

        for record in fresh {
            if inner.upsert(record) {
                summary.added += 1;
            } else {
                summary.refreshed += 1;
            }
        }

        summary
    }
}
