//! In-memory transactional substate store.
//!
//! Committed state lives behind a `parking_lot::RwLock`; a write
//! transaction stages a delta (new substates, spin-downs, virtual-down
//! tombstones, processed records, metadata) and applies it atomically
//! on commit. Dropping a transaction discards the delta untouched.
//!
//! Consumed substates are retained as tombstones rather than removed,
//! so the full spin history of every id stays auditable and a virtual
//! substate can never be consumed twice.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;

use spindle_types::{Spin, SubstateId, TxnId};

use crate::traits::{
    EngineStore, ProcessedRecord, StoreError, StoreTransaction, SubstateOp, SubstateReadView,
};

#[derive(Debug, Clone)]
struct Entry {
    type_tag: u8,
    payload: Vec<u8>,
    spin: Spin,
}

#[derive(Debug)]
struct Committed<M> {
    substates: BTreeMap<SubstateId, Entry>,
    virtual_downs: HashSet<SubstateId>,
    processed: Vec<ProcessedRecord>,
    txn_ids: HashSet<TxnId>,
    metadata: Option<M>,
    spin_history: HashMap<SubstateId, Vec<Spin>>,
}

impl<M> Default for Committed<M> {
    fn default() -> Self {
        Self {
            substates: BTreeMap::new(),
            virtual_downs: HashSet::new(),
            processed: Vec::new(),
            txn_ids: HashSet::new(),
            metadata: None,
            spin_history: HashMap::new(),
        }
    }
}

/// In-memory substate store.
pub struct MemStore<M> {
    inner: RwLock<Committed<M>>,
}

impl<M> Default for MemStore<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MemStore<M> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Committed::default()),
        }
    }

    /// Returns every committed processed record, in commit order.
    #[must_use]
    pub fn processed_records(&self) -> Vec<ProcessedRecord> {
        self.inner.read().processed.clone()
    }

    /// Observed spin sequence of a substate id across all committed
    /// transactions, in commit order.
    #[must_use]
    pub fn spin_history(&self, id: &SubstateId) -> Vec<Spin> {
        self.inner
            .read()
            .spin_history
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Deterministic byte dump of the committed substate table,
    /// tombstones included. Used by tests to assert that a failed
    /// batch left the store untouched.
    #[must_use]
    pub fn audit_dump(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read();
        let mut dump: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (id, entry) in &inner.substates {
            let mut value = vec![entry.spin.as_u8(), entry.type_tag];
            value.extend_from_slice(&entry.payload);
            dump.push((id.to_bytes(), value));
        }
        let mut virtuals: Vec<Vec<u8>> = inner.virtual_downs.iter().map(SubstateId::to_bytes).collect();
        virtuals.sort();
        for key in virtuals {
            dump.push((key, vec![Spin::Down.as_u8()]));
        }
        for record in &inner.processed {
            dump.push((record.txn_id.as_bytes().to_vec(), record.raw.clone()));
        }
        dump
    }
}

impl<M: Clone + Send + Sync> EngineStore<M> for MemStore<M> {
    type Transaction<'a>
        = MemTransaction<'a, M>
    where
        Self: 'a;

    fn create_transaction(&self) -> MemTransaction<'_, M> {
        MemTransaction {
            store: self,
            delta: Delta::default(),
        }
    }

    fn substate(&self, id: &SubstateId) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        inner
            .substates
            .get(id)
            .filter(|entry| entry.spin == Spin::Up)
            .map(|entry| entry.payload.clone())
    }

    fn is_downed(&self, id: &SubstateId) -> bool {
        let inner = self.inner.read();
        inner.virtual_downs.contains(id)
            || inner
                .substates
                .get(id)
                .is_some_and(|entry| entry.spin == Spin::Down)
    }

    fn indexed(&self, type_tag: u8) -> Vec<(SubstateId, Vec<u8>)> {
        let inner = self.inner.read();
        inner
            .substates
            .iter()
            .filter(|(_, entry)| entry.spin == Spin::Up && entry.type_tag == type_tag)
            .map(|(id, entry)| (id.clone(), entry.payload.clone()))
            .collect()
    }

    fn metadata(&self) -> Option<M> {
        self.inner.read().metadata.clone()
    }
}

#[derive(Debug)]
struct Delta<M> {
    ups: BTreeMap<SubstateId, Entry>,
    downs: HashSet<SubstateId>,
    virtual_downs: HashSet<SubstateId>,
    records: Vec<ProcessedRecord>,
    txn_ids: HashSet<TxnId>,
    metadata: Option<M>,
}

impl<M> Default for Delta<M> {
    fn default() -> Self {
        Self {
            ups: BTreeMap::new(),
            downs: HashSet::new(),
            virtual_downs: HashSet::new(),
            records: Vec::new(),
            txn_ids: HashSet::new(),
            metadata: None,
        }
    }
}

/// Write transaction over a [`MemStore`].
pub struct MemTransaction<'a, M> {
    store: &'a MemStore<M>,
    delta: Delta<M>,
}

impl<M: Clone + Send + Sync> MemTransaction<'_, M> {
    fn apply_op(&mut self, op: &SubstateOp) -> Result<(), StoreError> {
        match op.spin {
            Spin::Up => {
                let committed = self.store.inner.read();
                if committed.substates.contains_key(&op.id) || self.delta.ups.contains_key(&op.id) {
                    return Err(StoreError::SubstateExists { id: op.id.clone() });
                }
                drop(committed);
                self.delta.ups.insert(
                    op.id.clone(),
                    Entry {
                        type_tag: op.type_tag,
                        payload: op.payload.clone().unwrap_or_default(),
                        spin: Spin::Up,
                    },
                );
                Ok(())
            }
            Spin::Down if op.id.is_virtual() => {
                if self.is_downed(&op.id) {
                    return Err(StoreError::SubstateNotLive { id: op.id.clone() });
                }
                self.delta.virtual_downs.insert(op.id.clone());
                Ok(())
            }
            Spin::Down => {
                // A down of a substate staged earlier in this same
                // store transaction keeps its entry as a tombstone.
                if let Some(entry) = self.delta.ups.get_mut(&op.id) {
                    if entry.spin != Spin::Up {
                        return Err(StoreError::SubstateNotLive { id: op.id.clone() });
                    }
                    entry.spin = Spin::Down;
                    return Ok(());
                }
                if self.delta.downs.contains(&op.id) {
                    return Err(StoreError::SubstateNotLive { id: op.id.clone() });
                }
                let committed = self.store.inner.read();
                let live = committed
                    .substates
                    .get(&op.id)
                    .is_some_and(|entry| entry.spin == Spin::Up);
                drop(committed);
                if !live {
                    return Err(StoreError::SubstateNotLive { id: op.id.clone() });
                }
                self.delta.downs.insert(op.id.clone());
                Ok(())
            }
            Spin::Neutral => Err(StoreError::SubstateNotLive { id: op.id.clone() }),
        }
    }
}

impl<M: Clone + Send + Sync> SubstateReadView for MemTransaction<'_, M> {
    fn substate(&self, id: &SubstateId) -> Option<Vec<u8>> {
        if let Some(entry) = self.delta.ups.get(id) {
            return (entry.spin == Spin::Up).then(|| entry.payload.clone());
        }
        if self.delta.downs.contains(id) || self.delta.virtual_downs.contains(id) {
            return None;
        }
        self.store.substate(id)
    }

    fn is_downed(&self, id: &SubstateId) -> bool {
        if let Some(entry) = self.delta.ups.get(id) {
            return entry.spin == Spin::Down;
        }
        self.delta.downs.contains(id)
            || self.delta.virtual_downs.contains(id)
            || self.store.is_downed(id)
    }

    fn indexed(&self, type_tag: u8) -> Vec<(SubstateId, Vec<u8>)> {
        let mut merged: BTreeMap<SubstateId, Vec<u8>> =
            self.store.indexed(type_tag).into_iter().collect();
        for id in &self.delta.downs {
            merged.remove(id);
        }
        for (id, entry) in &self.delta.ups {
            if entry.spin == Spin::Up && entry.type_tag == type_tag {
                merged.insert(id.clone(), entry.payload.clone());
            }
        }
        merged.into_iter().collect()
    }
}

impl<M: Clone + Send + Sync> StoreTransaction<M> for MemTransaction<'_, M> {
    fn put_processed(&mut self, record: &ProcessedRecord) -> Result<(), StoreError> {
        {
            let committed = self.store.inner.read();
            if committed.txn_ids.contains(&record.txn_id)
                || self.delta.txn_ids.contains(&record.txn_id)
            {
                return Err(StoreError::DuplicateTransaction {
                    txn_id: record.txn_id,
                });
            }
        }
        for op in &record.ops {
            self.apply_op(op)?;
        }
        self.delta.txn_ids.insert(record.txn_id);
        self.delta.records.push(record.clone());
        Ok(())
    }

    fn put_metadata(&mut self, metadata: M) {
        self.delta.metadata = Some(metadata);
    }

    fn metadata(&self) -> Option<M> {
        self.delta
            .metadata
            .clone()
            .or_else(|| self.store.metadata())
    }

    fn commit(self) -> Result<(), StoreError> {
        let mut inner = self.store.inner.write();
        for (id, entry) in self.delta.ups {
            let history = inner.spin_history.entry(id.clone()).or_default();
            history.push(Spin::Up);
            if entry.spin == Spin::Down {
                history.push(Spin::Down);
            }
            inner.substates.insert(id, entry);
        }
        for id in self.delta.downs {
            if let Some(entry) = inner.substates.get_mut(&id) {
                entry.spin = Spin::Down;
            }
            inner.spin_history.entry(id).or_default().push(Spin::Down);
        }
        for id in self.delta.virtual_downs {
            inner.spin_history.entry(id.clone()).or_default().push(Spin::Down);
            inner.virtual_downs.insert(id);
        }
        for record in self.delta.records {
            inner.txn_ids.insert(record.txn_id);
            inner.processed.push(record);
        }
        if let Some(metadata) = self.delta.metadata {
            inner.metadata = Some(metadata);
        }
        Ok(())
    }
}
