//! Copy-on-write overlay store for speculative branches.
//!
//! A [`TransientStore`] layers a private write set over a parent
//! [`EngineStore`]. Reads fall through to the parent's committed
//! state; writes land only in the overlay. Nothing is ever merged
//! back: dropping the overlay is the delete operation, an O(1)
//! discard. The parent store is shared by reference, never copied.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use spindle_types::{Spin, SubstateId, TxnId};

use crate::traits::{
    EngineStore, ProcessedRecord, StoreError, StoreTransaction, SubstateOp, SubstateReadView,
};

#[derive(Debug, Clone)]
struct OverlayEntry {
    type_tag: u8,
    payload: Vec<u8>,
    spin: Spin,
}

#[derive(Debug)]
struct Overlay<M> {
    ups: BTreeMap<SubstateId, OverlayEntry>,
    downs: HashSet<SubstateId>,
    virtual_downs: HashSet<SubstateId>,
    txn_ids: HashSet<TxnId>,
    metadata: Option<M>,
}

impl<M> Default for Overlay<M> {
    fn default() -> Self {
        Self {
            ups: BTreeMap::new(),
            downs: HashSet::new(),
            virtual_downs: HashSet::new(),
            txn_ids: HashSet::new(),
            metadata: None,
        }
    }
}

/// Branch overlay over a parent engine store.
pub struct TransientStore<M, S> {
    parent: Arc<S>,
    overlay: RwLock<Overlay<M>>,
}

impl<M, S> TransientStore<M, S> {
    /// Creates an empty overlay over `parent`.
    #[must_use]
    pub fn new(parent: Arc<S>) -> Self {
        Self {
            parent,
            overlay: RwLock::new(Overlay::default()),
        }
    }
}

impl<M: Clone + Send + Sync, S: EngineStore<M>> EngineStore<M> for TransientStore<M, S> {
    type Transaction<'a>
        = TransientTransaction<'a, M, S>
    where
        Self: 'a;

    fn create_transaction(&self) -> TransientTransaction<'_, M, S> {
        TransientTransaction {
            store: self,
            staged_ups: BTreeMap::new(),
            staged_downs: HashSet::new(),
            staged_virtual_downs: HashSet::new(),
            staged_txn_ids: HashSet::new(),
            staged_metadata: None,
        }
    }

    fn substate(&self, id: &SubstateId) -> Option<Vec<u8>> {
        let overlay = self.overlay.read();
        if let Some(entry) = overlay.ups.get(id) {
            return (entry.spin == Spin::Up).then(|| entry.payload.clone());
        }
        if overlay.downs.contains(id) || overlay.virtual_downs.contains(id) {
            return None;
        }
        drop(overlay);
        self.parent.substate(id)
    }

    fn is_downed(&self, id: &SubstateId) -> bool {
        let overlay = self.overlay.read();
        if let Some(entry) = overlay.ups.get(id) {
            return entry.spin == Spin::Down;
        }
        if overlay.downs.contains(id) || overlay.virtual_downs.contains(id) {
            return true;
        }
        drop(overlay);
        self.parent.is_downed(id)
    }

    fn indexed(&self, type_tag: u8) -> Vec<(SubstateId, Vec<u8>)> {
        let mut merged: BTreeMap<SubstateId, Vec<u8>> =
            self.parent.indexed(type_tag).into_iter().collect();
        let overlay = self.overlay.read();
        for id in &overlay.downs {
            merged.remove(id);
        }
        for (id, entry) in &overlay.ups {
            if entry.spin == Spin::Up && entry.type_tag == type_tag {
                merged.insert(id.clone(), entry.payload.clone());
            }
        }
        merged.into_iter().collect()
    }

    fn metadata(&self) -> Option<M> {
        self.overlay
            .read()
            .metadata
            .clone()
            .or_else(|| self.parent.metadata())
    }
}

/// Write transaction over a [`TransientStore`].
pub struct TransientTransaction<'a, M, S> {
    store: &'a TransientStore<M, S>,
    staged_ups: BTreeMap<SubstateId, OverlayEntry>,
    staged_downs: HashSet<SubstateId>,
    staged_virtual_downs: HashSet<SubstateId>,
    staged_txn_ids: HashSet<TxnId>,
    staged_metadata: Option<M>,
}

impl<M: Clone + Send + Sync, S: EngineStore<M>> TransientTransaction<'_, M, S> {
    fn apply_op(&mut self, op: &SubstateOp) -> Result<(), StoreError> {
        match op.spin {
            Spin::Up => {
                let exists = self.staged_ups.contains_key(&op.id)
                    || self.store.overlay.read().ups.contains_key(&op.id)
                    || self.store.parent.substate(&op.id).is_some()
                    || self.store.parent.is_downed(&op.id);
                if exists {
                    return Err(StoreError::SubstateExists { id: op.id.clone() });
                }
                self.staged_ups.insert(
                    op.id.clone(),
                    OverlayEntry {
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
                self.staged_virtual_downs.insert(op.id.clone());
                Ok(())
            }
            Spin::Down => {
                if let Some(entry) = self.staged_ups.get_mut(&op.id) {
                    if entry.spin != Spin::Up {
                        return Err(StoreError::SubstateNotLive { id: op.id.clone() });
                    }
                    entry.spin = Spin::Down;
                    return Ok(());
                }
                if self.staged_downs.contains(&op.id) || self.substate(&op.id).is_none() {
                    return Err(StoreError::SubstateNotLive { id: op.id.clone() });
                }
                self.staged_downs.insert(op.id.clone());
                Ok(())
            }
            Spin::Neutral => Err(StoreError::SubstateNotLive { id: op.id.clone() }),
        }
    }
}

impl<M: Clone + Send + Sync, S: EngineStore<M>> SubstateReadView
    for TransientTransaction<'_, M, S>
{
    fn substate(&self, id: &SubstateId) -> Option<Vec<u8>> {
        if let Some(entry) = self.staged_ups.get(id) {
            return (entry.spin == Spin::Up).then(|| entry.payload.clone());
        }
        if self.staged_downs.contains(id) || self.staged_virtual_downs.contains(id) {
            return None;
        }
        self.store.substate(id)
    }

    fn is_downed(&self, id: &SubstateId) -> bool {
        if let Some(entry) = self.staged_ups.get(id) {
            return entry.spin == Spin::Down;
        }
        self.staged_downs.contains(id)
            || self.staged_virtual_downs.contains(id)
            || self.store.is_downed(id)
    }

    fn indexed(&self, type_tag: u8) -> Vec<(SubstateId, Vec<u8>)> {
        let mut merged: BTreeMap<SubstateId, Vec<u8>> =
            self.store.indexed(type_tag).into_iter().collect();
        for id in &self.staged_downs {
            merged.remove(id);
        }
        for (id, entry) in &self.staged_ups {
            if entry.spin == Spin::Up && entry.type_tag == type_tag {
                merged.insert(id.clone(), entry.payload.clone());
            }
        }
        merged.into_iter().collect()
    }
}

impl<M: Clone + Send + Sync, S: EngineStore<M>> StoreTransaction<M>
    for TransientTransaction<'_, M, S>
{
    fn put_processed(&mut self, record: &ProcessedRecord) -> Result<(), StoreError> {
        if self.staged_txn_ids.contains(&record.txn_id)
            || self.store.overlay.read().txn_ids.contains(&record.txn_id)
        {
            return Err(StoreError::DuplicateTransaction {
                txn_id: record.txn_id,
            });
        }
        for op in &record.ops {
            self.apply_op(op)?;
        }
        self.staged_txn_ids.insert(record.txn_id);
        Ok(())
    }

    fn put_metadata(&mut self, metadata: M) {
        self.staged_metadata = Some(metadata);
    }

    fn metadata(&self) -> Option<M> {
        self.staged_metadata.clone().or_else(|| self.store.metadata())
    }

    fn commit(self) -> Result<(), StoreError> {
        let mut overlay = self.store.overlay.write();
        for (id, entry) in self.staged_ups {
            overlay.ups.insert(id, entry);
        }
        for id in self.staged_downs {
            // Parent-owned substates are shadowed, never mutated.
            if let Some(entry) = overlay.ups.get_mut(&id) {
                entry.spin = Spin::Down;
            } else {
                overlay.downs.insert(id);
            }
        }
        overlay.virtual_downs.extend(self.staged_virtual_downs);
        overlay.txn_ids.extend(self.staged_txn_ids);
        if let Some(metadata) = self.staged_metadata {
            overlay.metadata = Some(metadata);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;

    fn up_op(id: SubstateId, tag: u8, payload: &[u8]) -> SubstateOp {
        SubstateOp {
            spin: Spin::Up,
            id,
            type_tag: tag,
            payload: Some(payload.to_vec()),
            instruction_index: 0,
        }
    }

    fn down_op(id: SubstateId, tag: u8) -> SubstateOp {
        SubstateOp {
            spin: Spin::Down,
            id,
            type_tag: tag,
            payload: None,
            instruction_index: 0,
        }
    }

    fn record(label: &[u8], ops: Vec<SubstateOp>) -> ProcessedRecord {
        ProcessedRecord {
            txn_id: TxnId::from_payload(label),
            raw: label.to_vec(),
            ops,
        }
    }

    fn committed_parent() -> (Arc<MemStore<u64>>, SubstateId) {
        let parent: Arc<MemStore<u64>> = Arc::new(MemStore::new());
        let id = SubstateId::of_substate(TxnId::from_payload(b"base"), 0);
        let mut txn = parent.create_transaction();
        txn.put_processed(&record(b"base", vec![up_op(id.clone(), 7, b"parent")]))
            .expect("stage");
        txn.commit().expect("commit");
        (parent, id)
    }

    #[test]
    fn test_reads_fall_through_to_parent() {
        let (parent, id) = committed_parent();
        let branch = TransientStore::new(Arc::clone(&parent));
        assert_eq!(branch.substate(&id), Some(b"parent".to_vec()));
        assert_eq!(branch.indexed(7).len(), 1);
    }

    #[test]
    fn test_overlay_writes_do_not_reach_parent() {
        let (parent, _) = committed_parent();
        let branch = TransientStore::new(Arc::clone(&parent));
        let new_id = SubstateId::of_substate(TxnId::from_payload(b"branch"), 0);

        let mut txn = branch.create_transaction();
        txn.put_processed(&record(b"branch", vec![up_op(new_id.clone(), 7, b"local")]))
            .expect("stage");
        txn.commit().expect("commit");

        assert_eq!(branch.substate(&new_id), Some(b"local".to_vec()));
        assert!(parent.substate(&new_id).is_none());
        assert_eq!(parent.indexed(7).len(), 1);
    }

    #[test]
    fn test_overlay_down_shadows_parent_substate() {
        let (parent, id) = committed_parent();
        let branch = TransientStore::new(Arc::clone(&parent));

        let mut txn = branch.create_transaction();
        txn.put_processed(&record(b"spend", vec![down_op(id.clone(), 7)]))
            .expect("stage");
        txn.commit().expect("commit");

        assert!(branch.substate(&id).is_none());
        assert!(branch.is_downed(&id));
        // Parent still sees its substate live.
        assert_eq!(parent.substate(&id), Some(b"parent".to_vec()));
        assert!(!parent.is_downed(&id));
    }

    #[test]
    fn test_drop_discards_overlay() {
        let (parent, id) = committed_parent();
        {
            let branch = TransientStore::new(Arc::clone(&parent));
            let mut txn = branch.create_transaction();
            txn.put_processed(&record(b"spend", vec![down_op(id.clone(), 7)]))
                .expect("stage");
            txn.commit().expect("commit");
        }
        assert_eq!(parent.substate(&id), Some(b"parent".to_vec()));
    }
}
