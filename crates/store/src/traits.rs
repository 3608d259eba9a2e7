//! Store collaborator contracts consumed by the engine.

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use spindle_types::{Spin, SubstateId, TxnId};

/// Store layer error types.
#[derive(Debug, Snafu)]
pub enum StoreError {
    /// An up-operation targeted a substate id that already exists.
    #[snafu(display("Substate {id:?} already exists"))]
    SubstateExists {
        /// The conflicting substate id.
        id: SubstateId,
    },

    /// A down-operation targeted a substate that is not live.
    #[snafu(display("Substate {id:?} is not live"))]
    SubstateNotLive {
        /// The missing or consumed substate id.
        id: SubstateId,
    },

    /// A processed record for this transaction was already stored.
    #[snafu(display("Transaction {txn_id} already stored"))]
    DuplicateTransaction {
        /// The duplicated transaction id.
        txn_id: TxnId,
    },
}

/// One persisted state change from a processed transaction.
///
/// `payload` carries the tagged substate bytes for up-operations; a
/// down-operation only references the id (virtual downs are recorded
/// as tombstones keyed by their virtual id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstateOp {
    /// The resulting spin (`Up` for creation, `Down` for consumption).
    pub spin: Spin,
    /// The substate being created or consumed.
    pub id: SubstateId,
    /// Registry type tag of the substate's particle.
    pub type_tag: u8,
    /// Tagged payload bytes, present for up-operations.
    pub payload: Option<Vec<u8>>,
    /// Index of the instruction that produced this change.
    pub instruction_index: u32,
}

/// The unit stored per transaction: raw bytes plus the ordered diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    /// Transaction id (SHA-256 of `raw`).
    pub txn_id: TxnId,
    /// Raw transaction bytes as submitted.
    pub raw: Vec<u8>,
    /// Ordered substate changes produced by verification.
    pub ops: Vec<SubstateOp>,
}

/// Read access to substates, shared by committed views and open
/// transactions.
pub trait SubstateReadView {
    /// Returns the tagged payload of a live (`Up`) substate.
    fn substate(&self, id: &SubstateId) -> Option<Vec<u8>>;

    /// Whether the substate has been consumed. Physical downs are
    /// retained as tombstones; virtual downs are recorded by id.
    fn is_downed(&self, id: &SubstateId) -> bool;

    /// All live substates carrying the given type tag, in id order.
    fn indexed(&self, type_tag: u8) -> Vec<(SubstateId, Vec<u8>)>;
}

/// A transaction-scoped store handle. All writes are staged; they
/// become visible to other handles only on [`StoreTransaction::commit`],
/// and dropping the handle abandons every staged write.
pub trait StoreTransaction<M>: SubstateReadView {
    /// Stages a processed transaction: its record plus the spin
    /// effects of each of its substate operations.
    fn put_processed(&mut self, record: &ProcessedRecord) -> Result<(), StoreError>;

    /// Stages the batch metadata.
    fn put_metadata(&mut self, metadata: M);

    /// Returns the metadata visible to this transaction (staged value
    /// if present, otherwise the committed one).
    fn metadata(&self) -> Option<M>;

    /// Atomically applies every staged write.
    fn commit(self) -> Result<(), StoreError>;
}

/// Transactional substate store with indexed scans.
///
/// Committed-side accessors serve the engine's read path; all
/// mutation goes through [`EngineStore::create_transaction`].
pub trait EngineStore<M>: Send + Sync {
    /// The transaction handle type.
    type Transaction<'a>: StoreTransaction<M>
    where
        Self: 'a;

    /// Opens a store transaction.
    fn create_transaction(&self) -> Self::Transaction<'_>;

    /// Committed read: tagged payload of a live substate.
    fn substate(&self, id: &SubstateId) -> Option<Vec<u8>>;

    /// Committed read: whether the substate has been consumed.
    fn is_downed(&self, id: &SubstateId) -> bool;

    /// Committed read: live substates with the given type tag.
    fn indexed(&self, type_tag: u8) -> Vec<(SubstateId, Vec<u8>)>;

    /// Committed read: current batch metadata.
    fn metadata(&self) -> Option<M>;
}
