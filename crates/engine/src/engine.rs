//! The ledger engine: batch execution over a substate store.
//!
//! One engine owns one store. Batches execute under a single store
//! transaction and a single execution lock: every transaction in the
//! batch verifies and stages, the post-processor revises the batch
//! metadata, and only then does anything commit. Any failure aborts
//! the whole batch with the index of the offending transaction.
//!
//! Speculative execution happens on transient branches: an engine
//! layered over a copy-on-write overlay of this engine's store.
//! Branches are counted, not stored; committing with metadata is
//! refused while any branch is outstanding, and
//! [`LedgerEngine::delete_branches`] resets the count.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::{debug, info, warn};

use spindle_store::{
    EngineStore, ProcessedRecord, StoreTransaction, SubstateOp, SubstateReadView, TransientStore,
};
use spindle_types::{Amount, Spin, SubstateId, TxnId, WideAmount};

use crate::builder::{
    ActionCompiler, BuildOutcome, ConstructionRequest, DefaultCompiler, SubstateSource,
    TxnConstructor,
};
use crate::context::{Event, ExecutionContext, PermissionLevel};
use crate::error::{
    BuildSnafu, CommitSnafu, ConstraintSnafu, EngineError, ParseSnafu, PostProcessError,
    ReadAggregationSnafu, StoreSnafu, TxnError,
};
use crate::machine::ConstraintMachine;
use crate::parser::{RawTxn, TxnParser};
use crate::particles::{KeyBytes, Particle, ParticleKind, ResourceAddr};

/// Bounded attempts for fee-paying construction.
pub const MAX_FEE_ATTEMPTS: u32 = 5;

/// Assumed minimal transaction size seeding the first fee guess.
const MIN_TXN_SIZE_BYTES: u64 = 128;

/// Default per-transaction signature-verification budget.
const DEFAULT_SIG_BUDGET: u32 = 16;

/// The swappable verification configuration: machine plus parser.
pub struct EngineConfig {
    /// The constraint machine.
    pub machine: ConstraintMachine,
    /// The transaction parser.
    pub parser: Box<dyn TxnParser>,
}

impl EngineConfig {
    /// Bundles a machine and parser.
    #[must_use]
    pub fn new(machine: ConstraintMachine, parser: Box<dyn TxnParser>) -> Self {
        Self { machine, parser }
    }
}

/// Batch metadata revision hook, consulted before a batch commits.
pub trait PostProcessor<M>: Send + Sync {
    /// Revises the candidate metadata for a verified batch. `prior` is
    /// the metadata committed before the batch; `view` sees the staged
    /// state. Returning an error aborts the whole batch.
    fn process(
        &self,
        prior: Option<M>,
        candidate: M,
        view: &dyn SubstateReadView,
        processed: &[ProcessedTransaction],
    ) -> Result<M, PostProcessError>;
}

/// A verified transaction and everything it produced.
#[derive(Debug, Clone)]
pub struct ProcessedTransaction {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Raw bytes as submitted.
    pub raw: Vec<u8>,
    /// Verified signer, if the transaction carried a signature.
    pub signer: Option<KeyBytes>,
    /// Ordered substate operations.
    pub ops: Vec<SubstateOp>,
    /// Events emitted during verification, in order.
    pub events: Vec<Event>,
}

impl ProcessedTransaction {
    /// The persistable projection of this transaction.
    #[must_use]
    pub fn to_record(&self) -> ProcessedRecord {
        ProcessedRecord {
            txn_id: self.txn_id,
            raw: self.raw.clone(),
            ops: self.ops.clone(),
        }
    }
}

struct CommittedSource<'a, M, S> {
    store: &'a S,
    _metadata: PhantomData<M>,
}

impl<M: Clone + Send + Sync, S: EngineStore<M>> SubstateSource for CommittedSource<'_, M, S> {
    fn indexed(&self, type_tag: u8) -> Vec<(SubstateId, Vec<u8>)> {
        self.store.indexed(type_tag)
    }
}

/// The state-transition engine over a substate store.
pub struct LedgerEngine<M, S> {
    store: Arc<S>,
    config: Arc<ArcSwap<EngineConfig>>,
    execution: Mutex<()>,
    open_branches: AtomicUsize,
    post_processor: Option<Box<dyn PostProcessor<M>>>,
    sig_budget: u32,
}

impl<M, S> LedgerEngine<M, S>
where
    M: Clone + Send + Sync,
    S: EngineStore<M>,
{
    /// Creates an engine over `store` with the given configuration.
    #[must_use]
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config: Arc::new(ArcSwap::from_pointee(config)),
            execution: Mutex::new(()),
            open_branches: AtomicUsize::new(0),
            post_processor: None,
            sig_budget: DEFAULT_SIG_BUDGET,
        }
    }

    /// Installs a post-processor consulted before each commit.
    #[must_use]
    pub fn with_post_processor(mut self, post_processor: Box<dyn PostProcessor<M>>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// Overrides the signature-verification budget.
    #[must_use]
    pub fn with_sig_budget(mut self, budget: u32) -> Self {
        self.sig_budget = budget;
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Committed batch metadata.
    #[must_use]
    pub fn metadata(&self) -> Option<M> {
        self.store.metadata()
    }

    /// Swaps in a new machine and parser. In-flight executions finish
    /// under the configuration they loaded; later ones see the new
    /// one.
    pub fn replace_constraint_machine(&self, config: EngineConfig) {
        let _guard = self.execution.lock();
        self.config.store(Arc::new(config));
        info!("constraint machine replaced");
    }

    /// Executes a batch atomically.
    ///
    /// With `metadata` present this is a committing execution: the
    /// post-processor (if any) revises the metadata and the whole
    /// batch commits, or nothing does. Without metadata the execution
    /// is speculative: state still lands in this engine's store (which
    /// for a branch engine is the overlay), but no metadata is
    /// written and outstanding branches are not checked.
    pub fn execute(
        &self,
        txns: &[RawTxn],
        metadata: Option<M>,
        level: PermissionLevel,
        skip_authorization: bool,
    ) -> Result<Vec<ProcessedTransaction>, EngineError> {
        let _guard = self.execution.lock();
        let committing = metadata.is_some();
        if committing {
            let count = self.open_branches.load(Ordering::SeqCst);
            if count > 0 {
                return Err(EngineError::BranchesOutstanding { count });
            }
        }
        let config = self.config.load_full();
        let mut txn = self.store.create_transaction();
        let total = txns.len();
        let mut shared_budget = self.sig_budget;
        let mut processed = Vec::with_capacity(total);

        for (index, raw) in txns.iter().enumerate() {
            // Committing batches get a fresh budget per transaction;
            // speculative ones share a single budget across the batch.
            let budget = if committing {
                self.sig_budget
            } else {
                shared_budget
            };
            match process_one(&config, &mut txn, raw, level, skip_authorization, budget) {
                Ok((one, remaining)) => {
                    if !committing {
                        shared_budget = remaining;
                    }
                    processed.push(one);
                }
                Err(source) => {
                    warn!(txn_id = %raw.id, index, total, "transaction rejected, batch aborted");
                    return Err(EngineError::Batch {
                        index,
                        total,
                        txn_id: raw.id,
                        source,
                    });
                }
            }
        }

        if let Some(candidate) = metadata {
            let revised = match &self.post_processor {
                Some(post_processor) => post_processor
                    .process(txn.metadata(), candidate, &txn, &processed)
                    .map_err(|source| {
                        warn!("post-processor vetoed batch");
                        EngineError::PostProcess { source }
                    })?,
                None => candidate,
            };
            txn.put_metadata(revised);
        }
        txn.commit().context(CommitSnafu)?;
        debug!(count = total, committing, "batch applied");
        Ok(processed)
    }

    /// Opens a speculative branch: an engine over a copy-on-write
    /// overlay of this engine's store. The branch shares this
    /// engine's configuration and counts against it until
    /// [`LedgerEngine::delete_branches`] runs.
    pub fn transient_branch(&self) -> LedgerEngine<M, TransientStore<M, S>> {
        self.open_branches.fetch_add(1, Ordering::SeqCst);
        debug!("transient branch opened");
        LedgerEngine {
            store: Arc::new(TransientStore::new(Arc::clone(&self.store))),
            config: Arc::clone(&self.config),
            execution: Mutex::new(()),
            open_branches: AtomicUsize::new(0),
            post_processor: None,
            sig_budget: self.sig_budget,
        }
    }

    /// Discards all outstanding branches in one step. Branch overlays
    /// themselves are dropped by their owners; this only resets the
    /// guard count.
    pub fn delete_branches(&self) {
        let count = self.open_branches.swap(0, Ordering::SeqCst);
        if count > 0 {
            debug!(count, "speculative branches deleted");
        }
    }

    /// Number of branches opened and not yet deleted.
    #[must_use]
    pub fn open_branch_count(&self) -> usize {
        self.open_branches.load(Ordering::SeqCst)
    }

    /// Point lookup of an addressable particle by its untagged key,
    /// falling back to the virtual default when no physical substate
    /// exists and the key virtualizes.
    pub fn find_by_key(
        &self,
        kind: ParticleKind,
        key: &[u8],
    ) -> Result<Option<Particle>, EngineError> {
        let config = self.config.load();
        let registry = config.machine.registry();
        let Some(tag) = registry.tag_of(kind) else {
            return Ok(None);
        };
        let Some(definition) = registry.definition(tag) else {
            return Ok(None);
        };
        let Some(codec) = definition.key_codec.as_ref() else {
            return Ok(None);
        };
        for (_, payload) in self.store.indexed(tag) {
            let (_, particle) = registry
                .decode_payload(&payload)
                .map_err(|source| EngineError::CorruptSubstate { source })?;
            if (codec.key_of)(&particle).as_deref() == Some(key) {
                return Ok(Some(particle));
            }
        }
        let mut tagged = Vec::with_capacity(1 + key.len());
        tagged.push(tag);
        tagged.extend_from_slice(key);
        if let Ok((tag, particle)) = registry.key_to_particle(&tagged) {
            let id = SubstateId::of_virtual(tagged);
            if registry.virtual_spin(tag, &particle) == Spin::Up && !self.store.is_downed(&id) {
                return Ok(Some(particle));
            }
        }
        Ok(None)
    }

    /// Folds every live particle of a kind into an accumulator.
    pub fn reduce<U>(
        &self,
        kind: ParticleKind,
        init: U,
        mut fold: impl FnMut(U, &Particle) -> U,
    ) -> Result<U, EngineError> {
        let config = self.config.load();
        let registry = config.machine.registry();
        let Some(tag) = registry.tag_of(kind) else {
            return Ok(init);
        };
        let mut accumulator = init;
        for (_, payload) in self.store.indexed(tag) {
            let (_, particle) = registry
                .decode_payload(&payload)
                .map_err(|source| EngineError::CorruptSubstate { source })?;
            accumulator = fold(accumulator, &particle);
        }
        Ok(accumulator)
    }

    /// Sums per-key amounts over every live particle of a kind, using
    /// the widened accumulator so no total can silently wrap.
    /// Particles for which either extractor returns `None` are
    /// skipped.
    pub fn sum_by_key(
        &self,
        kind: ParticleKind,
        key_of: impl Fn(&Particle) -> Option<Vec<u8>>,
        amount_of: impl Fn(&Particle) -> Option<Amount>,
    ) -> Result<BTreeMap<Vec<u8>, WideAmount>, EngineError> {
        let config = self.config.load();
        let registry = config.machine.registry();
        let Some(tag) = registry.tag_of(kind) else {
            return Ok(BTreeMap::new());
        };
        let mut totals: BTreeMap<Vec<u8>, WideAmount> = BTreeMap::new();
        for (_, payload) in self.store.indexed(tag) {
            let (_, particle) = registry
                .decode_payload(&payload)
                .map_err(|source| EngineError::CorruptSubstate { source })?;
            let (Some(key), Some(amount)) = (key_of(&particle), amount_of(&particle)) else {
                continue;
            };
            let entry = totals.entry(key).or_insert(WideAmount::ZERO);
            *entry = entry.add_amount(amount).context(ReadAggregationSnafu)?;
        }
        Ok(totals)
    }

    /// Builds a transaction from actions against committed state.
    pub fn construct(
        &self,
        request: &ConstructionRequest,
        signer: Option<&SigningKey>,
    ) -> Result<RawTxn, EngineError> {
        self.construct_with(request, signer, &DefaultCompiler)
    }

    /// Like [`LedgerEngine::construct`] with a custom compiler.
    pub fn construct_with(
        &self,
        request: &ConstructionRequest,
        signer: Option<&SigningKey>,
        compiler: &dyn ActionCompiler,
    ) -> Result<RawTxn, EngineError> {
        let config = self.config.load();
        let source = CommittedSource {
            store: self.store.as_ref(),
            _metadata: PhantomData::<M>,
        };
        TxnConstructor::new(config.machine.registry(), &source, compiler)
            .construct(request, signer)
            .context(BuildSnafu)
    }

    /// Builds a fee-paying transaction, converging on the fee implied
    /// by the sealed byte size.
    ///
    /// The fee starts at `fee_rate` times an assumed minimal size and
    /// each shortfall retries with the exact required figure; since
    /// amounts encode at fixed width the retry normally converges on
    /// the second attempt. Gives up after [`MAX_FEE_ATTEMPTS`].
    pub fn construct_with_fees(
        &self,
        request: &ConstructionRequest,
        signer: &SigningKey,
        fee_payer: &KeyBytes,
        fee_resource: ResourceAddr,
        fee_rate: Amount,
    ) -> Result<RawTxn, EngineError> {
        let config = self.config.load();
        let source = CommittedSource {
            store: self.store.as_ref(),
            _metadata: PhantomData::<M>,
        };
        let constructor = TxnConstructor::new(config.machine.registry(), &source, &DefaultCompiler);
        let mut fee = fee_rate
            .checked_mul_u64(MIN_TXN_SIZE_BYTES)
            .map_err(|source| EngineError::Build {
                source: source.into(),
            })?;
        for attempt in 1..=MAX_FEE_ATTEMPTS {
            match constructor
                .build_with_fee(request, signer, fee_payer, fee_resource, fee_rate, fee)
                .context(BuildSnafu)?
            {
                BuildOutcome::Built(raw) => {
                    debug!(attempt, %fee, "fee construction converged");
                    return Ok(raw);
                }
                BuildOutcome::FeeShortfall { required } => {
                    debug!(attempt, %fee, %required, "fee shortfall, retrying");
                    fee = required;
                }
            }
        }
        Err(EngineError::FeeConvergence {
            attempts: MAX_FEE_ATTEMPTS,
            last_fee: fee,
        })
    }
}

/// Parses, authenticates, verifies, and stages one transaction.
/// Returns the processed transaction and the remaining signature
/// budget.
fn process_one<M, T: StoreTransaction<M>>(
    config: &EngineConfig,
    txn: &mut T,
    raw: &RawTxn,
    level: PermissionLevel,
    skip_authorization: bool,
    sig_budget: u32,
) -> Result<(ProcessedTransaction, u32), TxnError> {
    let parsed = config.parser.parse(raw).context(ParseSnafu)?;
    if parsed.disable_resource_bookkeeping && level < PermissionLevel::SuperUser {
        return Err(TxnError::BookkeepingNotPermitted);
    }
    let mut ctx = ExecutionContext::new(level, sig_budget)
        .with_skip_authorization(skip_authorization)
        .with_resource_bookkeeping(!parsed.disable_resource_bookkeeping);

    // Signer derivation runs only when authorizers can consult it:
    // system-level and skip-authorization executions verify no
    // signatures and charge nothing against the budget.
    if level < PermissionLevel::System && !skip_authorization {
        if let Some(signature) = &parsed.signature {
            if !ctx.try_charge_sig_check() {
                return Err(TxnError::SignatureBudgetExceeded);
            }
            let verifying = VerifyingKey::from_bytes(&signature.public_key)
                .map_err(|_| TxnError::SignatureInvalid)?;
            let sig = Signature::from_slice(&signature.signature)
                .map_err(|_| TxnError::SignatureInvalid)?;
            verifying
                .verify_strict(&parsed.signing_hash, &sig)
                .map_err(|_| TxnError::SignatureInvalid)?;
            ctx.set_signer(signature.public_key);
        }
    }

    let ops = config
        .machine
        .verify(&*txn, &mut ctx, parsed.txn_id, &parsed.instructions)
        .context(ConstraintSnafu)?;
    let processed = ProcessedTransaction {
        txn_id: parsed.txn_id,
        raw: raw.bytes.clone(),
        signer: ctx.signer().copied(),
        ops,
        events: ctx.take_events(),
    };
    txn.put_processed(&processed.to_record()).context(StoreSnafu)?;
    Ok((processed, ctx.sig_checks_remaining()))
}
