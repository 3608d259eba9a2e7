//! Engine-level behavior: batch atomicity, metadata, branches,
//! configuration swaps.

mod common;

use common::{balance, commit, create_resource, engine, next_meta, pubkey, signing_key};

use spindle_engine::{
    ConstraintError, ConstraintMachine, ConstructionRequest, CostMeter, EngineConfig, EngineError,
    EnvelopeParser, Event, LedgerEngine, MachineLimits, NoMeter, Particle, ParticleKind,
    PermissionLevel, PostProcessError, PostProcessor, ProcessedTransaction, RawTxn, Registry,
    TxnAction, TxnError,
};
use spindle_store::{MemStore, StoreError, SubstateReadView};
use spindle_types::Amount;

use std::sync::Arc;

fn message_txn(engine: &common::TestEngine, text: &[u8]) -> RawTxn {
    let mut request = ConstructionRequest::new(vec![]);
    request.message = Some(text.to_vec());
    engine.construct(&request, None).expect("construct")
}

#[test]
fn test_failed_batch_leaves_store_untouched() {
    let engine = engine();
    let alice = signing_key(1);
    let bob = signing_key(2);
    let resource = create_resource(
        &engine,
        b"GEN",
        None,
        pubkey(&alice),
        Amount::from_u64(100),
        1,
    );

    let transfer = ConstructionRequest::new(vec![TxnAction::TransferTokens {
        resource,
        from: pubkey(&alice),
        to: pubkey(&bob),
        amount: Amount::from_u64(10),
    }]);
    let good = engine.construct(&transfer, Some(&alice)).expect("construct");
    let garbage = RawTxn::new(vec![0xFF; 24]);

    let dump = engine.store().audit_dump();
    let meta = engine.metadata();
    let result = engine.execute(
        &[good, garbage],
        Some(next_meta(&engine)),
        PermissionLevel::User,
        false,
    );
    assert!(matches!(
        result,
        Err(EngineError::Batch {
            index: 1,
            total: 2,
            source: TxnError::Parse { .. },
            ..
        })
    ));
    assert_eq!(engine.store().audit_dump(), dump);
    assert_eq!(engine.metadata(), meta);
    assert_eq!(
        balance(&engine, resource, &pubkey(&alice)),
        Amount::from_u64(100)
    );
}

#[test]
fn test_duplicate_transaction_in_batch_rejected() {
    let engine = engine();
    let txn = message_txn(&engine, b"hello");
    let result = engine.execute(
        &[txn.clone(), txn],
        Some(next_meta(&engine)),
        PermissionLevel::User,
        false,
    );
    assert!(matches!(
        result,
        Err(EngineError::Batch {
            index: 1,
            source: TxnError::Store {
                source: StoreError::DuplicateTransaction { .. }
            },
            ..
        })
    ));
}

#[test]
fn test_committed_transaction_cannot_replay() {
    let engine = engine();
    let txn = message_txn(&engine, b"once");
    commit(&engine, &[txn.clone()]);

    let result = engine.execute(
        &[txn],
        Some(next_meta(&engine)),
        PermissionLevel::User,
        false,
    );
    assert!(matches!(
        result,
        Err(EngineError::Batch {
            source: TxnError::Store {
                source: StoreError::DuplicateTransaction { .. }
            },
            ..
        })
    ));
}

struct CountingPostProcessor;

impl PostProcessor<u64> for CountingPostProcessor {
    fn process(
        &self,
        prior: Option<u64>,
        candidate: u64,
        _view: &dyn SubstateReadView,
        processed: &[ProcessedTransaction],
    ) -> Result<u64, PostProcessError> {
        let _ = prior;
        Ok(candidate + processed.len() as u64)
    }
}

struct VetoPostProcessor;

impl PostProcessor<u64> for VetoPostProcessor {
    fn process(
        &self,
        _prior: Option<u64>,
        _candidate: u64,
        _view: &dyn SubstateReadView,
        _processed: &[ProcessedTransaction],
    ) -> Result<u64, PostProcessError> {
        Err(PostProcessError {
            message: "rejected".to_string(),
        })
    }
}

#[test]
fn test_post_processor_revises_metadata() {
    let engine: common::TestEngine =
        LedgerEngine::new(Arc::new(MemStore::new()), common::config())
            .with_post_processor(Box::new(CountingPostProcessor));
    let txns = [message_txn(&engine, b"a"), message_txn(&engine, b"b")];
    engine
        .execute(&txns, Some(10), PermissionLevel::User, false)
        .expect("commit");
    assert_eq!(engine.metadata(), Some(12));
}

#[test]
fn test_post_processor_veto_rolls_batch_back() {
    let engine: common::TestEngine =
        LedgerEngine::new(Arc::new(MemStore::new()), common::config())
            .with_post_processor(Box::new(VetoPostProcessor));
    let dump = engine.store().audit_dump();
    let txn = message_txn(&engine, b"vetoed");
    let result = engine.execute(&[txn], Some(1), PermissionLevel::User, false);
    assert!(matches!(result, Err(EngineError::PostProcess { .. })));
    assert_eq!(engine.store().audit_dump(), dump);
    assert_eq!(engine.metadata(), None);
}

#[test]
fn test_branch_isolation_and_outstanding_guard() {
    let engine = engine();
    let alice = signing_key(1);
    let bob = signing_key(2);
    let resource = create_resource(
        &engine,
        b"GEN",
        None,
        pubkey(&alice),
        Amount::from_u64(100),
        1,
    );

    let branch = engine.transient_branch();
    assert_eq!(engine.open_branch_count(), 1);

    let transfer = ConstructionRequest::new(vec![TxnAction::TransferTokens {
        resource,
        from: pubkey(&alice),
        to: pubkey(&bob),
        amount: Amount::from_u64(30),
    }]);
    let raw = branch.construct(&transfer, Some(&alice)).expect("construct");
    branch
        .execute(&[raw.clone()], None, PermissionLevel::User, false)
        .expect("speculative execute");

    // The branch sees the transfer; the parent does not.
    assert_eq!(
        balance(&branch, resource, &pubkey(&bob)),
        Amount::from_u64(30)
    );
    assert_eq!(balance(&engine, resource, &pubkey(&bob)), Amount::ZERO);

    // Committing is refused while the branch is outstanding.
    let result = engine.execute(
        &[raw.clone()],
        Some(next_meta(&engine)),
        PermissionLevel::User,
        false,
    );
    assert!(matches!(
        result,
        Err(EngineError::BranchesOutstanding { count: 1 })
    ));

    engine.delete_branches();
    assert_eq!(engine.open_branch_count(), 0);
    commit(&engine, &[raw]);
    assert_eq!(
        balance(&engine, resource, &pubkey(&bob)),
        Amount::from_u64(30)
    );
}

#[test]
fn test_speculative_batch_shares_signature_budget() {
    let engine: common::TestEngine =
        LedgerEngine::new(Arc::new(MemStore::new()), common::config()).with_sig_budget(1);
    let alice = signing_key(1);
    let bob = signing_key(2);
    let first = create_resource(
        &engine,
        b"ONE",
        None,
        pubkey(&alice),
        Amount::from_u64(100),
        1,
    );
    let second = create_resource(
        &engine,
        b"TWO",
        None,
        pubkey(&alice),
        Amount::from_u64(100),
        1,
    );

    let txns: Vec<RawTxn> = [first, second]
        .into_iter()
        .map(|resource| {
            let request = ConstructionRequest::new(vec![TxnAction::TransferTokens {
                resource,
                from: pubkey(&alice),
                to: pubkey(&bob),
                amount: Amount::from_u64(10),
            }]);
            engine.construct(&request, Some(&alice)).expect("construct")
        })
        .collect();

    // Speculative: one budget across the batch, so the second signed
    // transaction exhausts it.
    let branch = engine.transient_branch();
    let result = branch.execute(&txns, None, PermissionLevel::User, false);
    assert!(matches!(
        result,
        Err(EngineError::Batch {
            index: 1,
            source: TxnError::SignatureBudgetExceeded,
            ..
        })
    ));
    engine.delete_branches();

    // Committing: each transaction gets a fresh budget.
    commit(&engine, &txns);
    assert_eq!(balance(&engine, first, &pubkey(&bob)), Amount::from_u64(10));
    assert_eq!(
        balance(&engine, second, &pubkey(&bob)),
        Amount::from_u64(10)
    );
}

#[test]
fn test_system_level_charges_no_signature_budget() {
    let engine: common::TestEngine =
        LedgerEngine::new(Arc::new(MemStore::new()), common::config()).with_sig_budget(0);
    let alice = signing_key(1);

    let request = ConstructionRequest::new(vec![TxnAction::CreateResource {
        addr: spindle_engine::ResourceAddr::derive(&pubkey(&alice), b"GEN"),
        granularity: Amount::from_u64(1),
        owner: None,
        initial_supply: Some((pubkey(&alice), Amount::from_u64(100))),
    }]);
    let raw = engine.construct(&request, Some(&alice)).expect("construct");
    engine
        .execute(&[raw], Some(0), PermissionLevel::System, false)
        .expect("signed transaction passes unverified at system level");
}

#[test]
fn test_skip_authorization_charges_no_signature_budget() {
    let engine: common::TestEngine =
        LedgerEngine::new(Arc::new(MemStore::new()), common::config()).with_sig_budget(0);
    let alice = signing_key(1);

    let request = ConstructionRequest::new(vec![TxnAction::CreateResource {
        addr: spindle_engine::ResourceAddr::derive(&pubkey(&alice), b"GEN"),
        granularity: Amount::from_u64(1),
        owner: None,
        initial_supply: Some((pubkey(&alice), Amount::from_u64(100))),
    }]);
    let raw = engine.construct(&request, Some(&alice)).expect("construct");
    engine
        .execute(&[raw], Some(0), PermissionLevel::User, true)
        .expect("signed transaction passes unverified when authorization is skipped");
}

#[test]
fn test_epoch_advance_requires_super_user() {
    let engine = engine();
    let request = ConstructionRequest::new(vec![TxnAction::AdvanceEpoch]);
    let raw = engine.construct(&request, None).expect("construct");

    let result = engine.execute(
        &[raw.clone()],
        Some(next_meta(&engine)),
        PermissionLevel::User,
        false,
    );
    assert!(matches!(
        result,
        Err(EngineError::Batch {
            source: TxnError::Constraint {
                source: ConstraintError::PermissionDenied {
                    required: PermissionLevel::SuperUser,
                    ..
                }
            },
            ..
        })
    ));

    let processed = engine
        .execute(
            &[raw],
            Some(next_meta(&engine)),
            PermissionLevel::SuperUser,
            false,
        )
        .expect("advance");
    assert_eq!(processed[0].events, vec![Event::EpochAdvanced { epoch: 1 }]);

    // The next advance consumes the physical epoch and chains 1 -> 2.
    let raw = engine.construct(&request, None).expect("construct");
    engine
        .execute(
            &[raw],
            Some(next_meta(&engine)),
            PermissionLevel::SuperUser,
            false,
        )
        .expect("second advance");
    let epoch = engine
        .find_by_key(ParticleKind::Epoch, &[])
        .expect("lookup")
        .expect("live epoch");
    assert_eq!(epoch, Particle::Epoch { epoch: 2 });
}

#[test]
fn test_skip_authorization_bypasses_signature_rules() {
    let engine = engine();
    let alice = signing_key(1);
    let mallory = signing_key(9);
    let resource = create_resource(
        &engine,
        b"GEN",
        None,
        pubkey(&alice),
        Amount::from_u64(100),
        1,
    );

    let request = ConstructionRequest::new(vec![TxnAction::TransferTokens {
        resource,
        from: pubkey(&alice),
        to: pubkey(&mallory),
        amount: Amount::from_u64(10),
    }]);
    let raw = engine
        .construct(&request, Some(&mallory))
        .expect("construct");
    engine
        .execute(&[raw], Some(next_meta(&engine)), PermissionLevel::User, true)
        .expect("unauthorized spend permitted when authorization is skipped");
    assert_eq!(
        balance(&engine, resource, &pubkey(&mallory)),
        Amount::from_u64(10)
    );
}

#[test]
fn test_replace_constraint_machine_changes_verification() {
    let engine = engine();
    let alice = signing_key(1);
    let bob = signing_key(2);
    let resource = create_resource(
        &engine,
        b"GEN",
        None,
        pubkey(&alice),
        Amount::from_u64(100),
        1,
    );
    let request = ConstructionRequest::new(vec![TxnAction::TransferTokens {
        resource,
        from: pubkey(&alice),
        to: pubkey(&bob),
        amount: Amount::from_u64(10),
    }]);
    let raw = engine.construct(&request, Some(&alice)).expect("construct");

    // A machine that only knows the system scrypt no longer decodes
    // token substates.
    let bare = ConstraintMachine::new(
        Registry::with_base().expect("registry"),
        MachineLimits::default(),
        Box::new(NoMeter),
    );
    engine.replace_constraint_machine(EngineConfig::new(bare, Box::new(EnvelopeParser)));

    let result = engine.execute(
        &[raw],
        Some(next_meta(&engine)),
        PermissionLevel::User,
        false,
    );
    assert!(matches!(
        result,
        Err(EngineError::Batch {
            source: TxnError::Constraint {
                source: ConstraintError::Decode { .. }
            },
            ..
        })
    ));
}

#[test]
fn test_cost_meter_limits_a_batch() {
    let machine = ConstraintMachine::new(
        common::registry(),
        MachineLimits::default(),
        Box::new(CostMeter::new(1, 1, 3)),
    );
    let config = EngineConfig::new(machine, Box::new(EnvelopeParser));
    let engine: common::TestEngine = LedgerEngine::new(Arc::new(MemStore::new()), config);
    let alice = signing_key(1);

    // Resource creation costs more than three units of instructions
    // and procedures.
    let request = ConstructionRequest::new(vec![TxnAction::CreateResource {
        addr: spindle_engine::ResourceAddr::derive(&pubkey(&alice), b"GEN"),
        granularity: Amount::from_u64(1),
        owner: None,
        initial_supply: Some((pubkey(&alice), Amount::from_u64(100))),
    }]);
    let raw = engine.construct(&request, None).expect("construct");
    let result = engine.execute(&[raw], Some(0), PermissionLevel::User, false);
    assert!(matches!(
        result,
        Err(EngineError::Batch {
            source: TxnError::Constraint {
                source: ConstraintError::Metering { .. }
            },
            ..
        })
    ));
}

#[test]
fn test_system_level_skips_metering() {
    let machine = ConstraintMachine::new(
        common::registry(),
        MachineLimits::default(),
        Box::new(CostMeter::new(1, 1, 1)),
    );
    let config = EngineConfig::new(machine, Box::new(EnvelopeParser));
    let engine: common::TestEngine = LedgerEngine::new(Arc::new(MemStore::new()), config);
    let alice = signing_key(1);

    let request = ConstructionRequest::new(vec![TxnAction::CreateResource {
        addr: spindle_engine::ResourceAddr::derive(&pubkey(&alice), b"GEN"),
        granularity: Amount::from_u64(1),
        owner: None,
        initial_supply: Some((pubkey(&alice), Amount::from_u64(100))),
    }]);
    let raw = engine.construct(&request, None).expect("construct");
    engine
        .execute(&[raw], Some(0), PermissionLevel::System, false)
        .expect("system execution is unmetered");
}
